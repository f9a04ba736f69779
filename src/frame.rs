use std::rc::Rc;

use ash::vk;

use crate::error::{ContractViolation, Result};
use crate::gpu::{
    BufferDesc, BufferHandle, CommandBuffer, DeviceContext, FenceHandle, SemaphoreHandle,
    INFINITE_TIMEOUT,
};
use crate::resource_state::ResourceStateTracker;

/// Everything one frame in flight needs. The command buffer may only be
/// re-recorded once `fence` reports the previous use retired.
pub struct FrameSlot {
    index: usize,
    fence: FenceHandle,
    image_available: SemaphoreHandle,
    render_finished: SemaphoreHandle,
    uniform_buffer: BufferHandle,
    pub command_buffer: CommandBuffer,
}

impl FrameSlot {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn fence(&self) -> FenceHandle {
        self.fence
    }

    pub fn image_available(&self) -> SemaphoreHandle {
        self.image_available
    }

    pub fn render_finished(&self) -> SemaphoreHandle {
        self.render_finished
    }

    pub fn uniform_buffer(&self) -> BufferHandle {
        self.uniform_buffer
    }
}

pub struct FrameResourcePool {
    device: Rc<dyn DeviceContext>,
    slots: Vec<FrameSlot>,
}

impl FrameResourcePool {
    /// One slot per surface image. Fences start signaled so the first use of
    /// every slot does not block.
    pub fn new(
        device: Rc<dyn DeviceContext>,
        tracker: &mut ResourceStateTracker,
        count: usize,
        uniform_size: u64,
    ) -> Result<Self> {
        let mut slots = Vec::with_capacity(count);
        for index in 0..count {
            let uniform_buffer = device.create_buffer(&BufferDesc::host_visible(
                &format!("uniforms {index}"),
                uniform_size,
                vk::BufferUsageFlags::UNIFORM_BUFFER,
            ))?;
            tracker.register(uniform_buffer, "uniforms");

            slots.push(FrameSlot {
                index,
                fence: device.create_fence(true)?,
                image_available: device.create_semaphore()?,
                render_finished: device.create_semaphore()?,
                uniform_buffer,
                command_buffer: CommandBuffer::new(&format!("frame {index}")),
            });
        }

        log::debug!("Created {} frames in flight", count);
        Ok(Self { device, slots })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slot(&self, index: usize) -> &FrameSlot {
        &self.slots[index % self.slots.len()]
    }

    /// Blocks until the slot's previous submission retired and hands it out
    /// for recording.
    pub fn begin(&mut self, index: usize) -> Result<&mut FrameSlot> {
        let index = index % self.slots.len();
        let fence = self.slots[index].fence;
        self.device.wait_fence(fence, INFINITE_TIMEOUT)?;
        if !self.device.fence_signaled(fence)? {
            return Err(ContractViolation::SlotNotRetired { slot: index }.into());
        }
        Ok(&mut self.slots[index])
    }

    pub fn uniform_buffers(&self) -> Vec<BufferHandle> {
        self.slots.iter().map(|slot| slot.uniform_buffer).collect()
    }

    pub fn fences(&self) -> Vec<FenceHandle> {
        self.slots.iter().map(|slot| slot.fence).collect()
    }

    /// The device must be idle.
    pub fn destroy(&mut self, tracker: &mut ResourceStateTracker) {
        for slot in self.slots.drain(..).rev() {
            tracker.forget(slot.uniform_buffer);
            self.device.destroy_buffer(slot.uniform_buffer);
            self.device.destroy_semaphore(slot.render_finished);
            self.device.destroy_semaphore(slot.image_available);
            self.device.destroy_fence(slot.fence);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::headless::{DeviceEvent, HeadlessConfig, HeadlessDevice};
    use crate::gpu::Submission;

    #[test]
    fn begin_waits_for_previous_submission() {
        let device = Rc::new(HeadlessDevice::new(HeadlessConfig::default()).with_latency(4));
        let mut tracker = ResourceStateTracker::new();
        let mut pool = FrameResourcePool::new(device.clone(), &mut tracker, 2, 256).unwrap();

        let slot = pool.begin(0).unwrap();
        let fence = slot.fence();
        device.reset_fence(fence).unwrap();
        device
            .submit(
                &slot.command_buffer,
                &Submission {
                    fence: Some(fence),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(!device.fence_signaled(fence).unwrap());

        pool.begin(2).unwrap();
        assert!(device.fence_signaled(fence).unwrap());
        assert!(device
            .events()
            .contains(&DeviceEvent::FenceWaited { fence, blocked: true }));
    }

    #[test]
    fn destroy_releases_everything() {
        let device = Rc::new(HeadlessDevice::new(HeadlessConfig::default()));
        let mut tracker = ResourceStateTracker::new();
        let mut pool = FrameResourcePool::new(device.clone(), &mut tracker, 3, 256).unwrap();
        assert_eq!(pool.uniform_buffers().len(), 3);
        assert_eq!(tracker.tracked_count(), 3);

        pool.destroy(&mut tracker);
        assert!(pool.is_empty());
        assert_eq!(tracker.tracked_count(), 0);
        assert_eq!(device.live_buffer_count(), 0);
    }
}
