//! [`DeviceContext`] on top of Vulkan 1.3 through `ash`.
//!
//! The device runs without a window: the swapchain is a ring of ordinary
//! images, acquire signals its semaphore from an empty submission and
//! present waits on it the same way. Tracing passes are compute shaders
//! using ray queries, so no shader binding tables are involved.

mod instance;
mod memory;
mod pipeline;
mod record;

use std::cell::RefCell;

use ash::vk;
use slotmap::SlotMap;

use crate::config::RenderSettings;
use crate::error::{GpuError, Result};
use crate::gpu::{
    AccelDesc, AccelGeometry, AccelHandle, AccelSizes, AcquireOutcome, BindingLayout,
    BindingResource, BindingTableDesc, BindingTableHandle, BufferDesc, BufferHandle, CommandBuffer,
    DeviceCapabilities, DeviceContext, FenceHandle, GpuResult, ImageDesc, ImageHandle,
    PipelineHandle, PipelineKind, PresentOutcome, ResourceId, SemaphoreHandle, Submission,
    Swapchain, SwapchainDesc, SwapchainHandle, ValidationCallback,
};
use crate::resource_state::Usage;

use instance::{Context, ValidationSink};
use memory::{to_rgba8, VulkanBuffer, VulkanImage};
use pipeline::{VulkanBindingTable, VulkanPipeline};
use record::{build_flags, geometry_data, geometry_type, Recorder};

fn vk_error(result: vk::Result) -> GpuError {
    match result {
        vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
            GpuError::OutOfMemory("device".to_string())
        }
        vk::Result::ERROR_DEVICE_LOST => GpuError::DeviceLost,
        vk::Result::TIMEOUT => GpuError::Timeout("fence".to_string()),
        other => GpuError::Vulkan(other.to_string()),
    }
}

struct OffscreenSwapchain {
    images: Vec<ImageHandle>,
    next: u32,
}

struct VulkanAccel {
    accel: vk::AccelerationStructureKHR,
    buffer: BufferHandle,
}

/// A submitted command buffer and the fence that tells when it retired.
struct InFlight {
    command_buffer: vk::CommandBuffer,
    fence: vk::Fence,
    owned_fence: bool,
}

#[derive(Default)]
struct State {
    images: SlotMap<ImageHandle, VulkanImage>,
    buffers: SlotMap<BufferHandle, VulkanBuffer>,
    fences: SlotMap<FenceHandle, vk::Fence>,
    semaphores: SlotMap<SemaphoreHandle, vk::Semaphore>,
    swapchains: SlotMap<SwapchainHandle, OffscreenSwapchain>,
    pipelines: SlotMap<PipelineHandle, VulkanPipeline>,
    tables: SlotMap<BindingTableHandle, (VulkanBindingTable, Vec<ResourceId>)>,
    accels: SlotMap<AccelHandle, VulkanAccel>,
    in_flight: Vec<InFlight>,
}

impl State {
    fn resource_exists(&self, resource: ResourceId) -> bool {
        match resource {
            ResourceId::Image(image) => self.images.contains_key(image),
            ResourceId::Buffer(buffer) => self.buffers.contains_key(buffer),
        }
    }

    /// Every resource a recording touches, directly or through its binding
    /// tables, must still be alive.
    fn check(&self, command_buffer: &CommandBuffer) -> GpuResult<()> {
        for command in command_buffer.commands() {
            for (resource, _) in command.accesses() {
                if !self.resource_exists(resource) {
                    return Err(GpuError::StaleResource(resource));
                }
            }
        }
        for table in command_buffer.referenced_binding_tables() {
            let (_, resources) = self
                .tables
                .get(table)
                .ok_or(GpuError::InvalidHandle("binding table"))?;
            let stale = resources.iter().find(|resource| !self.resource_exists(**resource));
            if let Some(stale) = stale {
                return Err(GpuError::StaleResource(*stale));
            }
        }
        Ok(())
    }

    /// Frees command buffers whose fence has signaled.
    fn reclaim(&mut self, context: &Context) {
        let device = &context.device;
        self.in_flight.retain(|submission| {
            let retired = unsafe { device.get_fence_status(submission.fence) }.unwrap_or(false);
            if retired {
                context.free_command_buffer(submission.command_buffer);
                if submission.owned_fence {
                    unsafe { device.destroy_fence(submission.fence, None) };
                }
            }
            !retired
        });
    }

    /// The device must be idle.
    fn reclaim_all(&mut self, context: &Context) {
        for submission in self.in_flight.drain(..) {
            context.free_command_buffer(submission.command_buffer);
            if submission.owned_fence {
                unsafe { context.device.destroy_fence(submission.fence, None) };
            }
        }
    }
}

pub struct VulkanDevice {
    context: Context,
    state: RefCell<State>,
    // Referenced by the debug messenger; dropped after the context.
    sink: Box<ValidationSink>,
}

impl VulkanDevice {
    pub fn new(settings: &RenderSettings) -> Result<Self> {
        let sink = Box::<ValidationSink>::default();
        let context = Context::new(settings, &sink)?;
        log::info!(
            "Vulkan device `{}` (queue family {}, scratch alignment {})",
            context.name,
            context.queue_family,
            context.capabilities.min_accel_scratch_alignment
        );
        Ok(Self {
            context,
            state: RefCell::new(State::default()),
            sink,
        })
    }

    fn create_fence_raw(&self, signaled: bool) -> GpuResult<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        unsafe {
            self.context
                .device
                .create_fence(&vk::FenceCreateInfo::default().flags(flags), None)
        }
        .map_err(vk_error)
    }

    fn semaphore(&self, semaphore: SemaphoreHandle) -> GpuResult<vk::Semaphore> {
        self.state
            .borrow()
            .semaphores
            .get(semaphore)
            .copied()
            .ok_or(GpuError::InvalidHandle("semaphore"))
    }

    /// A batch with no command buffers that only moves semaphores.
    fn signal_only(
        &self,
        wait: Option<vk::Semaphore>,
        signal: Option<vk::Semaphore>,
    ) -> GpuResult<()> {
        let waits: Vec<vk::SemaphoreSubmitInfo> = wait
            .into_iter()
            .map(|semaphore| {
                vk::SemaphoreSubmitInfo::default()
                    .semaphore(semaphore)
                    .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            })
            .collect();
        let signals: Vec<vk::SemaphoreSubmitInfo> = signal
            .into_iter()
            .map(|semaphore| {
                vk::SemaphoreSubmitInfo::default()
                    .semaphore(semaphore)
                    .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            })
            .collect();
        let batch = vk::SubmitInfo2::default()
            .wait_semaphore_infos(&waits)
            .signal_semaphore_infos(&signals);
        unsafe {
            self.context
                .device
                .queue_submit2(self.context.queue, &[batch], vk::Fence::null())
        }
        .map_err(vk_error)
    }

    /// Records and submits; returns the command buffer and fence now in flight.
    fn submit_recording(
        &self,
        state: &mut State,
        command_buffer: &CommandBuffer,
        submission: &Submission,
    ) -> GpuResult<InFlight> {
        state.reclaim(&self.context);
        state.check(command_buffer)?;

        let device = &self.context.device;
        let cmd = self.context.allocate_command_buffer().map_err(vk_error)?;
        let recorded = (|| -> GpuResult<()> {
            let begin = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            unsafe { device.begin_command_buffer(cmd, &begin) }.map_err(vk_error)?;
            Recorder::new(&self.context, state, cmd).record(command_buffer)?;
            unsafe { device.end_command_buffer(cmd) }.map_err(vk_error)
        })();
        if let Err(error) = recorded {
            self.context.free_command_buffer(cmd);
            return Err(error);
        }

        let (fence, owned_fence) = match submission.fence {
            Some(fence) => (
                *state.fences.get(fence).ok_or(GpuError::InvalidHandle("fence"))?,
                false,
            ),
            None => (self.create_fence_raw(false)?, true),
        };
        type SubmitInfos = GpuResult<Vec<vk::SemaphoreSubmitInfo<'static>>>;
        let lookup = |semaphore: Option<SemaphoreHandle>| -> SubmitInfos {
            semaphore
                .map(|semaphore| {
                    state
                        .semaphores
                        .get(semaphore)
                        .map(|semaphore| {
                            vk::SemaphoreSubmitInfo::default()
                                .semaphore(*semaphore)
                                .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
                        })
                        .ok_or(GpuError::InvalidHandle("semaphore"))
                })
                .into_iter()
                .collect()
        };
        let waits = lookup(submission.wait)?;
        let signals = lookup(submission.signal)?;
        let command_buffers = [vk::CommandBufferSubmitInfo::default().command_buffer(cmd)];
        let batch = vk::SubmitInfo2::default()
            .wait_semaphore_infos(&waits)
            .command_buffer_infos(&command_buffers)
            .signal_semaphore_infos(&signals);

        if let Err(result) = unsafe { device.queue_submit2(self.context.queue, &[batch], fence) } {
            self.context.free_command_buffer(cmd);
            if owned_fence {
                unsafe { device.destroy_fence(fence, None) };
            }
            return Err(vk_error(result));
        }
        Ok(InFlight {
            command_buffer: cmd,
            fence,
            owned_fence,
        })
    }

    fn wait_in_flight(&self, submission: InFlight) -> GpuResult<()> {
        let waited = unsafe {
            self.context
                .device
                .wait_for_fences(&[submission.fence], true, u64::MAX)
        };
        self.context.free_command_buffer(submission.command_buffer);
        if submission.owned_fence {
            unsafe { self.context.device.destroy_fence(submission.fence, None) };
        }
        waited.map_err(vk_error)
    }

    fn write_descriptors(
        &self,
        state: &State,
        set: vk::DescriptorSet,
        desc: &BindingTableDesc,
    ) -> GpuResult<()> {
        let sampler = self.context.sampler;
        let image_info = |handle: ImageHandle, usage: Usage| -> GpuResult<vk::DescriptorImageInfo> {
            let image = state.images.get(handle).ok_or(GpuError::StaleResource(handle.into()))?;
            Ok(vk::DescriptorImageInfo::default()
                .sampler(sampler)
                .image_view(image.view)
                .image_layout(usage.state().layout))
        };

        // Infos are collected first; the writes point into these vectors.
        let mut images: Vec<Vec<vk::DescriptorImageInfo>> = Vec::new();
        let mut buffers: Vec<[vk::DescriptorBufferInfo; 1]> = Vec::new();
        let mut accels: Vec<[vk::AccelerationStructureKHR; 1]> = Vec::new();
        let mut entries = Vec::new();
        for (slot, resource) in &desc.resources {
            let kind = desc
                .layout
                .slot(*slot)
                .map(|slot| slot.kind)
                .ok_or(GpuError::InvalidHandle("binding slot"))?;
            match resource {
                BindingResource::Accel(accel, _) => {
                    let accel = state
                        .accels
                        .get(*accel)
                        .ok_or(GpuError::InvalidHandle("acceleration structure"))?;
                    accels.push([accel.accel]);
                    entries.push((*slot, kind, 2, accels.len() - 1));
                }
                BindingResource::Buffer(handle) => {
                    let buffer = state
                        .buffers
                        .get(*handle)
                        .ok_or(GpuError::StaleResource((*handle).into()))?;
                    buffers.push([vk::DescriptorBufferInfo::default()
                        .buffer(buffer.buffer)
                        .range(vk::WHOLE_SIZE)]);
                    entries.push((*slot, kind, 1, buffers.len() - 1));
                }
                BindingResource::Image(handle) => {
                    let usage = if kind == crate::gpu::BindingKind::SampledImage {
                        Usage::Sampled
                    } else {
                        Usage::StorageWrite
                    };
                    images.push(vec![image_info(*handle, usage)?]);
                    entries.push((*slot, kind, 0, images.len() - 1));
                }
                BindingResource::Textures(handles) => {
                    let infos = handles
                        .iter()
                        .take(pipeline::MAX_TEXTURES as usize)
                        .map(|handle| image_info(*handle, Usage::Sampled))
                        .collect::<GpuResult<Vec<_>>>()?;
                    if infos.is_empty() {
                        continue;
                    }
                    images.push(infos);
                    entries.push((*slot, kind, 0, images.len() - 1));
                }
            }
        }

        let mut accel_writes: Vec<vk::WriteDescriptorSetAccelerationStructureKHR> = accels
            .iter()
            .map(|accel| {
                vk::WriteDescriptorSetAccelerationStructureKHR::default()
                    .acceleration_structures(accel)
            })
            .collect();
        let mut accel_writes = accel_writes.iter_mut();
        let mut writes = Vec::with_capacity(entries.len());
        for (slot, kind, family, index) in entries {
            let write = vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(slot)
                .descriptor_type(kind.descriptor_type());
            let write = match family {
                0 => write.image_info(&images[index]),
                1 => write.buffer_info(&buffers[index]),
                _ => {
                    let accel_write = accel_writes
                        .next()
                        .ok_or(GpuError::InvalidHandle("acceleration structure"))?;
                    write.descriptor_count(1).push_next(accel_write)
                }
            };
            writes.push(write);
        }
        unsafe { self.context.device.update_descriptor_sets(&writes, &[]) };
        Ok(())
    }
}

impl DeviceContext for VulkanDevice {
    fn name(&self) -> &str {
        &self.context.name
    }

    fn capabilities(&self) -> DeviceCapabilities {
        self.context.capabilities
    }

    fn set_validation_callback(&self, callback: ValidationCallback) {
        *self.sink.callback.borrow_mut() = Some(callback);
    }

    fn create_image(&self, desc: &ImageDesc) -> GpuResult<ImageHandle> {
        let image = VulkanImage::new(&self.context, desc)?;
        Ok(self.state.borrow_mut().images.insert(image))
    }

    fn destroy_image(&self, image: ImageHandle) {
        if let Some(image) = self.state.borrow_mut().images.remove(image) {
            image.destroy(&self.context);
        }
    }

    fn image_desc(&self, image: ImageHandle) -> GpuResult<ImageDesc> {
        self.state
            .borrow()
            .images
            .get(image)
            .map(|image| image.desc.clone())
            .ok_or(GpuError::InvalidHandle("image"))
    }

    fn create_buffer(&self, desc: &BufferDesc) -> GpuResult<BufferHandle> {
        let buffer = VulkanBuffer::new(&self.context, desc)?;
        Ok(self.state.borrow_mut().buffers.insert(buffer))
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        if let Some(buffer) = self.state.borrow_mut().buffers.remove(buffer) {
            buffer.destroy(&self.context);
        }
    }

    fn buffer_desc(&self, buffer: BufferHandle) -> GpuResult<BufferDesc> {
        self.state
            .borrow()
            .buffers
            .get(buffer)
            .map(|buffer| buffer.desc.clone())
            .ok_or(GpuError::InvalidHandle("buffer"))
    }

    fn write_buffer(&self, buffer: BufferHandle, offset: u64, data: &[u8]) -> GpuResult<()> {
        self.state
            .borrow_mut()
            .buffers
            .get_mut(buffer)
            .ok_or(GpuError::InvalidHandle("buffer"))?
            .write(offset, data)
    }

    fn buffer_address(&self, buffer: BufferHandle) -> GpuResult<u64> {
        self.state
            .borrow()
            .buffers
            .get(buffer)
            .map(|buffer| buffer.address)
            .ok_or(GpuError::InvalidHandle("buffer"))
    }

    fn create_fence(&self, signaled: bool) -> GpuResult<FenceHandle> {
        let fence = self.create_fence_raw(signaled)?;
        Ok(self.state.borrow_mut().fences.insert(fence))
    }

    fn destroy_fence(&self, fence: FenceHandle) {
        let mut state = self.state.borrow_mut();
        let Some(raw) = state.fences.remove(fence) else {
            return;
        };
        if state.in_flight.iter().any(|submission| submission.fence == raw) {
            let waited = unsafe { self.context.device.wait_for_fences(&[raw], true, u64::MAX) };
            if let Err(error) = waited {
                log::error!("Waiting before fence destruction failed: {}", error);
            }
            state.reclaim(&self.context);
            state.in_flight.retain(|submission| {
                let stale = submission.fence == raw;
                if stale {
                    self.context.free_command_buffer(submission.command_buffer);
                }
                !stale
            });
        }
        unsafe { self.context.device.destroy_fence(raw, None) };
    }

    fn wait_fence(&self, fence: FenceHandle, timeout: u64) -> GpuResult<()> {
        let raw = *self
            .state
            .borrow()
            .fences
            .get(fence)
            .ok_or(GpuError::InvalidHandle("fence"))?;
        unsafe { self.context.device.wait_for_fences(&[raw], true, timeout) }.map_err(vk_error)?;
        self.state.borrow_mut().reclaim(&self.context);
        Ok(())
    }

    fn reset_fence(&self, fence: FenceHandle) -> GpuResult<()> {
        let mut state = self.state.borrow_mut();
        // Retire what the fence covers before its signal is lost.
        state.reclaim(&self.context);
        let raw = *state.fences.get(fence).ok_or(GpuError::InvalidHandle("fence"))?;
        unsafe { self.context.device.reset_fences(&[raw]) }.map_err(vk_error)
    }

    fn fence_signaled(&self, fence: FenceHandle) -> GpuResult<bool> {
        let raw = *self
            .state
            .borrow()
            .fences
            .get(fence)
            .ok_or(GpuError::InvalidHandle("fence"))?;
        unsafe { self.context.device.get_fence_status(raw) }.map_err(vk_error)
    }

    fn create_semaphore(&self) -> GpuResult<SemaphoreHandle> {
        let semaphore = unsafe {
            self.context
                .device
                .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)
        }
        .map_err(vk_error)?;
        Ok(self.state.borrow_mut().semaphores.insert(semaphore))
    }

    fn destroy_semaphore(&self, semaphore: SemaphoreHandle) {
        if let Some(semaphore) = self.state.borrow_mut().semaphores.remove(semaphore) {
            unsafe { self.context.device.destroy_semaphore(semaphore, None) };
        }
    }

    fn create_swapchain(&self, desc: &SwapchainDesc) -> GpuResult<Swapchain> {
        let usage = vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST;
        let image_count = desc.image_count.max(2);
        let mut images = Vec::with_capacity(image_count as usize);
        for index in 0..image_count {
            let label = format!("surface image {index}");
            match self.create_image(&ImageDesc::new(&label, desc.extent, desc.format, usage)) {
                Ok(image) => images.push(image),
                Err(error) => {
                    for image in images {
                        self.destroy_image(image);
                    }
                    return Err(error);
                }
            }
        }
        let handle = self.state.borrow_mut().swapchains.insert(OffscreenSwapchain {
            images: images.clone(),
            next: 0,
        });
        log::debug!(
            "Offscreen swapchain {}x{} with {} images",
            desc.extent.width,
            desc.extent.height,
            image_count
        );
        Ok(Swapchain {
            handle,
            extent: desc.extent,
            format: desc.format,
            images,
        })
    }

    fn destroy_swapchain(&self, swapchain: SwapchainHandle) {
        let chain = self.state.borrow_mut().swapchains.remove(swapchain);
        if let Some(chain) = chain {
            for image in chain.images {
                self.destroy_image(image);
            }
        }
    }

    fn acquire_next_image(
        &self,
        swapchain: SwapchainHandle,
        signal: SemaphoreHandle,
        _timeout: u64,
    ) -> GpuResult<AcquireOutcome> {
        let image_index = {
            let mut state = self.state.borrow_mut();
            let chain = state
                .swapchains
                .get_mut(swapchain)
                .ok_or(GpuError::InvalidHandle("swapchain"))?;
            let index = chain.next;
            chain.next = (chain.next + 1) % chain.images.len() as u32;
            index
        };
        self.signal_only(None, Some(self.semaphore(signal)?))?;
        Ok(AcquireOutcome::Ready(image_index))
    }

    fn present(
        &self,
        swapchain: SwapchainHandle,
        _image_index: u32,
        wait: SemaphoreHandle,
    ) -> GpuResult<PresentOutcome> {
        if !self.state.borrow().swapchains.contains_key(swapchain) {
            return Err(GpuError::InvalidHandle("swapchain"));
        }
        self.signal_only(Some(self.semaphore(wait)?), None)?;
        Ok(PresentOutcome::Presented)
    }

    fn create_pipeline(
        &self,
        name: &str,
        kind: PipelineKind,
        code: &[u32],
        layout: &BindingLayout,
    ) -> GpuResult<PipelineHandle> {
        let pipeline = VulkanPipeline::new(&self.context, name, kind, code, layout)?;
        log::debug!("Created {:?} pipeline `{}`", kind, name);
        Ok(self.state.borrow_mut().pipelines.insert(pipeline))
    }

    fn destroy_pipeline(&self, pipeline: PipelineHandle) {
        if let Some(pipeline) = self.state.borrow_mut().pipelines.remove(pipeline) {
            pipeline.destroy(&self.context);
        }
    }

    fn create_binding_table(&self, desc: &BindingTableDesc) -> GpuResult<BindingTableHandle> {
        let mut state = self.state.borrow_mut();
        let resources = desc.referenced_resources();
        if let Some(stale) = resources.iter().find(|resource| !state.resource_exists(**resource)) {
            return Err(GpuError::StaleResource(*stale));
        }
        let table = VulkanBindingTable::new(&self.context, &desc.layout)?;
        if let Err(error) = self.write_descriptors(&state, table.set, desc) {
            table.destroy(&self.context);
            return Err(error);
        }
        Ok(state.tables.insert((table, resources)))
    }

    fn destroy_binding_table(&self, table: BindingTableHandle) {
        if let Some((table, _)) = self.state.borrow_mut().tables.remove(table) {
            table.destroy(&self.context);
        }
    }

    fn accel_build_sizes(&self, geometry: &AccelGeometry) -> GpuResult<AccelSizes> {
        let state = self.state.borrow();
        let data = geometry_data(&state, geometry)?;
        let info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(geometry_type(geometry))
            .flags(build_flags(geometry))
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(std::slice::from_ref(&data));
        let mut sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
        unsafe {
            self.context.accel.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &info,
                &[geometry.primitive_count()],
                &mut sizes,
            )
        };
        Ok(AccelSizes {
            result: sizes.acceleration_structure_size,
            build_scratch: sizes.build_scratch_size,
            update_scratch: sizes.update_scratch_size,
        })
    }

    fn create_accel(&self, desc: &AccelDesc) -> GpuResult<AccelHandle> {
        let mut state = self.state.borrow_mut();
        let buffer = state
            .buffers
            .get(desc.buffer)
            .ok_or(GpuError::InvalidHandle("buffer"))?;
        if desc.offset + desc.size > buffer.desc.size {
            return Err(GpuError::InvalidHandle("acceleration structure range"));
        }
        let ty = if desc.top_level {
            vk::AccelerationStructureTypeKHR::TOP_LEVEL
        } else {
            vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL
        };
        let info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(buffer.buffer)
            .offset(desc.offset)
            .size(desc.size)
            .ty(ty);
        let accel = unsafe { self.context.accel.create_acceleration_structure(&info, None) }
            .map_err(vk_error)?;
        Ok(state.accels.insert(VulkanAccel {
            accel,
            buffer: desc.buffer,
        }))
    }

    fn destroy_accel(&self, accel: AccelHandle) {
        if let Some(accel) = self.state.borrow_mut().accels.remove(accel) {
            unsafe {
                self.context
                    .accel
                    .destroy_acceleration_structure(accel.accel, None)
            };
        }
    }

    fn accel_address(&self, accel: AccelHandle) -> GpuResult<u64> {
        let state = self.state.borrow();
        let accel = state
            .accels
            .get(accel)
            .ok_or(GpuError::InvalidHandle("acceleration structure"))?;
        if !state.buffers.contains_key(accel.buffer) {
            return Err(GpuError::StaleResource(accel.buffer.into()));
        }
        let info = vk::AccelerationStructureDeviceAddressInfoKHR::default()
            .acceleration_structure(accel.accel);
        Ok(unsafe {
            self.context
                .accel
                .get_acceleration_structure_device_address(&info)
        })
    }

    fn submit(&self, command_buffer: &CommandBuffer, submission: &Submission) -> GpuResult<()> {
        let mut state = self.state.borrow_mut();
        let in_flight = self.submit_recording(&mut state, command_buffer, submission)?;
        state.in_flight.push(in_flight);
        Ok(())
    }

    fn submit_and_wait(&self, command_buffer: &CommandBuffer) -> GpuResult<()> {
        let in_flight = {
            let mut state = self.state.borrow_mut();
            self.submit_recording(&mut state, command_buffer, &Submission::default())?
        };
        self.wait_in_flight(in_flight)
    }

    fn wait_idle(&self) -> GpuResult<()> {
        unsafe { self.context.device.device_wait_idle() }.map_err(vk_error)?;
        self.state.borrow_mut().reclaim_all(&self.context);
        Ok(())
    }

    fn read_image(&self, image: ImageHandle) -> GpuResult<Vec<u8>> {
        let (raw, desc, layout) = {
            let state = self.state.borrow();
            let image = state.images.get(image).ok_or(GpuError::InvalidHandle("image"))?;
            (image.image, image.desc.clone(), image.layout)
        };
        let size = u64::from(desc.extent.width) * u64::from(desc.extent.height) * 4;
        let staging = VulkanBuffer::new(
            &self.context,
            &BufferDesc::host_visible("readback", size, vk::BufferUsageFlags::TRANSFER_DST),
        )?;

        let device = &self.context.device;
        let read = (|| -> GpuResult<Vec<u8>> {
            let cmd = self.context.allocate_command_buffer().map_err(vk_error)?;
            let fence = self.create_fence_raw(false)?;
            let range = memory::subresource_range(desc.format);
            let to_transfer = vk::ImageMemoryBarrier2::default()
                .src_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
                .src_access_mask(vk::AccessFlags2::MEMORY_WRITE)
                .dst_stage_mask(vk::PipelineStageFlags2::ALL_TRANSFER)
                .dst_access_mask(vk::AccessFlags2::TRANSFER_READ)
                .old_layout(layout)
                .new_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
                .image(raw)
                .subresource_range(range);
            let back = vk::ImageMemoryBarrier2::default()
                .src_stage_mask(vk::PipelineStageFlags2::ALL_TRANSFER)
                .src_access_mask(vk::AccessFlags2::TRANSFER_READ)
                .dst_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
                .dst_access_mask(vk::AccessFlags2::MEMORY_READ)
                .old_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
                .new_layout(if layout == vk::ImageLayout::UNDEFINED {
                    vk::ImageLayout::GENERAL
                } else {
                    layout
                })
                .image(raw)
                .subresource_range(range);
            let region = vk::BufferImageCopy::default()
                .image_subresource(
                    vk::ImageSubresourceLayers::default()
                        .aspect_mask(memory::aspect(desc.format))
                        .layer_count(1),
                )
                .image_extent(vk::Extent3D {
                    width: desc.extent.width,
                    height: desc.extent.height,
                    depth: 1,
                });

            let result = unsafe {
                let begin = vk::CommandBufferBeginInfo::default()
                    .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
                device.begin_command_buffer(cmd, &begin).and_then(|_| {
                    let barriers = [to_transfer];
                    let dependency = vk::DependencyInfo::default().image_memory_barriers(&barriers);
                    device.cmd_pipeline_barrier2(cmd, &dependency);
                    device.cmd_copy_image_to_buffer(
                        cmd,
                        raw,
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        staging.buffer,
                        &[region],
                    );
                    let barriers = [back];
                    let dependency = vk::DependencyInfo::default().image_memory_barriers(&barriers);
                    device.cmd_pipeline_barrier2(cmd, &dependency);
                    device.end_command_buffer(cmd)?;
                    let command_buffers =
                        [vk::CommandBufferSubmitInfo::default().command_buffer(cmd)];
                    let batch = vk::SubmitInfo2::default().command_buffer_infos(&command_buffers);
                    device.queue_submit2(self.context.queue, &[batch], fence)?;
                    device.wait_for_fences(&[fence], true, u64::MAX)
                })
            };
            self.context.free_command_buffer(cmd);
            unsafe { device.destroy_fence(fence, None) };
            result.map_err(vk_error)?;
            staging.read(size as usize)
        })();
        staging.destroy(&self.context);
        if let Some(image) = self.state.borrow_mut().images.get_mut(image) {
            if image.layout == vk::ImageLayout::UNDEFINED {
                image.layout = vk::ImageLayout::GENERAL;
            }
        }
        to_rgba8(desc.format, read?)
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        if let Err(error) = unsafe { self.context.device.device_wait_idle() } {
            log::error!("Vulkan device did not go idle: {}", error);
        }
        let state = self.state.get_mut();
        state.reclaim_all(&self.context);
        let leaked =
            state.images.len() + state.buffers.len() + state.pipelines.len() + state.tables.len();
        if leaked > 0 {
            log::warn!("{} device objects still alive at shutdown", leaked);
        }
        let context = &self.context;
        for (_, (table, _)) in state.tables.drain() {
            table.destroy(context);
        }
        for (_, pipeline) in state.pipelines.drain() {
            pipeline.destroy(context);
        }
        for (_, accel) in state.accels.drain() {
            unsafe { context.accel.destroy_acceleration_structure(accel.accel, None) };
        }
        state.swapchains.clear();
        for (_, image) in state.images.drain() {
            image.destroy(context);
        }
        for (_, buffer) in state.buffers.drain() {
            buffer.destroy(context);
        }
        unsafe {
            for (_, fence) in state.fences.drain() {
                context.device.destroy_fence(fence, None);
            }
            for (_, semaphore) in state.semaphores.drain() {
                context.device.destroy_semaphore(semaphore, None);
            }
        }
        self.context.destroy();
    }
}
