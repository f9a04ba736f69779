//! Simulated device used for offscreen runs and tests.
//!
//! Submissions are executed on the CPU against a single color per image,
//! which is enough to follow data through clears, copies and passes. Work
//! retires lazily: with a latency of `n`, a submission's fence is signaled
//! only once `n` later submissions were queued or someone waits on it.

use std::cell::RefCell;
use std::collections::{HashSet, VecDeque};

use ash::vk;
use byteorder::{LittleEndian, ReadBytesExt};
use slotmap::SlotMap;

use crate::compositor::{
    accumulate_texel, ACCUMULATE_CURRENT_IDS_SLOT, ACCUMULATE_HISTORY_SLOT, ACCUMULATE_INPUT_SLOT,
    ACCUMULATE_PASS, ACCUMULATE_PREVIOUS_IDS_SLOT, ACCUMULATE_TARGET_SLOT,
};
use crate::error::GpuError;
use crate::gpu::{
    align_up, AccelDesc, AccelGeometry, AccelHandle, AccelSizes, AcquireOutcome, BindingLayout,
    BindingResource, BindingTableDesc, BindingTableHandle, BufferDesc, BufferHandle, Command,
    CommandBuffer, DeviceCapabilities, DeviceContext, FenceHandle, GpuResult, ImageDesc,
    ImageHandle, Pass, PipelineHandle, PipelineKind, PresentOutcome, ResourceId, SemaphoreHandle,
    Submission, Swapchain, SwapchainDesc, SwapchainHandle, ValidationCallback, ValidationMessage,
    ValidationSeverity,
};
use crate::resource_state::validate_barriers;
use crate::shader_library::SPIRV_MAGIC;

const ADDRESS_ALIGNMENT: u64 = 256;

#[derive(Clone, Debug, PartialEq)]
pub enum DeviceEvent {
    ImageCreated { image: ImageHandle, label: String },
    ImageDestroyed { image: ImageHandle },
    BufferCreated { buffer: BufferHandle, label: String, size: u64 },
    BufferDestroyed { buffer: BufferHandle },
    FenceWaited { fence: FenceHandle, blocked: bool },
    FenceReset { fence: FenceHandle },
    SwapchainCreated { extent: vk::Extent2D, image_count: u32 },
    SwapchainDestroyed,
    Acquired { image_index: u32 },
    Submitted { label: String, recording: u64, fence: Option<FenceHandle> },
    OneShotSubmitted { label: String },
    Presented { image_index: u32 },
    AccelBuilt { bottom_level: usize, top_level: usize },
    AccelUpdated { instances: u32 },
    BindingTableCreated { table: BindingTableHandle, layout: String },
    BindingTableDestroyed { table: BindingTableHandle },
    PipelineCreated { name: String },
    ExternalHandoff,
    WaitIdle,
}

#[derive(Clone, Debug)]
pub struct HeadlessConfig {
    pub capabilities: DeviceCapabilities,
    /// Submissions queued before the oldest one retires on its own.
    pub latency: usize,
    pub surface_extent: vk::Extent2D,
    pub max_surface_images: u32,
}

impl Default for HeadlessConfig {
    fn default() -> Self {
        Self {
            capabilities: DeviceCapabilities::default(),
            latency: 1,
            surface_extent: vk::Extent2D {
                width: 1280,
                height: 720,
            },
            max_surface_images: 3,
        }
    }
}

struct HeadlessImage {
    desc: ImageDesc,
    color: [f32; 4],
}

struct HeadlessBuffer {
    desc: BufferDesc,
    data: Vec<u8>,
    address: u64,
}

struct HeadlessSwapchain {
    images: Vec<ImageHandle>,
    next: u32,
}

struct HeadlessAccel {
    desc: AccelDesc,
    address: u64,
    built: bool,
}

struct Pending {
    fence: Option<FenceHandle>,
    resources: HashSet<ResourceId>,
}

#[derive(Default)]
struct State {
    images: SlotMap<ImageHandle, HeadlessImage>,
    buffers: SlotMap<BufferHandle, HeadlessBuffer>,
    fences: SlotMap<FenceHandle, bool>,
    semaphores: SlotMap<SemaphoreHandle, bool>,
    swapchains: SlotMap<SwapchainHandle, HeadlessSwapchain>,
    pipelines: SlotMap<PipelineHandle, (String, PipelineKind)>,
    tables: SlotMap<BindingTableHandle, BindingTableDesc>,
    accels: SlotMap<AccelHandle, HeadlessAccel>,
    pending: VecDeque<Pending>,
    events: Vec<DeviceEvent>,
    messages: Vec<ValidationMessage>,
    hazards: usize,
    next_address: u64,
    surface_extent: vk::Extent2D,
    inject_acquire: Option<AcquireOutcome>,
    inject_present: Option<PresentOutcome>,
    fail_next_submit: Option<GpuError>,
}

impl State {
    fn allocate_address(&mut self, size: u64) -> u64 {
        let address = self.next_address;
        self.next_address += align_up(size.max(1), ADDRESS_ALIGNMENT);
        address
    }

    fn resource_exists(&self, resource: ResourceId) -> bool {
        match resource {
            ResourceId::Image(image) => self.images.contains_key(image),
            ResourceId::Buffer(buffer) => self.buffers.contains_key(buffer),
        }
    }

    fn retire_front(&mut self) {
        if let Some(pending) = self.pending.pop_front() {
            if let Some(fence) = pending.fence {
                if let Some(signaled) = self.fences.get_mut(fence) {
                    *signaled = true;
                }
            }
        }
    }

    fn retire_all(&mut self) {
        while !self.pending.is_empty() {
            self.retire_front();
        }
    }

    fn warn(&mut self, severity: ValidationSeverity, message: String) {
        self.messages.push(ValidationMessage { severity, message });
    }

    fn in_flight(&self, resource: ResourceId) -> bool {
        self.pending
            .iter()
            .any(|pending| pending.resources.contains(&resource))
    }

    /// Stale handles fail the submission; barrier hazards are only reported.
    fn check(&mut self, command_buffer: &CommandBuffer) -> GpuResult<HashSet<ResourceId>> {
        let mut resources = HashSet::new();
        for command in command_buffer.commands() {
            for (resource, _) in command.accesses() {
                if !self.resource_exists(resource) {
                    return Err(GpuError::StaleResource(resource));
                }
                resources.insert(resource);
            }
            if let Command::Barrier(barrier) = command {
                if !self.resource_exists(barrier.resource) {
                    return Err(GpuError::StaleResource(barrier.resource));
                }
            }
            if let Command::Pass(pass) = command {
                if !self.pipelines.contains_key(pass.pipeline) {
                    return Err(GpuError::InvalidHandle("pipeline"));
                }
                if let Some(table) = pass.bindings {
                    let desc = self
                        .tables
                        .get(table)
                        .ok_or(GpuError::InvalidHandle("binding table"))?;
                    for resource in desc.referenced_resources() {
                        if !self.resource_exists(resource) {
                            return Err(GpuError::StaleResource(resource));
                        }
                        resources.insert(resource);
                    }
                }
            }
            if let Command::BuildAccel(builds) = command {
                for build in builds {
                    if !self.accels.contains_key(build.accel) {
                        return Err(GpuError::InvalidHandle("acceleration structure"));
                    }
                }
            }
            if let Command::UpdateAccel(build) = command {
                let built = self.accels.get(build.accel).map(|accel| accel.built);
                match built {
                    None => return Err(GpuError::InvalidHandle("acceleration structure")),
                    Some(false) => self.warn(
                        ValidationSeverity::Error,
                        format!(
                            "{}: update of an acceleration structure that was never built",
                            command_buffer.label()
                        ),
                    ),
                    Some(true) => {}
                }
            }
        }

        for violation in validate_barriers(command_buffer) {
            self.hazards += 1;
            self.warn(
                ValidationSeverity::Warning,
                format!("{}: {}", command_buffer.label(), violation),
            );
        }

        Ok(resources)
    }

    fn color_of(&self, image: ImageHandle) -> [f32; 4] {
        self.images
            .get(image)
            .map(|image| image.color)
            .unwrap_or([0.0; 4])
    }

    fn paint(&mut self, image: ImageHandle, color: [f32; 4]) {
        if let Some(image) = self.images.get_mut(image) {
            image.color = color;
        }
    }

    fn is_accumulate(&self, pass: &Pass) -> bool {
        self.pipelines
            .get(pass.pipeline)
            .is_some_and(|(name, _)| name == ACCUMULATE_PASS)
    }

    fn bound_image(&self, pass: &Pass, slot: u32) -> Option<ImageHandle> {
        let table = self.tables.get(pass.bindings?)?;
        match table.resources.get(&slot)? {
            BindingResource::Image(image) => Some(*image),
            _ => None,
        }
    }

    /// Runs the accumulate pass on the CPU, one color per image standing in
    /// for every texel.
    fn accumulate(&mut self, pass: &Pass) {
        let slots = [
            ACCUMULATE_INPUT_SLOT,
            ACCUMULATE_PREVIOUS_IDS_SLOT,
            ACCUMULATE_CURRENT_IDS_SLOT,
            ACCUMULATE_HISTORY_SLOT,
            ACCUMULATE_TARGET_SLOT,
        ];
        let Some([input, previous_ids, current_ids, history, target]) = slots
            .iter()
            .map(|slot| self.bound_image(pass, *slot))
            .collect::<Option<Vec<_>>>()
            .and_then(|images| <[ImageHandle; 5]>::try_from(images).ok())
        else {
            self.warn(
                ValidationSeverity::Error,
                format!("{}: accumulate pass without its images bound", pass.label),
            );
            return;
        };
        let weight = pass
            .push_constants
            .as_slice()
            .read_f32::<LittleEndian>()
            .unwrap_or(1.0);
        let same_surface = self.color_of(previous_ids) == self.color_of(current_ids);
        let color = accumulate_texel(
            self.color_of(input),
            self.color_of(history),
            same_surface,
            weight,
        );
        self.paint(target, color);
    }

    fn execute(&mut self, command_buffer: &CommandBuffer) {
        for command in command_buffer.commands() {
            match command {
                Command::ClearImage { image, color } => self.paint(*image, *color),
                Command::CopyImage { src, dst } => {
                    let color = self.color_of(*src);
                    self.paint(*dst, color);
                }
                Command::UpdateBuffer {
                    buffer,
                    offset,
                    data,
                } => {
                    if let Some(buffer) = self.buffers.get_mut(*buffer) {
                        write_bytes(&mut buffer.data, *offset, data);
                    }
                }
                Command::Pass(pass) if self.is_accumulate(pass) => self.accumulate(pass),
                Command::Pass(pass) => {
                    // Written images take the color of the first image the pass reads.
                    let source = pass.accesses.iter().find_map(|(resource, usage)| match resource {
                        ResourceId::Image(image) if !usage.is_write() => Some(*image),
                        _ => None,
                    });
                    let color =
                        source.map(|image| self.color_of(image)).unwrap_or([0.0, 0.0, 0.0, 1.0]);
                    for (resource, usage) in &pass.accesses {
                        if let (ResourceId::Image(image), true) = (resource, usage.is_write()) {
                            self.paint(*image, color);
                        }
                    }
                }
                Command::BuildAccel(builds) => {
                    let top_level =
                        builds.iter().filter(|build| build.geometry.is_top_level()).count();
                    for build in builds {
                        if let Some(accel) = self.accels.get_mut(build.accel) {
                            accel.built = true;
                        }
                    }
                    self.events.push(DeviceEvent::AccelBuilt {
                        bottom_level: builds.len() - top_level,
                        top_level,
                    });
                }
                Command::UpdateAccel(build) => {
                    self.events.push(DeviceEvent::AccelUpdated {
                        instances: build.geometry.primitive_count(),
                    });
                }
                Command::ExternalHandoff { input, output } => {
                    let color = self.color_of(*input);
                    self.paint(*output, color);
                    self.events.push(DeviceEvent::ExternalHandoff);
                }
                Command::BeginLabel(_) | Command::EndLabel | Command::Barrier(_) => {}
            }
        }
    }
}

fn write_bytes(target: &mut Vec<u8>, offset: u64, data: &[u8]) {
    let start = offset as usize;
    let end = start + data.len();
    if target.len() < end {
        target.resize(end, 0);
    }
    target[start..end].copy_from_slice(data);
}

pub struct HeadlessDevice {
    config: HeadlessConfig,
    state: RefCell<State>,
    callback: RefCell<Option<ValidationCallback>>,
}

impl HeadlessDevice {
    pub fn new(config: HeadlessConfig) -> Self {
        let state = State {
            next_address: 0x1000,
            surface_extent: config.surface_extent,
            ..State::default()
        };
        Self {
            config,
            state: RefCell::new(state),
            callback: RefCell::new(None),
        }
    }

    pub fn with_latency(mut self, latency: usize) -> Self {
        self.config.latency = latency;
        self
    }

    fn flush_messages(&self) {
        let messages: Vec<ValidationMessage> = self.state.borrow_mut().messages.drain(..).collect();
        if messages.is_empty() {
            return;
        }
        let callback = self.callback.borrow();
        for message in &messages {
            match callback.as_ref() {
                Some(callback) => callback(message),
                None => log::warn!("{}", message.message),
            }
        }
    }

    pub fn events(&self) -> Vec<DeviceEvent> {
        self.state.borrow().events.clone()
    }

    pub fn clear_events(&self) {
        self.state.borrow_mut().events.clear();
    }

    /// Barrier hazards found while validating submissions.
    pub fn hazard_count(&self) -> usize {
        self.state.borrow().hazards
    }

    /// The next acquire reports `outcome` instead of handing out an image.
    pub fn inject_acquire(&self, outcome: AcquireOutcome) {
        self.state.borrow_mut().inject_acquire = Some(outcome);
    }

    pub fn inject_present(&self, outcome: PresentOutcome) {
        self.state.borrow_mut().inject_present = Some(outcome);
    }

    /// The platform reports a new window size; the surface becomes out of date.
    pub fn resize_surface(&self, extent: vk::Extent2D) {
        let mut state = self.state.borrow_mut();
        state.surface_extent = extent;
        state.inject_acquire = Some(AcquireOutcome::OutOfDate);
    }

    pub fn fail_next_submit(&self, error: GpuError) {
        self.state.borrow_mut().fail_next_submit = Some(error);
    }

    pub fn live_images(&self) -> Vec<ImageHandle> {
        self.state.borrow().images.keys().collect()
    }

    pub fn live_buffer_count(&self) -> usize {
        self.state.borrow().buffers.len()
    }

    pub fn live_binding_tables(&self) -> usize {
        self.state.borrow().tables.len()
    }

    pub fn live_accels(&self) -> usize {
        self.state.borrow().accels.len()
    }

    /// Overwrites an image's contents as if the host had uploaded them.
    pub fn set_image_color(&self, image: ImageHandle, color: [f32; 4]) {
        self.state.borrow_mut().paint(image, color);
    }

    pub fn image_color(&self, image: ImageHandle) -> Option<[f32; 4]> {
        self.state.borrow().images.get(image).map(|image| image.color)
    }

    pub fn buffer_contents(&self, buffer: BufferHandle) -> Option<Vec<u8>> {
        self.state.borrow().buffers.get(buffer).map(|buffer| buffer.data.clone())
    }

    /// Live binding tables that still reference a destroyed resource.
    pub fn stale_binding_tables(&self) -> Vec<BindingTableHandle> {
        let state = self.state.borrow();
        state
            .tables
            .iter()
            .filter(|(_, desc)| {
                desc.referenced_resources()
                    .into_iter()
                    .any(|resource| !state.resource_exists(resource))
            })
            .map(|(handle, _)| handle)
            .collect()
    }

    fn destroy_check(&self, resource: ResourceId, label: &str) {
        let mut state = self.state.borrow_mut();
        if state.in_flight(resource) {
            state.warn(
                ValidationSeverity::Error,
                format!("{label} destroyed while still in use by pending work"),
            );
        }
    }
}

impl DeviceContext for HeadlessDevice {
    fn name(&self) -> &str {
        "headless"
    }

    fn capabilities(&self) -> DeviceCapabilities {
        self.config.capabilities
    }

    fn set_validation_callback(&self, callback: ValidationCallback) {
        *self.callback.borrow_mut() = Some(callback);
    }

    fn create_image(&self, desc: &ImageDesc) -> GpuResult<ImageHandle> {
        if desc.extent.width == 0 || desc.extent.height == 0 {
            return Err(GpuError::Unsupported(format!("zero sized image `{}`", desc.label)));
        }
        if desc.external && !self.config.capabilities.external_memory {
            return Err(GpuError::Unsupported("external memory".to_string()));
        }
        let mut state = self.state.borrow_mut();
        let image = state.images.insert(HeadlessImage {
            desc: desc.clone(),
            color: [0.0; 4],
        });
        state.events.push(DeviceEvent::ImageCreated {
            image,
            label: desc.label.clone(),
        });
        Ok(image)
    }

    fn destroy_image(&self, image: ImageHandle) {
        self.destroy_check(image.into(), "image");
        let mut state = self.state.borrow_mut();
        if state.images.remove(image).is_some() {
            state.events.push(DeviceEvent::ImageDestroyed { image });
        }
        drop(state);
        self.flush_messages();
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
        let mut state = self.state.borrow_mut();
        let address = state.allocate_address(desc.size);
        let buffer = state.buffers.insert(HeadlessBuffer {
            desc: desc.clone(),
            data: vec![0; desc.size as usize],
            address,
        });
        state.events.push(DeviceEvent::BufferCreated {
            buffer,
            label: desc.label.clone(),
            size: desc.size,
        });
        Ok(buffer)
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        self.destroy_check(buffer.into(), "buffer");
        let mut state = self.state.borrow_mut();
        if state.buffers.remove(buffer).is_some() {
            state.events.push(DeviceEvent::BufferDestroyed { buffer });
        }
        drop(state);
        self.flush_messages();
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
        let mut state = self.state.borrow_mut();
        let target = state
            .buffers
            .get_mut(buffer)
            .ok_or(GpuError::InvalidHandle("buffer"))?;
        if !target.desc.host_visible {
            return Err(GpuError::Unsupported(format!(
                "host write into device local buffer `{}`",
                target.desc.label
            )));
        }
        if offset + data.len() as u64 > target.desc.size {
            return Err(GpuError::Unsupported(format!(
                "write of {} bytes at {} overflows `{}`",
                data.len(),
                offset,
                target.desc.label
            )));
        }
        write_bytes(&mut target.data, offset, data);
        Ok(())
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
        Ok(self.state.borrow_mut().fences.insert(signaled))
    }

    fn destroy_fence(&self, fence: FenceHandle) {
        self.state.borrow_mut().fences.remove(fence);
    }

    fn wait_fence(&self, fence: FenceHandle, _timeout: u64) -> GpuResult<()> {
        let mut state = self.state.borrow_mut();
        let signaled = *state
            .fences
            .get(fence)
            .ok_or(GpuError::InvalidHandle("fence"))?;
        if signaled {
            state.events.push(DeviceEvent::FenceWaited {
                fence,
                blocked: false,
            });
            return Ok(());
        }

        let position = state
            .pending
            .iter()
            .position(|pending| pending.fence == Some(fence))
            .ok_or_else(|| GpuError::Timeout("fence with no pending work".to_string()))?;
        for _ in 0..=position {
            state.retire_front();
        }
        state.events.push(DeviceEvent::FenceWaited {
            fence,
            blocked: true,
        });
        Ok(())
    }

    fn reset_fence(&self, fence: FenceHandle) -> GpuResult<()> {
        let mut state = self.state.borrow_mut();
        let signaled = state
            .fences
            .get_mut(fence)
            .ok_or(GpuError::InvalidHandle("fence"))?;
        *signaled = false;
        state.events.push(DeviceEvent::FenceReset { fence });
        Ok(())
    }

    fn fence_signaled(&self, fence: FenceHandle) -> GpuResult<bool> {
        self.state
            .borrow()
            .fences
            .get(fence)
            .copied()
            .ok_or(GpuError::InvalidHandle("fence"))
    }

    fn create_semaphore(&self) -> GpuResult<SemaphoreHandle> {
        Ok(self.state.borrow_mut().semaphores.insert(false))
    }

    fn destroy_semaphore(&self, semaphore: SemaphoreHandle) {
        self.state.borrow_mut().semaphores.remove(semaphore);
    }

    fn create_swapchain(&self, desc: &SwapchainDesc) -> GpuResult<Swapchain> {
        let mut state = self.state.borrow_mut();
        let extent = state.surface_extent;
        let image_count = desc.image_count.clamp(2, self.config.max_surface_images.max(2));
        let mut images = Vec::new();
        for index in 0..image_count {
            let image = state.images.insert(HeadlessImage {
                desc: ImageDesc::new(
                    &format!("surface image {index}"),
                    extent,
                    desc.format,
                    vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST,
                ),
                color: [0.0; 4],
            });
            images.push(image);
        }
        let handle = state.swapchains.insert(HeadlessSwapchain {
            images: images.clone(),
            next: 0,
        });
        state.events.push(DeviceEvent::SwapchainCreated {
            extent,
            image_count,
        });
        Ok(Swapchain {
            handle,
            extent,
            format: desc.format,
            images,
        })
    }

    fn destroy_swapchain(&self, swapchain: SwapchainHandle) {
        let mut state = self.state.borrow_mut();
        if let Some(chain) = state.swapchains.remove(swapchain) {
            for image in chain.images {
                state.images.remove(image);
            }
            state.events.push(DeviceEvent::SwapchainDestroyed);
        }
    }

    fn acquire_next_image(
        &self,
        swapchain: SwapchainHandle,
        signal: SemaphoreHandle,
        _timeout: u64,
    ) -> GpuResult<AcquireOutcome> {
        let mut state = self.state.borrow_mut();
        let injected = state.inject_acquire.take();
        if injected == Some(AcquireOutcome::OutOfDate) {
            return Ok(AcquireOutcome::OutOfDate);
        }

        let chain = state
            .swapchains
            .get_mut(swapchain)
            .ok_or(GpuError::InvalidHandle("swapchain"))?;
        let image_index = chain.next;
        chain.next = (chain.next + 1) % chain.images.len() as u32;

        let semaphore = state
            .semaphores
            .get_mut(signal)
            .ok_or(GpuError::InvalidHandle("semaphore"))?;
        let already_signaled = std::mem::replace(semaphore, true);
        if already_signaled {
            state.warn(
                ValidationSeverity::Error,
                "acquire signals a semaphore that is already signaled".to_string(),
            );
        }
        state.events.push(DeviceEvent::Acquired { image_index });
        drop(state);
        self.flush_messages();

        Ok(match injected {
            Some(AcquireOutcome::Suboptimal(_)) => AcquireOutcome::Suboptimal(image_index),
            _ => AcquireOutcome::Ready(image_index),
        })
    }

    fn present(
        &self,
        swapchain: SwapchainHandle,
        image_index: u32,
        wait: SemaphoreHandle,
    ) -> GpuResult<PresentOutcome> {
        let mut state = self.state.borrow_mut();
        if !state.swapchains.contains_key(swapchain) {
            return Err(GpuError::InvalidHandle("swapchain"));
        }
        let semaphore = state
            .semaphores
            .get_mut(wait)
            .ok_or(GpuError::InvalidHandle("semaphore"))?;
        let was_signaled = std::mem::replace(semaphore, false);
        if !was_signaled {
            state.warn(
                ValidationSeverity::Error,
                "present waits on a semaphore nothing signals".to_string(),
            );
        }
        let outcome = state.inject_present.take().unwrap_or(PresentOutcome::Presented);
        if outcome != PresentOutcome::OutOfDate {
            state.events.push(DeviceEvent::Presented { image_index });
        }
        drop(state);
        self.flush_messages();
        Ok(outcome)
    }

    fn create_pipeline(
        &self,
        name: &str,
        kind: PipelineKind,
        code: &[u32],
        _layout: &BindingLayout,
    ) -> GpuResult<PipelineHandle> {
        if code.first() != Some(&SPIRV_MAGIC) {
            return Err(GpuError::Unsupported(format!("`{name}` is not SPIR-V")));
        }
        if kind == PipelineKind::RayTracing && !self.config.capabilities.ray_tracing {
            return Err(GpuError::Unsupported("ray tracing pipelines".to_string()));
        }
        let mut state = self.state.borrow_mut();
        let pipeline = state.pipelines.insert((name.to_string(), kind));
        state.events.push(DeviceEvent::PipelineCreated {
            name: name.to_string(),
        });
        Ok(pipeline)
    }

    fn destroy_pipeline(&self, pipeline: PipelineHandle) {
        self.state.borrow_mut().pipelines.remove(pipeline);
    }

    fn create_binding_table(&self, desc: &BindingTableDesc) -> GpuResult<BindingTableHandle> {
        let mut state = self.state.borrow_mut();
        for resource in desc.referenced_resources() {
            if !state.resource_exists(resource) {
                return Err(GpuError::StaleResource(resource));
            }
        }
        let table = state.tables.insert(desc.clone());
        state.events.push(DeviceEvent::BindingTableCreated {
            table,
            layout: desc.layout.name().to_string(),
        });
        Ok(table)
    }

    fn destroy_binding_table(&self, table: BindingTableHandle) {
        let mut state = self.state.borrow_mut();
        if state.tables.remove(table).is_some() {
            state.events.push(DeviceEvent::BindingTableDestroyed { table });
        }
    }

    fn accel_build_sizes(&self, geometry: &AccelGeometry) -> GpuResult<AccelSizes> {
        if !self.config.capabilities.ray_tracing {
            return Err(GpuError::Unsupported("acceleration structures".to_string()));
        }
        let primitives = geometry.primitive_count() as u64;
        Ok(match geometry {
            AccelGeometry::Instances { .. } => AccelSizes {
                result: 256 + primitives * 128,
                build_scratch: 128 + primitives * 64,
                update_scratch: 128 + primitives * 32,
            },
            _ => AccelSizes {
                result: 256 + primitives * 64,
                build_scratch: 128 + primitives * 32,
                update_scratch: 64 + primitives * 16,
            },
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
        let address = buffer.address + desc.offset;
        Ok(state.accels.insert(HeadlessAccel {
            desc: *desc,
            address,
            built: false,
        }))
    }

    fn destroy_accel(&self, accel: AccelHandle) {
        self.state.borrow_mut().accels.remove(accel);
    }

    fn accel_address(&self, accel: AccelHandle) -> GpuResult<u64> {
        let state = self.state.borrow();
        let accel = state
            .accels
            .get(accel)
            .ok_or(GpuError::InvalidHandle("acceleration structure"))?;
        if !state.buffers.contains_key(accel.desc.buffer) {
            return Err(GpuError::StaleResource(accel.desc.buffer.into()));
        }
        Ok(accel.address)
    }

    fn submit(&self, command_buffer: &CommandBuffer, submission: &Submission) -> GpuResult<()> {
        let result = (|| -> GpuResult<()> {
            let mut state = self.state.borrow_mut();
            if let Some(error) = state.fail_next_submit.take() {
                return Err(error);
            }
            let resources = state.check(command_buffer)?;

            if let Some(wait) = submission.wait {
                let semaphore = state
                    .semaphores
                    .get_mut(wait)
                    .ok_or(GpuError::InvalidHandle("semaphore"))?;
                let was_signaled = std::mem::replace(semaphore, false);
                if !was_signaled {
                    state.warn(
                        ValidationSeverity::Error,
                        format!("{}: waits on a semaphore nothing signals", command_buffer.label()),
                    );
                }
            }
            if let Some(signal) = submission.signal {
                let semaphore = state
                    .semaphores
                    .get_mut(signal)
                    .ok_or(GpuError::InvalidHandle("semaphore"))?;
                *semaphore = true;
            }
            if let Some(fence) = submission.fence {
                let signaled = *state
                    .fences
                    .get(fence)
                    .ok_or(GpuError::InvalidHandle("fence"))?;
                if signaled {
                    state.warn(
                        ValidationSeverity::Error,
                        format!(
                            "{}: submitted with a fence that is still signaled",
                            command_buffer.label()
                        ),
                    );
                }
            }

            state.execute(command_buffer);
            state.events.push(DeviceEvent::Submitted {
                label: command_buffer.label().to_string(),
                recording: command_buffer.recording(),
                fence: submission.fence,
            });
            state.pending.push_back(Pending {
                fence: submission.fence,
                resources,
            });
            while state.pending.len() > self.config.latency {
                state.retire_front();
            }
            Ok(())
        })();
        self.flush_messages();
        result
    }

    fn submit_and_wait(&self, command_buffer: &CommandBuffer) -> GpuResult<()> {
        let result = (|| -> GpuResult<()> {
            let mut state = self.state.borrow_mut();
            if let Some(error) = state.fail_next_submit.take() {
                return Err(error);
            }
            state.check(command_buffer)?;
            state.execute(command_buffer);
            state.retire_all();
            state.events.push(DeviceEvent::OneShotSubmitted {
                label: command_buffer.label().to_string(),
            });
            Ok(())
        })();
        self.flush_messages();
        result
    }

    fn wait_idle(&self) -> GpuResult<()> {
        let mut state = self.state.borrow_mut();
        state.retire_all();
        state.events.push(DeviceEvent::WaitIdle);
        Ok(())
    }

    fn read_image(&self, image: ImageHandle) -> GpuResult<Vec<u8>> {
        let state = self.state.borrow();
        let image = state
            .images
            .get(image)
            .ok_or(GpuError::InvalidHandle("image"))?;
        let texel = image.color.map(|channel| (channel.clamp(0.0, 1.0) * 255.0).round() as u8);
        let count = (image.desc.extent.width * image.desc.extent.height) as usize;
        Ok(texel.repeat(count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource_state::{ResourceStateTracker, Usage};

    fn device() -> HeadlessDevice {
        HeadlessDevice::new(HeadlessConfig::default())
    }

    fn color_image(device: &HeadlessDevice) -> ImageHandle {
        device
            .create_image(&ImageDesc::new(
                "color",
                vk::Extent2D {
                    width: 4,
                    height: 4,
                },
                vk::Format::R8G8B8A8_UNORM,
                vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::TRANSFER_SRC,
            ))
            .unwrap()
    }

    #[test]
    fn fence_signals_after_latency() {
        let device = device().with_latency(1);
        let first = device.create_fence(false).unwrap();
        let second = device.create_fence(false).unwrap();

        let cmd = CommandBuffer::new("empty");
        device
            .submit(&cmd, &Submission { fence: Some(first), ..Default::default() })
            .unwrap();
        assert!(!device.fence_signaled(first).unwrap());

        device
            .submit(&cmd, &Submission { fence: Some(second), ..Default::default() })
            .unwrap();
        assert!(device.fence_signaled(first).unwrap());
        assert!(!device.fence_signaled(second).unwrap());

        device.wait_fence(second, u64::MAX).unwrap();
        assert!(device.fence_signaled(second).unwrap());
    }

    #[test]
    fn waiting_on_fence_without_work_times_out() {
        let device = device();
        let fence = device.create_fence(false).unwrap();
        assert!(matches!(device.wait_fence(fence, u64::MAX), Err(GpuError::Timeout(_))));
    }

    #[test]
    fn clear_and_copy_move_colors() {
        let device = device();
        let mut tracker = ResourceStateTracker::new();
        let a = color_image(&device);
        let b = color_image(&device);
        tracker.register(a, "a");
        tracker.register(b, "b");

        let mut cmd = CommandBuffer::new("copy");
        tracker.begin_recording(&mut cmd);
        tracker.transition(&mut cmd, a, Usage::TransferDst).unwrap();
        cmd.push(Command::ClearImage {
            image: a,
            color: [1.0, 0.0, 0.0, 1.0],
        });
        tracker.transition(&mut cmd, a, Usage::TransferSrc).unwrap();
        tracker.transition(&mut cmd, b, Usage::TransferDst).unwrap();
        cmd.push(Command::CopyImage { src: a, dst: b });
        device.submit_and_wait(&cmd).unwrap();

        assert_eq!(device.image_color(b), Some([1.0, 0.0, 0.0, 1.0]));
        assert_eq!(device.hazard_count(), 0);
        assert_eq!(&device.read_image(b).unwrap()[..4], &[255, 0, 0, 255]);
    }

    #[test]
    fn missing_barrier_is_reported_not_fatal() {
        let device = device();
        let image = color_image(&device);
        let mut cmd = CommandBuffer::new("hazard");
        cmd.push(Command::ClearImage {
            image,
            color: [0.0; 4],
        });
        device.submit_and_wait(&cmd).unwrap();
        assert_eq!(device.hazard_count(), 1);
    }

    #[test]
    fn destroyed_image_is_stale_at_submit() {
        let device = device();
        let image = color_image(&device);
        device.destroy_image(image);
        let mut cmd = CommandBuffer::new("stale");
        cmd.push(Command::ClearImage {
            image,
            color: [0.0; 4],
        });
        assert_eq!(
            device.submit_and_wait(&cmd),
            Err(GpuError::StaleResource(image.into()))
        );
    }

    #[test]
    fn resize_invalidates_next_acquire() {
        let device = device();
        let semaphore = device.create_semaphore().unwrap();
        let swapchain = device
            .create_swapchain(&SwapchainDesc {
                extent: vk::Extent2D {
                    width: 1280,
                    height: 720,
                },
                format: vk::Format::B8G8R8A8_UNORM,
                image_count: 3,
                present_mode: vk::PresentModeKHR::FIFO,
            })
            .unwrap();
        assert_eq!(swapchain.images.len(), 3);

        device.resize_surface(vk::Extent2D {
            width: 640,
            height: 480,
        });
        assert_eq!(
            device
                .acquire_next_image(swapchain.handle, semaphore, u64::MAX)
                .unwrap(),
            AcquireOutcome::OutOfDate
        );
        assert_eq!(
            device
                .acquire_next_image(swapchain.handle, semaphore, u64::MAX)
                .unwrap(),
            AcquireOutcome::Ready(0)
        );
    }
}
