//! Explicit low-level device abstraction.
//!
//! Everything above this module talks to the GPU through [`DeviceContext`]:
//! command buffers are recorded device independently and handed to
//! `submit`, synchronization is explicit through fences and semaphores, and
//! surface invalidation is reported as an outcome rather than an error.

mod binding;
mod command_buffer;
pub mod headless;
mod types;
#[cfg(feature = "vulkan")]
pub mod vulkan;

pub use binding::*;
pub use command_buffer::*;
pub use types::*;

use crate::error::GpuError;

pub type GpuResult<T> = Result<T, GpuError>;

/// Fence waits are effectively unbounded.
pub const INFINITE_TIMEOUT: u64 = u64::MAX;

pub trait DeviceContext {
    fn name(&self) -> &str;

    fn capabilities(&self) -> DeviceCapabilities;

    fn set_validation_callback(&self, callback: ValidationCallback);

    fn create_image(&self, desc: &ImageDesc) -> GpuResult<ImageHandle>;

    fn destroy_image(&self, image: ImageHandle);

    fn image_desc(&self, image: ImageHandle) -> GpuResult<ImageDesc>;

    fn create_buffer(&self, desc: &BufferDesc) -> GpuResult<BufferHandle>;

    fn destroy_buffer(&self, buffer: BufferHandle);

    fn buffer_desc(&self, buffer: BufferHandle) -> GpuResult<BufferDesc>;

    /// Writes into a host visible buffer.
    fn write_buffer(&self, buffer: BufferHandle, offset: u64, data: &[u8]) -> GpuResult<()>;

    fn buffer_address(&self, buffer: BufferHandle) -> GpuResult<u64>;

    fn create_fence(&self, signaled: bool) -> GpuResult<FenceHandle>;

    fn destroy_fence(&self, fence: FenceHandle);

    fn wait_fence(&self, fence: FenceHandle, timeout: u64) -> GpuResult<()>;

    fn reset_fence(&self, fence: FenceHandle) -> GpuResult<()>;

    fn fence_signaled(&self, fence: FenceHandle) -> GpuResult<bool>;

    fn create_semaphore(&self) -> GpuResult<SemaphoreHandle>;

    fn destroy_semaphore(&self, semaphore: SemaphoreHandle);

    fn create_swapchain(&self, desc: &SwapchainDesc) -> GpuResult<Swapchain>;

    fn destroy_swapchain(&self, swapchain: SwapchainHandle);

    fn acquire_next_image(
        &self,
        swapchain: SwapchainHandle,
        signal: SemaphoreHandle,
        timeout: u64,
    ) -> GpuResult<AcquireOutcome>;

    fn present(
        &self,
        swapchain: SwapchainHandle,
        image_index: u32,
        wait: SemaphoreHandle,
    ) -> GpuResult<PresentOutcome>;

    fn create_pipeline(
        &self,
        name: &str,
        kind: PipelineKind,
        code: &[u32],
        layout: &BindingLayout,
    ) -> GpuResult<PipelineHandle>;

    fn destroy_pipeline(&self, pipeline: PipelineHandle);

    fn create_binding_table(&self, desc: &BindingTableDesc) -> GpuResult<BindingTableHandle>;

    fn destroy_binding_table(&self, table: BindingTableHandle);

    fn accel_build_sizes(&self, geometry: &AccelGeometry) -> GpuResult<AccelSizes>;

    fn create_accel(&self, desc: &AccelDesc) -> GpuResult<AccelHandle>;

    fn destroy_accel(&self, accel: AccelHandle);

    fn accel_address(&self, accel: AccelHandle) -> GpuResult<u64>;

    fn submit(&self, command_buffer: &CommandBuffer, submission: &Submission) -> GpuResult<()>;

    /// Submits and blocks until the work retired.
    fn submit_and_wait(&self, command_buffer: &CommandBuffer) -> GpuResult<()>;

    fn wait_idle(&self) -> GpuResult<()>;

    /// RGBA8 pixels of an image. The caller makes sure writes have retired.
    fn read_image(&self, image: ImageHandle) -> GpuResult<Vec<u8>>;
}

pub fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        return value;
    }
    value.div_ceil(alignment) * alignment
}
