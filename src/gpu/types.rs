use ash::vk;

slotmap::new_key_type! {
    pub struct ImageHandle;
    pub struct BufferHandle;
    pub struct FenceHandle;
    pub struct SemaphoreHandle;
    pub struct AccelHandle;
    pub struct PipelineHandle;
    pub struct BindingTableHandle;
    pub struct SwapchainHandle;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceId {
    Image(ImageHandle),
    Buffer(BufferHandle),
}

impl From<ImageHandle> for ResourceId {
    fn from(handle: ImageHandle) -> Self {
        ResourceId::Image(handle)
    }
}

impl From<BufferHandle> for ResourceId {
    fn from(handle: BufferHandle) -> Self {
        ResourceId::Buffer(handle)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageDesc {
    pub label: String,
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    /// Exported through an external memory handle.
    pub external: bool,
}

impl ImageDesc {
    pub fn new(
        label: &str,
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
    ) -> Self {
        Self {
            label: label.to_string(),
            extent,
            format,
            usage,
            external: false,
        }
    }

    pub fn exported(mut self) -> Self {
        self.external = true;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BufferDesc {
    pub label: String,
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
    pub host_visible: bool,
}

impl BufferDesc {
    pub fn device_local(label: &str, size: u64, usage: vk::BufferUsageFlags) -> Self {
        Self {
            label: label.to_string(),
            size,
            usage,
            host_visible: false,
        }
    }

    pub fn host_visible(label: &str, size: u64, usage: vk::BufferUsageFlags) -> Self {
        Self {
            label: label.to_string(),
            size,
            usage,
            host_visible: true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwapchainDesc {
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub image_count: u32,
    pub present_mode: vk::PresentModeKHR,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Swapchain {
    pub handle: SwapchainHandle,
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub images: Vec<ImageHandle>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquireOutcome {
    Ready(u32),
    Suboptimal(u32),
    OutOfDate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    Suboptimal,
    OutOfDate,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Submission {
    pub wait: Option<SemaphoreHandle>,
    pub signal: Option<SemaphoreHandle>,
    pub fence: Option<FenceHandle>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceCapabilities {
    pub ray_tracing: bool,
    pub external_memory: bool,
    pub timestamp_queries: bool,
    pub min_accel_scratch_alignment: u64,
    pub max_instance_count: u32,
}

impl Default for DeviceCapabilities {
    fn default() -> Self {
        Self {
            ray_tracing: true,
            external_memory: false,
            timestamp_queries: false,
            min_accel_scratch_alignment: 128,
            max_instance_count: 65535,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineKind {
    Compute,
    Raster,
    RayTracing,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValidationSeverity {
    Warning,
    Error,
}

#[derive(Clone, Debug)]
pub struct ValidationMessage {
    pub severity: ValidationSeverity,
    pub message: String,
}

pub type ValidationCallback = Box<dyn Fn(&ValidationMessage)>;

/// Geometry handed to an acceleration structure build.
#[derive(Clone, Debug, PartialEq)]
pub enum AccelGeometry {
    Triangles {
        vertex_buffer: BufferHandle,
        vertex_offset: u64,
        vertex_count: u32,
        vertex_stride: u64,
        index_buffer: BufferHandle,
        index_offset: u64,
        index_count: u32,
    },
    Aabbs {
        buffer: BufferHandle,
        offset: u64,
        count: u32,
    },
    Instances {
        buffer: BufferHandle,
        count: u32,
    },
}

impl AccelGeometry {
    pub fn primitive_count(&self) -> u32 {
        match self {
            AccelGeometry::Triangles { index_count, .. } => index_count / 3,
            AccelGeometry::Aabbs { count, .. } => *count,
            AccelGeometry::Instances { count, .. } => *count,
        }
    }

    pub fn is_top_level(&self) -> bool {
        matches!(self, AccelGeometry::Instances { .. })
    }

    pub fn buffers(&self) -> Vec<BufferHandle> {
        match self {
            AccelGeometry::Triangles {
                vertex_buffer,
                index_buffer,
                ..
            } => vec![*vertex_buffer, *index_buffer],
            AccelGeometry::Aabbs { buffer, .. } => vec![*buffer],
            AccelGeometry::Instances { buffer, .. } => vec![*buffer],
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AccelSizes {
    pub result: u64,
    pub build_scratch: u64,
    pub update_scratch: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AccelDesc {
    pub top_level: bool,
    pub buffer: BufferHandle,
    pub offset: u64,
    pub size: u64,
}
