use std::path::PathBuf;

use thiserror::Error;

use crate::gpu::ResourceId;

/// Runtime failures reported by the device.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GpuError {
    #[error("out of device memory while allocating {0}")]
    OutOfMemory(String),

    #[error("device lost")]
    DeviceLost,

    #[error("timed out waiting on {0}")]
    Timeout(String),

    #[error("submission references destroyed resource {0:?}")]
    StaleResource(ResourceId),

    #[error("invalid {0} handle")]
    InvalidHandle(&'static str),

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("vulkan call failed: {0}")]
    Vulkan(String),
}

/// Programmer errors. These are never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContractViolation {
    #[error("{0} resources have already been created")]
    AlreadyInitialized(&'static str),

    #[error("binding slot {slot} declared twice in layout `{layout}`")]
    DuplicateBinding { layout: String, slot: u32 },

    #[error("binding slot {slot} of layout `{layout}` has no resource or the wrong kind")]
    BindingMismatch { layout: String, slot: u32 },

    #[error("frame slot {slot} re-recorded before its fence was signaled")]
    SlotNotRetired { slot: usize },

    #[error("resource {0:?} is not tracked")]
    UntrackedResource(ResourceId),

    #[error("in-place acceleration structure update requested across a topology change")]
    TopologyChanged,

    #[error("backend `{backend}` left the accumulation input in the wrong state")]
    AccumulationInputState { backend: &'static str },

    #[error("ping-pong roles alias the same image in frame {frame}")]
    PingPongAliased { frame: u64 },
}

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("missing device capability: {0}")]
    MissingCapability(String),

    #[error("shader `{name}` not found in {}", .path.display())]
    ShaderNotFound { name: String, path: PathBuf },

    #[error("shader `{name}` is not a valid SPIR-V module: {reason}")]
    MalformedShader { name: String, reason: String },

    #[error("acceleration structure build failed: {0}")]
    AccelerationBuild(String),

    #[error("instance count {count} exceeds capacity {capacity}")]
    InstanceCapacity { count: usize, capacity: usize },

    #[error("invalid settings: {0}")]
    Settings(#[from] toml::de::Error),

    #[error("screenshot failed: {0}")]
    Screenshot(#[from] image::ImageError),

    #[error(transparent)]
    Gpu(#[from] GpuError),

    #[error(transparent)]
    Contract(#[from] ContractViolation),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RenderError {
    pub fn is_contract_violation(&self) -> bool {
        matches!(self, RenderError::Contract(_))
    }
}

pub type Result<T, E = RenderError> = std::result::Result<T, E>;
