//! Real-time ray traced rendering core.
//!
//! [`scheduler::FrameScheduler`] drives frames over a [`gpu::DeviceContext`]:
//! it owns the surface targets, the acceleration structures and the frame
//! slots, and lends them to the active [`backend::RenderBackend`] and the
//! [`compositor::AccumulationCompositor`] while a frame is recorded.

pub mod acceleration;
pub mod backend;
pub mod benchmark;
pub mod camera;
pub mod compositor;
pub mod config;
pub mod cornell_box;
pub mod error;
pub mod frame;
pub mod gpu;
pub mod math;
pub mod resource_state;
pub mod scene;
pub mod scheduler;
pub mod screenshot;
pub mod shader_library;
pub mod surface;
pub mod texture_registry;
pub mod uniform;

pub use error::{ContractViolation, GpuError, RenderError, Result};
pub use scheduler::{FrameOutcome, FrameScheduler, FrameStats};
