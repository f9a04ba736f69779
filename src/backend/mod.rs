//! Interchangeable rendering strategies.
//!
//! Every backend writes its lit result into the shared accumulation input
//! and leaves it storage-write visible; motion vectors and the current
//! visibility ids are written the same way. Everything else a backend
//! needs it creates privately in `create_resources` and releases in
//! `destroy_resources`. Backends never keep references to shared
//! resources between calls: the scheduler lends them per call.

mod hybrid_deferred;
mod legacy_deferred;
mod modern_deferred;
mod pass;
mod path_tracing;
mod prepass;
mod software_tracing;
mod voxel_tracing;

pub use hybrid_deferred::HybridDeferred;
pub use legacy_deferred::LegacyDeferred;
pub use modern_deferred::ModernDeferred;
pub use pass::{
    PassChain, PassDesc, PreparedPass, PrivateTargets, SceneBuffer, SlotDecl, Source, Workload,
};
pub use path_tracing::PathTracing;
pub use prepass::Prepass;
pub use software_tracing::SoftwareTracing;
pub use voxel_tracing::VoxelTracing;

use std::rc::Rc;

use serde::Deserialize;

use crate::acceleration::AccelerationStructureManager;
use crate::config::RenderSettings;
use crate::error::Result;
use crate::gpu::{BufferHandle, CommandBuffer, DeviceContext};
use crate::resource_state::ResourceStateTracker;
use crate::scene::GpuScene;
use crate::shader_library::ShaderLibrary;
use crate::surface::SurfaceResourceSet;
use crate::texture_registry::TextureRegistry;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, clap::ValueEnum, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    PathTracing,
    HybridDeferred,
    ModernDeferred,
    LegacyDeferred,
    SoftwareTracing,
    VoxelTracing,
}

impl BackendKind {
    pub const ALL: [BackendKind; 6] = [
        BackendKind::PathTracing,
        BackendKind::HybridDeferred,
        BackendKind::ModernDeferred,
        BackendKind::LegacyDeferred,
        BackendKind::SoftwareTracing,
        BackendKind::VoxelTracing,
    ];

    pub fn name(self) -> &'static str {
        match self {
            BackendKind::PathTracing => "path tracing",
            BackendKind::HybridDeferred => "hybrid deferred",
            BackendKind::ModernDeferred => "modern deferred",
            BackendKind::LegacyDeferred => "legacy deferred",
            BackendKind::SoftwareTracing => "software tracing",
            BackendKind::VoxelTracing => "voxel tracing",
        }
    }

    /// Whether the backend traces against hardware acceleration structures.
    pub fn requires_ray_tracing(self) -> bool {
        matches!(
            self,
            BackendKind::PathTracing | BackendKind::HybridDeferred | BackendKind::ModernDeferred
        )
    }
}

/// Shared resources lent to backends for the duration of one call.
#[derive(Clone, Copy)]
pub struct SharedResources<'a> {
    pub surface: &'a SurfaceResourceSet,
    pub scene: &'a GpuScene,
    pub accel: &'a AccelerationStructureManager,
    pub textures: &'a TextureRegistry,
}

/// What backends see while (re)creating their private resources.
pub struct ResourceContext<'a> {
    pub device: &'a Rc<dyn DeviceContext>,
    pub tracker: &'a mut ResourceStateTracker,
    pub shaders: &'a mut ShaderLibrary,
    pub shared: SharedResources<'a>,
    /// One per frame slot.
    pub uniform_buffers: &'a [BufferHandle],
    pub settings: &'a RenderSettings,
}

/// What backends see while recording one frame.
pub struct FrameContext<'a> {
    pub command_buffer: &'a mut CommandBuffer,
    pub tracker: &'a mut ResourceStateTracker,
    pub shared: SharedResources<'a>,
    /// Frame slot being recorded.
    pub slot: usize,
    /// Total frame number; decides ping-pong roles.
    pub frame: u64,
    pub image_index: u32,
    pub uniform_buffer: BufferHandle,
    pub settings: &'a RenderSettings,
}

impl FrameContext<'_> {
    pub fn parity(&self) -> usize {
        (self.frame % 2) as usize
    }
}

pub trait RenderBackend {
    fn kind(&self) -> BackendKind;

    fn create_resources(&mut self, context: &mut ResourceContext) -> Result<()>;

    /// The device must be idle.
    fn destroy_resources(&mut self, device: &dyn DeviceContext, tracker: &mut ResourceStateTracker);

    fn render(&mut self, frame: &mut FrameContext) -> Result<()>;
}

pub fn create_backend(kind: BackendKind) -> Box<dyn RenderBackend> {
    match kind {
        BackendKind::PathTracing => Box::new(PathTracing::default()),
        BackendKind::HybridDeferred => Box::new(HybridDeferred::default()),
        BackendKind::ModernDeferred => Box::new(ModernDeferred::default()),
        BackendKind::LegacyDeferred => Box::new(LegacyDeferred::default()),
        BackendKind::SoftwareTracing => Box::new(SoftwareTracing::default()),
        BackendKind::VoxelTracing => Box::new(VoxelTracing::default()),
    }
}

/// Samples and bounce count every tracing backend pushes.
pub(crate) fn tracing_constants(settings: &RenderSettings, frame: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(16);
    crate::math::write_uints(
        &mut out,
        &[
            settings.samples,
            settings.bounces.min(settings.max_bounces),
            frame as u32,
            0,
        ],
    );
    out
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::cornell_box;
    use crate::frame::FrameResourcePool;
    use crate::gpu::headless::{HeadlessConfig, HeadlessDevice};
    use crate::scene::SceneProvider;
    use crate::surface::SurfaceConfig;
    use crate::uniform::UNIFORM_SIZE;
    use ash::vk;

    /// Everything a backend needs, without a scheduler.
    pub struct Harness {
        pub device: Rc<HeadlessDevice>,
        pub dyn_device: Rc<dyn DeviceContext>,
        pub tracker: ResourceStateTracker,
        pub shaders: ShaderLibrary,
        pub settings: RenderSettings,
        pub surface: SurfaceResourceSet,
        pub scene: GpuScene,
        pub accel: AccelerationStructureManager,
        pub textures: TextureRegistry,
        pub frames: FrameResourcePool,
    }

    impl Harness {
        pub fn new(config: HeadlessConfig) -> Self {
            let device = Rc::new(HeadlessDevice::new(config));
            let dyn_device: Rc<dyn DeviceContext> = device.clone();
            let mut tracker = ResourceStateTracker::new();
            let settings = RenderSettings::default();
            let provider = cornell_box::scene();
            let surface = SurfaceResourceSet::new(
                dyn_device.clone(),
                &mut tracker,
                SurfaceConfig {
                    extent: vk::Extent2D {
                        width: 64,
                        height: 64,
                    },
                    image_count: 2,
                    present_mode: vk::PresentModeKHR::FIFO,
                    denoiser_staging: false,
                },
            )
            .unwrap();
            let scene = GpuScene::upload(dyn_device.clone(), &mut tracker, &provider).unwrap();
            let mut accel = AccelerationStructureManager::new(dyn_device.clone());
            if dyn_device.capabilities().ray_tracing {
                accel
                    .build_all(&mut tracker, &scene, provider.models(), provider.instances())
                    .unwrap();
            }
            let textures = TextureRegistry::new(dyn_device.clone(), &mut tracker).unwrap();
            let frames =
                FrameResourcePool::new(dyn_device.clone(), &mut tracker, 2, UNIFORM_SIZE).unwrap();
            Self {
                device,
                dyn_device,
                tracker,
                shaders: ShaderLibrary::placeholders(),
                settings,
                surface,
                scene,
                accel,
                textures,
                frames,
            }
        }

        pub fn create(&mut self, backend: &mut dyn RenderBackend) -> Result<()> {
            let uniform_buffers = self.frames.uniform_buffers();
            let mut context = ResourceContext {
                device: &self.dyn_device,
                tracker: &mut self.tracker,
                shaders: &mut self.shaders,
                shared: SharedResources {
                    surface: &self.surface,
                    scene: &self.scene,
                    accel: &self.accel,
                    textures: &self.textures,
                },
                uniform_buffers: &uniform_buffers,
                settings: &self.settings,
            };
            backend.create_resources(&mut context)
        }

        /// Records one frame with `backend` and returns the command buffer.
        pub fn record(&mut self, backend: &mut dyn RenderBackend, frame: u64) -> CommandBuffer {
            let slot = (frame % 2) as usize;
            let uniform_buffer = self.frames.slot(slot).uniform_buffer();
            let mut command_buffer = CommandBuffer::new("backend test");
            self.tracker.begin_recording(&mut command_buffer);
            let mut context = FrameContext {
                command_buffer: &mut command_buffer,
                tracker: &mut self.tracker,
                shared: SharedResources {
                    surface: &self.surface,
                    scene: &self.scene,
                    accel: &self.accel,
                    textures: &self.textures,
                },
                slot,
                frame,
                image_index: 0,
                uniform_buffer,
                settings: &self.settings,
            };
            backend.render(&mut context).unwrap();
            command_buffer
        }
    }

    /// A backend must write the shared targets and leave the accumulation
    /// input storage-write visible.
    pub fn assert_backend_contract(kind: BackendKind) {
        use crate::gpu::ResourceId;
        use crate::resource_state::{validate_barriers, Usage};

        let mut harness = Harness::new(HeadlessConfig::default());
        let mut backend = create_backend(kind);
        harness.create(backend.as_mut()).unwrap();
        assert_eq!(backend.kind(), kind);

        for frame in 0..2 {
            let cmd = harness.record(backend.as_mut(), frame);
            assert!(validate_barriers(&cmd).is_empty(), "{:?}", validate_barriers(&cmd));

            let written: Vec<ResourceId> = cmd
                .passes()
                .flat_map(|pass| pass.accesses.iter())
                .filter(|(_, usage)| usage.is_write())
                .map(|(resource, _)| *resource)
                .collect();
            let surface = &harness.surface;
            assert!(written.contains(&surface.accumulation_input().into()));
            assert!(written.contains(&surface.motion_vectors().into()));
            assert!(written.contains(&surface.visibility().write(frame).into()));

            assert_eq!(
                harness.tracker.state(surface.accumulation_input()),
                Some(Usage::StorageWrite.state())
            );
        }

        let tables = harness.device.live_binding_tables();
        assert!(tables > 0);
        backend.destroy_resources(harness.dyn_device.as_ref(), &mut harness.tracker);
        assert_eq!(harness.device.live_binding_tables(), 0);
    }
}
