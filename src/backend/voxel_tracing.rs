use ash::vk;

use crate::backend::pass::{PassChain, PassDesc, SceneBuffer, Source, Workload};
use crate::backend::{tracing_constants, BackendKind, FrameContext, RenderBackend, ResourceContext};
use crate::error::Result;
use crate::gpu::{BufferDesc, DeviceContext};
use crate::resource_state::ResourceStateTracker;

/// Voxels along each edge of the scene volume.
pub const VOXEL_GRID: u32 = 64;
/// Packed RGBA8 radiance per voxel.
const VOXEL_SIZE: u64 = 4;

/// Voxelizes the scene every frame and cone traces the volume.
#[derive(Default)]
pub struct VoxelTracing {
    chain: PassChain,
}

impl RenderBackend for VoxelTracing {
    fn kind(&self) -> BackendKind {
        BackendKind::VoxelTracing
    }

    fn create_resources(&mut self, context: &mut ResourceContext) -> Result<()> {
        let voxels = self.chain.private.add_buffer(
            context.device.as_ref(),
            context.tracker,
            &BufferDesc::device_local(
                "voxels",
                (VOXEL_GRID as u64).pow(3) * VOXEL_SIZE,
                vk::BufferUsageFlags::STORAGE_BUFFER,
            ),
        )?;

        self.chain.add(
            PassDesc::compute("voxelize", "voxelize.comp")
                .workload(Workload::Volume(VOXEL_GRID))
                .read(0, Source::Uniforms)
                .read(1, Source::Scene(SceneBuffer::Vertices))
                .read(2, Source::Scene(SceneBuffer::Indices))
                .read(3, Source::Scene(SceneBuffer::Nodes))
                .read(4, Source::Scene(SceneBuffer::Ranges))
                .read(5, Source::Scene(SceneBuffer::Materials))
                .write(6, Source::PrivateBuffer(voxels)),
            context,
        )?;
        self.chain.add(
            PassDesc::compute("voxel cone tracing", "voxel_tracing.comp")
                .read(0, Source::Uniforms)
                .read(1, Source::PrivateBuffer(voxels))
                .write(2, Source::AccumulationInput)
                .write(3, Source::MotionVectors)
                .write(4, Source::VisibilityWrite)
                .write(5, Source::Albedo)
                .write(6, Source::Normal),
            context,
        )
    }

    fn destroy_resources(
        &mut self,
        device: &dyn DeviceContext,
        tracker: &mut ResourceStateTracker,
    ) {
        self.chain.destroy(device, tracker);
    }

    fn render(&mut self, frame: &mut FrameContext) -> Result<()> {
        let mut grid = Vec::with_capacity(4);
        crate::math::write_uints(&mut grid, &[VOXEL_GRID]);
        self.chain.record(0, frame, grid)?;
        let constants = tracing_constants(frame.settings, frame.frame);
        self.chain.record(1, frame, constants)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::test_support::{assert_backend_contract, Harness};
    use crate::gpu::headless::HeadlessConfig;
    use crate::resource_state::validate_barriers;

    #[test]
    fn honors_the_shared_target_contract() {
        assert_backend_contract(BackendKind::VoxelTracing);
    }

    #[test]
    fn voxels_are_written_before_they_are_traced() {
        let mut harness = Harness::new(HeadlessConfig::default());
        let mut backend = VoxelTracing::default();
        harness.create(&mut backend).unwrap();
        let cmd = harness.record(&mut backend, 3);
        let labels: Vec<&str> = cmd.passes().map(|pass| pass.label.as_str()).collect();
        assert_eq!(labels, vec!["voxelize", "voxel cone tracing"]);
        assert!(validate_barriers(&cmd).is_empty());
    }
}
