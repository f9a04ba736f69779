use crate::backend::pass::{PassChain, PassDesc, SceneBuffer, Source, Workload};
use crate::backend::{tracing_constants, BackendKind, FrameContext, RenderBackend, ResourceContext};
use crate::error::Result;
use crate::gpu::{DeviceContext, PipelineKind};
use crate::resource_state::{ResourceStateTracker, Usage};

/// Rasterized visibility pass. Shared by both visibility-buffer backends.
pub(crate) fn visibility_pass() -> PassDesc {
    PassDesc::new("visibility", "visibility.vert", PipelineKind::Raster, Workload::Instances)
        .read(0, Source::Uniforms)
        .read(1, Source::Scene(SceneBuffer::Vertices))
        .read(2, Source::Scene(SceneBuffer::Indices))
        .read(3, Source::Scene(SceneBuffer::Nodes))
        .attach(Source::VisibilityWrite, Usage::ColorAttachment)
        .attach(Source::MotionVectors, Usage::ColorAttachment)
        .attach(Source::Depth, Usage::DepthAttachment)
}

/// Raster visibility followed by ray traced shading of the visible surfaces.
#[derive(Default)]
pub struct HybridDeferred {
    chain: PassChain,
}

impl RenderBackend for HybridDeferred {
    fn kind(&self) -> BackendKind {
        BackendKind::HybridDeferred
    }

    fn create_resources(&mut self, context: &mut ResourceContext) -> Result<()> {
        self.chain.add(visibility_pass(), context)?;
        self.chain.add(
            PassDesc::new(
                "hybrid shading",
                "hybrid_shading.rgen",
                PipelineKind::RayTracing,
                Workload::TraceRays,
            )
            .scene_inputs(2)
            .read(9, Source::VisibilityWrite)
            .write(10, Source::AccumulationInput)
            .write(11, Source::Albedo)
            .write(12, Source::Normal),
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
        self.chain.record(0, frame, Vec::new())?;
        let constants = tracing_constants(frame.settings, frame.frame);
        self.chain.record(1, frame, constants)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::test_support::assert_backend_contract;

    #[test]
    fn honors_the_shared_target_contract() {
        assert_backend_contract(BackendKind::HybridDeferred);
    }
}
