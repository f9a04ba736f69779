use crate::backend::pass::{PassChain, PassDesc, Source, Workload};
use crate::backend::{tracing_constants, BackendKind, FrameContext, RenderBackend, ResourceContext};
use crate::error::Result;
use crate::gpu::{DeviceContext, PipelineKind};
use crate::resource_state::ResourceStateTracker;

/// Hardware ray traced path tracing straight into the shared targets.
#[derive(Default)]
pub struct PathTracing {
    chain: PassChain,
}

impl RenderBackend for PathTracing {
    fn kind(&self) -> BackendKind {
        BackendKind::PathTracing
    }

    fn create_resources(&mut self, context: &mut ResourceContext) -> Result<()> {
        self.chain.add(
            PassDesc::new(
                "path tracing",
                "path_tracing.rgen",
                PipelineKind::RayTracing,
                Workload::TraceRays,
            )
            .scene_inputs(2)
            .write(9, Source::AccumulationInput)
            .write(10, Source::MotionVectors)
            .write(11, Source::VisibilityWrite)
            .write(12, Source::Albedo)
            .write(13, Source::Normal),
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
        let constants = tracing_constants(frame.settings, frame.frame);
        self.chain.record(0, frame, constants)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::test_support::assert_backend_contract;

    #[test]
    fn honors_the_shared_target_contract() {
        assert_backend_contract(BackendKind::PathTracing);
    }

    #[test]
    fn checkerboard_traces_half_the_columns() {
        use crate::backend::create_backend;
        use crate::backend::test_support::Harness;
        use crate::gpu::headless::HeadlessConfig;
        use crate::gpu::Dispatch;

        let mut harness = Harness::new(HeadlessConfig::default());
        let mut backend = create_backend(BackendKind::PathTracing);
        harness.create(backend.as_mut()).unwrap();
        let dispatch = |cmd: &crate::gpu::CommandBuffer| {
            cmd.passes()
                .find(|pass| pass.label == "path tracing")
                .map(|pass| pass.dispatch)
        };

        let full = harness.record(backend.as_mut(), 0);
        assert_eq!(dispatch(&full), Some(Dispatch::TraceRays { width: 64, height: 64 }));

        harness.settings.checkerboard = true;
        let half = harness.record(backend.as_mut(), 1);
        assert_eq!(dispatch(&half), Some(Dispatch::TraceRays { width: 32, height: 64 }));
    }
}
