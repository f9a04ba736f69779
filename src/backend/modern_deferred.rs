use crate::backend::hybrid_deferred::visibility_pass;
use crate::backend::pass::{PassChain, PassDesc, Source};
use crate::backend::{tracing_constants, BackendKind, FrameContext, RenderBackend, ResourceContext};
use crate::error::Result;
use crate::gpu::DeviceContext;
use crate::resource_state::{ResourceStateTracker, Usage};

/// Visibility buffer plus compute shading. Shadows and reflections use ray
/// queries against the scene's top level structure.
#[derive(Default)]
pub struct ModernDeferred {
    chain: PassChain,
}

impl RenderBackend for ModernDeferred {
    fn kind(&self) -> BackendKind {
        BackendKind::ModernDeferred
    }

    fn create_resources(&mut self, context: &mut ResourceContext) -> Result<()> {
        self.chain.add(visibility_pass(), context)?;
        self.chain.add(
            PassDesc::compute("modern shading", "modern_shading.comp")
                .scene_inputs(2)
                .read(9, Source::VisibilityWrite)
                .read(10, Source::MotionVectors)
                .bind(11, Source::Depth, Usage::Sampled)
                .write(12, Source::AccumulationInput)
                .write(13, Source::Albedo)
                .write(14, Source::Normal),
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
        assert_backend_contract(BackendKind::ModernDeferred);
    }
}
