use crate::backend::pass::{PassChain, PassDesc, SceneBuffer, Source};
use crate::backend::{tracing_constants, BackendKind, FrameContext, RenderBackend, ResourceContext};
use crate::error::Result;
use crate::gpu::DeviceContext;
use crate::resource_state::ResourceStateTracker;

/// Compute shader tracing over the raw scene buffers; no acceleration
/// structure hardware involved.
#[derive(Default)]
pub struct SoftwareTracing {
    chain: PassChain,
}

impl RenderBackend for SoftwareTracing {
    fn kind(&self) -> BackendKind {
        BackendKind::SoftwareTracing
    }

    fn create_resources(&mut self, context: &mut ResourceContext) -> Result<()> {
        let mut desc = PassDesc::compute("software tracing", "software_tracing.comp")
            .read(0, Source::Uniforms);
        for (offset, buffer) in SceneBuffer::ALL.into_iter().enumerate() {
            desc = desc.read(1 + offset as u32, Source::Scene(buffer));
        }
        desc = desc
            .read(7, Source::Textures)
            .write(8, Source::AccumulationInput)
            .write(9, Source::MotionVectors)
            .write(10, Source::VisibilityWrite)
            .write(11, Source::Albedo)
            .write(12, Source::Normal);
        self.chain.add(desc, context)
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
        assert_backend_contract(BackendKind::SoftwareTracing);
    }
}
