use ash::vk;

use crate::backend::pass::{PassChain, PassDesc, SceneBuffer, Source, Workload};
use crate::backend::{BackendKind, FrameContext, RenderBackend, ResourceContext};
use crate::error::Result;
use crate::gpu::{DeviceContext, ImageDesc, PipelineKind};
use crate::resource_state::{ResourceStateTracker, Usage};
use crate::surface::AUXILIARY_FORMAT;

const GBUFFER: [&str; 3] = ["gbuffer position", "gbuffer normal", "gbuffer material"];

/// Classic three target G-buffer and a deferred lighting pass. Needs no ray
/// tracing hardware.
#[derive(Default)]
pub struct LegacyDeferred {
    chain: PassChain,
}

impl RenderBackend for LegacyDeferred {
    fn kind(&self) -> BackendKind {
        BackendKind::LegacyDeferred
    }

    fn create_resources(&mut self, context: &mut ResourceContext) -> Result<()> {
        let extent = context.shared.surface.extent();
        let mut targets = Vec::with_capacity(GBUFFER.len());
        for label in GBUFFER {
            targets.push(self.chain.private.add_image(
                context.device.as_ref(),
                context.tracker,
                &ImageDesc::new(
                    label,
                    extent,
                    AUXILIARY_FORMAT,
                    vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::STORAGE,
                ),
            )?);
        }

        let mut gbuffer =
            PassDesc::new("gbuffer", "gbuffer.vert", PipelineKind::Raster, Workload::Instances);
        gbuffer = gbuffer
            .read(0, Source::Uniforms)
            .read(1, Source::Scene(SceneBuffer::Vertices))
            .read(2, Source::Scene(SceneBuffer::Indices))
            .read(3, Source::Scene(SceneBuffer::Nodes))
            .read(4, Source::Scene(SceneBuffer::Materials));
        for target in &targets {
            gbuffer = gbuffer.attach(Source::PrivateImage(*target), Usage::ColorAttachment);
        }
        gbuffer = gbuffer
            .attach(Source::MotionVectors, Usage::ColorAttachment)
            .attach(Source::VisibilityWrite, Usage::ColorAttachment)
            .attach(Source::Depth, Usage::DepthAttachment);
        self.chain.add(gbuffer, context)?;

        let mut shading = PassDesc::compute("deferred shading", "deferred_shading.comp")
            .workload(Workload::TracedPixels)
            .read(0, Source::Uniforms)
            .read(1, Source::Scene(SceneBuffer::Materials))
            .read(2, Source::Textures);
        for (offset, target) in targets.iter().enumerate() {
            shading = shading.read(3 + offset as u32, Source::PrivateImage(*target));
        }
        shading = shading
            .write(6, Source::AccumulationInput)
            .write(7, Source::Albedo)
            .write(8, Source::Normal);
        self.chain.add(shading, context)
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
        self.chain.record(1, frame, Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::test_support::{assert_backend_contract, Harness};
    use crate::gpu::headless::HeadlessConfig;
    use crate::gpu::DeviceCapabilities;

    #[test]
    fn honors_the_shared_target_contract() {
        assert_backend_contract(BackendKind::LegacyDeferred);
    }

    #[test]
    fn runs_without_ray_tracing_hardware() {
        let mut harness = Harness::new(HeadlessConfig {
            capabilities: DeviceCapabilities {
                ray_tracing: false,
                ..DeviceCapabilities::default()
            },
            ..HeadlessConfig::default()
        });
        let mut backend = LegacyDeferred::default();
        harness.create(&mut backend).unwrap();
        let cmd = harness.record(&mut backend, 0);
        assert_eq!(cmd.passes().count(), 2);
    }

    #[test]
    fn private_targets_are_released() {
        let mut harness = Harness::new(HeadlessConfig::default());
        let before = harness.device.live_images().len();
        let mut backend = LegacyDeferred::default();
        harness.create(&mut backend).unwrap();
        assert_eq!(harness.device.live_images().len(), before + GBUFFER.len());
        backend.destroy_resources(harness.dyn_device.as_ref(), &mut harness.tracker);
        assert_eq!(harness.device.live_images().len(), before);
    }
}
