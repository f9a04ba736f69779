use ash::vk;

use crate::backend::pass::{PassChain, PassDesc, SceneBuffer, Source, Workload};
use crate::backend::{FrameContext, ResourceContext};
use crate::error::{ContractViolation, Result};
use crate::gpu::{BufferDesc, Command, DeviceContext};
use crate::resource_state::{ResourceStateTracker, Usage};

/// Clears the shared per-frame targets and culls instances before any
/// backend runs. Owned by the scheduler, independent of the backend.
#[derive(Default)]
pub struct Prepass {
    chain: PassChain,
}

impl Prepass {
    pub fn create_resources(&mut self, context: &mut ResourceContext) -> Result<()> {
        if self.chain.is_created() {
            return Err(ContractViolation::AlreadyInitialized("prepass").into());
        }
        let capacity = context.device.capabilities().max_instance_count as u64;
        let visible = self.chain.private.add_buffer(
            context.device.as_ref(),
            context.tracker,
            &BufferDesc::device_local(
                "visible instances",
                capacity.max(1) * 4,
                vk::BufferUsageFlags::STORAGE_BUFFER,
            ),
        )?;
        self.chain.add(
            PassDesc::compute("cull", "cull.comp")
                .workload(Workload::InstanceThreads)
                .read(0, Source::Uniforms)
                .read(1, Source::Scene(SceneBuffer::Nodes))
                .read(2, Source::Scene(SceneBuffer::Ranges))
                .write(3, Source::PrivateBuffer(visible)),
            context,
        )
    }

    pub fn destroy_resources(
        &mut self,
        device: &dyn DeviceContext,
        tracker: &mut ResourceStateTracker,
    ) {
        self.chain.destroy(device, tracker);
    }

    pub fn record(&self, frame: &mut FrameContext) -> Result<()> {
        let surface = frame.shared.surface;
        frame.command_buffer.begin_label("prepass");
        for image in [surface.accumulation_input(), surface.visibility().write(frame.frame)] {
            frame.tracker.transition(frame.command_buffer, image, Usage::TransferDst)?;
            frame.command_buffer.push(Command::ClearImage {
                image,
                color: [0.0; 4],
            });
        }
        self.chain.record(0, frame, Vec::new())?;
        frame.command_buffer.end_label();
        Ok(())
    }
}
