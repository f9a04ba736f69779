use std::collections::HashMap;
use std::fmt;

use ash::vk;

use crate::error::ContractViolation;
use crate::gpu::{Command, CommandBuffer, ResourceId};

const SHADER_STAGES: vk::PipelineStageFlags2 = vk::PipelineStageFlags2::from_raw(
    vk::PipelineStageFlags2::VERTEX_SHADER.as_raw()
        | vk::PipelineStageFlags2::FRAGMENT_SHADER.as_raw()
        | vk::PipelineStageFlags2::COMPUTE_SHADER.as_raw()
        | vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR.as_raw(),
);

const WRITE_ACCESS: vk::AccessFlags2 = vk::AccessFlags2::from_raw(
    vk::AccessFlags2::SHADER_STORAGE_WRITE.as_raw()
        | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE.as_raw()
        | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE.as_raw()
        | vk::AccessFlags2::TRANSFER_WRITE.as_raw()
        | vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR.as_raw()
        | vk::AccessFlags2::MEMORY_WRITE.as_raw(),
);

/// Access and layout of a resource as seen by the last emitted barrier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResourceState {
    pub layout: vk::ImageLayout,
    pub access: vk::AccessFlags2,
    pub stage: vk::PipelineStageFlags2,
    pub queue_family: u32,
}

impl ResourceState {
    pub const fn undefined() -> Self {
        Self {
            layout: vk::ImageLayout::UNDEFINED,
            access: vk::AccessFlags2::NONE,
            stage: vk::PipelineStageFlags2::TOP_OF_PIPE,
            queue_family: 0,
        }
    }

    pub fn is_write(&self) -> bool {
        self.access.intersects(WRITE_ACCESS)
    }

    fn merge(&self, other: &ResourceState) -> Self {
        Self {
            layout: self.layout,
            access: self.access | other.access,
            stage: self.stage | other.stage,
            queue_family: self.queue_family,
        }
    }

    fn covers(&self, other: &ResourceState, image: bool) -> bool {
        (!image || self.layout == other.layout)
            && self.access.contains(other.access)
            && self.stage.contains(other.stage)
    }
}

/// The ways a pass can touch a resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Usage {
    StorageRead,
    StorageWrite,
    Sampled,
    UniformRead,
    ColorAttachment,
    DepthAttachment,
    TransferSrc,
    TransferDst,
    Present,
    AccelRead,
    AccelBuildInput,
    AccelBuild,
    ExternalShared,
}

impl Usage {
    pub fn state(self) -> ResourceState {
        use vk::AccessFlags2 as A;
        use vk::ImageLayout as L;
        use vk::PipelineStageFlags2 as S;

        let (layout, access, stage) = match self {
            Usage::StorageRead => (L::GENERAL, A::SHADER_STORAGE_READ, SHADER_STAGES),
            Usage::StorageWrite => (L::GENERAL, A::SHADER_STORAGE_WRITE, SHADER_STAGES),
            Usage::Sampled => (L::SHADER_READ_ONLY_OPTIMAL, A::SHADER_SAMPLED_READ, SHADER_STAGES),
            Usage::UniformRead => (L::UNDEFINED, A::UNIFORM_READ, SHADER_STAGES),
            Usage::ColorAttachment => (
                L::COLOR_ATTACHMENT_OPTIMAL,
                A::COLOR_ATTACHMENT_WRITE,
                S::COLOR_ATTACHMENT_OUTPUT,
            ),
            Usage::DepthAttachment => (
                L::DEPTH_ATTACHMENT_OPTIMAL,
                A::DEPTH_STENCIL_ATTACHMENT_WRITE | A::DEPTH_STENCIL_ATTACHMENT_READ,
                S::EARLY_FRAGMENT_TESTS | S::LATE_FRAGMENT_TESTS,
            ),
            Usage::TransferSrc => (L::TRANSFER_SRC_OPTIMAL, A::TRANSFER_READ, S::ALL_TRANSFER),
            Usage::TransferDst => (L::TRANSFER_DST_OPTIMAL, A::TRANSFER_WRITE, S::ALL_TRANSFER),
            Usage::Present => (L::PRESENT_SRC_KHR, A::NONE, S::BOTTOM_OF_PIPE),
            Usage::AccelRead => (
                L::UNDEFINED,
                A::ACCELERATION_STRUCTURE_READ_KHR,
                SHADER_STAGES | S::ACCELERATION_STRUCTURE_BUILD_KHR,
            ),
            Usage::AccelBuildInput => (
                L::UNDEFINED,
                A::SHADER_READ,
                S::ACCELERATION_STRUCTURE_BUILD_KHR,
            ),
            Usage::AccelBuild => (
                L::UNDEFINED,
                A::ACCELERATION_STRUCTURE_WRITE_KHR | A::ACCELERATION_STRUCTURE_READ_KHR,
                S::ACCELERATION_STRUCTURE_BUILD_KHR,
            ),
            Usage::ExternalShared => (
                L::GENERAL,
                A::MEMORY_READ | A::MEMORY_WRITE,
                S::ALL_COMMANDS,
            ),
        };

        ResourceState {
            layout,
            access,
            stage,
            queue_family: 0,
        }
    }

    pub fn is_write(self) -> bool {
        self.state().is_write()
    }

    /// Whether `state` already satisfies this usage.
    pub fn satisfied_by(self, state: &ResourceState, resource: ResourceId) -> bool {
        state.covers(&self.state(), matches!(resource, ResourceId::Image(_)))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Barrier {
    pub resource: ResourceId,
    pub src: ResourceState,
    pub dst: ResourceState,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransitionRecord {
    pub recording: u64,
    pub resource: ResourceId,
    pub src: ResourceState,
    pub dst: ResourceState,
}

struct Record {
    label: String,
    state: ResourceState,
    recording: u64,
}

/// Tracks the last recorded state of every live image and buffer and emits
/// whole-resource barriers at pass boundaries.
///
/// The first use of a resource inside a command buffer always emits a
/// barrier so that each recording is self-contained. Reads that follow a
/// read in the same layout within one recording are merged into a single
/// state without a second barrier when the existing state already covers
/// them.
#[derive(Default)]
pub struct ResourceStateTracker {
    records: HashMap<ResourceId, Record>,
    recording: u64,
    log: Vec<TransitionRecord>,
}

impl ResourceStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, resource: impl Into<ResourceId>, label: &str) {
        self.records.insert(
            resource.into(),
            Record {
                label: label.to_string(),
                state: ResourceState::undefined(),
                recording: 0,
            },
        );
    }

    pub fn forget(&mut self, resource: impl Into<ResourceId>) {
        self.records.remove(&resource.into());
    }

    pub fn is_tracked(&self, resource: impl Into<ResourceId>) -> bool {
        self.records.contains_key(&resource.into())
    }

    pub fn tracked_count(&self) -> usize {
        self.records.len()
    }

    pub fn state(&self, resource: impl Into<ResourceId>) -> Option<ResourceState> {
        self.records.get(&resource.into()).map(|record| record.state)
    }

    pub fn label(&self, resource: impl Into<ResourceId>) -> Option<&str> {
        self.records
            .get(&resource.into())
            .map(|record| record.label.as_str())
    }

    /// Starts a new recording; the transition log only covers the current one.
    pub fn begin_recording(&mut self, command_buffer: &mut CommandBuffer) {
        self.recording += 1;
        command_buffer.begin(self.recording);
        self.log.clear();
    }

    /// Previous contents are discarded, e.g. a freshly acquired surface image.
    pub fn discard(&mut self, resource: impl Into<ResourceId>) -> Result<(), ContractViolation> {
        let resource = resource.into();
        let record = self
            .records
            .get_mut(&resource)
            .ok_or(ContractViolation::UntrackedResource(resource))?;
        record.state = ResourceState::undefined();
        record.recording = 0;
        Ok(())
    }

    pub fn transition(
        &mut self,
        command_buffer: &mut CommandBuffer,
        resource: impl Into<ResourceId>,
        usage: Usage,
    ) -> Result<(), ContractViolation> {
        let resource = resource.into();
        let recording = command_buffer.recording();
        let record = self
            .records
            .get_mut(&resource)
            .ok_or(ContractViolation::UntrackedResource(resource))?;

        let requested = usage.state();
        let is_image = matches!(resource, ResourceId::Image(_));
        let same_layout = !is_image || record.state.layout == requested.layout;
        let dst = if record.recording == recording
            && same_layout
            && !record.state.is_write()
            && !usage.is_write()
        {
            if record.state.covers(&requested, is_image) {
                return Ok(());
            }
            record.state.merge(&requested)
        } else {
            requested
        };

        let barrier = Barrier {
            resource,
            src: record.state,
            dst,
        };
        command_buffer.push(Command::Barrier(barrier));
        self.log.push(TransitionRecord {
            recording,
            resource,
            src: record.state,
            dst,
        });
        record.state = dst;
        record.recording = recording;
        Ok(())
    }

    pub fn transition_all(
        &mut self,
        command_buffer: &mut CommandBuffer,
        accesses: &[(ResourceId, Usage)],
    ) -> Result<(), ContractViolation> {
        for (resource, usage) in accesses {
            self.transition(command_buffer, *resource, *usage)?;
        }
        Ok(())
    }

    pub fn log(&self) -> &[TransitionRecord] {
        &self.log
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BarrierViolation {
    pub command_index: usize,
    pub resource: ResourceId,
    pub usage: Usage,
    pub reason: &'static str,
}

impl fmt::Display for BarrierViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "command {}: {:?} used as {:?}: {}",
            self.command_index, self.resource, self.usage, self.reason
        )
    }
}

/// Replays the barriers of one command buffer and checks that every access is
/// preceded, inside the same command buffer, by a transition compatible with
/// it, and that nothing touches a resource written by an earlier command
/// without a barrier in between.
pub fn validate_barriers(command_buffer: &CommandBuffer) -> Vec<BarrierViolation> {
    struct Replay {
        state: ResourceState,
        written_by: Option<usize>,
    }

    let mut replay: HashMap<ResourceId, Replay> = HashMap::new();
    let mut violations = Vec::new();

    for (index, command) in command_buffer.commands().iter().enumerate() {
        if let Command::Barrier(barrier) = command {
            replay.insert(
                barrier.resource,
                Replay {
                    state: barrier.dst,
                    written_by: None,
                },
            );
            continue;
        }

        for (resource, usage) in command.accesses() {
            let Some(entry) = replay.get_mut(&resource) else {
                violations.push(BarrierViolation {
                    command_index: index,
                    resource,
                    usage,
                    reason: "no transition earlier in this command buffer",
                });
                continue;
            };

            if !usage.satisfied_by(&entry.state, resource) {
                violations.push(BarrierViolation {
                    command_index: index,
                    resource,
                    usage,
                    reason: "last transition is incompatible",
                });
            } else if entry.written_by.is_some_and(|writer| writer != index) {
                violations.push(BarrierViolation {
                    command_index: index,
                    resource,
                    usage,
                    reason: "written by an earlier command without a barrier",
                });
            }

            if usage.is_write() {
                entry.written_by = Some(index);
            }
        }
    }

    violations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{BufferHandle, ImageHandle};
    use slotmap::SlotMap;

    fn image() -> ImageHandle {
        let mut map: SlotMap<ImageHandle, ()> = SlotMap::with_key();
        map.insert(())
    }

    fn buffer() -> BufferHandle {
        let mut map: SlotMap<BufferHandle, ()> = SlotMap::with_key();
        map.insert(())
    }

    fn barrier_count(command_buffer: &CommandBuffer) -> usize {
        command_buffer
            .commands()
            .iter()
            .filter(|command| matches!(command, Command::Barrier(_)))
            .count()
    }

    #[test]
    fn first_use_in_each_recording_emits_barrier() {
        let mut tracker = ResourceStateTracker::new();
        let target = image();
        tracker.register(target, "target");

        let mut cmd = CommandBuffer::new("a");
        tracker.begin_recording(&mut cmd);
        tracker.transition(&mut cmd, target, Usage::StorageRead).unwrap();
        assert_eq!(barrier_count(&cmd), 1);

        let mut next = CommandBuffer::new("b");
        tracker.begin_recording(&mut next);
        tracker.transition(&mut next, target, Usage::StorageRead).unwrap();
        assert_eq!(barrier_count(&next), 1);
        assert_eq!(tracker.log()[0].src, Usage::StorageRead.state());
    }

    #[test]
    fn read_after_read_in_same_layout_is_merged() {
        let mut tracker = ResourceStateTracker::new();
        let target = image();
        tracker.register(target, "target");

        let mut cmd = CommandBuffer::new("frame");
        tracker.begin_recording(&mut cmd);
        tracker.transition(&mut cmd, target, Usage::StorageRead).unwrap();
        tracker.transition(&mut cmd, target, Usage::StorageRead).unwrap();
        assert_eq!(barrier_count(&cmd), 1);

        tracker.transition(&mut cmd, target, Usage::Sampled).unwrap();
        assert_eq!(barrier_count(&cmd), 2);
    }

    #[test]
    fn write_always_emits_barrier() {
        let mut tracker = ResourceStateTracker::new();
        let target = image();
        tracker.register(target, "target");

        let mut cmd = CommandBuffer::new("frame");
        tracker.begin_recording(&mut cmd);
        tracker.transition(&mut cmd, target, Usage::StorageWrite).unwrap();
        tracker.transition(&mut cmd, target, Usage::StorageWrite).unwrap();
        assert_eq!(barrier_count(&cmd), 2);
        assert_eq!(tracker.state(target), Some(Usage::StorageWrite.state()));
    }

    #[test]
    fn untracked_resource_is_a_contract_violation() {
        let mut tracker = ResourceStateTracker::new();
        let mut cmd = CommandBuffer::new("frame");
        tracker.begin_recording(&mut cmd);
        let missing = buffer();
        assert_eq!(
            tracker.transition(&mut cmd, missing, Usage::UniformRead),
            Err(ContractViolation::UntrackedResource(missing.into()))
        );
    }

    #[test]
    fn validator_flags_read_after_write_without_barrier() {
        let target = image();
        let mut cmd = CommandBuffer::new("frame");
        cmd.begin(1);
        cmd.push(Command::Barrier(Barrier {
            resource: target.into(),
            src: ResourceState::undefined(),
            dst: Usage::TransferDst.state(),
        }));
        cmd.push(Command::ClearImage {
            image: target,
            color: [0.0; 4],
        });
        cmd.push(Command::ClearImage {
            image: target,
            color: [1.0; 4],
        });

        let violations = validate_barriers(&cmd);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].command_index, 2);
    }

    #[test]
    fn validator_accepts_tracker_output() {
        let mut tracker = ResourceStateTracker::new();
        let target = image();
        let source = image();
        tracker.register(target, "target");
        tracker.register(source, "source");

        let mut cmd = CommandBuffer::new("frame");
        tracker.begin_recording(&mut cmd);
        tracker.transition(&mut cmd, target, Usage::TransferDst).unwrap();
        cmd.push(Command::ClearImage {
            image: target,
            color: [0.0; 4],
        });
        tracker.transition(&mut cmd, target, Usage::TransferSrc).unwrap();
        tracker.transition(&mut cmd, source, Usage::TransferDst).unwrap();
        cmd.push(Command::CopyImage {
            src: target,
            dst: source,
        });

        assert!(validate_barriers(&cmd).is_empty());
    }

    #[test]
    fn validator_rejects_access_without_any_transition() {
        let target = image();
        let mut cmd = CommandBuffer::new("frame");
        cmd.begin(1);
        cmd.push(Command::ClearImage {
            image: target,
            color: [0.0; 4],
        });
        let violations = validate_barriers(&cmd);
        assert_eq!(violations[0].reason, "no transition earlier in this command buffer");
    }
}
