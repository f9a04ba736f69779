use crate::gpu::types::{
    AccelGeometry, AccelHandle, BindingTableHandle, BufferHandle, ImageHandle, PipelineHandle,
    ResourceId,
};
use crate::resource_state::{Barrier, Usage};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dispatch {
    Compute { x: u32, y: u32, z: u32 },
    Draw { vertex_count: u32, instance_count: u32 },
    TraceRays { width: u32, height: u32 },
}

impl Dispatch {
    /// One invocation per pixel with 8x8 workgroups.
    pub fn per_pixel(width: u32, height: u32) -> Self {
        Dispatch::Compute {
            x: width.div_ceil(8),
            y: height.div_ceil(8),
            z: 1,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Pass {
    pub label: String,
    pub pipeline: PipelineHandle,
    pub bindings: Option<BindingTableHandle>,
    pub dispatch: Dispatch,
    pub push_constants: Vec<u8>,
    pub accesses: Vec<(ResourceId, Usage)>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AccelBuild {
    pub accel: AccelHandle,
    pub geometry: AccelGeometry,
    pub result: BufferHandle,
    pub scratch: BufferHandle,
    pub scratch_offset: u64,
    /// Result buffers of structures this one references.
    pub references: Vec<BufferHandle>,
}

impl AccelBuild {
    fn accesses(&self, out: &mut Vec<(ResourceId, Usage)>) {
        for buffer in self.geometry.buffers() {
            out.push((buffer.into(), Usage::AccelBuildInput));
        }
        for buffer in &self.references {
            out.push(((*buffer).into(), Usage::AccelRead));
        }
        out.push((self.scratch.into(), Usage::AccelBuild));
        out.push((self.result.into(), Usage::AccelBuild));
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    BeginLabel(String),
    EndLabel,
    Barrier(Barrier),
    ClearImage {
        image: ImageHandle,
        color: [f32; 4],
    },
    CopyImage {
        src: ImageHandle,
        dst: ImageHandle,
    },
    UpdateBuffer {
        buffer: BufferHandle,
        offset: u64,
        data: Vec<u8>,
    },
    Pass(Pass),
    BuildAccel(Vec<AccelBuild>),
    UpdateAccel(AccelBuild),
    /// Hands `input` to an external filter that writes `output`.
    ExternalHandoff {
        input: ImageHandle,
        output: ImageHandle,
    },
}

impl Command {
    /// Resources touched by this command and how.
    pub fn accesses(&self) -> Vec<(ResourceId, Usage)> {
        let mut out = Vec::new();
        match self {
            Command::BeginLabel(_) | Command::EndLabel | Command::Barrier(_) => {}
            Command::ClearImage { image, .. } => out.push(((*image).into(), Usage::TransferDst)),
            Command::CopyImage { src, dst } => {
                out.push(((*src).into(), Usage::TransferSrc));
                out.push(((*dst).into(), Usage::TransferDst));
            }
            Command::UpdateBuffer { buffer, .. } => {
                out.push(((*buffer).into(), Usage::TransferDst))
            }
            Command::Pass(pass) => out.extend(pass.accesses.iter().copied()),
            Command::BuildAccel(builds) => {
                for build in builds {
                    build.accesses(&mut out);
                }
            }
            Command::UpdateAccel(build) => build.accesses(&mut out),
            Command::ExternalHandoff { input, output } => {
                out.push(((*input).into(), Usage::ExternalShared));
                out.push(((*output).into(), Usage::ExternalShared));
            }
        }
        out
    }
}

/// A device independent recording. Devices translate it on submit.
#[derive(Clone, Debug)]
pub struct CommandBuffer {
    label: String,
    recording: u64,
    commands: Vec<Command>,
}

impl CommandBuffer {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            recording: 0,
            commands: Vec::new(),
        }
    }

    pub fn begin(&mut self, recording: u64) {
        self.recording = recording;
        self.commands.clear();
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn recording(&self) -> u64 {
        self.recording
    }

    pub fn push(&mut self, command: Command) {
        self.commands.push(command);
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn begin_label(&mut self, label: &str) {
        self.commands.push(Command::BeginLabel(label.to_string()));
    }

    pub fn end_label(&mut self) {
        self.commands.push(Command::EndLabel);
    }

    pub fn passes(&self) -> impl Iterator<Item = &Pass> {
        self.commands.iter().filter_map(|command| match command {
            Command::Pass(pass) => Some(pass),
            _ => None,
        })
    }

    pub fn referenced_binding_tables(&self) -> Vec<BindingTableHandle> {
        self.passes().filter_map(|pass| pass.bindings).collect()
    }
}
