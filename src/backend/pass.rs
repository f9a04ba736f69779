//! Passes described as data.
//!
//! A pass is a shader, a pipeline kind and a list of slots. Each slot names
//! where its resource comes from and whether the pass reads or writes it.
//! The binding layout, the binding tables and the per-frame access list
//! (and with it the barriers) are all derived from that one list.

use ash::vk;

use crate::backend::{FrameContext, ResourceContext, SharedResources};
use crate::error::{RenderError, Result};
use crate::gpu::{
    BindingKind, BindingLayout, BindingResource, BindingSlot, BindingTableDesc,
    BindingTableHandle, BufferDesc, BufferHandle, Command, DeviceContext, Dispatch, ImageDesc,
    ImageHandle, Pass, PipelineHandle, PipelineKind, ResourceId,
};
use crate::resource_state::{ResourceStateTracker, Usage};

pub const ACCELERATION_STRUCTURE_LOCATION: u32 = 0;
pub const UNIFORM_LOCATION: u32 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SceneBuffer {
    Vertices,
    Indices,
    Aabbs,
    Materials,
    Nodes,
    Ranges,
}

impl SceneBuffer {
    pub const ALL: [SceneBuffer; 6] = [
        SceneBuffer::Vertices,
        SceneBuffer::Indices,
        SceneBuffer::Aabbs,
        SceneBuffer::Materials,
        SceneBuffer::Nodes,
        SceneBuffer::Ranges,
    ];
}

/// Where a slot's resource comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Source {
    TopLevel,
    Uniforms,
    Scene(SceneBuffer),
    Textures,
    AccumulationInput,
    MotionVectors,
    Depth,
    Albedo,
    Normal,
    Output,
    VisibilityRead,
    VisibilityWrite,
    HistoryRead,
    HistoryWrite,
    DenoiserOutput,
    PrivateImage(usize),
    PrivateBuffer(usize),
}

impl Source {
    fn is_image(self) -> bool {
        !matches!(
            self,
            Source::TopLevel
                | Source::Uniforms
                | Source::Scene(_)
                | Source::Textures
                | Source::PrivateBuffer(_)
        )
    }

    fn binding_kind(self, usage: Usage) -> BindingKind {
        match self {
            Source::TopLevel => BindingKind::AccelerationStructure,
            Source::Uniforms => BindingKind::UniformBuffer,
            Source::Scene(_) | Source::PrivateBuffer(_) => BindingKind::StorageBuffer,
            Source::Textures => BindingKind::TextureArray,
            _ if usage == Usage::Sampled => BindingKind::SampledImage,
            _ => BindingKind::StorageImage,
        }
    }

    fn image(
        self,
        shared: &SharedResources,
        private: &PrivateTargets,
        parity: usize,
    ) -> Result<ImageHandle> {
        let surface = shared.surface;
        Ok(match self {
            Source::AccumulationInput => surface.accumulation_input(),
            Source::MotionVectors => surface.motion_vectors(),
            Source::Depth => surface.depth(),
            Source::Albedo => surface.albedo(),
            Source::Normal => surface.normal(),
            Source::Output => surface.output(),
            Source::VisibilityRead => surface.visibility().by_parity(parity).0,
            Source::VisibilityWrite => surface.visibility().by_parity(parity).1,
            Source::HistoryRead => surface.history().by_parity(parity).0,
            Source::HistoryWrite => surface.history().by_parity(parity).1,
            Source::DenoiserOutput => {
                let staging = surface.denoiser_staging().ok_or_else(|| {
                    RenderError::MissingCapability("denoiser staging images".to_string())
                })?;
                staging.images()[1]
            }
            Source::PrivateImage(index) => private.image(index)?,
            _ => {
                return Err(RenderError::Gpu(crate::error::GpuError::InvalidHandle(
                    "image source",
                )))
            }
        })
    }

    fn resolve(
        self,
        shared: &SharedResources,
        private: &PrivateTargets,
        uniform_buffer: BufferHandle,
        parity: usize,
    ) -> Result<BindingResource> {
        let scene = shared.scene;
        Ok(match self {
            Source::TopLevel => {
                let top_level = shared.accel.top_level().ok_or_else(|| {
                    RenderError::AccelerationBuild("top level structure not built".to_string())
                })?;
                BindingResource::Accel(top_level.accel, top_level.buffer)
            }
            Source::Uniforms => BindingResource::Buffer(uniform_buffer),
            Source::Scene(buffer) => BindingResource::Buffer(match buffer {
                SceneBuffer::Vertices => scene.vertices(),
                SceneBuffer::Indices => scene.indices(),
                SceneBuffer::Aabbs => scene.aabbs(),
                SceneBuffer::Materials => scene.materials(),
                SceneBuffer::Nodes => scene.nodes(),
                SceneBuffer::Ranges => scene.ranges(),
            }),
            Source::Textures => BindingResource::Textures(shared.textures.images()),
            Source::PrivateBuffer(index) => BindingResource::Buffer(private.buffer(index)?),
            image => BindingResource::Image(image.image(shared, private, parity)?),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotDecl {
    pub slot: u32,
    pub source: Source,
    pub usage: Usage,
}

/// How big a dispatch is, resolved against the surface and scene each frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Workload {
    PerPixel,
    /// Per pixel compute tracing; halved horizontally under checkerboard
    /// rendering.
    TracedPixels,
    TraceRays,
    /// One draw instance per scene instance.
    Instances,
    /// One thread per scene instance.
    InstanceThreads,
    /// Cubic grid with the given edge length.
    Volume(u32),
}

impl Workload {
    fn dispatch(self, shared: &SharedResources, checkerboard: bool) -> Dispatch {
        let extent = shared.surface.extent();
        let traced_width = if checkerboard {
            extent.width.div_ceil(2)
        } else {
            extent.width
        };
        let instances = shared.scene.instance_count() as u32;
        match self {
            Workload::PerPixel => Dispatch::per_pixel(extent.width, extent.height),
            Workload::TracedPixels => Dispatch::per_pixel(traced_width, extent.height),
            Workload::TraceRays => Dispatch::TraceRays {
                width: traced_width,
                height: extent.height,
            },
            Workload::Instances => Dispatch::Draw {
                vertex_count: shared
                    .scene
                    .model_ranges()
                    .iter()
                    .map(|range| range.index_count)
                    .max()
                    .unwrap_or(0),
                instance_count: instances,
            },
            Workload::InstanceThreads => Dispatch::Compute {
                x: instances.div_ceil(64).max(1),
                y: 1,
                z: 1,
            },
            Workload::Volume(edge) => {
                let groups = edge.div_ceil(4);
                Dispatch::Compute {
                    x: groups,
                    y: groups,
                    z: groups,
                }
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PassDesc {
    pub label: &'static str,
    pub shader: &'static str,
    pub kind: PipelineKind,
    pub workload: Workload,
    pub slots: Vec<SlotDecl>,
    /// Raster targets; accessed but not bound.
    pub attachments: Vec<(Source, Usage)>,
}

impl PassDesc {
    pub fn new(
        label: &'static str,
        shader: &'static str,
        kind: PipelineKind,
        workload: Workload,
    ) -> Self {
        Self {
            label,
            shader,
            kind,
            workload,
            slots: Vec::new(),
            attachments: Vec::new(),
        }
    }

    pub fn compute(label: &'static str, shader: &'static str) -> Self {
        Self::new(label, shader, PipelineKind::Compute, Workload::PerPixel)
    }

    pub fn workload(mut self, workload: Workload) -> Self {
        self.workload = workload;
        self
    }

    pub fn bind(mut self, slot: u32, source: Source, usage: Usage) -> Self {
        self.slots.push(SlotDecl { slot, source, usage });
        self
    }

    /// Reads `source` the natural way for its kind.
    pub fn read(self, slot: u32, source: Source) -> Self {
        let usage = match source {
            Source::TopLevel => Usage::AccelRead,
            Source::Uniforms => Usage::UniformRead,
            Source::Textures => Usage::Sampled,
            _ => Usage::StorageRead,
        };
        self.bind(slot, source, usage)
    }

    pub fn write(self, slot: u32, source: Source) -> Self {
        self.bind(slot, source, Usage::StorageWrite)
    }

    /// Acceleration structure, uniforms, scene buffers and textures in the
    /// slots every tracing shader shares.
    pub fn scene_inputs(self, first_scene_slot: u32) -> Self {
        let mut desc = self
            .read(ACCELERATION_STRUCTURE_LOCATION, Source::TopLevel)
            .read(UNIFORM_LOCATION, Source::Uniforms);
        for (offset, buffer) in SceneBuffer::ALL.into_iter().enumerate() {
            desc = desc.read(first_scene_slot + offset as u32, Source::Scene(buffer));
        }
        desc.read(first_scene_slot + SceneBuffer::ALL.len() as u32, Source::Textures)
    }

    pub fn attach(mut self, source: Source, usage: Usage) -> Self {
        self.attachments.push((source, usage));
        self
    }

    fn stages(&self) -> vk::ShaderStageFlags {
        use vk::ShaderStageFlags as S;
        match self.kind {
            PipelineKind::Compute => S::COMPUTE,
            PipelineKind::Raster => S::VERTEX | S::FRAGMENT,
            PipelineKind::RayTracing => {
                S::RAYGEN_KHR
                    | S::CLOSEST_HIT_KHR
                    | S::ANY_HIT_KHR
                    | S::MISS_KHR
                    | S::INTERSECTION_KHR
            }
        }
    }

    pub fn layout(&self) -> Result<BindingLayout> {
        let stages = self.stages();
        let slots: Vec<BindingSlot> = self
            .slots
            .iter()
            .map(|decl| BindingSlot {
                slot: decl.slot,
                kind: decl.source.binding_kind(decl.usage),
                stages,
            })
            .collect();
        Ok(BindingLayout::from_slots(self.label, &slots)?)
    }
}

/// Images and buffers a backend owns. Torn down in reverse creation order.
#[derive(Default)]
pub struct PrivateTargets {
    images: Vec<ImageHandle>,
    buffers: Vec<BufferHandle>,
}

impl PrivateTargets {
    pub fn add_image(
        &mut self,
        device: &dyn DeviceContext,
        tracker: &mut ResourceStateTracker,
        desc: &ImageDesc,
    ) -> Result<usize> {
        let image = device.create_image(desc)?;
        tracker.register(image, &desc.label);
        self.images.push(image);
        Ok(self.images.len() - 1)
    }

    pub fn add_buffer(
        &mut self,
        device: &dyn DeviceContext,
        tracker: &mut ResourceStateTracker,
        desc: &BufferDesc,
    ) -> Result<usize> {
        let buffer = device.create_buffer(desc)?;
        tracker.register(buffer, &desc.label);
        self.buffers.push(buffer);
        Ok(self.buffers.len() - 1)
    }

    pub fn image(&self, index: usize) -> Result<ImageHandle> {
        self.images
            .get(index)
            .copied()
            .ok_or(RenderError::Gpu(crate::error::GpuError::InvalidHandle("private image")))
    }

    pub fn buffer(&self, index: usize) -> Result<BufferHandle> {
        self.buffers
            .get(index)
            .copied()
            .ok_or(RenderError::Gpu(crate::error::GpuError::InvalidHandle("private buffer")))
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty() && self.buffers.is_empty()
    }

    pub fn destroy(&mut self, device: &dyn DeviceContext, tracker: &mut ResourceStateTracker) {
        for buffer in self.buffers.drain(..).rev() {
            tracker.forget(buffer);
            device.destroy_buffer(buffer);
        }
        for image in self.images.drain(..).rev() {
            tracker.forget(image);
            device.destroy_image(image);
        }
    }
}

/// A created pass: its pipeline plus one binding table per frame slot and
/// ping-pong parity.
pub struct PreparedPass {
    desc: PassDesc,
    pipeline: PipelineHandle,
    tables: Vec<BindingTableHandle>,
}

impl PreparedPass {
    pub fn create(
        desc: PassDesc,
        context: &mut ResourceContext,
        private: &PrivateTargets,
    ) -> Result<Self> {
        let layout = desc.layout()?;
        let code = context.shaders.load(desc.shader)?;
        let pipeline = context
            .device
            .create_pipeline(desc.label, desc.kind, code, &layout)?;

        let mut tables = Vec::with_capacity(context.uniform_buffers.len() * 2);
        for uniform_buffer in context.uniform_buffers {
            for parity in 0..2 {
                let resources = desc
                    .slots
                    .iter()
                    .map(|decl| {
                        Ok((
                            decl.slot,
                            decl.source
                                .resolve(&context.shared, private, *uniform_buffer, parity)?,
                        ))
                    })
                    .collect::<Result<Vec<_>>>()?;
                let table = BindingTableDesc::new(&layout, resources)?;
                tables.push(context.device.create_binding_table(&table)?);
            }
        }

        log::trace!("Created pass `{}` with {} binding tables", desc.label, tables.len());
        Ok(Self {
            desc,
            pipeline,
            tables,
        })
    }

    pub fn label(&self) -> &'static str {
        self.desc.label
    }

    pub fn desc(&self) -> &PassDesc {
        &self.desc
    }

    pub fn binding_tables(&self) -> &[BindingTableHandle] {
        &self.tables
    }

    /// Resources the pass touches in frame `frame`, in slot order followed
    /// by attachments.
    pub fn accesses(
        &self,
        shared: &SharedResources,
        private: &PrivateTargets,
        uniform_buffer: BufferHandle,
        frame: u64,
    ) -> Result<Vec<(ResourceId, Usage)>> {
        let parity = (frame % 2) as usize;
        let mut accesses = Vec::new();
        for decl in &self.desc.slots {
            let resource = decl.source.resolve(shared, private, uniform_buffer, parity)?;
            accesses.extend(resource.resources().into_iter().map(|id| (id, decl.usage)));
        }
        for (source, usage) in &self.desc.attachments {
            debug_assert!(source.is_image());
            accesses.push((source.image(shared, private, parity)?.into(), *usage));
        }
        Ok(accesses)
    }

    /// Transitions everything the pass touches and records it.
    pub fn record(
        &self,
        frame: &mut FrameContext,
        private: &PrivateTargets,
        push_constants: Vec<u8>,
    ) -> Result<()> {
        let accesses = self.accesses(&frame.shared, private, frame.uniform_buffer, frame.frame)?;
        let table = self.tables[(frame.slot * 2 + frame.parity()) % self.tables.len().max(1)];
        frame.tracker.transition_all(frame.command_buffer, &accesses)?;
        frame.command_buffer.push(Command::Pass(Pass {
            label: self.desc.label.to_string(),
            pipeline: self.pipeline,
            bindings: Some(table),
            dispatch: self
                .desc
                .workload
                .dispatch(&frame.shared, frame.settings.checkerboard),
            push_constants,
            accesses,
        }));
        Ok(())
    }

    pub fn destroy(self, device: &dyn DeviceContext) {
        for table in self.tables.into_iter().rev() {
            device.destroy_binding_table(table);
        }
        device.destroy_pipeline(self.pipeline);
    }
}

/// Passes plus private targets; the shape every backend shares.
#[derive(Default)]
pub struct PassChain {
    pub passes: Vec<PreparedPass>,
    pub private: PrivateTargets,
}

impl PassChain {
    pub fn add(&mut self, desc: PassDesc, context: &mut ResourceContext) -> Result<()> {
        let pass = PreparedPass::create(desc, context, &self.private)?;
        self.passes.push(pass);
        Ok(())
    }

    pub fn record(
        &self,
        index: usize,
        frame: &mut FrameContext,
        push_constants: Vec<u8>,
    ) -> Result<()> {
        self.passes[index].record(frame, &self.private, push_constants)
    }

    pub fn is_created(&self) -> bool {
        !self.passes.is_empty()
    }

    /// Tables and pipelines first, the targets they reference after.
    pub fn destroy(&mut self, device: &dyn DeviceContext, tracker: &mut ResourceStateTracker) {
        for pass in self.passes.drain(..).rev() {
            pass.destroy(device);
        }
        self.private.destroy(device, tracker);
    }
}
