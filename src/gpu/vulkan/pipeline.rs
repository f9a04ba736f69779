use std::collections::HashMap;

use ash::vk;

use super::instance::Context;
use super::vk_error;
use crate::error::GpuError;
use crate::gpu::{BindingKind, BindingLayout, GpuResult, PipelineKind};

/// Upper bound of the bindless texture array.
pub(super) const MAX_TEXTURES: u32 = 1024;

pub(super) const PUSH_CONSTANT_SIZE: u32 = 128;

const ENTRY_POINT: &std::ffi::CStr = c"main";

/// Tracing passes run as compute shaders using ray queries.
pub(super) fn shader_stages(stages: vk::ShaderStageFlags) -> vk::ShaderStageFlags {
    let tracing = vk::ShaderStageFlags::RAYGEN_KHR
        | vk::ShaderStageFlags::CLOSEST_HIT_KHR
        | vk::ShaderStageFlags::ANY_HIT_KHR
        | vk::ShaderStageFlags::MISS_KHR
        | vk::ShaderStageFlags::INTERSECTION_KHR;
    if stages.intersects(tracing) {
        (stages & !tracing) | vk::ShaderStageFlags::COMPUTE
    } else {
        stages
    }
}

fn push_constant_stages(kind: PipelineKind) -> vk::ShaderStageFlags {
    match kind {
        PipelineKind::Compute | PipelineKind::RayTracing => vk::ShaderStageFlags::COMPUTE,
        PipelineKind::Raster => vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
    }
}

pub(super) fn bind_point(kind: PipelineKind) -> vk::PipelineBindPoint {
    match kind {
        PipelineKind::Compute | PipelineKind::RayTracing => vk::PipelineBindPoint::COMPUTE,
        PipelineKind::Raster => vk::PipelineBindPoint::GRAPHICS,
    }
}

pub(super) fn descriptor_count(kind: BindingKind) -> u32 {
    match kind {
        BindingKind::TextureArray => MAX_TEXTURES,
        _ => 1,
    }
}

pub(super) fn create_set_layout(
    context: &Context,
    layout: &BindingLayout,
) -> GpuResult<vk::DescriptorSetLayout> {
    let bindings: Vec<vk::DescriptorSetLayoutBinding> = layout
        .slots()
        .iter()
        .map(|slot| {
            vk::DescriptorSetLayoutBinding::default()
                .binding(slot.slot)
                .descriptor_type(slot.kind.descriptor_type())
                .descriptor_count(descriptor_count(slot.kind))
                .stage_flags(shader_stages(slot.stages))
        })
        .collect();
    let flags: Vec<vk::DescriptorBindingFlags> = layout
        .slots()
        .iter()
        .map(|slot| match slot.kind {
            BindingKind::TextureArray => vk::DescriptorBindingFlags::PARTIALLY_BOUND,
            _ => vk::DescriptorBindingFlags::empty(),
        })
        .collect();
    let mut binding_flags =
        vk::DescriptorSetLayoutBindingFlagsCreateInfo::default().binding_flags(&flags);
    let info = vk::DescriptorSetLayoutCreateInfo::default()
        .bindings(&bindings)
        .push_next(&mut binding_flags);
    unsafe { context.device.create_descriptor_set_layout(&info, None) }.map_err(vk_error)
}

/// Formats of the attachments a raster pipeline renders into.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(super) struct AttachmentFormats {
    pub color: Vec<vk::Format>,
    pub depth: Option<vk::Format>,
}

pub(super) struct VulkanPipeline {
    pub name: String,
    pub kind: PipelineKind,
    set_layout: vk::DescriptorSetLayout,
    pub layout: vk::PipelineLayout,
    module: vk::ShaderModule,
    compute: Option<vk::Pipeline>,
    // Raster pipelines are specialized for the attachments of the first draw.
    raster: HashMap<AttachmentFormats, vk::Pipeline>,
}

impl VulkanPipeline {
    pub fn new(
        context: &Context,
        name: &str,
        kind: PipelineKind,
        code: &[u32],
        layout: &BindingLayout,
    ) -> GpuResult<Self> {
        let device = &context.device;
        let module_info = vk::ShaderModuleCreateInfo::default().code(code);
        let module = unsafe { device.create_shader_module(&module_info, None) }.map_err(vk_error)?;

        let set_layout = match create_set_layout(context, layout) {
            Ok(set_layout) => set_layout,
            Err(error) => {
                unsafe { device.destroy_shader_module(module, None) };
                return Err(error);
            }
        };
        let push_constants = [vk::PushConstantRange::default()
            .stage_flags(push_constant_stages(kind))
            .size(PUSH_CONSTANT_SIZE)];
        let set_layouts = [set_layout];
        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&push_constants);
        let pipeline_layout = match unsafe { device.create_pipeline_layout(&layout_info, None) } {
            Ok(pipeline_layout) => pipeline_layout,
            Err(result) => {
                unsafe {
                    device.destroy_descriptor_set_layout(set_layout, None);
                    device.destroy_shader_module(module, None);
                }
                return Err(vk_error(result));
            }
        };

        let mut pipeline = Self {
            name: name.to_string(),
            kind,
            set_layout,
            layout: pipeline_layout,
            module,
            compute: None,
            raster: HashMap::new(),
        };
        if kind != PipelineKind::Raster {
            let stage = vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::COMPUTE)
                .module(module)
                .name(ENTRY_POINT);
            let info = vk::ComputePipelineCreateInfo::default()
                .stage(stage)
                .layout(pipeline_layout);
            let created = unsafe {
                device.create_compute_pipelines(vk::PipelineCache::null(), &[info], None)
            };
            match created {
                Ok(pipelines) => pipeline.compute = pipelines.first().copied(),
                Err((_, result)) => {
                    pipeline.destroy(context);
                    return Err(vk_error(result));
                }
            }
        }
        Ok(pipeline)
    }

    pub fn compute(&self) -> GpuResult<vk::Pipeline> {
        self.compute.ok_or_else(|| {
            GpuError::Unsupported(format!("`{}` is not a compute pipeline", self.name))
        })
    }

    /// The module carries a vertex and a fragment entry point, both `main`.
    pub fn raster(
        &mut self,
        context: &Context,
        formats: &AttachmentFormats,
    ) -> GpuResult<vk::Pipeline> {
        if let Some(pipeline) = self.raster.get(formats) {
            return Ok(*pipeline);
        }

        let stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(self.module)
                .name(ENTRY_POINT),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(self.module)
                .name(ENTRY_POINT),
        ];
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default();
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST);
        let viewport = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);
        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(vk::PolygonMode::FILL)
            .cull_mode(vk::CullModeFlags::BACK)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .line_width(1.0);
        let multisample = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(formats.depth.is_some())
            .depth_write_enable(formats.depth.is_some())
            .depth_compare_op(vk::CompareOp::LESS_OR_EQUAL);
        let blend_attachments: Vec<vk::PipelineColorBlendAttachmentState> = formats
            .color
            .iter()
            .map(|_| {
                vk::PipelineColorBlendAttachmentState::default()
                    .color_write_mask(vk::ColorComponentFlags::RGBA)
            })
            .collect();
        let color_blend =
            vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);
        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);
        let mut rendering = vk::PipelineRenderingCreateInfo::default()
            .color_attachment_formats(&formats.color)
            .depth_attachment_format(formats.depth.unwrap_or(vk::Format::UNDEFINED));

        let info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic)
            .layout(self.layout)
            .push_next(&mut rendering);
        let pipeline = unsafe {
            context
                .device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[info], None)
        }
        .map_err(|(_, result)| vk_error(result))?
        .first()
        .copied()
        .ok_or(GpuError::InvalidHandle("graphics pipeline"))?;

        log::debug!("Specialized `{}` for {:?}", self.name, formats);
        self.raster.insert(formats.clone(), pipeline);
        Ok(pipeline)
    }

    pub fn destroy(self, context: &Context) {
        let device = &context.device;
        unsafe {
            if let Some(pipeline) = self.compute {
                device.destroy_pipeline(pipeline, None);
            }
            for pipeline in self.raster.into_values() {
                device.destroy_pipeline(pipeline, None);
            }
            device.destroy_pipeline_layout(self.layout, None);
            device.destroy_descriptor_set_layout(self.set_layout, None);
            device.destroy_shader_module(self.module, None);
        }
    }
}

/// One descriptor set in its own pool.
pub(super) struct VulkanBindingTable {
    pub set: vk::DescriptorSet,
    set_layout: vk::DescriptorSetLayout,
    pool: vk::DescriptorPool,
}

impl VulkanBindingTable {
    pub fn new(context: &Context, layout: &BindingLayout) -> GpuResult<Self> {
        let device = &context.device;
        let set_layout = create_set_layout(context, layout)?;

        let mut counts: HashMap<vk::DescriptorType, u32> = HashMap::new();
        for slot in layout.slots() {
            *counts.entry(slot.kind.descriptor_type()).or_default() += descriptor_count(slot.kind);
        }
        let sizes: Vec<vk::DescriptorPoolSize> = counts
            .into_iter()
            .map(|(ty, descriptor_count)| vk::DescriptorPoolSize { ty, descriptor_count })
            .collect();
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(1)
            .pool_sizes(&sizes);
        let pool = match unsafe { device.create_descriptor_pool(&pool_info, None) } {
            Ok(pool) => pool,
            Err(result) => {
                unsafe { device.destroy_descriptor_set_layout(set_layout, None) };
                return Err(vk_error(result));
            }
        };

        let set_layouts = [set_layout];
        let allocate_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&set_layouts);
        match unsafe { device.allocate_descriptor_sets(&allocate_info) } {
            Ok(sets) => Ok(Self {
                set: sets.first().copied().unwrap_or_default(),
                set_layout,
                pool,
            }),
            Err(result) => {
                unsafe {
                    device.destroy_descriptor_pool(pool, None);
                    device.destroy_descriptor_set_layout(set_layout, None);
                }
                Err(vk_error(result))
            }
        }
    }

    pub fn destroy(self, context: &Context) {
        unsafe {
            context.device.destroy_descriptor_pool(self.pool, None);
            context.device.destroy_descriptor_set_layout(self.set_layout, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracing_stages_run_as_compute() {
        let stages = vk::ShaderStageFlags::RAYGEN_KHR | vk::ShaderStageFlags::MISS_KHR;
        assert_eq!(shader_stages(stages), vk::ShaderStageFlags::COMPUTE);
        let raster = vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT;
        assert_eq!(shader_stages(raster), raster);
    }

    #[test]
    fn texture_arrays_are_bounded() {
        assert_eq!(descriptor_count(BindingKind::TextureArray), MAX_TEXTURES);
        assert_eq!(descriptor_count(BindingKind::StorageImage), 1);
    }
}
