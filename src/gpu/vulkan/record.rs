//! Translation of recorded [`CommandBuffer`]s into Vulkan commands.

use std::ffi::CString;

use ash::vk;

use super::instance::Context;
use super::memory::{aspect, is_depth, subresource_range, VulkanImage};
use super::pipeline::{bind_point, AttachmentFormats, PUSH_CONSTANT_SIZE};
use super::State;
use crate::error::GpuError;
use crate::gpu::{
    AccelBuild, AccelGeometry, BufferHandle, Command, CommandBuffer, Dispatch, GpuResult,
    ImageHandle, Pass, PipelineKind, ResourceId,
};
use crate::resource_state::{Barrier, Usage};

const UPDATE_CHUNK: usize = 65536;

/// Offscreen surfaces have no presentation engine.
fn image_layout(layout: vk::ImageLayout) -> vk::ImageLayout {
    if layout == vk::ImageLayout::PRESENT_SRC_KHR {
        vk::ImageLayout::GENERAL
    } else {
        layout
    }
}

/// Stages of pipelines this device never creates are dropped.
fn pipeline_stages(stages: vk::PipelineStageFlags2) -> vk::PipelineStageFlags2 {
    let stages = stages & !vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR;
    if stages.is_empty() {
        vk::PipelineStageFlags2::NONE
    } else {
        stages
    }
}

fn buffer_of(state: &State, buffer: BufferHandle) -> GpuResult<&super::memory::VulkanBuffer> {
    state
        .buffers
        .get(buffer)
        .ok_or(GpuError::StaleResource(buffer.into()))
}

fn image_of(state: &State, image: ImageHandle) -> GpuResult<&VulkanImage> {
    state
        .images
        .get(image)
        .ok_or(GpuError::StaleResource(image.into()))
}

pub(super) fn geometry_type(geometry: &AccelGeometry) -> vk::AccelerationStructureTypeKHR {
    if geometry.is_top_level() {
        vk::AccelerationStructureTypeKHR::TOP_LEVEL
    } else {
        vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL
    }
}

pub(super) fn build_flags(geometry: &AccelGeometry) -> vk::BuildAccelerationStructureFlagsKHR {
    if geometry.is_top_level() {
        vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE
            | vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE
    } else {
        vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE
    }
}

pub(super) fn geometry_data(
    state: &State,
    geometry: &AccelGeometry,
) -> GpuResult<vk::AccelerationStructureGeometryKHR<'static>> {
    let address =
        |buffer: BufferHandle, offset: u64| -> GpuResult<vk::DeviceOrHostAddressConstKHR> {
            Ok(vk::DeviceOrHostAddressConstKHR {
                device_address: buffer_of(state, buffer)?.address + offset,
            })
        };
    Ok(match geometry {
        AccelGeometry::Triangles {
            vertex_buffer,
            vertex_offset,
            vertex_count,
            vertex_stride,
            index_buffer,
            index_offset,
            ..
        } => {
            let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::default()
                .vertex_format(vk::Format::R32G32B32_SFLOAT)
                .vertex_data(address(*vertex_buffer, *vertex_offset)?)
                .vertex_stride(*vertex_stride)
                .max_vertex(vertex_count.saturating_sub(1))
                .index_type(vk::IndexType::UINT32)
                .index_data(address(*index_buffer, *index_offset)?);
            vk::AccelerationStructureGeometryKHR::default()
                .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
                .flags(vk::GeometryFlagsKHR::OPAQUE)
                .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
        }
        AccelGeometry::Aabbs { buffer, offset, .. } => {
            let aabbs = vk::AccelerationStructureGeometryAabbsDataKHR::default()
                .data(address(*buffer, *offset)?)
                .stride(std::mem::size_of::<vk::AabbPositionsKHR>() as u64);
            vk::AccelerationStructureGeometryKHR::default()
                .geometry_type(vk::GeometryTypeKHR::AABBS)
                .flags(vk::GeometryFlagsKHR::OPAQUE)
                .geometry(vk::AccelerationStructureGeometryDataKHR { aabbs })
        }
        AccelGeometry::Instances { buffer, .. } => {
            let instances = vk::AccelerationStructureGeometryInstancesDataKHR::default()
                .array_of_pointers(false)
                .data(address(*buffer, 0)?);
            vk::AccelerationStructureGeometryKHR::default()
                .geometry_type(vk::GeometryTypeKHR::INSTANCES)
                .geometry(vk::AccelerationStructureGeometryDataKHR { instances })
        }
    })
}

pub(super) struct Recorder<'a> {
    context: &'a Context,
    state: &'a mut State,
    cmd: vk::CommandBuffer,
}

impl<'a> Recorder<'a> {
    pub fn new(context: &'a Context, state: &'a mut State, cmd: vk::CommandBuffer) -> Self {
        Self { context, state, cmd }
    }

    pub fn record(&mut self, commands: &CommandBuffer) -> GpuResult<()> {
        for command in commands.commands() {
            match command {
                Command::BeginLabel(label) => self.begin_label(label),
                Command::EndLabel => self.end_label(),
                Command::Barrier(barrier) => self.barrier(barrier)?,
                Command::ClearImage { image, color } => self.clear(*image, *color)?,
                Command::CopyImage { src, dst } => self.copy(*src, *dst)?,
                Command::UpdateBuffer { buffer, offset, data } => {
                    self.update_buffer(*buffer, *offset, data)?
                }
                Command::Pass(pass) => self.pass(pass)?,
                Command::BuildAccel(builds) => self.build_accels(builds, false)?,
                Command::UpdateAccel(build) => {
                    self.build_accels(std::slice::from_ref(build), true)?
                }
                Command::ExternalHandoff { .. } => {
                    return Err(GpuError::Unsupported("external denoiser hand-off".to_string()))
                }
            }
        }
        Ok(())
    }

    fn begin_label(&self, label: &str) {
        if let Some(labels) = &self.context.labels {
            let name = CString::new(label).unwrap_or_default();
            let info = vk::DebugUtilsLabelEXT::default().label_name(&name);
            unsafe { labels.cmd_begin_debug_utils_label(self.cmd, &info) };
        }
    }

    fn end_label(&self) {
        if let Some(labels) = &self.context.labels {
            unsafe { labels.cmd_end_debug_utils_label(self.cmd) };
        }
    }

    fn barrier(&mut self, barrier: &Barrier) -> GpuResult<()> {
        let src_stage = pipeline_stages(barrier.src.stage);
        let dst_stage = pipeline_stages(barrier.dst.stage);
        match barrier.resource {
            ResourceId::Image(handle) => {
                let image = self
                    .state
                    .images
                    .get_mut(handle)
                    .ok_or(GpuError::StaleResource(barrier.resource))?;
                let new_layout = image_layout(barrier.dst.layout);
                let image_barrier = vk::ImageMemoryBarrier2::default()
                    .src_stage_mask(src_stage)
                    .src_access_mask(barrier.src.access)
                    .dst_stage_mask(dst_stage)
                    .dst_access_mask(barrier.dst.access)
                    .old_layout(image_layout(barrier.src.layout))
                    .new_layout(new_layout)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(image.image)
                    .subresource_range(subresource_range(image.desc.format));
                image.layout = new_layout;
                let barriers = [image_barrier];
                let dependency = vk::DependencyInfo::default().image_memory_barriers(&barriers);
                unsafe { self.context.device.cmd_pipeline_barrier2(self.cmd, &dependency) };
            }
            ResourceId::Buffer(handle) => {
                let buffer = buffer_of(self.state, handle)?;
                let buffer_barrier = vk::BufferMemoryBarrier2::default()
                    .src_stage_mask(src_stage)
                    .src_access_mask(barrier.src.access)
                    .dst_stage_mask(dst_stage)
                    .dst_access_mask(barrier.dst.access)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .buffer(buffer.buffer)
                    .size(vk::WHOLE_SIZE);
                let barriers = [buffer_barrier];
                let dependency = vk::DependencyInfo::default().buffer_memory_barriers(&barriers);
                unsafe { self.context.device.cmd_pipeline_barrier2(self.cmd, &dependency) };
            }
        }
        Ok(())
    }

    fn clear(&self, handle: ImageHandle, color: [f32; 4]) -> GpuResult<()> {
        let image = image_of(self.state, handle)?;
        let range = [subresource_range(image.desc.format)];
        let layout = Usage::TransferDst.state().layout;
        unsafe {
            if is_depth(image.desc.format) {
                let value = vk::ClearDepthStencilValue {
                    depth: color[0],
                    stencil: 0,
                };
                self.context
                    .device
                    .cmd_clear_depth_stencil_image(self.cmd, image.image, layout, &value, &range);
            } else {
                let value = vk::ClearColorValue { float32: color };
                self.context
                    .device
                    .cmd_clear_color_image(self.cmd, image.image, layout, &value, &range);
            }
        }
        Ok(())
    }

    /// Same format copies, blits otherwise.
    fn copy(&self, src: ImageHandle, dst: ImageHandle) -> GpuResult<()> {
        let src = image_of(self.state, src)?;
        let dst = image_of(self.state, dst)?;
        let src_layout = Usage::TransferSrc.state().layout;
        let dst_layout = Usage::TransferDst.state().layout;
        let layers = |format| {
            vk::ImageSubresourceLayers::default()
                .aspect_mask(aspect(format))
                .layer_count(1)
        };
        let device = &self.context.device;
        if src.desc.format == dst.desc.format {
            let region = vk::ImageCopy::default()
                .src_subresource(layers(src.desc.format))
                .dst_subresource(layers(dst.desc.format))
                .extent(vk::Extent3D {
                    width: src.desc.extent.width.min(dst.desc.extent.width),
                    height: src.desc.extent.height.min(dst.desc.extent.height),
                    depth: 1,
                });
            unsafe {
                device.cmd_copy_image(
                    self.cmd,
                    src.image,
                    src_layout,
                    dst.image,
                    dst_layout,
                    &[region],
                )
            };
        } else {
            let corner = |extent: vk::Extent2D| vk::Offset3D {
                x: extent.width as i32,
                y: extent.height as i32,
                z: 1,
            };
            let region = vk::ImageBlit::default()
                .src_subresource(layers(src.desc.format))
                .src_offsets([vk::Offset3D::default(), corner(src.desc.extent)])
                .dst_subresource(layers(dst.desc.format))
                .dst_offsets([vk::Offset3D::default(), corner(dst.desc.extent)]);
            unsafe {
                device.cmd_blit_image(
                    self.cmd,
                    src.image,
                    src_layout,
                    dst.image,
                    dst_layout,
                    &[region],
                    vk::Filter::NEAREST,
                )
            };
        }
        Ok(())
    }

    fn update_buffer(&self, handle: BufferHandle, offset: u64, data: &[u8]) -> GpuResult<()> {
        let buffer = buffer_of(self.state, handle)?;
        if data.len() % 4 != 0 || offset % 4 != 0 {
            return Err(GpuError::Unsupported(format!(
                "unaligned update of `{}` ({} bytes at {})",
                buffer.desc.label,
                data.len(),
                offset
            )));
        }
        for (index, chunk) in data.chunks(UPDATE_CHUNK).enumerate() {
            let chunk_offset = offset + (index * UPDATE_CHUNK) as u64;
            unsafe {
                self.context
                    .device
                    .cmd_update_buffer(self.cmd, buffer.buffer, chunk_offset, chunk)
            };
        }
        Ok(())
    }

    fn attachments(&self, pass: &Pass) -> GpuResult<(Vec<&VulkanImage>, Option<&VulkanImage>)> {
        let mut color = Vec::new();
        let mut depth = None;
        for (resource, usage) in &pass.accesses {
            let ResourceId::Image(handle) = resource else {
                continue;
            };
            match usage {
                Usage::ColorAttachment => color.push(image_of(self.state, *handle)?),
                Usage::DepthAttachment => depth = Some(image_of(self.state, *handle)?),
                _ => {}
            }
        }
        Ok((color, depth))
    }

    fn pass(&mut self, pass: &Pass) -> GpuResult<()> {
        let device = &self.context.device;
        let set = match pass.bindings {
            Some(table) => Some(
                self.state
                    .tables
                    .get(table)
                    .ok_or(GpuError::InvalidHandle("binding table"))?
                    .0
                    .set,
            ),
            None => None,
        };

        let kind = self
            .state
            .pipelines
            .get(pass.pipeline)
            .ok_or(GpuError::InvalidHandle("pipeline"))?
            .kind;
        let (pipeline, layout, formats, extent) = if kind == PipelineKind::Raster {
            let (color, depth) = self.attachments(pass)?;
            let formats = AttachmentFormats {
                color: color.iter().map(|image| image.desc.format).collect(),
                depth: depth.map(|image| image.desc.format),
            };
            let extent = color
                .first()
                .or(depth.as_ref())
                .map(|image| image.desc.extent)
                .ok_or_else(|| {
                    GpuError::Unsupported(format!("`{}` draws without attachments", pass.label))
                })?;
            let pipeline = self
                .state
                .pipelines
                .get_mut(pass.pipeline)
                .ok_or(GpuError::InvalidHandle("pipeline"))?;
            let layout = pipeline.layout;
            (pipeline.raster(self.context, &formats)?, layout, Some(formats), extent)
        } else {
            let pipeline = self
                .state
                .pipelines
                .get(pass.pipeline)
                .ok_or(GpuError::InvalidHandle("pipeline"))?;
            (pipeline.compute()?, pipeline.layout, None, vk::Extent2D::default())
        };

        let bind_point = bind_point(kind);
        unsafe {
            device.cmd_bind_pipeline(self.cmd, bind_point, pipeline);
            if let Some(set) = set {
                device.cmd_bind_descriptor_sets(self.cmd, bind_point, layout, 0, &[set], &[]);
            }
        }
        if !pass.push_constants.is_empty() {
            let mut constants = pass.push_constants.clone();
            constants.resize(constants.len().next_multiple_of(4), 0);
            if constants.len() > PUSH_CONSTANT_SIZE as usize {
                return Err(GpuError::Unsupported(format!(
                    "`{}` pushes {} bytes of constants",
                    pass.label,
                    constants.len()
                )));
            }
            let stages = match kind {
                PipelineKind::Raster => {
                    vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
                }
                _ => vk::ShaderStageFlags::COMPUTE,
            };
            unsafe { device.cmd_push_constants(self.cmd, layout, stages, 0, &constants) };
        }

        match pass.dispatch {
            Dispatch::Compute { x, y, z } => unsafe { device.cmd_dispatch(self.cmd, x, y, z) },
            Dispatch::TraceRays { width, height } => unsafe {
                device.cmd_dispatch(self.cmd, width.div_ceil(8), height.div_ceil(8), 1)
            },
            Dispatch::Draw {
                vertex_count,
                instance_count,
            } => {
                let formats = formats.unwrap_or(AttachmentFormats {
                    color: Vec::new(),
                    depth: None,
                });
                self.draw(pass, &formats, extent, vertex_count, instance_count)?;
            }
        }
        Ok(())
    }

    fn draw(
        &self,
        pass: &Pass,
        formats: &AttachmentFormats,
        extent: vk::Extent2D,
        vertex_count: u32,
        instance_count: u32,
    ) -> GpuResult<()> {
        let (color, depth) = self.attachments(pass)?;
        let color_attachments: Vec<vk::RenderingAttachmentInfo> = color
            .iter()
            .map(|image| {
                vk::RenderingAttachmentInfo::default()
                    .image_view(image.view)
                    .image_layout(Usage::ColorAttachment.state().layout)
                    .load_op(vk::AttachmentLoadOp::CLEAR)
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .clear_value(vk::ClearValue {
                        color: vk::ClearColorValue { float32: [0.0; 4] },
                    })
            })
            .collect();
        let depth_attachment = depth.map(|image| {
            vk::RenderingAttachmentInfo::default()
                .image_view(image.view)
                .image_layout(Usage::DepthAttachment.state().layout)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(vk::AttachmentStoreOp::STORE)
                .clear_value(vk::ClearValue {
                    depth_stencil: vk::ClearDepthStencilValue { depth: 1.0, stencil: 0 },
                })
        });
        debug_assert_eq!(color_attachments.len(), formats.color.len());

        let area = vk::Rect2D {
            offset: vk::Offset2D::default(),
            extent,
        };
        let mut rendering = vk::RenderingInfo::default()
            .render_area(area)
            .layer_count(1)
            .color_attachments(&color_attachments);
        if let Some(depth_attachment) = depth_attachment.as_ref() {
            rendering = rendering.depth_attachment(depth_attachment);
        }
        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };

        let device = &self.context.device;
        unsafe {
            device.cmd_begin_rendering(self.cmd, &rendering);
            device.cmd_set_viewport(self.cmd, 0, &[viewport]);
            device.cmd_set_scissor(self.cmd, 0, &[area]);
            device.cmd_draw(self.cmd, vertex_count, instance_count, 0, 0);
            device.cmd_end_rendering(self.cmd);
        }
        Ok(())
    }

    fn build_accels(&self, builds: &[AccelBuild], update: bool) -> GpuResult<()> {
        let mut geometries = Vec::with_capacity(builds.len());
        let mut ranges = Vec::with_capacity(builds.len());
        for build in builds {
            geometries.push(geometry_data(self.state, &build.geometry)?);
            ranges.push([vk::AccelerationStructureBuildRangeInfoKHR::default()
                .primitive_count(build.geometry.primitive_count())]);
        }

        let mut infos = Vec::with_capacity(builds.len());
        for (build, geometry) in builds.iter().zip(&geometries) {
            let accel = self
                .state
                .accels
                .get(build.accel)
                .ok_or(GpuError::InvalidHandle("acceleration structure"))?
                .accel;
            let scratch = buffer_of(self.state, build.scratch)?.address + build.scratch_offset;
            let mut info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
                .ty(geometry_type(&build.geometry))
                .flags(build_flags(&build.geometry))
                .dst_acceleration_structure(accel)
                .geometries(std::slice::from_ref(geometry))
                .scratch_data(vk::DeviceOrHostAddressKHR {
                    device_address: scratch,
                });
            info = if update {
                info.mode(vk::BuildAccelerationStructureModeKHR::UPDATE)
                    .src_acceleration_structure(accel)
            } else {
                info.mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            };
            infos.push(info);
        }
        let range_slices: Vec<&[vk::AccelerationStructureBuildRangeInfoKHR]> =
            ranges.iter().map(|range| &range[..]).collect();
        unsafe {
            self.context
                .accel
                .cmd_build_acceleration_structures(self.cmd, &infos, &range_slices)
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn present_layout_maps_to_general() {
        assert_eq!(image_layout(vk::ImageLayout::PRESENT_SRC_KHR), vk::ImageLayout::GENERAL);
        assert_eq!(
            image_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL),
            vk::ImageLayout::TRANSFER_DST_OPTIMAL
        );
    }

    #[test]
    fn ray_tracing_stage_is_dropped() {
        let stages = vk::PipelineStageFlags2::COMPUTE_SHADER
            | vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR;
        assert_eq!(pipeline_stages(stages), vk::PipelineStageFlags2::COMPUTE_SHADER);
        assert_eq!(
            pipeline_stages(vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR),
            vk::PipelineStageFlags2::NONE
        );
    }
}
