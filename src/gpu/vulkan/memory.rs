use std::ptr::NonNull;

use ash::vk;

use super::instance::Context;
use super::vk_error;
use crate::gpu::{BufferDesc, GpuResult, ImageDesc};
use crate::error::GpuError;

pub(super) fn memory_type_index(
    type_bits: u32,
    properties: &vk::PhysicalDeviceMemoryProperties,
    flags: vk::MemoryPropertyFlags,
) -> Option<u32> {
    properties.memory_types[..properties.memory_type_count as usize]
        .iter()
        .enumerate()
        .find(|(index, memory_type)| {
            type_bits & (1 << index) != 0 && memory_type.property_flags.contains(flags)
        })
        .map(|(index, _)| index as u32)
}

fn allocate(
    context: &Context,
    requirements: vk::MemoryRequirements,
    flags: vk::MemoryPropertyFlags,
    device_address: bool,
    label: &str,
) -> GpuResult<vk::DeviceMemory> {
    let type_bits = requirements.memory_type_bits;
    let type_index = memory_type_index(type_bits, &context.memory_properties, flags)
        .ok_or_else(|| GpuError::OutOfMemory(format!("`{label}`: no memory type with {flags:?}")))?;
    let mut allocate_flags =
        vk::MemoryAllocateFlagsInfo::default().flags(vk::MemoryAllocateFlags::DEVICE_ADDRESS);
    let mut info = vk::MemoryAllocateInfo::default()
        .allocation_size(requirements.size)
        .memory_type_index(type_index);
    if device_address {
        info = info.push_next(&mut allocate_flags);
    }
    unsafe { context.device.allocate_memory(&info, None) }.map_err(|result| match result {
        vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
            GpuError::OutOfMemory(label.to_string())
        }
        other => vk_error(other),
    })
}

pub(super) struct VulkanBuffer {
    pub desc: BufferDesc,
    pub buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    mapped: Option<NonNull<u8>>,
    pub address: u64,
}

impl VulkanBuffer {
    pub fn new(context: &Context, desc: &BufferDesc) -> GpuResult<Self> {
        let device = &context.device;
        let usage = desc.usage
            | vk::BufferUsageFlags::TRANSFER_SRC
            | vk::BufferUsageFlags::TRANSFER_DST
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
        let info = vk::BufferCreateInfo::default()
            .size(desc.size.max(4))
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { device.create_buffer(&info, None) }.map_err(vk_error)?;

        let flags = if desc.host_visible {
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
        } else {
            vk::MemoryPropertyFlags::DEVICE_LOCAL
        };
        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };
        let memory = match allocate(context, requirements, flags, true, &desc.label) {
            Ok(memory) => memory,
            Err(error) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(error);
            }
        };

        let bound = unsafe { device.bind_buffer_memory(buffer, memory, 0) }.and_then(|_| {
            if desc.host_visible {
                let map_flags = vk::MemoryMapFlags::empty();
                let pointer =
                    unsafe { device.map_memory(memory, 0, vk::WHOLE_SIZE, map_flags) }?;
                Ok(NonNull::new(pointer as *mut u8))
            } else {
                Ok(None)
            }
        });
        let mapped = match bound {
            Ok(mapped) => mapped,
            Err(result) => {
                unsafe {
                    device.destroy_buffer(buffer, None);
                    device.free_memory(memory, None);
                }
                return Err(vk_error(result));
            }
        };

        let address = unsafe {
            device.get_buffer_device_address(&vk::BufferDeviceAddressInfo::default().buffer(buffer))
        };
        Ok(Self {
            desc: desc.clone(),
            buffer,
            memory,
            mapped,
            address,
        })
    }

    pub fn write(&mut self, offset: u64, data: &[u8]) -> GpuResult<()> {
        let mapped = self.mapped.ok_or_else(|| {
            let label = &self.desc.label;
            GpuError::Unsupported(format!("host write into device local buffer `{label}`"))
        })?;
        if offset + data.len() as u64 > self.desc.size {
            return Err(GpuError::Unsupported(format!(
                "write of {} bytes at {} overflows `{}`",
                data.len(),
                offset,
                self.desc.label
            )));
        }
        unsafe {
            let target = mapped.as_ptr().add(offset as usize);
            std::ptr::copy_nonoverlapping(data.as_ptr(), target, data.len());
        }
        Ok(())
    }

    pub fn read(&self, len: usize) -> GpuResult<Vec<u8>> {
        let mapped = self
            .mapped
            .ok_or_else(|| GpuError::Unsupported(format!("host read of `{}`", self.desc.label)))?;
        let len = len.min(self.desc.size as usize);
        Ok(unsafe { std::slice::from_raw_parts(mapped.as_ptr(), len) }.to_vec())
    }

    pub fn destroy(self, context: &Context) {
        unsafe {
            if self.mapped.is_some() {
                context.device.unmap_memory(self.memory);
            }
            context.device.destroy_buffer(self.buffer, None);
            context.device.free_memory(self.memory, None);
        }
    }
}

pub(super) fn is_depth(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D16_UNORM
            | vk::Format::D32_SFLOAT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
    )
}

pub(super) fn aspect(format: vk::Format) -> vk::ImageAspectFlags {
    if is_depth(format) {
        vk::ImageAspectFlags::DEPTH
    } else {
        vk::ImageAspectFlags::COLOR
    }
}

pub(super) fn subresource_range(format: vk::Format) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange::default()
        .aspect_mask(aspect(format))
        .level_count(1)
        .layer_count(1)
}

pub(super) struct VulkanImage {
    pub desc: ImageDesc,
    pub image: vk::Image,
    pub view: vk::ImageView,
    memory: vk::DeviceMemory,
    /// Layout after the last submitted command that touched the image.
    pub layout: vk::ImageLayout,
}

impl VulkanImage {
    pub fn new(context: &Context, desc: &ImageDesc) -> GpuResult<Self> {
        if desc.extent.width == 0 || desc.extent.height == 0 {
            return Err(GpuError::Unsupported(format!("zero sized image `{}`", desc.label)));
        }
        if desc.external && !context.capabilities.external_memory {
            return Err(GpuError::Unsupported("external memory".to_string()));
        }
        let device = &context.device;
        let info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format)
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(
                desc.usage | vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST,
            )
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe { device.create_image(&info, None) }.map_err(vk_error)?;

        let requirements = unsafe { device.get_image_memory_requirements(image) };
        let memory = match allocate(
            context,
            requirements,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            false,
            &desc.label,
        ) {
            Ok(memory) => memory,
            Err(error) => {
                unsafe { device.destroy_image(image, None) };
                return Err(error);
            }
        };

        let view = unsafe { device.bind_image_memory(image, memory, 0) }.and_then(|_| {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(desc.format)
                .subresource_range(subresource_range(desc.format));
            unsafe { device.create_image_view(&view_info, None) }
        });
        let view = match view {
            Ok(view) => view,
            Err(result) => {
                unsafe {
                    device.destroy_image(image, None);
                    device.free_memory(memory, None);
                }
                return Err(vk_error(result));
            }
        };

        Ok(Self {
            desc: desc.clone(),
            image,
            view,
            memory,
            layout: vk::ImageLayout::UNDEFINED,
        })
    }

    pub fn destroy(self, context: &Context) {
        unsafe {
            context.device.destroy_image_view(self.view, None);
            context.device.destroy_image(self.image, None);
            context.device.free_memory(self.memory, None);
        }
    }
}

/// Tightly packed RGBA8 from a readback of `format`.
pub(super) fn to_rgba8(format: vk::Format, bytes: Vec<u8>) -> GpuResult<Vec<u8>> {
    match format {
        vk::Format::R8G8B8A8_UNORM | vk::Format::R8G8B8A8_SRGB => Ok(bytes),
        vk::Format::B8G8R8A8_UNORM | vk::Format::B8G8R8A8_SRGB => {
            let mut bytes = bytes;
            for texel in bytes.chunks_exact_mut(4) {
                texel.swap(0, 2);
            }
            Ok(bytes)
        }
        other => Err(GpuError::Unsupported(format!("readback of {other:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_first_matching_memory_type() {
        let mut properties = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: 3,
            ..Default::default()
        };
        properties.memory_types[0].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        properties.memory_types[1].property_flags =
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        properties.memory_types[2].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL
            | vk::MemoryPropertyFlags::HOST_VISIBLE
            | vk::MemoryPropertyFlags::HOST_COHERENT;

        let host = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        assert_eq!(memory_type_index(0b111, &properties, host), Some(1));
        assert_eq!(memory_type_index(0b101, &properties, host), Some(2));
        assert_eq!(memory_type_index(0b001, &properties, host), None);
    }

    #[test]
    fn bgra_readback_is_swizzled() {
        let rgba = to_rgba8(vk::Format::B8G8R8A8_UNORM, vec![1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        assert_eq!(rgba, vec![3, 2, 1, 4, 7, 6, 5, 8]);
        assert!(to_rgba8(vk::Format::R32G32B32A32_SFLOAT, Vec::new()).is_err());
    }
}
