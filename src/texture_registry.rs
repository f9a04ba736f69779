use std::rc::Rc;

use ash::vk;
use slotmap::{new_key_type, SlotMap};

use crate::error::Result;
use crate::gpu::{Command, CommandBuffer, DeviceContext, ImageDesc, ImageHandle};
use crate::resource_state::{ResourceStateTracker, Usage};

new_key_type! {
    pub struct TextureHandle;
}

pub const TEXTURE_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;

struct Texture {
    image: ImageHandle,
    index: u32,
}

/// Bindless texture table. Owned by the scheduler and handed to whoever
/// builds binding tables; index 0 is always a white default texture.
pub struct TextureRegistry {
    device: Rc<dyn DeviceContext>,
    textures: SlotMap<TextureHandle, Texture>,
    // Shader visible order; released entries fall back to the default.
    slots: Vec<Option<TextureHandle>>,
    default: TextureHandle,
}

impl TextureRegistry {
    pub fn new(device: Rc<dyn DeviceContext>, tracker: &mut ResourceStateTracker) -> Result<Self> {
        let mut registry = Self {
            device,
            textures: SlotMap::with_key(),
            slots: Vec::new(),
            default: TextureHandle::default(),
        };
        registry.default = registry.add_solid(tracker, "default texture", [1.0; 4])?;
        Ok(registry)
    }

    /// A 1x1 texture of a single color.
    pub fn add_solid(
        &mut self,
        tracker: &mut ResourceStateTracker,
        label: &str,
        color: [f32; 4],
    ) -> Result<TextureHandle> {
        let image = self.device.create_image(&ImageDesc::new(
            label,
            vk::Extent2D {
                width: 1,
                height: 1,
            },
            TEXTURE_FORMAT,
            vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
        ))?;
        tracker.register(image, label);

        let mut command_buffer = CommandBuffer::new("texture upload");
        tracker.begin_recording(&mut command_buffer);
        tracker.transition(&mut command_buffer, image, Usage::TransferDst)?;
        command_buffer.push(Command::ClearImage { image, color });
        tracker.transition(&mut command_buffer, image, Usage::Sampled)?;
        self.device.submit_and_wait(&command_buffer)?;

        let index = self.slots.len() as u32;
        let handle = self.textures.insert(Texture { image, index });
        self.slots.push(Some(handle));
        log::debug!("Registered texture `{}` at index {}", label, index);
        Ok(handle)
    }

    pub fn index(&self, handle: TextureHandle) -> Option<u32> {
        self.textures.get(handle).map(|texture| texture.index)
    }

    pub fn default_texture(&self) -> TextureHandle {
        self.default
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// The device must not be using the texture anymore. Its index stays
    /// reserved and resolves to the default texture.
    pub fn release(&mut self, tracker: &mut ResourceStateTracker, handle: TextureHandle) -> bool {
        if handle == self.default {
            return false;
        }
        let Some(texture) = self.textures.remove(handle) else {
            return false;
        };
        self.slots[texture.index as usize] = None;
        tracker.forget(texture.image);
        self.device.destroy_image(texture.image);
        true
    }

    /// Images in shader index order.
    pub fn images(&self) -> Vec<ImageHandle> {
        let fallback = self.textures.get(self.default).map(|texture| texture.image);
        self.slots
            .iter()
            .filter_map(|slot| {
                slot.and_then(|handle| self.textures.get(handle))
                    .map(|texture| texture.image)
                    .or(fallback)
            })
            .collect()
    }

    /// Releases everything, the default texture included. The device must be idle.
    pub fn destroy(&mut self, tracker: &mut ResourceStateTracker) {
        for (_, texture) in self.textures.drain() {
            tracker.forget(texture.image);
            self.device.destroy_image(texture.image);
        }
        self.slots.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::headless::{HeadlessConfig, HeadlessDevice};

    fn registry() -> (Rc<HeadlessDevice>, ResourceStateTracker, TextureRegistry) {
        let device = Rc::new(HeadlessDevice::new(HeadlessConfig::default()));
        let mut tracker = ResourceStateTracker::new();
        let registry = TextureRegistry::new(device.clone(), &mut tracker).unwrap();
        (device, tracker, registry)
    }

    #[test]
    fn default_texture_is_white_at_index_zero() {
        let (device, _, registry) = registry();
        assert_eq!(registry.index(registry.default_texture()), Some(0));
        let images = registry.images();
        assert_eq!(images.len(), 1);
        assert_eq!(device.image_color(images[0]), Some([1.0; 4]));
        assert_eq!(device.hazard_count(), 0);
    }

    #[test]
    fn released_index_falls_back_to_default() {
        let (_, mut tracker, mut registry) = registry();
        let red = registry.add_solid(&mut tracker, "red", [1.0, 0.0, 0.0, 1.0]).unwrap();
        let blue = registry.add_solid(&mut tracker, "blue", [0.0, 0.0, 1.0, 1.0]).unwrap();
        assert_eq!(registry.index(blue), Some(2));

        assert!(registry.release(&mut tracker, red));
        let images = registry.images();
        assert_eq!(images.len(), 3);
        assert_eq!(images[1], images[0]);
        assert_eq!(registry.index(blue), Some(2));
        assert!(!registry.release(&mut tracker, registry.default_texture()));
    }

    #[test]
    fn destroy_releases_every_image() {
        let (device, mut tracker, mut registry) = registry();
        registry.add_solid(&mut tracker, "red", [1.0, 0.0, 0.0, 1.0]).unwrap();
        registry.destroy(&mut tracker);
        assert!(device.live_images().is_empty());
        assert_eq!(tracker.tracked_count(), 0);
    }
}
