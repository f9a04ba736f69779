use std::collections::BTreeMap;

use ash::vk;

use crate::error::ContractViolation;
use crate::gpu::types::{AccelHandle, BufferHandle, ImageHandle, ResourceId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BindingKind {
    AccelerationStructure,
    StorageImage,
    SampledImage,
    UniformBuffer,
    StorageBuffer,
    /// Unbounded array of sampled textures.
    TextureArray,
}

impl BindingKind {
    pub fn descriptor_type(self) -> vk::DescriptorType {
        match self {
            BindingKind::AccelerationStructure => vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
            BindingKind::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
            BindingKind::SampledImage | BindingKind::TextureArray => {
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER
            }
            BindingKind::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
            BindingKind::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BindingSlot {
    pub slot: u32,
    pub kind: BindingKind,
    pub stages: vk::ShaderStageFlags,
}

/// Declarative binding table layout. Pipelines are described by a list of
/// slots instead of one hand written layout per pipeline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BindingLayout {
    name: String,
    slots: Vec<BindingSlot>,
}

impl BindingLayout {
    pub fn builder(name: &str) -> BindingLayoutBuilder {
        BindingLayoutBuilder {
            name: name.to_string(),
            slots: Vec::new(),
        }
    }

    pub fn from_slots(name: &str, slots: &[BindingSlot]) -> Result<Self, ContractViolation> {
        let mut seen = BTreeMap::new();
        for slot in slots {
            if seen.insert(slot.slot, slot.kind).is_some() {
                return Err(ContractViolation::DuplicateBinding {
                    layout: name.to_string(),
                    slot: slot.slot,
                });
            }
        }

        let mut slots = slots.to_vec();
        slots.sort_by_key(|slot| slot.slot);
        Ok(Self {
            name: name.to_string(),
            slots,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn slots(&self) -> &[BindingSlot] {
        &self.slots
    }

    pub fn slot(&self, slot: u32) -> Option<&BindingSlot> {
        self.slots.iter().find(|entry| entry.slot == slot)
    }
}

pub struct BindingLayoutBuilder {
    name: String,
    slots: Vec<BindingSlot>,
}

impl BindingLayoutBuilder {
    pub fn slot(mut self, slot: u32, kind: BindingKind, stages: vk::ShaderStageFlags) -> Self {
        self.slots.push(BindingSlot { slot, kind, stages });
        self
    }

    pub fn build(self) -> Result<BindingLayout, ContractViolation> {
        BindingLayout::from_slots(&self.name, &self.slots)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BindingResource {
    Accel(AccelHandle, BufferHandle),
    Image(ImageHandle),
    Buffer(BufferHandle),
    Textures(Vec<ImageHandle>),
}

impl BindingResource {
    fn matches(&self, kind: BindingKind) -> bool {
        matches!(
            (self, kind),
            (BindingResource::Accel(..), BindingKind::AccelerationStructure)
                | (BindingResource::Image(_), BindingKind::StorageImage)
                | (BindingResource::Image(_), BindingKind::SampledImage)
                | (BindingResource::Buffer(_), BindingKind::UniformBuffer)
                | (BindingResource::Buffer(_), BindingKind::StorageBuffer)
                | (BindingResource::Textures(_), BindingKind::TextureArray)
        )
    }

    pub fn resources(&self) -> Vec<ResourceId> {
        match self {
            BindingResource::Accel(_, buffer) => vec![(*buffer).into()],
            BindingResource::Image(image) => vec![(*image).into()],
            BindingResource::Buffer(buffer) => vec![(*buffer).into()],
            BindingResource::Textures(images) => {
                images.iter().map(|image| (*image).into()).collect()
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BindingTableDesc {
    pub layout: BindingLayout,
    pub resources: BTreeMap<u32, BindingResource>,
}

impl BindingTableDesc {
    /// Checks that every slot of the layout is bound with a resource of the right kind.
    pub fn new(
        layout: &BindingLayout,
        resources: Vec<(u32, BindingResource)>,
    ) -> Result<Self, ContractViolation> {
        let resources: BTreeMap<u32, BindingResource> = resources.into_iter().collect();
        for slot in layout.slots() {
            let bound = resources
                .get(&slot.slot)
                .is_some_and(|resource| resource.matches(slot.kind));
            if !bound {
                return Err(ContractViolation::BindingMismatch {
                    layout: layout.name().to_string(),
                    slot: slot.slot,
                });
            }
        }
        if let Some(extra) = resources.keys().find(|slot| layout.slot(**slot).is_none()) {
            return Err(ContractViolation::BindingMismatch {
                layout: layout.name().to_string(),
                slot: *extra,
            });
        }

        Ok(Self {
            layout: layout.clone(),
            resources,
        })
    }

    pub fn referenced_resources(&self) -> Vec<ResourceId> {
        self.resources
            .values()
            .flat_map(|resource| resource.resources())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_slot_is_rejected() {
        let result = BindingLayout::builder("accumulate")
            .slot(0, BindingKind::StorageImage, vk::ShaderStageFlags::COMPUTE)
            .slot(1, BindingKind::StorageImage, vk::ShaderStageFlags::COMPUTE)
            .slot(0, BindingKind::UniformBuffer, vk::ShaderStageFlags::COMPUTE)
            .build();

        assert_eq!(
            result,
            Err(ContractViolation::DuplicateBinding {
                layout: "accumulate".to_string(),
                slot: 0
            })
        );
    }

    #[test]
    fn slots_are_sorted() {
        let layout = BindingLayout::builder("compose")
            .slot(2, BindingKind::StorageImage, vk::ShaderStageFlags::COMPUTE)
            .slot(0, BindingKind::UniformBuffer, vk::ShaderStageFlags::COMPUTE)
            .build()
            .unwrap();
        let order: Vec<u32> = layout.slots().iter().map(|slot| slot.slot).collect();
        assert_eq!(order, vec![0, 2]);
    }

    #[test]
    fn table_requires_every_slot() {
        let layout = BindingLayout::builder("compose")
            .slot(0, BindingKind::UniformBuffer, vk::ShaderStageFlags::COMPUTE)
            .slot(1, BindingKind::StorageImage, vk::ShaderStageFlags::COMPUTE)
            .build()
            .unwrap();

        let mut buffers: slotmap::SlotMap<BufferHandle, ()> = slotmap::SlotMap::with_key();
        let uniform = buffers.insert(());
        let result = BindingTableDesc::new(&layout, vec![(0, BindingResource::Buffer(uniform))]);
        assert_eq!(
            result,
            Err(ContractViolation::BindingMismatch {
                layout: "compose".to_string(),
                slot: 1
            })
        );
    }
}
