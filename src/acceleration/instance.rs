use ash::vk::GeometryInstanceFlagsKHR;
use byteorder::{LittleEndian, WriteBytesExt};

use crate::math::{row_major_3x4, Mat4};

pub const INSTANCE_SIZE: u64 = 64;

/// Hit group used by instances of procedural (AABB) models.
pub const PROCEDURAL_HIT_GROUP: u32 = 1;

/// One entry of the top level instance array, laid out as the device reads it.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GeometryInstance {
    transform: [f32; 12],
    id_and_mask: u32,
    hit_group_offset_and_flags: u32,
    acceleration_structure_handle: u64,
}

impl GeometryInstance {
    pub fn new(
        instance_id: u32,
        mask: u8,
        hit_group_offset: u32,
        flags: GeometryInstanceFlagsKHR,
        acceleration_structure_handle: u64,
        transform: &Mat4,
    ) -> Self {
        let id_and_mask = ((mask as u32) << 24) | (instance_id & 0x00ff_ffff);
        let hit_group_offset_and_flags =
            ((flags.as_raw() & 0xff) << 24) | (hit_group_offset & 0x00ff_ffff);
        Self {
            transform: row_major_3x4(transform),
            id_and_mask,
            hit_group_offset_and_flags,
            acceleration_structure_handle,
        }
    }

    pub fn instance_id(&self) -> u32 {
        self.id_and_mask & 0x00ff_ffff
    }

    pub fn mask(&self) -> u8 {
        (self.id_and_mask >> 24) as u8
    }

    pub fn hit_group_offset(&self) -> u32 {
        self.hit_group_offset_and_flags & 0x00ff_ffff
    }

    pub fn acceleration_structure_handle(&self) -> u64 {
        self.acceleration_structure_handle
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        for value in &self.transform {
            let _ = out.write_f32::<LittleEndian>(*value);
        }
        let _ = out.write_u32::<LittleEndian>(self.id_and_mask);
        let _ = out.write_u32::<LittleEndian>(self.hit_group_offset_and_flags);
        let _ = out.write_u64::<LittleEndian>(self.acceleration_structure_handle);
    }
}

pub fn encode(instances: &[GeometryInstance]) -> Vec<u8> {
    let mut out = Vec::with_capacity(instances.len() * INSTANCE_SIZE as usize);
    for instance in instances {
        instance.write(&mut out);
    }
    out
}
