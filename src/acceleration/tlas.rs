use ash::vk::GeometryInstanceFlagsKHR;

use crate::acceleration::blas::BottomLevelStructure;
use crate::acceleration::instance::{GeometryInstance, PROCEDURAL_HIT_GROUP};
use crate::error::{RenderError, Result};
use crate::gpu::{AccelHandle, BufferHandle};
use crate::scene::Instance;

/// The single top level structure of a scene. Its buffers are sized for the
/// full instance capacity so a topology change can rebuild in place.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TopLevelStructure {
    pub accel: AccelHandle,
    pub buffer: BufferHandle,
    pub scratch: BufferHandle,
    pub instances: BufferHandle,
    pub instance_count: u32,
    pub capacity: u32,
}

/// Per instance BLAS references. An in-place update is only valid while this
/// stays identical to the one of the last full build.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Topology(Vec<u64>);

impl Topology {
    pub fn of(instances: &[GeometryInstance]) -> Self {
        Self(
            instances
                .iter()
                .map(|instance| instance.acceleration_structure_handle())
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

pub fn gpu_instances(
    instances: &[Instance],
    bottom_level: &[BottomLevelStructure],
) -> Result<Vec<GeometryInstance>> {
    instances
        .iter()
        .enumerate()
        .map(|(index, instance)| {
            let blas = bottom_level.get(instance.model).ok_or_else(|| {
                RenderError::AccelerationBuild(format!(
                    "instance {index} references missing model {}",
                    instance.model
                ))
            })?;
            let hit_group = if blas.procedural { PROCEDURAL_HIT_GROUP } else { 0 };
            Ok(GeometryInstance::new(
                index as u32,
                0xff,
                hit_group,
                GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE,
                blas.address,
                &instance.transform,
            ))
        })
        .collect()
}
