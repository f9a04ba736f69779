use crate::gpu::{align_up, AccelGeometry, AccelHandle, AccelSizes};
use crate::scene::{GpuScene, Model, VERTEX_STRIDE};

/// Result buffer offsets must be multiples of this.
pub const RESULT_ALIGNMENT: u64 = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BottomLevelStructure {
    pub accel: AccelHandle,
    pub address: u64,
    pub offset: u64,
    pub size: u64,
    pub procedural: bool,
    pub primitive_count: u32,
}

/// Geometry of one bottom level structure and where it lands in the shared
/// result and scratch buffers.
#[derive(Clone, Debug, PartialEq)]
pub struct BlasPlan {
    pub geometry: AccelGeometry,
    pub sizes: AccelSizes,
    pub result_offset: u64,
    pub scratch_offset: u64,
    pub procedural: bool,
}

pub fn geometry_for(scene: &GpuScene, models: &[Model]) -> Vec<(AccelGeometry, bool)> {
    if models.is_empty() {
        // An empty scene still gets one structure so the top level never
        // special cases missing geometry.
        return vec![(
            AccelGeometry::Triangles {
                vertex_buffer: scene.vertices(),
                vertex_offset: 0,
                vertex_count: 0,
                vertex_stride: VERTEX_STRIDE,
                index_buffer: scene.indices(),
                index_offset: 0,
                index_count: 0,
            },
            false,
        )];
    }

    models
        .iter()
        .zip(scene.model_ranges())
        .map(|(model, range)| {
            if model.is_procedural() {
                (
                    AccelGeometry::Aabbs {
                        buffer: scene.aabbs(),
                        offset: range.aabb_offset,
                        count: range.aabb_count,
                    },
                    true,
                )
            } else {
                (
                    AccelGeometry::Triangles {
                        vertex_buffer: scene.vertices(),
                        vertex_offset: range.vertex_offset,
                        vertex_count: range.vertex_count,
                        vertex_stride: VERTEX_STRIDE,
                        index_buffer: scene.indices(),
                        index_offset: range.index_offset,
                        index_count: range.index_count,
                    },
                    false,
                )
            }
        })
        .collect()
}

/// Packs every structure into one result and one scratch allocation.
/// Returns the plans plus the total result and scratch sizes.
pub fn plan(
    geometry: Vec<(AccelGeometry, bool)>,
    sizes: Vec<AccelSizes>,
    scratch_alignment: u64,
) -> (Vec<BlasPlan>, u64, u64) {
    let mut result_total = 0;
    let mut scratch_total = 0;
    let mut plans = Vec::with_capacity(geometry.len());
    for ((geometry, procedural), sizes) in geometry.into_iter().zip(sizes) {
        let result_offset = align_up(result_total, RESULT_ALIGNMENT);
        let scratch_offset = align_up(scratch_total, scratch_alignment);
        result_total = result_offset + sizes.result;
        scratch_total = scratch_offset + sizes.build_scratch;
        plans.push(BlasPlan {
            geometry,
            sizes,
            result_offset,
            scratch_offset,
            procedural,
        });
    }
    (plans, result_total.max(RESULT_ALIGNMENT), scratch_total.max(scratch_alignment))
}
