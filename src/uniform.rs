use ash::vk;
use cgmath::{InnerSpace, SquareMatrix};

use crate::camera::Camera;
use crate::config::RenderSettings;
use crate::math::{write_floats, write_mat4, write_uints, Mat4, Vec3};

/// Byte size of the uniform block as shaders see it, padded to 16 bytes.
pub const UNIFORM_SIZE: u64 = 464;

pub const FLAG_HDR: u32 = 1;
pub const FLAG_PROGRESSIVE: u32 = 1 << 1;
pub const FLAG_ADAPTIVE_SAMPLING: u32 = 1 << 2;
pub const FLAG_CHECKERBOARD: u32 = 1 << 3;

/// Per-frame constants written into the slot's uniform buffer before submit.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct UniformBlock {
    pub view: Mat4,
    pub projection: Mat4,
    pub view_inverse: Mat4,
    pub projection_inverse: Mat4,
    pub view_projection: Mat4,
    pub previous_view_projection: Mat4,
    pub viewport: [f32; 4],
    pub sun_direction: [f32; 4],
    pub aperture: f32,
    pub focus_distance: f32,
    pub frame: u32,
    pub samples: u32,
    pub bounces: u32,
    pub max_bounces: u32,
    pub seed: u32,
    pub temporal_frames: u32,
    pub flags: u32,
    pub russian_roulette_depth: u32,
    pub adaptive_steps: u32,
    pub adaptive_variance: f32,
}

impl UniformBlock {
    pub fn new(
        camera: &Camera,
        extent: vk::Extent2D,
        settings: &RenderSettings,
        frame: u64,
        previous_view_projection: Option<Mat4>,
    ) -> Self {
        let aspect_ratio = extent.width.max(1) as f32 / extent.height.max(1) as f32;
        let view = camera.view_matrix();
        let projection = camera.projection_matrix(aspect_ratio);
        let view_projection = projection * view;
        let sun = Vec3::new(0.3, -1.0, 0.2).normalize();

        let mut flags = 0;
        if settings.hdr {
            flags |= FLAG_HDR;
        }
        if settings.adaptive_sampling {
            flags |= FLAG_ADAPTIVE_SAMPLING;
        }
        if settings.checkerboard {
            flags |= FLAG_CHECKERBOARD;
        }

        Self {
            view,
            projection,
            view_inverse: Camera::inverse(&view),
            projection_inverse: Camera::inverse(&projection),
            view_projection,
            // First frame after a reset reprojects onto itself.
            previous_view_projection: previous_view_projection.unwrap_or(view_projection),
            viewport: [0.0, 0.0, extent.width as f32, extent.height as f32],
            sun_direction: [sun.x, sun.y, sun.z, 0.0],
            aperture: camera.aperture(),
            focus_distance: camera.focus_distance(),
            frame: frame as u32,
            samples: settings.samples,
            bounces: settings.bounces.min(settings.max_bounces),
            max_bounces: settings.max_bounces,
            seed: (frame as u32).wrapping_mul(0x9e37_79b9) ^ 0x85eb_ca6b,
            temporal_frames: settings.temporal_frames,
            flags,
            russian_roulette_depth: settings.russian_roulette_depth,
            adaptive_steps: settings.adaptive_steps,
            adaptive_variance: settings.adaptive_variance,
        }
    }

    pub fn progressive(mut self, progressive: bool) -> Self {
        if progressive {
            self.flags |= FLAG_PROGRESSIVE;
        } else {
            self.flags &= !FLAG_PROGRESSIVE;
        }
        self
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(UNIFORM_SIZE as usize);
        for matrix in [
            &self.view,
            &self.projection,
            &self.view_inverse,
            &self.projection_inverse,
            &self.view_projection,
            &self.previous_view_projection,
        ] {
            write_mat4(&mut out, matrix);
        }
        write_floats(&mut out, &self.viewport);
        write_floats(&mut out, &self.sun_direction);
        write_floats(&mut out, &[self.aperture, self.focus_distance]);
        write_uints(
            &mut out,
            &[
                self.frame,
                self.samples,
                self.bounces,
                self.max_bounces,
                self.seed,
                self.temporal_frames,
                self.flags,
                self.russian_roulette_depth,
                self.adaptive_steps,
            ],
        );
        write_floats(&mut out, &[self.adaptive_variance]);
        out.resize(UNIFORM_SIZE as usize, 0);
        out
    }
}

impl Default for UniformBlock {
    fn default() -> Self {
        Self {
            view: Mat4::identity(),
            projection: Mat4::identity(),
            view_inverse: Mat4::identity(),
            projection_inverse: Mat4::identity(),
            view_projection: Mat4::identity(),
            previous_view_projection: Mat4::identity(),
            viewport: [0.0; 4],
            sun_direction: [0.0, -1.0, 0.0, 0.0],
            aperture: 0.0,
            focus_distance: 10.0,
            frame: 0,
            samples: 1,
            bounces: 1,
            max_bounces: 1,
            seed: 0,
            temporal_frames: 1,
            flags: 0,
            russian_roulette_depth: 2,
            adaptive_steps: 0,
            adaptive_variance: 0.0,
        }
    }
}
