use cgmath::{perspective, Deg, EuclideanSpace, InnerSpace, Matrix4, SquareMatrix};

use crate::math::{Mat4, Point, Real, Vec3};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Camera {
    position: Point,
    target: Point,
    up: Vec3,
    fov: Real,
    z_near: Real,
    z_far: Real,
    aperture: Real,
    focus_distance: Real,
}

impl Camera {
    pub fn new(fov: Real, z_near: Real, z_far: Real) -> Self {
        Self {
            position: Point::new(0.0, 0.0, 1.0),
            target: Point::origin(),
            up: Vec3::unit_y(),
            fov,
            z_near,
            z_far,
            aperture: 0.0,
            focus_distance: 10.0,
        }
    }

    pub fn look_at(mut self, position: Point, target: Point) -> Self {
        self.position = position;
        self.target = target;
        self
    }

    pub fn with_lens(mut self, aperture: Real, focus_distance: Real) -> Self {
        self.aperture = aperture;
        self.focus_distance = focus_distance;
        self
    }

    pub fn translate(&mut self, t: Vec3) {
        self.position += t;
        self.target += t;
    }

    pub fn position(&self) -> Point {
        self.position
    }

    pub fn forward(&self) -> Vec3 {
        (self.target - self.position).normalize()
    }

    pub fn aperture(&self) -> Real {
        self.aperture
    }

    pub fn focus_distance(&self) -> Real {
        self.focus_distance
    }

    pub fn view_matrix(&self) -> Mat4 {
        Matrix4::look_at_rh(self.position, self.target, self.up)
    }

    /// Vulkan clip space: y points down, depth in [0, 1].
    pub fn projection_matrix(&self, aspect_ratio: Real) -> Mat4 {
        let gl = perspective(Deg(self.fov), aspect_ratio, self.z_near, self.z_far);
        #[rustfmt::skip]
        let correction = Mat4::new(
            1.0, 0.0, 0.0, 0.0,
            0.0, -1.0, 0.0, 0.0,
            0.0, 0.0, 0.5, 0.0,
            0.0, 0.0, 0.5, 1.0,
        );
        correction * gl
    }

    pub fn inverse(matrix: &Mat4) -> Mat4 {
        matrix.invert().unwrap_or_else(Mat4::identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cgmath::{Transform, Vector4};

    #[test]
    fn view_maps_target_onto_negative_z() {
        let camera =
            Camera::new(45.0, 0.1, 100.0).look_at(Point::new(0.0, 0.0, 5.0), Point::origin());
        let in_view = camera.view_matrix().transform_point(Point::origin());
        assert!((in_view.z + 5.0).abs() < 1e-5);
    }

    #[test]
    fn projection_uses_zero_to_one_depth() {
        let camera = Camera::new(60.0, 0.1, 100.0);
        let projection = camera.projection_matrix(16.0 / 9.0);
        let near = projection * Vector4::new(0.0, 0.0, -0.1, 1.0);
        let far = projection * Vector4::new(0.0, 0.0, -100.0, 1.0);
        assert!((near.z / near.w).abs() < 1e-4);
        assert!((far.z / far.w - 1.0).abs() < 1e-4);
    }
}
