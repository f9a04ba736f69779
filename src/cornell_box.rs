//! The default demo scene: a Cornell box with two blocks and a procedural
//! sphere resting on the short one.

use cgmath::Deg;

use crate::camera::Camera;
use crate::math::{Mat4, Point, Vec3};
use crate::scene::{Aabb, Material, Model, Scene};

/// Unit quad in the XY plane facing +Z.
pub fn quad() -> Model {
    Model::triangles(
        "quad",
        vec![
            [-0.5, -0.5, 0.0],
            [0.5, -0.5, 0.0],
            [0.5, 0.5, 0.0],
            [-0.5, 0.5, 0.0],
        ],
        vec![0, 1, 2, 0, 2, 3],
    )
}

/// Unit cube centered on the origin.
pub fn cube() -> Model {
    let mut positions = Vec::with_capacity(8);
    for z in [-0.5, 0.5] {
        for y in [-0.5, 0.5] {
            for x in [-0.5, 0.5] {
                positions.push([x, y, z]);
            }
        }
    }
    #[rustfmt::skip]
    let indices = vec![
        0, 2, 1, 1, 2, 3, // -z
        4, 5, 6, 5, 7, 6, // +z
        0, 1, 4, 1, 5, 4, // -y
        2, 6, 3, 3, 6, 7, // +y
        0, 4, 2, 2, 4, 6, // -x
        1, 3, 5, 3, 7, 5, // +x
    ];
    Model::triangles("cube", positions, indices)
}

/// Unit sphere, intersected in the shader.
pub fn sphere() -> Model {
    Model::procedural(
        "sphere",
        vec![Aabb {
            min: [-1.0; 3],
            max: [1.0; 3],
        }],
    )
}

pub fn scene() -> Scene {
    let camera = Camera::new(40.0, 0.01, 100.0)
        .look_at(Point::new(0.0, 0.0, 3.4), Point::new(0.0, 0.0, 0.0))
        .with_lens(0.0, 3.4);
    let mut scene = Scene::new("cornell box", camera);

    let quad = scene.add_model(quad());
    let cube = scene.add_model(cube());
    let sphere = scene.add_model(sphere());

    let red = scene.add_material(Material::diffuse([0.65, 0.05, 0.05]));
    let green = scene.add_material(Material::diffuse([0.12, 0.45, 0.15]));
    let white = scene.add_material(Material::diffuse([0.73, 0.73, 0.73]));
    let light = scene.add_material(Material::emissive([1.0, 0.9, 0.8], 15.0));
    let glass = scene.add_material(Material {
        roughness: 0.0,
        refraction_index: 1.5,
        ..Material::diffuse([1.0, 1.0, 1.0])
    });

    let at = |x: f32, y: f32, z: f32| Mat4::from_translation(Vec3::new(x, y, z));
    let wall = Mat4::from_scale(2.0);

    scene.add_instance(quad, white, at(0.0, 0.0, -1.0) * wall);
    scene.add_instance(quad, white, at(0.0, -1.0, 0.0) * Mat4::from_angle_x(Deg(-90.0)) * wall);
    scene.add_instance(quad, white, at(0.0, 1.0, 0.0) * Mat4::from_angle_x(Deg(90.0)) * wall);
    scene.add_instance(quad, red, at(-1.0, 0.0, 0.0) * Mat4::from_angle_y(Deg(90.0)) * wall);
    scene.add_instance(quad, green, at(1.0, 0.0, 0.0) * Mat4::from_angle_y(Deg(-90.0)) * wall);
    scene.add_instance(
        quad,
        light,
        at(0.0, 0.999, 0.0) * Mat4::from_angle_x(Deg(90.0)) * Mat4::from_scale(0.5),
    );

    scene.add_instance(
        cube,
        white,
        at(0.35, -0.7, 0.3) * Mat4::from_angle_y(Deg(-18.0)) * Mat4::from_scale(0.6),
    );
    scene.add_instance(
        cube,
        white,
        at(-0.35, -0.4, -0.3)
            * Mat4::from_angle_y(Deg(15.0))
            * Mat4::from_nonuniform_scale(0.6, 1.2, 0.6),
    );
    scene.add_instance(sphere, glass, at(0.35, -0.15, 0.3) * Mat4::from_scale(0.25));

    scene
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::SceneProvider;

    #[test]
    fn box_has_walls_light_blocks_and_sphere() {
        let scene = scene();
        assert_eq!(scene.models().len(), 3);
        assert_eq!(scene.instances().len(), 9);
        assert!(scene.models()[2].is_procedural());
        assert!(scene.instances().iter().all(|instance| instance.model < 3));
        assert!(scene
            .instances()
            .iter()
            .all(|instance| instance.material < scene.materials().len()));
    }

    #[test]
    fn cube_indices_stay_in_range() {
        let cube = cube();
        assert_eq!(cube.indices.len(), 36);
        assert!(cube.indices.iter().all(|index| (*index as usize) < cube.positions.len()));
    }

    #[test]
    fn light_is_the_only_emitter() {
        let scene = scene();
        let emitters: Vec<_> = scene
            .instances()
            .iter()
            .filter(|instance| scene.materials()[instance.material].emission[0] > 0.0)
            .collect();
        assert_eq!(emitters.len(), 1);
    }
}
