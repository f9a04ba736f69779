use std::rc::Rc;

use ash::vk;

use crate::camera::Camera;
use crate::error::Result;
use crate::gpu::{BufferDesc, BufferHandle, CommandBuffer, Command, DeviceContext};
use crate::math::{write_floats, write_mat4, write_uints, Mat4};
use crate::resource_state::{ResourceStateTracker, Usage};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Aabb {
    pub min: [f32; 3],
    pub max: [f32; 3],
}

/// Triangle mesh or a list of boxes intersected procedurally.
#[derive(Clone, Debug, PartialEq)]
pub struct Model {
    pub name: String,
    pub positions: Vec<[f32; 3]>,
    pub indices: Vec<u32>,
    pub aabbs: Vec<Aabb>,
}

impl Model {
    pub fn triangles(name: &str, positions: Vec<[f32; 3]>, indices: Vec<u32>) -> Self {
        Self {
            name: name.to_string(),
            positions,
            indices,
            aabbs: Vec::new(),
        }
    }

    pub fn procedural(name: &str, aabbs: Vec<Aabb>) -> Self {
        Self {
            name: name.to_string(),
            positions: Vec::new(),
            indices: Vec::new(),
            aabbs,
        }
    }

    pub fn is_procedural(&self) -> bool {
        !self.aabbs.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Material {
    pub base_color: [f32; 4],
    pub emission: [f32; 4],
    pub roughness: f32,
    pub metallic: f32,
    pub refraction_index: f32,
    pub base_color_texture: Option<u32>,
}

impl Material {
    pub fn diffuse(color: [f32; 3]) -> Self {
        Self {
            base_color: [color[0], color[1], color[2], 1.0],
            ..Default::default()
        }
    }

    pub fn emissive(color: [f32; 3], strength: f32) -> Self {
        Self {
            emission: [color[0] * strength, color[1] * strength, color[2] * strength, 1.0],
            ..Default::default()
        }
    }
}

impl Default for Material {
    fn default() -> Self {
        Self {
            base_color: [1.0, 1.0, 1.0, 1.0],
            emission: [0.0, 0.0, 0.0, 0.0],
            roughness: 0.5,
            metallic: 0.0,
            refraction_index: 1.0,
            base_color_texture: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Instance {
    pub model: usize,
    pub material: usize,
    pub transform: Mat4,
}

/// What changed since the last time the renderer looked.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SceneChanges {
    pub reloaded: bool,
    pub transforms_changed: bool,
    pub camera_changed: bool,
}

impl SceneChanges {
    /// Folds in changes reported after these.
    pub fn merge(&mut self, later: SceneChanges) {
        self.reloaded |= later.reloaded;
        self.transforms_changed |= later.transforms_changed;
        self.camera_changed |= later.camera_changed;
    }
}

/// Read-only view of scene data plus change notifications.
pub trait SceneProvider {
    fn name(&self) -> &str;

    fn models(&self) -> &[Model];

    fn materials(&self) -> &[Material];

    fn instances(&self) -> &[Instance];

    fn camera(&self) -> &Camera;

    /// Returns and clears the pending change flags.
    fn take_changes(&mut self) -> SceneChanges;
}

pub struct Scene {
    name: String,
    models: Vec<Model>,
    materials: Vec<Material>,
    instances: Vec<Instance>,
    camera: Camera,
    changes: SceneChanges,
}

impl Scene {
    pub fn new(name: &str, camera: Camera) -> Self {
        Self {
            name: name.to_string(),
            models: Vec::new(),
            materials: vec![Material::default()],
            instances: Vec::new(),
            camera,
            changes: SceneChanges {
                reloaded: true,
                ..Default::default()
            },
        }
    }

    pub fn empty() -> Self {
        Self::new("empty", Camera::new(45.0, 0.1, 100.0))
    }

    pub fn add_model(&mut self, model: Model) -> usize {
        self.models.push(model);
        self.changes.reloaded = true;
        self.models.len() - 1
    }

    pub fn add_material(&mut self, material: Material) -> usize {
        self.materials.push(material);
        self.changes.reloaded = true;
        self.materials.len() - 1
    }

    /// Adding or removing instances changes the scene topology.
    pub fn add_instance(&mut self, model: usize, material: usize, transform: Mat4) -> usize {
        self.instances.push(Instance {
            model,
            material,
            transform,
        });
        self.changes.transforms_changed = true;
        self.instances.len() - 1
    }

    pub fn remove_instance(&mut self, index: usize) -> Option<Instance> {
        if index >= self.instances.len() {
            return None;
        }
        self.changes.transforms_changed = true;
        Some(self.instances.remove(index))
    }

    pub fn set_transform(&mut self, index: usize, transform: Mat4) {
        if let Some(instance) = self.instances.get_mut(index) {
            instance.transform = transform;
            self.changes.transforms_changed = true;
        }
    }

    pub fn camera_mut(&mut self) -> &mut Camera {
        self.changes.camera_changed = true;
        &mut self.camera
    }

    /// Marks everything for a full reload.
    pub fn reload(&mut self) {
        self.changes.reloaded = true;
    }
}

impl SceneProvider for Scene {
    fn name(&self) -> &str {
        &self.name
    }

    fn models(&self) -> &[Model] {
        &self.models
    }

    fn materials(&self) -> &[Material] {
        &self.materials
    }

    fn instances(&self) -> &[Instance] {
        &self.instances
    }

    fn camera(&self) -> &Camera {
        &self.camera
    }

    fn take_changes(&mut self) -> SceneChanges {
        std::mem::take(&mut self.changes)
    }
}

pub const VERTEX_STRIDE: u64 = 12;
pub const INDEX_STRIDE: u64 = 4;
pub const AABB_STRIDE: u64 = 24;
pub const MATERIAL_STRIDE: u64 = 48;
pub const NODE_STRIDE: u64 = 80;
const MIN_BUFFER_SIZE: u64 = 16;

/// Where one model lives inside the shared geometry buffers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ModelRange {
    pub vertex_offset: u64,
    pub vertex_count: u32,
    pub index_offset: u64,
    pub index_count: u32,
    pub aabb_offset: u64,
    pub aabb_count: u32,
}

/// Scene data uploaded to the device.
pub struct GpuScene {
    device: Rc<dyn DeviceContext>,
    vertices: BufferHandle,
    indices: BufferHandle,
    aabbs: BufferHandle,
    materials: BufferHandle,
    nodes: BufferHandle,
    ranges: BufferHandle,
    model_ranges: Vec<ModelRange>,
    instance_count: usize,
}

fn host_buffer(
    device: &dyn DeviceContext,
    tracker: &mut ResourceStateTracker,
    label: &str,
    bytes: &[u8],
    usage: vk::BufferUsageFlags,
) -> Result<BufferHandle> {
    let size = (bytes.len() as u64).max(MIN_BUFFER_SIZE);
    let buffer = device.create_buffer(&BufferDesc::host_visible(label, size, usage))?;
    if !bytes.is_empty() {
        device.write_buffer(buffer, 0, bytes)?;
    }
    tracker.register(buffer, label);
    Ok(buffer)
}

pub fn encode_nodes(instances: &[Instance]) -> Vec<u8> {
    let mut out = Vec::with_capacity(instances.len() * NODE_STRIDE as usize);
    for instance in instances {
        write_mat4(&mut out, &instance.transform);
        write_uints(&mut out, &[instance.model as u32, instance.material as u32, 0, 0]);
    }
    out
}

fn encode_materials(materials: &[Material]) -> Vec<u8> {
    let mut out = Vec::new();
    for material in materials {
        write_floats(&mut out, &material.base_color);
        write_floats(&mut out, &material.emission);
        write_floats(&mut out, &[material.roughness, material.metallic, material.refraction_index]);
        write_uints(&mut out, &[material.base_color_texture.unwrap_or(0)]);
    }
    out
}

impl GpuScene {
    pub fn upload(
        device: Rc<dyn DeviceContext>,
        tracker: &mut ResourceStateTracker,
        scene: &dyn SceneProvider,
    ) -> Result<Self> {
        let mut vertices = Vec::new();
        let mut indices = Vec::new();
        let mut aabbs = Vec::new();
        let mut model_ranges = Vec::new();

        for model in scene.models() {
            let range = ModelRange {
                vertex_offset: vertices.len() as u64,
                vertex_count: model.positions.len() as u32,
                index_offset: indices.len() as u64,
                index_count: model.indices.len() as u32,
                aabb_offset: aabbs.len() as u64,
                aabb_count: model.aabbs.len() as u32,
            };
            for position in &model.positions {
                write_floats(&mut vertices, position);
            }
            write_uints(&mut indices, &model.indices);
            for aabb in &model.aabbs {
                write_floats(&mut aabbs, &aabb.min);
                write_floats(&mut aabbs, &aabb.max);
            }
            model_ranges.push(range);
        }

        let mut ranges = Vec::new();
        for range in &model_ranges {
            write_uints(
                &mut ranges,
                &[
                    (range.vertex_offset / VERTEX_STRIDE) as u32,
                    (range.index_offset / INDEX_STRIDE) as u32,
                    (range.aabb_offset / AABB_STRIDE) as u32,
                    range.index_count,
                ],
            );
        }

        use vk::BufferUsageFlags as B;
        let geometry = B::STORAGE_BUFFER
            | B::SHADER_DEVICE_ADDRESS
            | B::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR;
        let dev = device.as_ref();
        let gpu_scene = Self {
            vertices: host_buffer(dev, tracker, "vertices", &vertices, geometry)?,
            indices: host_buffer(dev, tracker, "indices", &indices, geometry)?,
            aabbs: host_buffer(dev, tracker, "aabbs", &aabbs, geometry)?,
            materials: host_buffer(
                dev,
                tracker,
                "materials",
                &encode_materials(scene.materials()),
                B::STORAGE_BUFFER,
            )?,
            nodes: host_buffer(
                dev,
                tracker,
                "nodes",
                &encode_nodes(scene.instances()),
                B::STORAGE_BUFFER | B::TRANSFER_DST,
            )?,
            ranges: host_buffer(dev, tracker, "model ranges", &ranges, B::STORAGE_BUFFER)?,
            model_ranges,
            instance_count: scene.instances().len(),
            device: device.clone(),
        };

        log::info!(
            "Uploaded scene `{}`: {} models, {} instances, {} materials",
            scene.name(),
            scene.models().len(),
            scene.instances().len(),
            scene.materials().len()
        );
        Ok(gpu_scene)
    }

    /// Node transforms go through the command stream so frames still in
    /// flight keep reading the old values.
    pub fn record_node_update(
        &mut self,
        command_buffer: &mut CommandBuffer,
        tracker: &mut ResourceStateTracker,
        instances: &[Instance],
    ) -> Result<bool> {
        let data = encode_nodes(instances);
        let capacity = self.device.buffer_desc(self.nodes)?.size;
        if data.len() as u64 > capacity {
            return Ok(false);
        }
        if !data.is_empty() {
            tracker.transition(command_buffer, self.nodes, Usage::TransferDst)?;
            command_buffer.push(Command::UpdateBuffer {
                buffer: self.nodes,
                offset: 0,
                data,
            });
        }
        self.instance_count = instances.len();
        Ok(true)
    }

    pub fn vertices(&self) -> BufferHandle {
        self.vertices
    }

    pub fn indices(&self) -> BufferHandle {
        self.indices
    }

    pub fn aabbs(&self) -> BufferHandle {
        self.aabbs
    }

    pub fn materials(&self) -> BufferHandle {
        self.materials
    }

    pub fn nodes(&self) -> BufferHandle {
        self.nodes
    }

    pub fn ranges(&self) -> BufferHandle {
        self.ranges
    }

    pub fn model_ranges(&self) -> &[ModelRange] {
        &self.model_ranges
    }

    pub fn instance_count(&self) -> usize {
        self.instance_count
    }

    /// Instances the node buffer can hold without a reload.
    pub fn node_capacity(&self) -> Result<usize> {
        Ok((self.device.buffer_desc(self.nodes)?.size / NODE_STRIDE) as usize)
    }

    /// Buffers shaders read, for pass access lists.
    pub fn shader_buffers(&self) -> [BufferHandle; 6] {
        [
            self.vertices,
            self.indices,
            self.aabbs,
            self.materials,
            self.nodes,
            self.ranges,
        ]
    }

    /// The device must be idle.
    pub fn destroy(self, tracker: &mut ResourceStateTracker) {
        for buffer in self.shader_buffers().into_iter().rev() {
            tracker.forget(buffer);
            self.device.destroy_buffer(buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::headless::{HeadlessConfig, HeadlessDevice};
    use cgmath::SquareMatrix;

    fn triangle_scene() -> Scene {
        let mut scene = Scene::empty();
        let model = scene.add_model(Model::triangles(
            "triangle",
            vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
            vec![0, 1, 2],
        ));
        scene.add_instance(model, 0, Mat4::identity());
        scene
    }

    #[test]
    fn take_changes_clears_flags() {
        let mut scene = triangle_scene();
        let changes = scene.take_changes();
        assert!(changes.reloaded);
        assert!(changes.transforms_changed);
        assert_eq!(scene.take_changes(), SceneChanges::default());

        scene.set_transform(0, Mat4::from_scale(2.0));
        assert!(scene.take_changes().transforms_changed);
    }

    #[test]
    fn upload_packs_geometry() {
        let device = Rc::new(HeadlessDevice::new(HeadlessConfig::default()));
        let mut tracker = ResourceStateTracker::new();
        let scene = triangle_scene();
        let gpu_scene = GpuScene::upload(device.clone(), &mut tracker, &scene).unwrap();

        assert_eq!(gpu_scene.model_ranges()[0].vertex_count, 3);
        assert_eq!(device.buffer_contents(gpu_scene.vertices()).unwrap().len(), 36);
        assert_eq!(
            device.buffer_contents(gpu_scene.nodes()).unwrap().len() as u64,
            NODE_STRIDE
        );

        gpu_scene.destroy(&mut tracker);
        assert_eq!(device.live_buffer_count(), 0);
    }
}
