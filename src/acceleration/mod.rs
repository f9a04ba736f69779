//! Bottom and top level acceleration structure lifecycle.
//!
//! A scene load builds every structure in one blocking submission. After
//! that the top level structure is refreshed from inside the frame's own
//! command buffer: an in-place update while the instance topology is
//! unchanged, a rebuild into the same buffers otherwise.

mod blas;
mod instance;
mod tlas;

pub use blas::{BlasPlan, BottomLevelStructure, RESULT_ALIGNMENT};
pub use instance::{
    encode as encode_instances, GeometryInstance, INSTANCE_SIZE, PROCEDURAL_HIT_GROUP,
};
pub use tlas::{TopLevelStructure, Topology};

use std::rc::Rc;
use std::time::Instant;

use ash::vk;

use crate::error::{ContractViolation, RenderError, Result};
use crate::gpu::{
    AccelBuild, AccelDesc, AccelGeometry, BufferDesc, BufferHandle, Command, CommandBuffer,
    DeviceContext,
};
use crate::resource_state::{ResourceStateTracker, Usage};
use crate::scene::{GpuScene, Instance, Model};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TlasRefresh {
    Updated,
    Rebuilt,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct BuildStats {
    pub full_builds: u32,
    pub updates: u32,
    pub top_level_rebuilds: u32,
    pub result_bytes: u64,
    pub scratch_bytes: u64,
    pub last_build_ms: f64,
}

pub struct AccelerationStructureManager {
    device: Rc<dyn DeviceContext>,
    bottom_level: Vec<BottomLevelStructure>,
    bottom_level_buffer: Option<BufferHandle>,
    top_level: Option<TopLevelStructure>,
    topology: Topology,
    stats: BuildStats,
}

impl AccelerationStructureManager {
    pub fn new(device: Rc<dyn DeviceContext>) -> Self {
        Self {
            device,
            bottom_level: Vec::new(),
            bottom_level_buffer: None,
            top_level: None,
            topology: Topology::default(),
            stats: BuildStats::default(),
        }
    }

    pub fn is_built(&self) -> bool {
        self.top_level.is_some()
    }

    pub fn top_level(&self) -> Option<&TopLevelStructure> {
        self.top_level.as_ref()
    }

    pub fn bottom_level(&self) -> &[BottomLevelStructure] {
        &self.bottom_level
    }

    pub fn bottom_level_buffer(&self) -> Option<BufferHandle> {
        self.bottom_level_buffer
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn stats(&self) -> BuildStats {
        self.stats
    }

    fn track_buffer(
        &self,
        tracker: &mut ResourceStateTracker,
        desc: BufferDesc,
    ) -> Result<BufferHandle> {
        let buffer = self.device.create_buffer(&desc)?;
        tracker.register(buffer, &desc.label);
        Ok(buffer)
    }

    /// Builds one BLAS per model and the scene's TLAS in a single blocking
    /// submission. Existing structures are released first; the device must
    /// be idle. A failed build leaves nothing behind.
    pub fn build_all(
        &mut self,
        tracker: &mut ResourceStateTracker,
        scene: &GpuScene,
        models: &[Model],
        instances: &[Instance],
    ) -> Result<()> {
        self.destroy(tracker);

        let mut transient = Vec::new();
        let result = self.build_structures(tracker, scene, models, instances, &mut transient);
        for buffer in transient {
            tracker.forget(buffer);
            self.device.destroy_buffer(buffer);
        }
        if result.is_err() {
            self.destroy(tracker);
        }
        result
    }

    /// Buffers pushed to `transient` are released by the caller whatever
    /// the outcome.
    fn build_structures(
        &mut self,
        tracker: &mut ResourceStateTracker,
        scene: &GpuScene,
        models: &[Model],
        instances: &[Instance],
        transient: &mut Vec<BufferHandle>,
    ) -> Result<()> {
        let started = Instant::now();
        let capabilities = self.device.capabilities();
        if !capabilities.ray_tracing {
            return Err(RenderError::MissingCapability("acceleration structures".to_string()));
        }
        let capacity = capabilities.max_instance_count;
        if instances.len() > capacity as usize {
            return Err(RenderError::InstanceCapacity {
                count: instances.len(),
                capacity: capacity as usize,
            });
        }

        let geometry = blas::geometry_for(scene, models);
        let sizes = geometry
            .iter()
            .map(|(geometry, _)| self.device.accel_build_sizes(geometry))
            .collect::<Result<Vec<_>, _>>()?;
        let (plans, result_size, scratch_size) =
            blas::plan(geometry, sizes, capabilities.min_accel_scratch_alignment);

        use vk::BufferUsageFlags as B;
        let result_buffer = self.track_buffer(
            tracker,
            BufferDesc::device_local(
                "bottom level structures",
                result_size,
                B::ACCELERATION_STRUCTURE_STORAGE_KHR | B::SHADER_DEVICE_ADDRESS,
            ),
        )?;
        self.bottom_level_buffer = Some(result_buffer);
        let scratch = self.track_buffer(
            tracker,
            BufferDesc::device_local(
                "bottom level scratch",
                scratch_size,
                B::STORAGE_BUFFER | B::SHADER_DEVICE_ADDRESS,
            ),
        )?;
        transient.push(scratch);

        let mut builds = Vec::with_capacity(plans.len());
        for plan in &plans {
            let accel = self.device.create_accel(&AccelDesc {
                top_level: false,
                buffer: result_buffer,
                offset: plan.result_offset,
                size: plan.sizes.result,
            })?;
            self.bottom_level.push(BottomLevelStructure {
                accel,
                address: self.device.accel_address(accel)?,
                offset: plan.result_offset,
                size: plan.sizes.result,
                procedural: plan.procedural,
                primitive_count: plan.geometry.primitive_count(),
            });
            builds.push(AccelBuild {
                accel,
                geometry: plan.geometry.clone(),
                result: result_buffer,
                scratch,
                scratch_offset: plan.scratch_offset,
                references: Vec::new(),
            });
        }

        let gpu_instances = tlas::gpu_instances(instances, &self.bottom_level)?;
        let instance_buffer = self.track_buffer(
            tracker,
            BufferDesc::host_visible(
                "instances",
                capacity as u64 * INSTANCE_SIZE,
                B::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                    | B::SHADER_DEVICE_ADDRESS
                    | B::TRANSFER_DST,
            ),
        )?;
        transient.push(instance_buffer);
        self.device
            .write_buffer(instance_buffer, 0, &encode_instances(&gpu_instances))?;

        let full = AccelGeometry::Instances {
            buffer: instance_buffer,
            count: capacity,
        };
        let top_sizes = self.device.accel_build_sizes(&full)?;
        let top_buffer = self.track_buffer(
            tracker,
            BufferDesc::device_local(
                "top level structure",
                top_sizes.result,
                B::ACCELERATION_STRUCTURE_STORAGE_KHR | B::SHADER_DEVICE_ADDRESS,
            ),
        )?;
        transient.push(top_buffer);
        let top_scratch = self.track_buffer(
            tracker,
            BufferDesc::device_local(
                "top level scratch",
                top_sizes.build_scratch.max(top_sizes.update_scratch),
                B::STORAGE_BUFFER | B::SHADER_DEVICE_ADDRESS,
            ),
        )?;
        transient.push(top_scratch);
        let top_accel = self.device.create_accel(&AccelDesc {
            top_level: true,
            buffer: top_buffer,
            offset: 0,
            size: top_sizes.result,
        })?;
        let top_level = TopLevelStructure {
            accel: top_accel,
            buffer: top_buffer,
            scratch: top_scratch,
            instances: instance_buffer,
            instance_count: gpu_instances.len() as u32,
            capacity,
        };
        // The top level owns these from here on.
        transient.retain(|buffer| *buffer == scratch);
        self.top_level = Some(top_level);

        let mut command_buffer = CommandBuffer::new("acceleration structure build");
        tracker.begin_recording(&mut command_buffer);
        command_buffer.begin_label("bottom level");
        for build in &builds {
            for buffer in build.geometry.buffers() {
                tracker.transition(&mut command_buffer, buffer, Usage::AccelBuildInput)?;
            }
        }
        tracker.transition(&mut command_buffer, scratch, Usage::AccelBuild)?;
        tracker.transition(&mut command_buffer, result_buffer, Usage::AccelBuild)?;
        command_buffer.push(Command::BuildAccel(builds));
        command_buffer.end_label();

        command_buffer.begin_label("top level");
        self.record_top_level(
            &mut command_buffer,
            tracker,
            &top_level,
            gpu_instances.len() as u32,
            false,
        )?;
        command_buffer.end_label();

        self.device
            .submit_and_wait(&command_buffer)
            .map_err(|error| RenderError::AccelerationBuild(error.to_string()))?;

        self.topology = Topology::of(&gpu_instances);
        let elapsed = started.elapsed().as_secs_f64() * 1000.0;
        self.stats.full_builds += 1;
        self.stats.result_bytes = result_size + top_sizes.result;
        self.stats.scratch_bytes = scratch_size;
        self.stats.last_build_ms = elapsed;
        log::info!(
            "Built {} bottom level structures ({} bytes, {} scratch), {} instances in {:.2} ms",
            self.bottom_level.len(),
            result_size,
            scratch_size,
            gpu_instances.len(),
            elapsed
        );
        Ok(())
    }

    fn record_top_level(
        &self,
        command_buffer: &mut CommandBuffer,
        tracker: &mut ResourceStateTracker,
        top_level: &TopLevelStructure,
        count: u32,
        update: bool,
    ) -> Result<()> {
        let bottom_level = self
            .bottom_level_buffer
            .ok_or_else(|| {
                RenderError::AccelerationBuild("no bottom level structures".to_string())
            })?;

        tracker.transition(command_buffer, top_level.instances, Usage::AccelBuildInput)?;
        tracker.transition(command_buffer, bottom_level, Usage::AccelRead)?;
        tracker.transition(command_buffer, top_level.scratch, Usage::AccelBuild)?;
        tracker.transition(command_buffer, top_level.buffer, Usage::AccelBuild)?;

        let build = AccelBuild {
            accel: top_level.accel,
            geometry: AccelGeometry::Instances {
                buffer: top_level.instances,
                count,
            },
            result: top_level.buffer,
            scratch: top_level.scratch,
            scratch_offset: 0,
            references: vec![bottom_level],
        };
        command_buffer.push(if update {
            Command::UpdateAccel(build)
        } else {
            Command::BuildAccel(vec![build])
        });

        // Shaders read the structure after this point.
        tracker.transition(command_buffer, top_level.buffer, Usage::AccelRead)?;
        Ok(())
    }

    fn record_instances(
        &self,
        command_buffer: &mut CommandBuffer,
        tracker: &mut ResourceStateTracker,
        top_level: &TopLevelStructure,
        instances: &[GeometryInstance],
    ) -> Result<()> {
        if instances.is_empty() {
            return Ok(());
        }
        tracker.transition(command_buffer, top_level.instances, Usage::TransferDst)?;
        command_buffer.push(Command::UpdateBuffer {
            buffer: top_level.instances,
            offset: 0,
            data: encode_instances(instances),
        });
        Ok(())
    }

    /// Rewrites instance transforms and records an in-place TLAS update into
    /// the frame's command buffer. Only valid while the topology matches the
    /// last full build.
    pub fn update_transforms(
        &mut self,
        command_buffer: &mut CommandBuffer,
        tracker: &mut ResourceStateTracker,
        instances: &[Instance],
    ) -> Result<()> {
        let top_level = self
            .top_level
            .ok_or_else(|| RenderError::AccelerationBuild("scene not built".to_string()))?;
        let gpu_instances = tlas::gpu_instances(instances, &self.bottom_level)?;
        if Topology::of(&gpu_instances) != self.topology {
            return Err(ContractViolation::TopologyChanged.into());
        }

        self.record_instances(command_buffer, tracker, &top_level, &gpu_instances)?;
        self.record_top_level(command_buffer, tracker, &top_level, top_level.instance_count, true)?;
        self.stats.updates += 1;
        log::trace!("Top level update of {} instances", top_level.instance_count);
        Ok(())
    }

    /// Updates in place when only transforms changed, rebuilds the top level
    /// structure otherwise. Both are recorded into the frame's command buffer.
    pub fn sync_instances(
        &mut self,
        command_buffer: &mut CommandBuffer,
        tracker: &mut ResourceStateTracker,
        instances: &[Instance],
    ) -> Result<TlasRefresh> {
        let mut top_level = self
            .top_level
            .ok_or_else(|| RenderError::AccelerationBuild("scene not built".to_string()))?;
        let gpu_instances = tlas::gpu_instances(instances, &self.bottom_level)?;
        let topology = Topology::of(&gpu_instances);
        if topology == self.topology {
            self.update_transforms(command_buffer, tracker, instances)?;
            return Ok(TlasRefresh::Updated);
        }

        if gpu_instances.len() > top_level.capacity as usize {
            return Err(RenderError::InstanceCapacity {
                count: gpu_instances.len(),
                capacity: top_level.capacity as usize,
            });
        }

        top_level.instance_count = gpu_instances.len() as u32;
        self.record_instances(command_buffer, tracker, &top_level, &gpu_instances)?;
        let count = top_level.instance_count;
        self.record_top_level(command_buffer, tracker, &top_level, count, false)?;
        self.top_level = Some(top_level);
        self.topology = topology;
        self.stats.top_level_rebuilds += 1;
        log::debug!("Top level rebuild with {} instances", top_level.instance_count);
        Ok(TlasRefresh::Rebuilt)
    }

    /// Releases every structure and buffer. The device must be idle.
    pub fn destroy(&mut self, tracker: &mut ResourceStateTracker) {
        if let Some(top_level) = self.top_level.take() {
            self.device.destroy_accel(top_level.accel);
            for buffer in [top_level.scratch, top_level.buffer, top_level.instances] {
                tracker.forget(buffer);
                self.device.destroy_buffer(buffer);
            }
        }
        for blas in self.bottom_level.drain(..).rev() {
            self.device.destroy_accel(blas.accel);
        }
        if let Some(buffer) = self.bottom_level_buffer.take() {
            tracker.forget(buffer);
            self.device.destroy_buffer(buffer);
        }
        self.topology = Topology::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::headless::{DeviceEvent, HeadlessConfig, HeadlessDevice};
    use crate::error::GpuError;
    use crate::math::{Mat4, Vec3};
    use crate::resource_state::validate_barriers;
    use crate::scene::{Aabb, Scene, SceneProvider};
    use cgmath::SquareMatrix;

    struct Fixture {
        device: Rc<HeadlessDevice>,
        tracker: ResourceStateTracker,
        scene: Scene,
        gpu_scene: GpuScene,
        manager: AccelerationStructureManager,
    }

    fn fixture(scene: Scene) -> Fixture {
        let device = Rc::new(HeadlessDevice::new(HeadlessConfig::default()));
        let mut tracker = ResourceStateTracker::new();
        let gpu_scene = GpuScene::upload(device.clone(), &mut tracker, &scene).unwrap();
        let manager = AccelerationStructureManager::new(device.clone());
        Fixture {
            device,
            tracker,
            scene,
            gpu_scene,
            manager,
        }
    }

    fn two_models() -> Scene {
        let mut scene = Scene::empty();
        let quad = scene.add_model(Model::triangles(
            "quad",
            vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [1.0, 1.0, 0.0], [0.0, 1.0, 0.0]],
            vec![0, 1, 2, 0, 2, 3],
        ));
        let sphere = scene.add_model(Model::procedural(
            "sphere",
            vec![Aabb {
                min: [-1.0; 3],
                max: [1.0; 3],
            }],
        ));
        scene.add_instance(quad, 0, Mat4::identity());
        scene.add_instance(sphere, 0, Mat4::from_translation(Vec3::new(0.0, 2.0, 0.0)));
        scene
    }

    fn build(fixture: &mut Fixture) -> Result<()> {
        fixture.manager.build_all(
            &mut fixture.tracker,
            &fixture.gpu_scene,
            fixture.scene.models(),
            fixture.scene.instances(),
        )
    }

    #[test]
    fn builds_in_one_blocking_submission() {
        let mut fixture = fixture(two_models());
        build(&mut fixture).unwrap();

        let events = fixture.device.events();
        assert!(events.contains(&DeviceEvent::AccelBuilt {
            bottom_level: 2,
            top_level: 0
        }));
        assert!(events.contains(&DeviceEvent::AccelBuilt {
            bottom_level: 0,
            top_level: 1
        }));
        assert_eq!(
            events
                .iter()
                .filter(|event| matches!(event, DeviceEvent::OneShotSubmitted { .. }))
                .count(),
            1
        );
        assert_eq!(fixture.device.hazard_count(), 0);
        assert!(fixture.manager.bottom_level()[1].procedural);
        assert_eq!(fixture.manager.top_level().unwrap().instance_count, 2);
    }

    #[test]
    fn bottom_level_scratch_is_freed() {
        let mut fixture = fixture(two_models());
        build(&mut fixture).unwrap();
        let scratch_freed = fixture.device.events().iter().any(|event| {
            matches!(event, DeviceEvent::BufferDestroyed { .. })
        });
        assert!(scratch_freed);
        // scene buffers + bottom level + instances + top level + top scratch
        assert_eq!(fixture.device.live_buffer_count(), 6 + 4);
    }

    #[test]
    fn empty_scene_still_gets_a_bottom_level_structure() {
        let mut fixture = fixture(Scene::empty());
        build(&mut fixture).unwrap();
        assert_eq!(fixture.manager.bottom_level().len(), 1);
        assert_eq!(fixture.manager.bottom_level()[0].primitive_count, 0);
        assert_eq!(fixture.manager.top_level().unwrap().instance_count, 0);
    }

    #[test]
    fn transform_change_updates_in_place() {
        let mut fixture = fixture(two_models());
        build(&mut fixture).unwrap();
        fixture
            .scene
            .set_transform(0, Mat4::from_translation(Vec3::new(1.0, 0.0, 0.0)));

        let mut cmd = CommandBuffer::new("frame");
        fixture.tracker.begin_recording(&mut cmd);
        let refresh = fixture
            .manager
            .sync_instances(&mut cmd, &mut fixture.tracker, fixture.scene.instances())
            .unwrap();
        assert_eq!(refresh, TlasRefresh::Updated);
        assert!(cmd.commands().iter().any(|command| matches!(command, Command::UpdateAccel(_))));
        assert!(validate_barriers(&cmd).is_empty());
    }

    #[test]
    fn topology_change_rebuilds_never_updates() {
        let mut fixture = fixture(two_models());
        build(&mut fixture).unwrap();
        fixture.scene.add_instance(0, 0, Mat4::identity());

        let mut cmd = CommandBuffer::new("frame");
        fixture.tracker.begin_recording(&mut cmd);
        assert!(matches!(
            fixture
                .manager
                .update_transforms(&mut cmd, &mut fixture.tracker, fixture.scene.instances()),
            Err(RenderError::Contract(ContractViolation::TopologyChanged))
        ));

        let refresh = fixture
            .manager
            .sync_instances(&mut cmd, &mut fixture.tracker, fixture.scene.instances())
            .unwrap();
        assert_eq!(refresh, TlasRefresh::Rebuilt);
        assert!(!cmd.commands().iter().any(|command| matches!(command, Command::UpdateAccel(_))));
        assert_eq!(fixture.manager.top_level().unwrap().instance_count, 3);
        assert_eq!(fixture.manager.stats().top_level_rebuilds, 1);
    }

    #[test]
    fn swapping_blas_reference_is_a_topology_change() {
        let mut fixture = fixture(two_models());
        build(&mut fixture).unwrap();
        let before = fixture.manager.topology().clone();

        let mut swapped = fixture.scene.instances().to_vec();
        swapped[0].model = 1;
        let mut cmd = CommandBuffer::new("frame");
        fixture.tracker.begin_recording(&mut cmd);
        let refresh = fixture
            .manager
            .sync_instances(&mut cmd, &mut fixture.tracker, &swapped)
            .unwrap();
        assert_eq!(refresh, TlasRefresh::Rebuilt);
        assert_ne!(&before, fixture.manager.topology());
    }

    #[test]
    fn failed_build_is_fatal() {
        let mut fixture = fixture(two_models());
        let buffers = fixture.device.live_buffer_count();
        let tracked = fixture.tracker.tracked_count();
        fixture.device.fail_next_submit(GpuError::DeviceLost);
        assert!(matches!(build(&mut fixture), Err(RenderError::AccelerationBuild(_))));

        assert!(!fixture.manager.is_built());
        assert!(fixture.manager.bottom_level().is_empty());
        assert_eq!(fixture.device.live_buffer_count(), buffers);
        assert_eq!(fixture.device.live_accels(), 0);
        assert_eq!(fixture.tracker.tracked_count(), tracked);

        build(&mut fixture).unwrap();
        assert!(fixture.manager.is_built());
    }
}
