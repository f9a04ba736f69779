//! The per-frame driver.
//!
//! One frame: wait for the slot's fence, acquire a surface image, write the
//! slot's uniforms, record prepass, backend and compositor into the slot's
//! command buffer, submit, present. Only a successful present advances the
//! frame. An out of date or suboptimal surface on acquire or present makes
//! the scheduler idle the device, rebuild every resolution dependent
//! resource and drop the frame.

use std::path::Path;
use std::rc::Rc;
use std::time::Instant;

use ash::vk;

use crate::acceleration::{
    AccelerationStructureManager, BottomLevelStructure, TlasRefresh, TopLevelStructure,
};
use crate::backend::{
    create_backend, BackendKind, FrameContext, Prepass, RenderBackend, ResourceContext,
    SharedResources,
};
use crate::compositor::{AccumulationCompositor, HistoryState};
use crate::config::RenderSettings;
use crate::error::{GpuError, RenderError, Result};
use crate::frame::FrameResourcePool;
use crate::gpu::{
    AcquireOutcome, BufferHandle, DeviceContext, PresentOutcome, Submission, ValidationSeverity,
    INFINITE_TIMEOUT,
};
use crate::math::Mat4;
use crate::resource_state::ResourceStateTracker;
use crate::scene::{GpuScene, SceneChanges, SceneProvider};
use crate::screenshot;
use crate::shader_library::ShaderLibrary;
use crate::surface::{SurfaceConfig, SurfaceResourceSet};
use crate::texture_registry::TextureRegistry;
use crate::uniform::{UniformBlock, UNIFORM_SIZE};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    Presented,
    /// Nothing was recorded, e.g. while minimized.
    Skipped,
    /// The surface was invalidated and rebuilt; the frame was dropped.
    SurfaceRebuilt,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FrameStats {
    pub presented: u64,
    pub skipped: u64,
    pub surface_rebuilds: u64,
    pub scene_reloads: u64,
    pub backend_switches: u64,
    /// Moving average of CPU time per presented frame.
    pub average_frame_ms: f64,
}

impl FrameStats {
    fn record_frame_time(&mut self, ms: f64) {
        self.average_frame_ms = if self.presented <= 1 {
            ms
        } else {
            self.average_frame_ms * 0.9 + ms * 0.1
        };
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ResourceScope {
    Backend,
    All,
}

fn missing(what: &'static str) -> RenderError {
    GpuError::InvalidHandle(what).into()
}

pub struct FrameScheduler<S: SceneProvider> {
    device: Rc<dyn DeviceContext>,
    settings: RenderSettings,
    shaders: ShaderLibrary,
    tracker: ResourceStateTracker,
    textures: TextureRegistry,
    // Both are None only while being rebuilt.
    surface: Option<SurfaceResourceSet>,
    gpu_scene: Option<GpuScene>,
    frames: FrameResourcePool,
    accel: AccelerationStructureManager,
    scene: S,
    // Changes taken from the provider that no submitted frame has applied yet.
    pending_changes: SceneChanges,
    prepass: Prepass,
    backend: Box<dyn RenderBackend>,
    compositor: AccumulationCompositor,
    current_frame: usize,
    frame_number: u64,
    minimized: bool,
    pending_extent: Option<vk::Extent2D>,
    previous_view_projection: Option<Mat4>,
    last_presented: Option<u32>,
    stats: FrameStats,
}

impl<S: SceneProvider> FrameScheduler<S> {
    pub fn new(
        device: Rc<dyn DeviceContext>,
        settings: RenderSettings,
        shaders: ShaderLibrary,
        mut scene: S,
    ) -> Result<Self> {
        let capabilities = device.capabilities();
        log::info!(
            "Device `{}`: ray tracing {}, external memory {}, up to {} instances",
            device.name(),
            capabilities.ray_tracing,
            capabilities.external_memory,
            capabilities.max_instance_count
        );
        if settings.backend.requires_ray_tracing() && !capabilities.ray_tracing {
            return Err(RenderError::MissingCapability(format!(
                "the {} backend needs hardware ray tracing",
                settings.backend.name()
            )));
        }
        if settings.validation {
            device.set_validation_callback(Box::new(|message| match message.severity {
                ValidationSeverity::Warning => log::warn!("Validation: {}", message.message),
                ValidationSeverity::Error => log::warn!("Validation error: {}", message.message),
            }));
        }

        let mut tracker = ResourceStateTracker::new();
        let textures = TextureRegistry::new(device.clone(), &mut tracker)?;
        let surface = SurfaceResourceSet::new(
            device.clone(),
            &mut tracker,
            surface_config(&settings, capabilities.external_memory),
        )?;
        let frames = FrameResourcePool::new(
            device.clone(),
            &mut tracker,
            surface.image_count(),
            UNIFORM_SIZE,
        )?;

        // The initial upload covers whatever the provider reported so far.
        scene.take_changes();
        let gpu_scene = GpuScene::upload(device.clone(), &mut tracker, &scene)?;
        let mut accel = AccelerationStructureManager::new(device.clone());
        if capabilities.ray_tracing {
            accel.build_all(&mut tracker, &gpu_scene, scene.models(), scene.instances())?;
        }

        let mut scheduler = Self {
            backend: create_backend(settings.backend),
            compositor: AccumulationCompositor::new(settings.denoiser),
            prepass: Prepass::default(),
            device,
            settings,
            shaders,
            tracker,
            textures,
            surface: Some(surface),
            gpu_scene: Some(gpu_scene),
            frames,
            accel,
            scene,
            pending_changes: SceneChanges::default(),
            current_frame: 0,
            frame_number: 0,
            minimized: false,
            pending_extent: None,
            previous_view_projection: None,
            last_presented: None,
            stats: FrameStats::default(),
        };
        scheduler.create_resources(ResourceScope::All)?;
        log::info!("Active backend: {}", scheduler.backend.kind().name());
        Ok(scheduler)
    }

    fn create_resources(&mut self, scope: ResourceScope) -> Result<()> {
        let surface = self.surface.as_ref().ok_or_else(|| missing("surface"))?;
        let scene = self.gpu_scene.as_ref().ok_or_else(|| missing("scene"))?;
        let uniform_buffers = self.frames.uniform_buffers();
        let mut context = ResourceContext {
            device: &self.device,
            tracker: &mut self.tracker,
            shaders: &mut self.shaders,
            shared: SharedResources {
                surface,
                scene,
                accel: &self.accel,
                textures: &self.textures,
            },
            uniform_buffers: &uniform_buffers,
            settings: &self.settings,
        };
        if scope == ResourceScope::All {
            self.prepass.create_resources(&mut context)?;
        }
        self.backend.create_resources(&mut context)?;
        if scope == ResourceScope::All {
            self.compositor.create_resources(&mut context)?;
        }
        Ok(())
    }

    /// The device must be idle.
    fn destroy_resources(&mut self) {
        let device = self.device.as_ref();
        self.compositor.destroy_resources(device, &mut self.tracker);
        self.backend.destroy_resources(device, &mut self.tracker);
        self.prepass.destroy_resources(device, &mut self.tracker);
    }

    /// Drives one frame to completion, or skips it.
    pub fn render_frame(&mut self) -> Result<FrameOutcome> {
        if self.minimized {
            self.stats.skipped += 1;
            return Ok(FrameOutcome::Skipped);
        }
        if let Some(extent) = self.pending_extent.take() {
            self.rebuild_surface(Some(extent))?;
            return Ok(FrameOutcome::SurfaceRebuilt);
        }
        let started = Instant::now();

        self.pending_changes.merge(self.scene.take_changes());
        let changes = self.pending_changes;
        let outgrown = match &self.gpu_scene {
            Some(gpu_scene) => self.scene.instances().len() > gpu_scene.node_capacity()?,
            None => true,
        };
        if changes.reloaded || (changes.transforms_changed && outgrown) {
            self.reload_scene()?;
        } else if changes.camera_changed {
            self.compositor.reset();
            self.pending_changes.camera_changed = false;
        }
        let transforms_changed = self.pending_changes.transforms_changed;

        let slot_index = self.current_frame;
        let slot = self.frames.begin(slot_index)?;
        let fence = slot.fence();
        let image_available = slot.image_available();
        let render_finished = slot.render_finished();
        let uniform_buffer = slot.uniform_buffer();

        let surface = self.surface.as_ref().ok_or_else(|| missing("surface"))?;
        let swapchain = surface.swapchain().handle;
        let acquired = self
            .device
            .acquire_next_image(swapchain, image_available, INFINITE_TIMEOUT)?;
        let image_index = match acquired {
            AcquireOutcome::Ready(index) => index,
            outcome => {
                log::info!("Surface invalidated on acquire ({:?})", outcome);
                self.rebuild_surface(None)?;
                return Ok(FrameOutcome::SurfaceRebuilt);
            }
        };

        let block = UniformBlock::new(
            self.scene.camera(),
            surface.extent(),
            &self.settings,
            self.frame_number,
            self.previous_view_projection,
        )
        .progressive(self.compositor.state() != HistoryState::Cold);
        self.device.write_buffer(uniform_buffer, 0, &block.to_bytes())?;

        let gpu_scene = self.gpu_scene.as_mut().ok_or_else(|| missing("scene"))?;
        let command_buffer = &mut slot.command_buffer;
        self.tracker.begin_recording(command_buffer);
        command_buffer.begin_label("frame");
        self.tracker.discard(surface.surface_image(image_index))?;

        if transforms_changed {
            command_buffer.begin_label("scene update");
            let instances = self.scene.instances();
            if !gpu_scene.record_node_update(command_buffer, &mut self.tracker, instances)? {
                log::warn!("Node buffer too small for {} instances", instances.len());
            }
            if self.accel.is_built() {
                match self.accel.sync_instances(command_buffer, &mut self.tracker, instances)? {
                    TlasRefresh::Updated => log::trace!("Top level structure updated in place"),
                    TlasRefresh::Rebuilt => {
                        log::debug!("Top level structure rebuilt after a topology change")
                    }
                }
            }
            command_buffer.end_label();
        }

        let backend_name = self.backend.kind().name();
        let mut frame = FrameContext {
            command_buffer,
            tracker: &mut self.tracker,
            shared: SharedResources {
                surface,
                scene: gpu_scene,
                accel: &self.accel,
                textures: &self.textures,
            },
            slot: slot_index,
            frame: self.frame_number,
            image_index,
            uniform_buffer,
            settings: &self.settings,
        };
        self.prepass.record(&mut frame)?;
        frame.command_buffer.begin_label(backend_name);
        self.backend.render(&mut frame)?;
        frame.command_buffer.end_label();
        AccumulationCompositor::check_input(frame.tracker, surface, backend_name)?;
        self.compositor.accumulate(&mut frame)?;
        self.compositor.compose(&mut frame)?;
        frame.command_buffer.end_label();

        self.device.reset_fence(fence)?;
        self.device.submit(
            &slot.command_buffer,
            &Submission {
                wait: Some(image_available),
                signal: Some(render_finished),
                fence: Some(fence),
            },
        )?;
        self.pending_changes.transforms_changed = false;

        let presented = self.device.present(swapchain, image_index, render_finished)?;
        match presented {
            PresentOutcome::Presented => {}
            outcome => {
                log::info!("Surface invalidated on present ({:?})", outcome);
                self.rebuild_surface(None)?;
                return Ok(FrameOutcome::SurfaceRebuilt);
            }
        }

        self.previous_view_projection = Some(block.view_projection);
        self.last_presented = Some(image_index);
        self.current_frame = (self.current_frame + 1) % self.frames.len();
        self.frame_number += 1;
        self.stats.presented += 1;
        self.stats
            .record_frame_time(started.elapsed().as_secs_f64() * 1000.0);
        let interval = self.settings.stats_interval;
        if interval > 0 && self.stats.presented % interval == 0 {
            log::debug!(
                "{} frames presented, {:.2} ms average, {} skipped, {} surface rebuilds",
                self.stats.presented,
                self.stats.average_frame_ms,
                self.stats.skipped,
                self.stats.surface_rebuilds
            );
        }
        Ok(FrameOutcome::Presented)
    }

    /// Idles the device and recreates the surface, every resolution
    /// dependent target, the frame slots and everything bound to them.
    fn rebuild_surface(&mut self, extent: Option<vk::Extent2D>) -> Result<()> {
        self.device.wait_idle()?;
        self.destroy_resources();
        self.frames.destroy(&mut self.tracker);
        if let Some(surface) = self.surface.take() {
            surface.destroy(&mut self.tracker);
        }

        if let Some(extent) = extent {
            self.settings.width = extent.width;
            self.settings.height = extent.height;
        }
        let external_memory = self.device.capabilities().external_memory;
        let surface = SurfaceResourceSet::new(
            self.device.clone(),
            &mut self.tracker,
            surface_config(&self.settings, external_memory),
        )?;
        let actual = surface.extent();
        self.settings.width = actual.width;
        self.settings.height = actual.height;
        self.frames = FrameResourcePool::new(
            self.device.clone(),
            &mut self.tracker,
            surface.image_count(),
            UNIFORM_SIZE,
        )?;
        self.surface = Some(surface);
        self.current_frame = 0;
        self.create_resources(ResourceScope::All)?;

        self.compositor.reset();
        self.previous_view_projection = None;
        self.last_presented = None;
        self.stats.surface_rebuilds += 1;
        Ok(())
    }

    /// Uploads the scene again and rebuilds every acceleration structure.
    fn reload_scene(&mut self) -> Result<()> {
        self.device.wait_idle()?;
        self.destroy_resources();
        self.accel.destroy(&mut self.tracker);
        if let Some(gpu_scene) = self.gpu_scene.take() {
            gpu_scene.destroy(&mut self.tracker);
        }

        let gpu_scene = GpuScene::upload(self.device.clone(), &mut self.tracker, &self.scene)?;
        if self.device.capabilities().ray_tracing {
            self.accel.build_all(
                &mut self.tracker,
                &gpu_scene,
                self.scene.models(),
                self.scene.instances(),
            )?;
        }
        self.gpu_scene = Some(gpu_scene);
        self.create_resources(ResourceScope::All)?;

        self.compositor.reset();
        self.previous_view_projection = None;
        self.pending_changes = SceneChanges::default();
        self.stats.scene_reloads += 1;
        log::info!("Reloaded scene `{}`", self.scene.name());
        Ok(())
    }

    /// Switches the active backend. Shared resources and acceleration
    /// structures stay as they are.
    pub fn select_backend(&mut self, kind: BackendKind) -> Result<()> {
        if kind == self.backend.kind() {
            return Ok(());
        }
        if kind.requires_ray_tracing() && !self.device.capabilities().ray_tracing {
            return Err(RenderError::MissingCapability(format!(
                "the {} backend needs hardware ray tracing",
                kind.name()
            )));
        }

        self.device.wait_idle()?;
        self.backend.destroy_resources(self.device.as_ref(), &mut self.tracker);
        self.backend = create_backend(kind);
        self.settings.backend = kind;
        self.create_resources(ResourceScope::Backend)?;
        self.compositor.reset();
        self.stats.backend_switches += 1;
        log::info!("Switched backend to {}", kind.name());
        Ok(())
    }

    /// The surface is rebuilt before the next frame.
    pub fn resize(&mut self, extent: vk::Extent2D) {
        self.pending_extent = Some(extent);
    }

    /// No image is acquired while minimized.
    pub fn set_minimized(&mut self, minimized: bool) {
        self.minimized = minimized;
    }

    /// Replaces the scene; it is uploaded and built before the next frame.
    pub fn load_scene(&mut self, scene: S) {
        self.scene = scene;
        self.pending_changes.reloaded = true;
    }

    /// Writes the last presented image as PNG.
    pub fn screenshot(&self, path: &Path) -> Result<()> {
        let index = self.last_presented.ok_or_else(|| missing("presented image"))?;
        let surface = self.surface.as_ref().ok_or_else(|| missing("surface"))?;
        self.device.wait_idle()?;
        let image = surface.surface_image(index);
        let pixels = self.device.read_image(image)?;
        screenshot::save_png(path, self.device.image_desc(image)?.extent, pixels)
    }

    pub fn top_level_structure(&self) -> Option<&TopLevelStructure> {
        self.accel.top_level()
    }

    pub fn bottom_level_structures(&self) -> &[BottomLevelStructure] {
        self.accel.bottom_level()
    }

    pub fn acceleration(&self) -> &AccelerationStructureManager {
        &self.accel
    }

    /// One per frame in flight.
    pub fn active_uniform_buffers(&self) -> Vec<BufferHandle> {
        self.frames.uniform_buffers()
    }

    pub fn current_scene(&self) -> &S {
        &self.scene
    }

    /// Changes are picked up at the start of the next frame.
    pub fn scene_mut(&mut self) -> &mut S {
        &mut self.scene
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn compositor(&self) -> &AccumulationCompositor {
        &self.compositor
    }

    pub fn surface(&self) -> Option<&SurfaceResourceSet> {
        self.surface.as_ref()
    }

    pub fn tracker(&self) -> &ResourceStateTracker {
        &self.tracker
    }

    pub fn textures(&self) -> &TextureRegistry {
        &self.textures
    }

    pub fn settings(&self) -> &RenderSettings {
        &self.settings
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frames.len()
    }

    /// Slot the next frame records into.
    pub fn current_frame(&self) -> usize {
        self.current_frame
    }

    /// Presented frames so far; decides ping-pong roles.
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    pub fn stats(&self) -> FrameStats {
        self.stats
    }
}

impl<S: SceneProvider> Drop for FrameScheduler<S> {
    fn drop(&mut self) {
        if let Err(error) = self.device.wait_idle() {
            log::error!("Device did not go idle during teardown: {}", error);
        }
        self.destroy_resources();
        self.accel.destroy(&mut self.tracker);
        if let Some(gpu_scene) = self.gpu_scene.take() {
            gpu_scene.destroy(&mut self.tracker);
        }
        self.frames.destroy(&mut self.tracker);
        if let Some(surface) = self.surface.take() {
            surface.destroy(&mut self.tracker);
        }
        self.textures.destroy(&mut self.tracker);
        log::debug!("Scheduler released all device resources");
    }
}

fn surface_config(settings: &RenderSettings, external_memory: bool) -> SurfaceConfig {
    SurfaceConfig {
        extent: settings.extent(),
        image_count: settings.surface_images,
        present_mode: settings.present_mode.vk(),
        denoiser_staging: settings.denoiser && external_memory,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cornell_box;
    use crate::gpu::headless::{DeviceEvent, HeadlessConfig, HeadlessDevice};
    use crate::scene::Scene;

    fn scheduler(
        config: HeadlessConfig,
        settings: RenderSettings,
    ) -> (Rc<HeadlessDevice>, FrameScheduler<Scene>) {
        let device = Rc::new(HeadlessDevice::new(config));
        let scheduler = FrameScheduler::new(
            device.clone(),
            settings,
            ShaderLibrary::placeholders(),
            cornell_box::scene(),
        )
        .unwrap();
        (device, scheduler)
    }

    #[test]
    fn presents_and_advances_the_slot() {
        let (device, mut scheduler) =
            scheduler(HeadlessConfig::default(), RenderSettings::default());
        let slots = scheduler.frames_in_flight();
        assert_eq!(scheduler.render_frame().unwrap(), FrameOutcome::Presented);
        assert_eq!(scheduler.current_frame(), 1 % slots);
        assert_eq!(scheduler.frame_number(), 1);
        assert!(device
            .events()
            .iter()
            .any(|event| matches!(event, DeviceEvent::Presented { .. })));
    }

    #[test]
    fn minimized_surface_is_never_acquired() {
        let (device, mut scheduler) =
            scheduler(HeadlessConfig::default(), RenderSettings::default());
        device.clear_events();
        scheduler.set_minimized(true);
        assert_eq!(scheduler.render_frame().unwrap(), FrameOutcome::Skipped);
        assert!(!device
            .events()
            .iter()
            .any(|event| matches!(event, DeviceEvent::Acquired { .. })));
        assert_eq!(scheduler.stats().skipped, 1);
    }

    #[test]
    fn suboptimal_present_rebuilds_without_advancing() {
        let (device, mut scheduler) =
            scheduler(HeadlessConfig::default(), RenderSettings::default());
        scheduler.render_frame().unwrap();
        device.inject_present(PresentOutcome::Suboptimal);
        assert_eq!(scheduler.render_frame().unwrap(), FrameOutcome::SurfaceRebuilt);
        assert_eq!(scheduler.frame_number(), 1);
        assert_eq!(scheduler.current_frame(), 0);
        assert_eq!(scheduler.stats().surface_rebuilds, 1);
        assert_eq!(scheduler.render_frame().unwrap(), FrameOutcome::Presented);
    }

    #[test]
    fn transform_change_survives_a_dropped_frame() {
        let (device, mut scheduler) =
            scheduler(HeadlessConfig::default(), RenderSettings::default());
        scheduler.render_frame().unwrap();
        scheduler
            .scene_mut()
            .set_transform(0, Mat4::from_translation(crate::math::Vec3::new(0.0, 0.2, -1.0)));
        device.inject_acquire(AcquireOutcome::OutOfDate);
        device.clear_events();

        assert_eq!(scheduler.render_frame().unwrap(), FrameOutcome::SurfaceRebuilt);
        assert_eq!(scheduler.render_frame().unwrap(), FrameOutcome::Presented);
        assert!(device
            .events()
            .iter()
            .any(|event| matches!(event, DeviceEvent::AccelUpdated { .. })));

        device.clear_events();
        scheduler.render_frame().unwrap();
        assert!(!device
            .events()
            .iter()
            .any(|event| matches!(event, DeviceEvent::AccelUpdated { .. })));
    }

    #[test]
    fn loaded_scene_is_uploaded_before_the_next_frame() {
        let (device, mut scheduler) =
            scheduler(HeadlessConfig::default(), RenderSettings::default());
        scheduler.render_frame().unwrap();
        assert_eq!(scheduler.bottom_level_structures().len(), 3);

        let mut next = Scene::empty();
        next.take_changes();
        scheduler.load_scene(next);
        device.clear_events();
        assert_eq!(scheduler.render_frame().unwrap(), FrameOutcome::Presented);

        assert_eq!(scheduler.stats().scene_reloads, 1);
        assert!(scheduler.current_scene().models().is_empty());
        assert_eq!(scheduler.bottom_level_structures().len(), 1);
        assert_eq!(scheduler.top_level_structure().unwrap().instance_count, 0);
        assert!(device
            .events()
            .iter()
            .any(|event| matches!(event, DeviceEvent::AccelBuilt { top_level: 1, .. })));
        assert_eq!(scheduler.compositor().last_weight(), Some(1.0));

        scheduler.render_frame().unwrap();
        assert_eq!(scheduler.stats().scene_reloads, 1);
    }

    #[test]
    fn camera_motion_resets_history() {
        let (_, mut scheduler) = scheduler(HeadlessConfig::default(), RenderSettings::default());
        scheduler.render_frame().unwrap();
        scheduler.render_frame().unwrap();
        assert_eq!(scheduler.compositor().last_weight(), Some(0.5));

        scheduler.scene_mut().camera_mut().translate(crate::math::Vec3::new(0.1, 0.0, 0.0));
        scheduler.render_frame().unwrap();
        assert_eq!(scheduler.compositor().last_weight(), Some(1.0));
    }

    #[test]
    fn teardown_releases_everything() {
        let (device, mut scheduler) =
            scheduler(HeadlessConfig::default(), RenderSettings::default());
        scheduler.render_frame().unwrap();
        drop(scheduler);
        assert!(device.live_images().is_empty());
        assert_eq!(device.live_buffer_count(), 0);
        assert_eq!(device.live_binding_tables(), 0);
        assert_eq!(device.live_accels(), 0);
    }

    #[test]
    fn stats_track_presented_frames() {
        let (_, mut scheduler) = scheduler(HeadlessConfig::default(), RenderSettings::default());
        for _ in 0..5 {
            scheduler.render_frame().unwrap();
        }
        let stats = scheduler.stats();
        assert_eq!(stats.presented, 5);
        assert!(stats.average_frame_ms >= 0.0);
    }
}
