use std::collections::HashSet;
use std::rc::Rc;

use ash::vk;

use tracer::backend::BackendKind;
use tracer::config::RenderSettings;
use tracer::cornell_box;
use tracer::gpu::headless::{DeviceEvent, HeadlessConfig, HeadlessDevice};
use tracer::gpu::{BindingKind, BindingLayout, DeviceCapabilities};
use tracer::math::{Mat4, Vec3};
use tracer::scene::Scene;
use tracer::shader_library::ShaderLibrary;
use tracer::{ContractViolation, FrameOutcome, FrameScheduler, GpuError, RenderError};

fn extent(width: u32, height: u32) -> vk::Extent2D {
    vk::Extent2D { width, height }
}

fn settings(backend: BackendKind, extent: vk::Extent2D) -> RenderSettings {
    RenderSettings {
        backend,
        width: extent.width,
        height: extent.height,
        ..RenderSettings::default()
    }
}

fn start(
    config: HeadlessConfig,
    settings: RenderSettings,
    scene: Scene,
) -> (Rc<HeadlessDevice>, FrameScheduler<Scene>) {
    let device = Rc::new(HeadlessDevice::new(config));
    let shaders = ShaderLibrary::placeholders();
    let scheduler = match FrameScheduler::new(device.clone(), settings, shaders, scene) {
        Ok(scheduler) => scheduler,
        Err(error) => panic!("scheduler creation failed: {error}"),
    };
    (device, scheduler)
}

fn cornell(backend: BackendKind) -> (Rc<HeadlessDevice>, FrameScheduler<Scene>) {
    let size = extent(320, 240);
    start(
        HeadlessConfig {
            surface_extent: size,
            ..HeadlessConfig::default()
        },
        settings(backend, size),
        cornell_box::scene(),
    )
}

fn present(scheduler: &mut FrameScheduler<Scene>, frames: usize) {
    for _ in 0..frames {
        assert_eq!(scheduler.render_frame().unwrap(), FrameOutcome::Presented);
    }
}

#[test]
fn slots_are_never_rerecorded_before_their_fence() {
    let size = extent(320, 240);
    let (device, mut scheduler) = start(
        HeadlessConfig {
            surface_extent: size,
            latency: 8,
            ..HeadlessConfig::default()
        },
        settings(BackendKind::PathTracing, size),
        cornell_box::scene(),
    );
    assert!(scheduler.frames_in_flight() < 8);
    device.clear_events();
    present(&mut scheduler, 10);

    let mut outstanding = HashSet::new();
    let mut blocked_waits = 0;
    for event in device.events() {
        match event {
            DeviceEvent::Submitted { fence: Some(fence), label, .. } => {
                assert!(
                    outstanding.insert(fence),
                    "{label} submitted before its fence was waited on"
                );
            }
            DeviceEvent::FenceWaited { fence, blocked } => {
                outstanding.remove(&fence);
                if blocked {
                    blocked_waits += 1;
                }
            }
            _ => {}
        }
    }
    assert!(blocked_waits > 0);
}

#[test]
fn history_written_in_one_frame_is_read_in_the_next() {
    let (_, mut scheduler) = cornell(BackendKind::PathTracing);
    present(&mut scheduler, 4);
    let surface = scheduler.surface().unwrap();
    for pair in [surface.history(), surface.visibility()] {
        for frame in 1..6 {
            assert_eq!(pair.write(frame - 1), pair.read(frame));
            assert_ne!(pair.read(frame), pair.write(frame));
        }
    }
}

#[test]
fn moving_an_instance_updates_the_top_level_in_place() {
    let (device, mut scheduler) = cornell(BackendKind::PathTracing);
    present(&mut scheduler, 1);
    device.clear_events();

    scheduler
        .scene_mut()
        .set_transform(0, Mat4::from_translation(Vec3::new(0.0, 0.1, -1.0)));
    present(&mut scheduler, 1);

    let events = device.events();
    assert!(events
        .iter()
        .any(|event| matches!(event, DeviceEvent::AccelUpdated { .. })));
    assert!(!events
        .iter()
        .any(|event| matches!(event, DeviceEvent::AccelBuilt { .. })));
}

#[test]
fn adding_an_instance_rebuilds_the_top_level() {
    let (device, mut scheduler) = cornell(BackendKind::PathTracing);
    present(&mut scheduler, 1);
    let before = scheduler.top_level_structure().unwrap().instance_count;
    device.clear_events();

    scheduler
        .scene_mut()
        .add_instance(0, 0, Mat4::from_translation(Vec3::new(0.2, 0.2, 0.2)));
    present(&mut scheduler, 1);

    let events = device.events();
    assert!(events
        .iter()
        .any(|event| matches!(event, DeviceEvent::AccelBuilt { top_level: 1, .. })));
    assert!(!events
        .iter()
        .any(|event| matches!(event, DeviceEvent::AccelUpdated { .. })));
    assert_eq!(scheduler.top_level_structure().unwrap().instance_count, before + 1);
}

#[test]
fn every_backend_records_without_hazards() {
    for backend in BackendKind::ALL {
        let (device, mut scheduler) = cornell(backend);
        present(&mut scheduler, 6);
        assert_eq!(device.hazard_count(), 0, "{} recorded a hazard", backend.name());
        assert_eq!(scheduler.backend_kind(), backend);
    }
}

#[test]
fn resize_rebuilds_every_target() {
    let large = extent(1920, 1080);
    let small = extent(1280, 720);
    let (device, mut scheduler) = start(
        HeadlessConfig {
            surface_extent: large,
            ..HeadlessConfig::default()
        },
        settings(BackendKind::HybridDeferred, large),
        cornell_box::scene(),
    );
    present(&mut scheduler, 2);

    device.resize_surface(small);
    assert_eq!(scheduler.render_frame().unwrap(), FrameOutcome::SurfaceRebuilt);
    present(&mut scheduler, 2);

    let surface = scheduler.surface().unwrap();
    assert_eq!(surface.extent(), small);
    assert!(surface
        .descriptor()
        .iter()
        .all(|desc| desc.extent == small));
    assert_eq!(scheduler.settings().extent(), small);
    assert!(device.stale_binding_tables().is_empty());
    assert_eq!(device.hazard_count(), 0);
    assert_eq!(scheduler.stats().surface_rebuilds, 1);
}

#[test]
fn resizing_back_restores_the_surface() {
    let original = extent(640, 480);
    let (device, mut scheduler) = start(
        HeadlessConfig {
            surface_extent: original,
            ..HeadlessConfig::default()
        },
        settings(BackendKind::PathTracing, original),
        cornell_box::scene(),
    );
    present(&mut scheduler, 1);
    let descriptor = scheduler.surface().unwrap().descriptor();

    device.resize_surface(extent(800, 600));
    scheduler.render_frame().unwrap();
    present(&mut scheduler, 1);
    device.resize_surface(original);
    scheduler.render_frame().unwrap();
    present(&mut scheduler, 1);

    assert_eq!(scheduler.surface().unwrap().descriptor(), descriptor);
}

#[test]
fn reload_rebuilds_structures_and_restarts_history() {
    let (device, mut scheduler) = cornell(BackendKind::PathTracing);
    present(&mut scheduler, 3);
    device.clear_events();

    scheduler.scene_mut().reload();
    present(&mut scheduler, 1);

    assert!(device.events().iter().any(|event| matches!(
        event,
        DeviceEvent::AccelBuilt { bottom_level, .. } if *bottom_level > 0
    )));
    assert_eq!(scheduler.compositor().last_weight(), Some(1.0));
    assert_eq!(scheduler.stats().scene_reloads, 1);
}

#[test]
fn switching_backends_keeps_acceleration_structures() {
    let (device, mut scheduler) = cornell(BackendKind::HybridDeferred);
    present(&mut scheduler, 2);
    let shared_layouts = ["cull", "accumulate", "compose"];
    let shared_tables: HashSet<_> = device
        .events()
        .into_iter()
        .filter_map(|event| match event {
            DeviceEvent::BindingTableCreated { table, layout }
                if shared_layouts.contains(&layout.as_str()) =>
            {
                Some(table)
            }
            _ => None,
        })
        .collect();
    assert!(!shared_tables.is_empty());
    let surface_images: HashSet<_> =
        scheduler.surface().unwrap().owned_images().into_iter().collect();
    device.clear_events();

    scheduler.select_backend(BackendKind::ModernDeferred).unwrap();
    present(&mut scheduler, 2);

    assert_eq!(scheduler.backend_kind(), BackendKind::ModernDeferred);
    assert_eq!(scheduler.stats().backend_switches, 1);
    let after: HashSet<_> = scheduler.surface().unwrap().owned_images().into_iter().collect();
    assert_eq!(after, surface_images);
    for event in device.events() {
        match event {
            DeviceEvent::AccelBuilt { .. } => panic!("acceleration structures were rebuilt"),
            DeviceEvent::SwapchainCreated { .. } | DeviceEvent::SwapchainDestroyed => {
                panic!("surface was rebuilt")
            }
            DeviceEvent::ImageDestroyed { image } => {
                assert!(!surface_images.contains(&image), "surface image destroyed")
            }
            DeviceEvent::BindingTableDestroyed { table } => {
                assert!(!shared_tables.contains(&table), "shared pass table destroyed")
            }
            DeviceEvent::BindingTableCreated { layout, .. } => {
                assert!(!shared_layouts.contains(&layout.as_str()), "`{layout}` recreated")
            }
            _ => {}
        }
    }
    assert_eq!(scheduler.compositor().last_weight(), Some(0.5));
}

#[test]
fn duplicate_binding_slot_is_a_contract_violation() {
    let result = BindingLayout::builder("trace")
        .slot(0, BindingKind::AccelerationStructure, vk::ShaderStageFlags::COMPUTE)
        .slot(0, BindingKind::StorageImage, vk::ShaderStageFlags::COMPUTE)
        .build();
    let error = RenderError::from(result.unwrap_err());
    assert!(error.is_contract_violation());
    assert!(matches!(
        error,
        RenderError::Contract(ContractViolation::DuplicateBinding { slot: 0, .. })
    ));
}

#[test]
fn empty_scene_renders() {
    for backend in [
        BackendKind::PathTracing,
        BackendKind::SoftwareTracing,
        BackendKind::LegacyDeferred,
    ] {
        let size = extent(128, 96);
        let (device, mut scheduler) = start(
            HeadlessConfig {
                surface_extent: size,
                ..HeadlessConfig::default()
            },
            settings(backend, size),
            Scene::empty(),
        );
        present(&mut scheduler, 3);
        assert_eq!(device.hazard_count(), 0);
    }
}

#[test]
fn missing_shader_fails_startup() {
    let device = Rc::new(HeadlessDevice::new(HeadlessConfig::default()));
    let result = FrameScheduler::new(
        device,
        RenderSettings::default(),
        ShaderLibrary::in_memory(),
        cornell_box::scene(),
    );
    match result {
        Err(RenderError::ShaderNotFound { name, .. }) => assert!(!name.is_empty()),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("startup succeeded without shaders"),
    }
}

#[test]
fn tracing_backends_need_ray_tracing_hardware() {
    let config = HeadlessConfig {
        capabilities: DeviceCapabilities {
            ray_tracing: false,
            ..DeviceCapabilities::default()
        },
        ..HeadlessConfig::default()
    };

    let device = Rc::new(HeadlessDevice::new(config.clone()));
    let result = FrameScheduler::new(
        device,
        settings(BackendKind::PathTracing, config.surface_extent),
        ShaderLibrary::placeholders(),
        cornell_box::scene(),
    );
    assert!(matches!(result, Err(RenderError::MissingCapability(_))));

    let (device, mut scheduler) = start(
        config.clone(),
        settings(BackendKind::SoftwareTracing, config.surface_extent),
        cornell_box::scene(),
    );
    present(&mut scheduler, 2);
    assert!(!device
        .events()
        .iter()
        .any(|event| matches!(event, DeviceEvent::AccelBuilt { .. })));
    assert!(matches!(
        scheduler.select_backend(BackendKind::HybridDeferred),
        Err(RenderError::MissingCapability(_))
    ));
    assert_eq!(scheduler.backend_kind(), BackendKind::SoftwareTracing);
}

#[test]
fn device_loss_is_reported() {
    let (device, mut scheduler) = cornell(BackendKind::PathTracing);
    present(&mut scheduler, 1);
    device.fail_next_submit(GpuError::DeviceLost);
    assert!(matches!(
        scheduler.render_frame(),
        Err(RenderError::Gpu(GpuError::DeviceLost))
    ));
}

#[test]
fn screenshot_writes_the_presented_image() {
    let size = extent(64, 48);
    let (_, mut scheduler) = start(
        HeadlessConfig {
            surface_extent: size,
            ..HeadlessConfig::default()
        },
        settings(BackendKind::SoftwareTracing, size),
        cornell_box::scene(),
    );
    present(&mut scheduler, 2);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("frame.png");
    scheduler.screenshot(&path).unwrap();

    let image = image::open(&path).unwrap();
    assert_eq!((image.width(), image.height()), (64, 48));
}
