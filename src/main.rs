use std::backtrace::Backtrace;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use env_logger::{Builder, Env};

use tracer::benchmark::{self, BenchmarkLimit, BenchmarkReport};
use tracer::config::{DeviceChoice, Options, RenderSettings, SceneChoice};
use tracer::cornell_box;
use tracer::gpu::headless::{HeadlessConfig, HeadlessDevice};
use tracer::gpu::DeviceContext;
use tracer::scene::Scene;
use tracer::shader_library::ShaderLibrary;
use tracer::{FrameOutcome, FrameScheduler, RenderError};

const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";
const RED: &str = "\x1b[31m";

/// The device plus, when simulated, a handle to drive its window system.
struct Device {
    context: Rc<dyn DeviceContext>,
    headless: Option<Rc<HeadlessDevice>>,
}

fn create_device(choice: DeviceChoice, settings: &RenderSettings) -> anyhow::Result<Device> {
    match choice {
        DeviceChoice::Headless => {
            let headless = Rc::new(HeadlessDevice::new(HeadlessConfig {
                surface_extent: settings.extent(),
                ..HeadlessConfig::default()
            }));
            Ok(Device {
                context: headless.clone(),
                headless: Some(headless),
            })
        }
        #[cfg(feature = "vulkan")]
        DeviceChoice::Vulkan => Ok(Device {
            context: Rc::new(tracer::gpu::vulkan::VulkanDevice::new(settings)?),
            headless: None,
        }),
        #[cfg(not(feature = "vulkan"))]
        DeviceChoice::Vulkan => {
            anyhow::bail!("this build has no Vulkan support; rebuild with `--features vulkan`")
        }
    }
}

fn shader_library(settings: &RenderSettings, choice: DeviceChoice) -> ShaderLibrary {
    match (&settings.shader_dir, choice) {
        (Some(dir), _) => ShaderLibrary::from_directory(dir),
        // The simulated device never compiles shader code.
        (None, DeviceChoice::Headless) => ShaderLibrary::placeholders(),
        (None, DeviceChoice::Vulkan) => ShaderLibrary::from_directory("shaders"),
    }
}

fn load_scene(choice: SceneChoice) -> Scene {
    match choice {
        SceneChoice::CornellBox => cornell_box::scene(),
        SceneChoice::Empty => Scene::empty(),
    }
}

fn run_benchmark(
    options: &Options,
    mut scheduler: FrameScheduler<Scene>,
    first: SceneChoice,
) -> anyhow::Result<()> {
    let scenes = if options.next_scenes {
        first.from_here()
    } else {
        std::slice::from_ref(&first)
    };
    let limit = BenchmarkLimit {
        max_time: Duration::from_secs(u64::from(options.max_time)),
        max_frames: options.max_frames,
    };

    let mut report = BenchmarkReport::default();
    for (index, choice) in scenes.iter().enumerate() {
        if index > 0 {
            scheduler.load_scene(load_scene(*choice));
        }
        let result = benchmark::run_scene(&mut scheduler, index, limit)?;
        if options.save_file {
            let path = PathBuf::from(format!("{}.png", result.scene.replace(' ', "-")));
            scheduler.screenshot(&path)?;
        }
        report.push(result);
    }
    report.write(&options.report)?;
    Ok(())
}

fn run(options: Options) -> anyhow::Result<()> {
    let settings = options.settings().context("reading settings")?;
    let device = create_device(options.device, &settings)?;
    let shaders = shader_library(&settings, options.device);
    let first = settings.scene;

    let mut scheduler = FrameScheduler::new(device.context, settings, shaders, load_scene(first))?;
    if options.benchmark {
        return run_benchmark(&options, scheduler, first);
    }
    let mut presented = 0;
    for frame in 0..options.frames {
        for switch in options.switch_backend_at.iter().filter(|switch| switch.frame == frame) {
            scheduler.select_backend(switch.value)?;
        }
        for resize in options.resize_at.iter().filter(|resize| resize.frame == frame) {
            match &device.headless {
                // The simulated surface reports the new size on the next acquire.
                Some(headless) => headless.resize_surface(resize.value),
                None => scheduler.resize(resize.value),
            }
        }
        if scheduler.render_frame()? == FrameOutcome::Presented {
            presented += 1;
        }
    }

    let stats = scheduler.stats();
    log::info!(
        "Presented {} of {} frames ({} surface rebuilds, {:.2} ms average)",
        presented,
        options.frames,
        stats.surface_rebuilds,
        stats.average_frame_ms
    );
    if let Some(path) = &options.screenshot {
        scheduler.screenshot(path)?;
    }
    Ok(())
}

fn report(error: &anyhow::Error) {
    let heading = match error.downcast_ref::<RenderError>() {
        Some(error) if error.is_contract_violation() => "contract violation",
        _ => "fatal error",
    };
    eprintln!("{}{}{}: {}{}", BOLD, RED, heading, error, RESET);
    for cause in error.chain().skip(1) {
        eprintln!("  caused by: {}", cause);
    }
    eprintln!("\n{}", Backtrace::force_capture());
}

fn main() {
    Builder::from_env(Env::default().default_filter_or("info")).init();
    let options = Options::parse();
    if let Err(error) = run(options) {
        report(&error);
        std::process::exit(1);
    }
}
