use std::path::{Path, PathBuf};

use ash::vk;
use clap::{Parser, ValueEnum};
use serde::Deserialize;

use crate::backend::BackendKind;
use crate::error::Result;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PresentMode {
    Immediate,
    Mailbox,
    Fifo,
    FifoRelaxed,
}

impl PresentMode {
    pub fn vk(self) -> vk::PresentModeKHR {
        match self {
            PresentMode::Immediate => vk::PresentModeKHR::IMMEDIATE,
            PresentMode::Mailbox => vk::PresentModeKHR::MAILBOX,
            PresentMode::Fifo => vk::PresentModeKHR::FIFO,
            PresentMode::FifoRelaxed => vk::PresentModeKHR::FIFO_RELAXED,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SceneChoice {
    CornellBox,
    Empty,
}

impl SceneChoice {
    pub const ALL: &'static [SceneChoice] = &[SceneChoice::CornellBox, SceneChoice::Empty];

    /// This scene and every one after it, in benchmark order.
    pub fn from_here(self) -> &'static [SceneChoice] {
        let start = Self::ALL.iter().position(|scene| *scene == self).unwrap_or(0);
        &Self::ALL[start..]
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum DeviceChoice {
    Headless,
    Vulkan,
}

/// Startup settings, read once. Values come from an optional TOML file and
/// are then overridden by the command line.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RenderSettings {
    pub backend: BackendKind,
    pub width: u32,
    pub height: u32,
    pub gpu_index: u32,
    pub present_mode: PresentMode,
    pub denoiser: bool,
    pub samples: u32,
    pub bounces: u32,
    pub max_bounces: u32,
    pub temporal_frames: u32,
    /// Bounce from which paths may be terminated by Russian roulette.
    pub russian_roulette_depth: u32,
    pub adaptive_sampling: bool,
    /// Luminance variance above which adaptive sampling adds samples.
    pub adaptive_variance: f32,
    pub adaptive_steps: u32,
    /// Trace every other pixel column each frame.
    pub checkerboard: bool,
    pub surface_images: u32,
    pub scene: SceneChoice,
    pub hdr: bool,
    pub validation: bool,
    pub shader_dir: Option<PathBuf>,
    /// Frames between statistics log lines.
    pub stats_interval: u64,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            backend: BackendKind::PathTracing,
            width: 1280,
            height: 720,
            gpu_index: 0,
            present_mode: PresentMode::Fifo,
            denoiser: true,
            samples: 8,
            bounces: 4,
            max_bounces: 10,
            temporal_frames: 64,
            russian_roulette_depth: 2,
            adaptive_sampling: false,
            adaptive_variance: 6.0,
            adaptive_steps: 8,
            checkerboard: false,
            surface_images: 3,
            scene: SceneChoice::CornellBox,
            hdr: false,
            validation: cfg!(debug_assertions),
            shader_dir: None,
            stats_interval: 120,
        }
    }
}

impl RenderSettings {
    pub fn from_toml(source: &str) -> Result<Self> {
        Ok(toml::from_str(source)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml(&source)
    }

    pub fn extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.width,
            height: self.height,
        }
    }
}

/// `<frame>=<value>` pairs used by scripted runs.
#[derive(Clone, Debug, PartialEq)]
pub struct AtFrame<T> {
    pub frame: u64,
    pub value: T,
}

fn parse_at_frame<T>(input: &str, parse: impl Fn(&str) -> Option<T>) -> Result<AtFrame<T>, String> {
    let (frame, value) = input
        .split_once('=')
        .ok_or_else(|| format!("expected <frame>=<value>, got `{input}`"))?;
    let frame = frame
        .trim()
        .parse()
        .map_err(|_| format!("`{frame}` is not a frame number"))?;
    let value = parse(value.trim()).ok_or_else(|| format!("cannot parse `{value}`"))?;
    Ok(AtFrame { frame, value })
}

fn parse_backend_switch(input: &str) -> Result<AtFrame<BackendKind>, String> {
    parse_at_frame(input, |value| BackendKind::from_str(value, true).ok())
}

fn parse_resize(input: &str) -> Result<AtFrame<vk::Extent2D>, String> {
    parse_at_frame(input, |value| {
        let (width, height) = value.split_once('x')?;
        Some(vk::Extent2D {
            width: width.parse().ok()?,
            height: height.parse().ok()?,
        })
    })
}

#[derive(Parser, Debug)]
#[command(name = "tracer")]
#[command(about = "Real-time ray traced renderer")]
pub struct Options {
    /// TOML settings file; command line values take precedence.
    #[arg(long)]
    pub settings: Option<PathBuf>,

    #[arg(long, value_enum)]
    pub backend: Option<BackendKind>,

    #[arg(long)]
    pub width: Option<u32>,

    #[arg(long)]
    pub height: Option<u32>,

    #[arg(long)]
    pub gpu_index: Option<u32>,

    #[arg(long, value_enum)]
    pub present_mode: Option<PresentMode>,

    #[arg(long)]
    pub no_denoiser: bool,

    #[arg(long)]
    pub samples: Option<u32>,

    #[arg(long)]
    pub bounces: Option<u32>,

    #[arg(long)]
    pub max_bounces: Option<u32>,

    #[arg(long)]
    pub temporal_frames: Option<u32>,

    /// Bounce from which Russian roulette may end a path.
    #[arg(long = "rr")]
    pub russian_roulette_depth: Option<u32>,

    #[arg(long, alias = "adaptivesample")]
    pub adaptive_sample: bool,

    #[arg(long)]
    pub checkerboard: bool,

    #[arg(long, value_enum)]
    pub scene: Option<SceneChoice>,

    #[arg(long)]
    pub shader_dir: Option<PathBuf>,

    #[arg(long)]
    pub validation: bool,

    #[arg(long, value_enum, default_value = "headless")]
    pub device: DeviceChoice,

    /// Frames to render before exiting.
    #[arg(long, default_value_t = 120)]
    pub frames: u64,

    /// Writes the last presented frame as PNG.
    #[arg(long)]
    pub screenshot: Option<PathBuf>,

    #[arg(long, value_parser = parse_backend_switch)]
    pub switch_backend_at: Vec<AtFrame<BackendKind>>,

    #[arg(long, value_parser = parse_resize)]
    pub resize_at: Vec<AtFrame<vk::Extent2D>>,

    /// Measures frame rate per scene instead of rendering `--frames` frames.
    #[arg(long, help_heading = "Benchmark")]
    pub benchmark: bool,

    /// Time limit per scene in seconds.
    #[arg(long, default_value_t = 10, help_heading = "Benchmark")]
    pub max_time: u32,

    /// Frame limit per scene; 0 leaves only the time limit.
    #[arg(long, default_value_t = 0, help_heading = "Benchmark")]
    pub max_frames: u64,

    /// Continues with the following scenes once a scene is done.
    #[arg(long, help_heading = "Benchmark")]
    pub next_scenes: bool,

    /// Writes a screenshot after every scene.
    #[arg(long, alias = "savefile", help_heading = "Benchmark")]
    pub save_file: bool,

    #[arg(long, default_value = "benchmark.csv", help_heading = "Benchmark")]
    pub report: PathBuf,
}

impl Options {
    pub fn settings(&self) -> Result<RenderSettings> {
        let mut settings = match &self.settings {
            Some(path) => RenderSettings::load(path)?,
            None => RenderSettings::default(),
        };

        if let Some(backend) = self.backend {
            settings.backend = backend;
        }
        if let Some(width) = self.width {
            settings.width = width;
        }
        if let Some(height) = self.height {
            settings.height = height;
        }
        if let Some(gpu_index) = self.gpu_index {
            settings.gpu_index = gpu_index;
        }
        if let Some(present_mode) = self.present_mode {
            settings.present_mode = present_mode;
        }
        if self.no_denoiser {
            settings.denoiser = false;
        }
        if let Some(samples) = self.samples {
            settings.samples = samples;
        }
        if let Some(bounces) = self.bounces {
            settings.bounces = bounces;
        }
        if let Some(max_bounces) = self.max_bounces {
            settings.max_bounces = max_bounces;
        }
        if let Some(temporal_frames) = self.temporal_frames {
            settings.temporal_frames = temporal_frames.max(1);
        }
        if let Some(depth) = self.russian_roulette_depth {
            settings.russian_roulette_depth = depth;
        }
        if self.adaptive_sample {
            settings.adaptive_sampling = true;
        }
        if self.checkerboard {
            settings.checkerboard = true;
        }
        if let Some(scene) = self.scene {
            settings.scene = scene;
        }
        if let Some(shader_dir) = &self.shader_dir {
            settings.shader_dir = Some(shader_dir.clone());
        }
        if self.validation {
            settings.validation = true;
        }
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn partial_toml_keeps_defaults() {
        let settings = RenderSettings::from_toml(
            r#"
            backend = "modern-deferred"
            width = 1920
            height = 1080
            denoiser = false
            "#,
        )
        .unwrap();
        assert_eq!(settings.backend, BackendKind::ModernDeferred);
        assert_eq!(settings.extent().width, 1920);
        assert!(!settings.denoiser);
        assert_eq!(settings.temporal_frames, 64);
    }

    #[test]
    fn unknown_key_is_an_error() {
        assert!(RenderSettings::from_toml("frobnicate = 1").is_err());
    }

    #[test]
    fn command_line_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "samples = 2\npresent_mode = \"mailbox\"").unwrap();
        let path = file.path().to_string_lossy().to_string();

        let options = Options::parse_from([
            "tracer",
            "--settings",
            path.as_str(),
            "--samples",
            "16",
            "--backend",
            "voxel-tracing",
        ]);
        let settings = options.settings().unwrap();
        assert_eq!(settings.samples, 16);
        assert_eq!(settings.present_mode, PresentMode::Mailbox);
        assert_eq!(settings.backend, BackendKind::VoxelTracing);
    }

    #[test]
    fn renderer_flags_reach_the_settings() {
        let options =
            Options::parse_from(["tracer", "--rr", "5", "--adaptivesample", "--checkerboard"]);
        let settings = options.settings().unwrap();
        assert_eq!(settings.russian_roulette_depth, 5);
        assert!(settings.adaptive_sampling);
        assert!(settings.checkerboard);

        let defaults = Options::parse_from(["tracer"]).settings().unwrap();
        assert_eq!(defaults.russian_roulette_depth, 2);
        assert!(!defaults.adaptive_sampling);
        assert!(!defaults.checkerboard);
    }

    #[test]
    fn benchmark_options_parse() {
        let options = Options::parse_from([
            "tracer",
            "--benchmark",
            "--max-time",
            "3",
            "--next-scenes",
            "--savefile",
        ]);
        assert!(options.benchmark);
        assert_eq!(options.max_time, 3);
        assert_eq!(options.max_frames, 0);
        assert!(options.next_scenes);
        assert!(options.save_file);
        assert_eq!(SceneChoice::CornellBox.from_here(), SceneChoice::ALL);
        assert_eq!(SceneChoice::Empty.from_here(), &[SceneChoice::Empty]);
    }

    #[test]
    fn scripted_events_parse() {
        let options = Options::parse_from([
            "tracer",
            "--switch-backend-at",
            "10=modern-deferred",
            "--resize-at",
            "20=1280x720",
        ]);
        assert_eq!(
            options.switch_backend_at,
            vec![AtFrame {
                frame: 10,
                value: BackendKind::ModernDeferred
            }]
        );
        assert_eq!(options.resize_at[0].frame, 20);
        assert_eq!(options.resize_at[0].value.width, 1280);
    }
}
