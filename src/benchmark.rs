//! Frame rate measurement per scene.
//!
//! A scene runs until its frame limit is reached or, without one, until
//! the time limit has passed. Results are collected into a semicolon
//! separated report, one line per scene.

use std::fmt::Write as _;
use std::path::Path;
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::scene::SceneProvider;
use crate::scheduler::{FrameOutcome, FrameScheduler};

/// Interval between intermediate frame rate log lines.
const REPORT_PERIOD: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BenchmarkLimit {
    pub max_time: Duration,
    /// 0 leaves only the time limit.
    pub max_frames: u64,
}

impl BenchmarkLimit {
    fn reached(&self, frames: u64, elapsed: Duration) -> bool {
        if self.max_frames > 0 {
            frames >= self.max_frames
        } else {
            frames > 0 && elapsed > self.max_time
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SceneResult {
    pub index: usize,
    pub scene: String,
    pub frames: u64,
    pub seconds: f64,
}

impl SceneResult {
    pub fn fps(&self) -> f64 {
        if self.seconds > 0.0 {
            self.frames as f64 / self.seconds
        } else {
            0.0
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct BenchmarkReport {
    results: Vec<SceneResult>,
}

impl BenchmarkReport {
    pub fn push(&mut self, result: SceneResult) {
        self.results.push(result);
    }

    pub fn results(&self) -> &[SceneResult] {
        &self.results
    }

    pub fn to_csv(&self) -> String {
        let mut out = String::from("#;scene;FPS\n");
        for result in &self.results {
            let _ = writeln!(out, "{};{};{:.3}", result.index, result.scene, result.fps());
        }
        out
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_csv())?;
        log::info!("Wrote benchmark report to {}", path.display());
        Ok(())
    }
}

/// Renders the current scene until `limit` and measures presented frames.
pub fn run_scene<S: SceneProvider>(
    scheduler: &mut FrameScheduler<S>,
    index: usize,
    limit: BenchmarkLimit,
) -> Result<SceneResult> {
    let scene = scheduler.current_scene().name().to_string();
    log::info!(
        "Benchmark: scene #{} `{}` on {}",
        index,
        scene,
        scheduler.backend_kind().name()
    );

    let started = Instant::now();
    let mut period_started = started;
    let mut period_frames = 0u64;
    let mut frames = 0u64;
    while !limit.reached(frames, started.elapsed()) {
        if scheduler.render_frame()? == FrameOutcome::Presented {
            frames += 1;
            period_frames += 1;
        }
        let period = period_started.elapsed();
        if period >= REPORT_PERIOD {
            log::info!("Benchmark: {:.3} fps", period_frames as f64 / period.as_secs_f64());
            period_started = Instant::now();
            period_frames = 0;
        }
    }

    let result = SceneResult {
        index,
        scene,
        frames,
        seconds: started.elapsed().as_secs_f64(),
    };
    log::info!(
        "Benchmark: `{}` {} frames in {:.2} s, {:.3} fps",
        result.scene,
        result.frames,
        result.seconds,
        result.fps()
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RenderSettings;
    use crate::cornell_box;
    use crate::gpu::headless::{HeadlessConfig, HeadlessDevice};
    use crate::shader_library::ShaderLibrary;
    use std::rc::Rc;

    #[test]
    fn frame_limit_ends_the_scene() {
        let device = Rc::new(HeadlessDevice::new(HeadlessConfig::default()));
        let mut scheduler = FrameScheduler::new(
            device,
            RenderSettings::default(),
            ShaderLibrary::placeholders(),
            cornell_box::scene(),
        )
        .unwrap();
        let limit = BenchmarkLimit {
            max_time: Duration::from_secs(3600),
            max_frames: 5,
        };

        let result = run_scene(&mut scheduler, 0, limit).unwrap();
        assert_eq!(result.frames, 5);
        assert_eq!(result.scene, "cornell box");
        assert_eq!(scheduler.stats().presented, 5);
    }

    #[test]
    fn time_limit_needs_a_presented_frame() {
        let limit = BenchmarkLimit {
            max_time: Duration::ZERO,
            max_frames: 0,
        };
        assert!(!limit.reached(0, Duration::from_secs(1)));
        assert!(limit.reached(1, Duration::from_millis(1)));
    }

    #[test]
    fn report_lists_one_line_per_scene() {
        let mut report = BenchmarkReport::default();
        report.push(SceneResult {
            index: 0,
            scene: "cornell box".to_string(),
            frames: 300,
            seconds: 2.0,
        });
        report.push(SceneResult {
            index: 1,
            scene: "empty".to_string(),
            frames: 0,
            seconds: 0.0,
        });
        assert_eq!(report.to_csv(), "#;scene;FPS\n0;cornell box;150.000\n1;empty;0.000\n");

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.csv");
        report.write(&path).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), report.to_csv());
    }
}
