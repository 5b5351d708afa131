use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::align::AlignmentConfig;
use crate::detect::{DifferenceMode, RegionConfig, ThresholdMode};
use crate::error::InspectError;
use crate::frame::DEFAULT_RING_CAPACITY;
use crate::ingest::{SceneKind, SyntheticConfig, SyntheticDefect};
use crate::pipeline::ComputeLanes;
use crate::track::TrackerConfig;

const DEFAULT_TARGET_FPS: u32 = 10;
const DEFAULT_MAX_IN_FLIGHT: usize = 2;
const DEFAULT_DIFF_THRESHOLD: f32 = 40.0;
const DEFAULT_MIN_DEFECT_AREA: u64 = 16;
const DEFAULT_MORPH_RADIUS: usize = 1;
const DEFAULT_MORPH_ITERATIONS: usize = 1;
const DEFAULT_CONFIRM_FRAMES: u32 = 3;
const DEFAULT_RETIRE_FRAMES: u32 = 3;
const DEFAULT_MIN_TRACK_OVERLAP: f32 = 0.3;
const DEFAULT_FRAME_WIDTH: u32 = 640;
const DEFAULT_FRAME_HEIGHT: u32 = 480;
const DEFAULT_DEVIATION_HALF: f32 = 32.0;

const DEFAULT_SOURCE_URL: &str = "stub://line_camera";
const DEFAULT_PRODUCT_ID: &str = "synthetic-part";
const DEFAULT_BLOCK_SIZE: u32 = 8;
const DEFAULT_SCENE_SEED: u64 = 7;
const DEFAULT_UNIFORM_LEVEL: u8 = 128;
const DEFAULT_HEALTH_LOG_SECS: u64 = 10;

// ---- Pipeline configuration ----

/// Runtime parameters of the inspection pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub target_fps: u32,
    pub max_in_flight_frames: usize,
    pub ring_buffer_capacity: usize,
    pub threshold: ThresholdMode,
    pub min_defect_area: u64,
    pub morph_kernel_radius: usize,
    pub morph_iterations: usize,
    pub confirm_frame_count: u32,
    pub retire_frame_count: u32,
    /// Minimum bounding-box IoU for a region to continue a tracked defect.
    pub min_track_overlap: f32,
    /// Expected frame size; frames and profiles of any other size are rejected.
    pub frame_width: u32,
    pub frame_height: u32,
    pub difference_mode: DifferenceMode,
    /// Overrides the derived per-frame deadline.
    pub frame_deadline_ms: Option<u64>,
    /// Frame workers; defaults to `max_in_flight_frames`.
    pub worker_threads: Option<usize>,
    /// Threads for tile-parallel stages; defaults to available parallelism.
    pub tile_threads: Option<usize>,
    /// Feature/RANSAC tuning, including `max_reprojection_error`.
    pub alignment: AlignmentConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            target_fps: DEFAULT_TARGET_FPS,
            max_in_flight_frames: DEFAULT_MAX_IN_FLIGHT,
            ring_buffer_capacity: DEFAULT_RING_CAPACITY,
            threshold: ThresholdMode::Fixed {
                cutoff: DEFAULT_DIFF_THRESHOLD,
            },
            min_defect_area: DEFAULT_MIN_DEFECT_AREA,
            morph_kernel_radius: DEFAULT_MORPH_RADIUS,
            morph_iterations: DEFAULT_MORPH_ITERATIONS,
            confirm_frame_count: DEFAULT_CONFIRM_FRAMES,
            retire_frame_count: DEFAULT_RETIRE_FRAMES,
            min_track_overlap: DEFAULT_MIN_TRACK_OVERLAP,
            frame_width: DEFAULT_FRAME_WIDTH,
            frame_height: DEFAULT_FRAME_HEIGHT,
            difference_mode: DifferenceMode::Absolute,
            frame_deadline_ms: None,
            worker_threads: None,
            tile_threads: None,
            alignment: AlignmentConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn alignment_max_reprojection_error(&self) -> f64 {
        self.alignment.max_reprojection_error
    }

    /// Reject parameter sets the pipeline cannot run with.
    pub fn validate(&self) -> crate::error::Result<()> {
        let invalid = |msg: String| Err(InspectError::InvalidConfig(msg));
        if self.target_fps == 0 {
            return invalid("target_fps must be >= 1".into());
        }
        if self.ring_buffer_capacity == 0 {
            return invalid("ring_buffer_capacity must be >= 1".into());
        }
        if self.max_in_flight_frames == 0 || self.max_in_flight_frames > self.ring_buffer_capacity {
            return invalid(format!(
                "max_in_flight_frames must be in 1..={} (ring_buffer_capacity)",
                self.ring_buffer_capacity
            ));
        }
        if self.confirm_frame_count == 0 || self.retire_frame_count == 0 {
            return invalid("confirm_frame_count and retire_frame_count must be >= 1".into());
        }
        if !(self.min_track_overlap > 0.0 && self.min_track_overlap <= 1.0) {
            return invalid("min_track_overlap must be in (0, 1]".into());
        }
        if self.frame_width == 0 || self.frame_height == 0 {
            return invalid("frame_width and frame_height must be non-zero".into());
        }
        if self.morph_iterations == 0 {
            return invalid("morph_iterations must be >= 1".into());
        }
        if self.frame_deadline_ms == Some(0) {
            return invalid("frame_deadline_ms must be > 0".into());
        }
        if self.worker_threads == Some(0) || self.tile_threads == Some(0) {
            return invalid("worker_threads and tile_threads must be >= 1".into());
        }
        self.threshold.validate().map_err(InspectError::InvalidConfig)?;
        self.alignment.validate().map_err(InspectError::InvalidConfig)?;
        Ok(())
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.target_fps.max(1) as f64)
    }

    /// Per-frame deadline, measured from admission: `max_in_flight_frames`
    /// frame intervals unless overridden.
    pub fn frame_deadline(&self) -> Duration {
        match self.frame_deadline_ms {
            Some(ms) => Duration::from_millis(ms),
            None => self.frame_interval() * self.max_in_flight_frames.max(1) as u32,
        }
    }

    pub fn tracker_config(&self) -> TrackerConfig {
        TrackerConfig {
            confirm_frames: self.confirm_frame_count,
            retire_frames: self.retire_frame_count,
            min_overlap: self.min_track_overlap,
        }
    }

    pub fn region_config(&self) -> RegionConfig {
        RegionConfig {
            min_defect_area: self.min_defect_area,
            area_half: (self.min_defect_area.max(1) * 4) as f32,
            deviation_half: DEFAULT_DEVIATION_HALF,
        }
    }

    /// Compute lanes sized from this config.
    pub fn lanes(&self) -> crate::error::Result<ComputeLanes> {
        let workers = self.worker_threads.unwrap_or(self.max_in_flight_frames);
        let tiles = self.tile_threads.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        });
        ComputeLanes::new(workers, tiles)
    }
}

// ---- Daemon configuration file ----

#[derive(Debug, Deserialize, Default)]
struct InspectdConfigFile {
    pipeline: Option<PipelineConfigFile>,
    source: Option<SourceConfigFile>,
    profile: Option<ProfileConfigFile>,
    health_log_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    target_fps: Option<u32>,
    max_in_flight_frames: Option<usize>,
    ring_buffer_capacity: Option<usize>,
    threshold: Option<ThresholdMode>,
    min_defect_area: Option<u64>,
    morph_kernel_radius: Option<usize>,
    morph_iterations: Option<usize>,
    alignment_max_reprojection_error: Option<f64>,
    confirm_frame_count: Option<u32>,
    retire_frame_count: Option<u32>,
    min_track_overlap: Option<f32>,
    frame_width: Option<u32>,
    frame_height: Option<u32>,
    difference_mode: Option<DifferenceMode>,
    frame_deadline_ms: Option<u64>,
    worker_threads: Option<usize>,
    tile_threads: Option<usize>,
    alignment: Option<AlignmentConfig>,
}

#[derive(Debug, Deserialize, Default)]
struct SourceConfigFile {
    url: Option<String>,
    /// "blocks" or "uniform".
    scene: Option<String>,
    level: Option<u8>,
    block_size: Option<u32>,
    seed: Option<u64>,
    quarter_turns: Option<u8>,
    defect: Option<DefectConfigFile>,
}

#[derive(Debug, Deserialize)]
struct DefectConfigFile {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
    delta: i16,
    from_frame: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct ProfileConfigFile {
    record_path: Option<PathBuf>,
    product_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct InspectdConfig {
    pub pipeline: PipelineConfig,
    pub source: SourceSettings,
    pub profile: ProfileSettings,
    pub health_log_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub url: String,
    pub scene: SceneKind,
    pub defect: Option<SyntheticDefect>,
    pub quarter_turns: u8,
}

#[derive(Debug, Clone)]
pub struct ProfileSettings {
    /// Profile record to load; when absent the synthetic source's golden
    /// sample is used.
    pub record_path: Option<PathBuf>,
    /// Product id for the synthetic golden sample.
    pub product_id: String,
}

impl InspectdConfig {
    /// Load from the file named by `INSPECT_CONFIG` (if any), then apply
    /// `INSPECT_*` overrides and validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("INSPECT_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    /// Same as `load`, with an explicit config file path.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: InspectdConfigFile) -> Result<Self> {
        let defaults = PipelineConfig::default();
        let p = file.pipeline.unwrap_or_default();
        let mut alignment = p.alignment.unwrap_or_default();
        if let Some(bound) = p.alignment_max_reprojection_error {
            alignment.max_reprojection_error = bound;
        }
        let pipeline = PipelineConfig {
            target_fps: p.target_fps.unwrap_or(defaults.target_fps),
            max_in_flight_frames: p
                .max_in_flight_frames
                .unwrap_or(defaults.max_in_flight_frames),
            ring_buffer_capacity: p
                .ring_buffer_capacity
                .unwrap_or(defaults.ring_buffer_capacity),
            threshold: p.threshold.unwrap_or(defaults.threshold),
            min_defect_area: p.min_defect_area.unwrap_or(defaults.min_defect_area),
            morph_kernel_radius: p
                .morph_kernel_radius
                .unwrap_or(defaults.morph_kernel_radius),
            morph_iterations: p.morph_iterations.unwrap_or(defaults.morph_iterations),
            confirm_frame_count: p
                .confirm_frame_count
                .unwrap_or(defaults.confirm_frame_count),
            retire_frame_count: p
                .retire_frame_count
                .unwrap_or(defaults.retire_frame_count),
            min_track_overlap: p.min_track_overlap.unwrap_or(defaults.min_track_overlap),
            frame_width: p.frame_width.unwrap_or(defaults.frame_width),
            frame_height: p.frame_height.unwrap_or(defaults.frame_height),
            difference_mode: p.difference_mode.unwrap_or(defaults.difference_mode),
            frame_deadline_ms: p.frame_deadline_ms,
            worker_threads: p.worker_threads,
            tile_threads: p.tile_threads,
            alignment,
        };

        let s = file.source.unwrap_or_default();
        let scene = match s.scene.as_deref().unwrap_or("blocks") {
            "blocks" => SceneKind::Blocks {
                block_size: s.block_size.unwrap_or(DEFAULT_BLOCK_SIZE),
                seed: s.seed.unwrap_or(DEFAULT_SCENE_SEED),
            },
            "uniform" => SceneKind::Uniform {
                level: s.level.unwrap_or(DEFAULT_UNIFORM_LEVEL),
            },
            other => return Err(anyhow!("unknown source scene {:?} (blocks|uniform)", other)),
        };
        let source = SourceSettings {
            url: s.url.unwrap_or_else(|| DEFAULT_SOURCE_URL.to_string()),
            scene,
            defect: s.defect.map(|d| SyntheticDefect {
                x: d.x,
                y: d.y,
                width: d.width,
                height: d.height,
                delta: d.delta,
                from_frame: d.from_frame.unwrap_or(1),
            }),
            quarter_turns: s.quarter_turns.unwrap_or(0),
        };

        let prof = file.profile.unwrap_or_default();
        let profile = ProfileSettings {
            record_path: prof.record_path,
            product_id: prof
                .product_id
                .unwrap_or_else(|| DEFAULT_PRODUCT_ID.to_string()),
        };

        Ok(Self {
            pipeline,
            source,
            profile,
            health_log_interval: Duration::from_secs(
                file.health_log_secs.unwrap_or(DEFAULT_HEALTH_LOG_SECS),
            ),
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(fps) = std::env::var("INSPECT_TARGET_FPS") {
            self.pipeline.target_fps = fps
                .trim()
                .parse()
                .map_err(|_| anyhow!("INSPECT_TARGET_FPS must be a positive integer"))?;
        }
        if let Ok(cutoff) = std::env::var("INSPECT_DIFF_THRESHOLD") {
            let cutoff: f32 = cutoff
                .trim()
                .parse()
                .map_err(|_| anyhow!("INSPECT_DIFF_THRESHOLD must be a number"))?;
            self.pipeline.threshold = ThresholdMode::Fixed { cutoff };
        }
        if let Ok(flag) = std::env::var("INSPECT_ADAPTIVE_THRESHOLD") {
            let adaptive = parse_flag(&flag)
                .ok_or_else(|| anyhow!("INSPECT_ADAPTIVE_THRESHOLD must be true/false/1/0"))?;
            let level = match self.pipeline.threshold {
                ThresholdMode::Fixed { cutoff } => cutoff,
                ThresholdMode::Adaptive { min_cutoff } => min_cutoff,
            };
            self.pipeline.threshold = if adaptive {
                ThresholdMode::Adaptive { min_cutoff: level }
            } else {
                ThresholdMode::Fixed { cutoff: level }
            };
        }
        if let Ok(area) = std::env::var("INSPECT_MIN_DEFECT_AREA") {
            self.pipeline.min_defect_area = area
                .trim()
                .parse()
                .map_err(|_| anyhow!("INSPECT_MIN_DEFECT_AREA must be an integer cell count"))?;
        }
        if let Ok(url) = std::env::var("INSPECT_SOURCE_URL") {
            if !url.trim().is_empty() {
                self.source.url = url;
            }
        }
        if let Ok(path) = std::env::var("INSPECT_PROFILE_PATH") {
            if !path.trim().is_empty() {
                self.profile.record_path = Some(PathBuf::from(path));
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        self.pipeline.validate()?;
        crate::profile::validate_product_id(&self.profile.product_id)?;
        if self.source.url.trim().is_empty() {
            return Err(anyhow!("source url must not be empty"));
        }
        if self.source.quarter_turns > 3 {
            return Err(anyhow!("source quarter_turns must be in 0..=3"));
        }
        if self.health_log_interval.is_zero() {
            return Err(anyhow!("health_log_secs must be greater than zero"));
        }
        Ok(())
    }

    /// Synthetic source parameters matching the configured frame size.
    pub fn synthetic_config(&self) -> SyntheticConfig {
        SyntheticConfig {
            url: self.source.url.clone(),
            width: self.pipeline.frame_width,
            height: self.pipeline.frame_height,
            target_fps: self.pipeline.target_fps,
            scene: self.source.scene,
            defect: self.source.defect,
            quarter_turns: self.source.quarter_turns,
        }
    }
}

fn read_config_file(path: &Path) -> Result<InspectdConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = if path.extension().and_then(|e| e.to_str()) == Some("toml") {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = PipelineConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.ring_buffer_capacity, 4);
        assert_eq!(cfg.confirm_frame_count, 3);
        assert_eq!(cfg.alignment_max_reprojection_error(), 2.0);
    }

    #[test]
    fn derived_deadline_spans_in_flight_intervals() {
        let cfg = PipelineConfig {
            target_fps: 20,
            max_in_flight_frames: 3,
            ..PipelineConfig::default()
        };
        assert_eq!(cfg.frame_interval(), Duration::from_millis(50));
        assert_eq!(cfg.frame_deadline(), Duration::from_millis(150));
        let fixed = PipelineConfig {
            frame_deadline_ms: Some(40),
            ..cfg
        };
        assert_eq!(fixed.frame_deadline(), Duration::from_millis(40));
    }

    #[test]
    fn invalid_pipeline_configs_are_rejected() {
        let cases = [
            PipelineConfig {
                target_fps: 0,
                ..PipelineConfig::default()
            },
            PipelineConfig {
                ring_buffer_capacity: 0,
                ..PipelineConfig::default()
            },
            PipelineConfig {
                max_in_flight_frames: 5,
                ..PipelineConfig::default()
            },
            PipelineConfig {
                confirm_frame_count: 0,
                ..PipelineConfig::default()
            },
            PipelineConfig {
                min_track_overlap: 0.0,
                ..PipelineConfig::default()
            },
            PipelineConfig {
                threshold: ThresholdMode::Fixed { cutoff: f32::NAN },
                ..PipelineConfig::default()
            },
        ];
        for cfg in cases {
            assert!(matches!(cfg.validate(), Err(InspectError::InvalidConfig(_))));
        }
    }

    #[test]
    fn flags_parse_loosely() {
        assert_eq!(parse_flag(" TRUE "), Some(true));
        assert_eq!(parse_flag("0"), Some(false));
        assert_eq!(parse_flag("maybe"), None);
    }
}
