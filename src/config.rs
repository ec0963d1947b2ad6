use crate::error::ConfigError;
use crate::geometry::Vec2;
use clap::{Parser, ValueEnum};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Detection-driven stick assist for a virtual gamepad (Linux uinput/evdev).
/// Reads raw grayscale frames, tracks the brightest target and steers a
/// virtual stick toward it while mapping is enabled.
#[derive(Parser, Debug)]
#[command(name = "aimlink")]
pub struct Cli {
    /// Assist config file (TOML). Reloaded on `aimlink reload`.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Raw 8-bit grayscale frame feed: file, FIFO, or `-` for stdin
    #[arg(short, long, default_value = "-")]
    pub frames: String,

    /// Frame width in pixels
    #[arg(long, default_value_t = 1920)]
    pub width: u32,

    /// Frame height in pixels
    #[arg(long, default_value_t = 1080)]
    pub height: u32,

    /// Brightness threshold (0-255) for the bright-spot detector
    #[arg(long, default_value_t = 200)]
    pub threshold: u8,

    /// Tick rate preset
    #[arg(long, value_enum, default_value_t = Profile::Balanced)]
    pub profile: Profile,

    /// Control tick period in microseconds; overrides the profile
    #[arg(long)]
    pub tick_us: Option<u64>,

    /// Sensitivity override (gain multiplier)
    #[arg(short, long)]
    pub sensitivity: Option<f32>,

    /// Dead-zone radius override in pixels
    #[arg(long)]
    pub dead_zone: Option<f32>,

    /// Output to left stick (ABS_X/ABS_Y) instead of right stick (ABS_RX/ABS_RY)
    #[arg(long, default_value_t = false)]
    pub left_stick: bool,

    /// Invert Y axis
    #[arg(long, default_value_t = false)]
    pub invert_y: bool,

    /// Start the system (Armed) immediately
    #[arg(long, default_value_t = false)]
    pub start: bool,

    /// Start the system and enable mapping (Active) immediately
    #[arg(long, default_value_t = false)]
    pub enable: bool,

    /// Print debug diagnostics every 100 ticks (target, output, mode)
    #[arg(long, default_value_t = false)]
    pub debug: bool,
}

/// Control loop rate presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Profile {
    /// 250 Hz
    UltraLowLatency,
    /// 200 Hz
    Balanced,
    /// 125 Hz
    PowerSaver,
}

impl Profile {
    pub fn tick_us(self) -> u64 {
        match self {
            Profile::UltraLowLatency => 4000,
            Profile::Balanced => 5000,
            Profile::PowerSaver => 8000,
        }
    }
}

impl Cli {
    /// Tick period in microseconds, never zero.
    pub fn tick_us(&self) -> u64 {
        self.tick_us.unwrap_or_else(|| self.profile.tick_us()).max(1)
    }
}

/// Tuning for the tracker and the assist controller. One immutable snapshot is
/// used per tick; see [`ConfigHandle`] for swapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssistConfig {
    /// Gain applied to the pixel offset before normalization
    pub sensitivity: f32,
    /// Offsets shorter than this (pixels) produce no input
    pub dead_zone_radius: f32,
    /// Prediction horizon in ticks for lead compensation
    pub max_lead_ticks: f32,
    /// Cap on the lead distance (pixels)
    pub max_lead_distance: f32,
    /// Largest per-axis output change allowed between ticks
    pub max_rate_per_tick: f32,
    /// Output low-pass factor in (0, 1]
    pub smoothing_alpha: f32,
    /// Tracker position smoothing factor in (0, 1]
    pub tracking_alpha: f32,
    /// Detections farther than this from the aim point are ignored
    pub fov_radius: f32,
    /// Ticks a target may go unseen before it is dropped
    pub staleness_threshold: u32,
    /// Scaled offset (pixels) that maps to full stick deflection
    pub output_range: f32,
    /// Aim reference point in frame coordinates
    pub aim_point: Vec2,
    /// Consecutive detector failures tolerated before the loop stops
    pub detector_failure_limit: u32,
}

impl Default for AssistConfig {
    fn default() -> Self {
        Self {
            sensitivity: 1.0,
            dead_zone_radius: 4.0,
            max_lead_ticks: 2.0,
            max_lead_distance: 40.0,
            max_rate_per_tick: 0.25,
            smoothing_alpha: 0.5,
            tracking_alpha: 0.6,
            fov_radius: 200.0,
            staleness_threshold: 12,
            output_range: 100.0,
            aim_point: Vec2::new(960.0, 540.0),
            detector_failure_limit: 500,
        }
    }
}

impl AssistConfig {
    /// Load and validate a TOML config file. Missing fields take defaults,
    /// except `aim_point`, which falls back to `frame_center`.
    pub fn load(path: &Path, frame_center: Vec2) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_toml(&text, frame_center).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.display().to_string(),
                source,
            },
            other => other,
        })?;
        Ok(config)
    }

    pub fn from_toml(text: &str, frame_center: Vec2) -> Result<Self, ConfigError> {
        let parse_error = |source: toml::de::Error| ConfigError::Parse {
            path: "<inline>".into(),
            source,
        };
        let table: toml::Table = toml::from_str(text).map_err(parse_error)?;
        let has_aim_point = table.contains_key("aim_point");
        let mut config: AssistConfig = toml::Value::Table(table).try_into().map_err(parse_error)?;
        if !has_aim_point {
            config.aim_point = frame_center;
        }
        config.validate()?;
        Ok(config)
    }

    /// Reject ranges the controller cannot run with. Checked at load time so
    /// the tick never has to.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let finite = [
            ("sensitivity", self.sensitivity),
            ("dead_zone_radius", self.dead_zone_radius),
            ("max_lead_ticks", self.max_lead_ticks),
            ("max_lead_distance", self.max_lead_distance),
            ("max_rate_per_tick", self.max_rate_per_tick),
            ("smoothing_alpha", self.smoothing_alpha),
            ("tracking_alpha", self.tracking_alpha),
            ("fov_radius", self.fov_radius),
            ("output_range", self.output_range),
            ("aim_point.x", self.aim_point.x),
            ("aim_point.y", self.aim_point.y),
        ];
        for (field, value) in finite {
            if !value.is_finite() {
                return Err(ConfigError::invalid(field, format!("{} is not finite", value)));
            }
        }

        if self.sensitivity <= 0.0 {
            return Err(ConfigError::invalid("sensitivity", "must be positive"));
        }
        if self.output_range <= 0.0 {
            return Err(ConfigError::invalid("output_range", "must be positive"));
        }
        for (field, alpha) in [
            ("smoothing_alpha", self.smoothing_alpha),
            ("tracking_alpha", self.tracking_alpha),
        ] {
            if alpha <= 0.0 || alpha > 1.0 {
                return Err(ConfigError::invalid(field, format!("{} not in (0, 1]", alpha)));
            }
        }
        if self.max_rate_per_tick <= 0.0 {
            return Err(ConfigError::invalid("max_rate_per_tick", "must be positive"));
        }
        for (field, value) in [
            ("dead_zone_radius", self.dead_zone_radius),
            ("max_lead_ticks", self.max_lead_ticks),
            ("max_lead_distance", self.max_lead_distance),
            ("fov_radius", self.fov_radius),
        ] {
            if value < 0.0 {
                return Err(ConfigError::invalid(field, "must not be negative"));
            }
        }
        if self.detector_failure_limit == 0 {
            return Err(ConfigError::invalid("detector_failure_limit", "must be at least 1"));
        }
        Ok(())
    }
}

/// Shared, hot-swappable config. Readers take an `Arc` snapshot; a swap
/// replaces the whole snapshot at once.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    current: Arc<RwLock<Arc<AssistConfig>>>,
}

impl ConfigHandle {
    pub fn new(config: AssistConfig) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    pub fn snapshot(&self) -> Arc<AssistConfig> {
        self.current.read().clone()
    }

    /// Validate and install a new snapshot. The old one stays on error.
    pub fn swap(&self, config: AssistConfig) -> Result<(), ConfigError> {
        config.validate()?;
        *self.current.write() = Arc::new(config);
        Ok(())
    }
}
