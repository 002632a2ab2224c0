//! Runtime configuration.
//!
//! Every field has a default so an empty JSON object is a valid config.
//! Device choices are deliberately absent: selections live only for the
//! duration of a session.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Level meter analysis settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeterConfig {
    /// Analysis window in samples (power of two)
    pub fft_size: usize,

    /// Time between ticks in milliseconds (16ms is roughly one frame at 60Hz)
    pub tick_interval_ms: u64,

    /// Weight of the previous frame when smoothing bin magnitudes (0 disables)
    pub smoothing: f32,

    /// Magnitude mapped to 0.0
    pub min_decibels: f32,

    /// Magnitude mapped to 1.0
    pub max_decibels: f32,
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            fft_size: 256,
            tick_interval_ms: 16,
            smoothing: 0.8,
            min_decibels: -100.0,
            max_decibels: -30.0,
        }
    }
}

impl MeterConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.fft_size.is_power_of_two() || !(32..=32768).contains(&self.fft_size) {
            return Err(ConfigError::Invalid {
                field: "meter.fft_size",
                reason: format!("{} is not a power of two in 32..=32768", self.fft_size),
            });
        }
        if !(0.0..1.0).contains(&self.smoothing) {
            return Err(ConfigError::Invalid {
                field: "meter.smoothing",
                reason: format!("{} is outside [0, 1)", self.smoothing),
            });
        }
        if self.min_decibels >= self.max_decibels {
            return Err(ConfigError::Invalid {
                field: "meter.max_decibels",
                reason: "must be greater than min_decibels".to_string(),
            });
        }
        Ok(())
    }
}

/// Test tone played by the output router.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToneConfig {
    pub frequency_hz: f32,
    pub duration_ms: u64,
    pub sample_rate: u32,
    /// Peak amplitude (0.0 to 1.0)
    pub amplitude: f32,
    /// Fade in/out length to avoid clicks
    pub fade_ms: u64,
}

impl Default for ToneConfig {
    fn default() -> Self {
        Self {
            frequency_hz: 440.0,
            duration_ms: 1000,
            sample_rate: 48_000,
            amplitude: 0.5,
            fade_ms: 10,
        }
    }
}

impl ToneConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_rate == 0 {
            return Err(ConfigError::Invalid {
                field: "tone.sample_rate",
                reason: "must be positive".to_string(),
            });
        }
        if self.frequency_hz <= 0.0 || self.frequency_hz >= self.sample_rate as f32 / 2.0 {
            return Err(ConfigError::Invalid {
                field: "tone.frequency_hz",
                reason: format!("{} is outside (0, nyquist)", self.frequency_hz),
            });
        }
        if self.amplitude <= 0.0 || self.amplitude > 1.0 {
            return Err(ConfigError::Invalid {
                field: "tone.amplitude",
                reason: format!("{} is outside (0, 1]", self.amplitude),
            });
        }
        if self.duration_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "tone.duration_ms",
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }
}

/// Stream session policy switches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Retry a kind with default constraints when its exact device id is gone
    pub fallback_to_default: bool,

    /// Fill empty selections with the first device of each kind after a refresh
    pub auto_select_first: bool,

    /// Stop live tracks whose device vanished from the catalog
    pub release_vanished_tracks: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            fallback_to_default: true,
            auto_select_first: false,
            release_vanished_tracks: true,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreflightConfig {
    pub meter: MeterConfig,
    pub tone: ToneConfig,
    pub session: SessionConfig,

    /// tracing filter directive, e.g. "media_preflight_rs=debug"
    pub log_filter: Option<String>,
}

impl PreflightConfig {
    /// Load and validate a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.meter.validate()?;
        self.tone.validate()
    }
}
