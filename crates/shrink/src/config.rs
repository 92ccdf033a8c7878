use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// x264 presets accepted by HandBrakeCLI's `--x264-preset`
pub const X264_PRESETS: &[&str] = &[
    "ultrafast", "superfast", "veryfast", "faster", "fast",
    "medium", "slow", "slower", "veryslow", "placebo",
];

/// Longest accepted eligibility delay, a century
pub const MAX_DELAY_DAYS: f64 = 36_500.0;

/// A configuration value that failed validation
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("dotfile_skip must begin with a period, got {0:?}")]
    DotfileSkip(String),

    #[error("{field} must be a finite number {bound}, got {value}")]
    OutOfRange {
        field: &'static str,
        bound: &'static str,
        value: f64,
    },

    #[error("max_width must be between 1000 and 10000 (exclusive), got {0}")]
    MaxWidth(u32),

    #[error("encode_quality must be between 18 and 28 (inclusive), got {0}")]
    EncodeQuality(u8),

    #[error("speed {0:?} is not an x264 preset; expected one of {presets:?}", presets = X264_PRESETS)]
    Speed(String),

    #[error("extension {0:?} in {1} must begin with a period")]
    Extension(String, &'static str),

    #[error("mandatory_encode extension {0:?} is not listed in extensions")]
    MandatoryNotTracked(String),
}

/// Configuration for a shrink-video run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ShrinkConfig {
    /// Scratch directory receiving in-progress transcoder output
    pub working_path: PathBuf,
    /// Root of the trash mirror that receives replaced originals
    pub trash_path: PathBuf,
    /// Crash guard marker file
    pub running_path: PathBuf,
    /// Append-only log of evaluated files
    pub checked_path: PathBuf,
    /// Append-only log of replaced files
    pub transcoded_path: PathBuf,
    /// Append-only per-file error report
    pub error_path: PathBuf,
    /// Append-only report of outputs that are still over the threshold
    pub too_big_after_path: PathBuf,
    /// Sentinel file name that excludes a directory and its children
    pub dotfile_skip: String,
    /// Tracked video extensions, including the leading period
    pub extensions: Vec<String>,
    /// Extensions that are always re-encoded
    pub mandatory_encode: Vec<String>,
    /// Codecs that are always re-encoded
    pub mandatory_codecs: Vec<String>,
    /// Base quality threshold in bits/s per pixel
    pub threshold: f64,
    /// Added to the base threshold for video at or below 1000px wide
    pub low_res_offset: f64,
    /// Widest output the transcoder may produce
    pub max_width: u32,
    /// x264 constant quality (-q)
    pub encode_quality: u8,
    /// x264 preset
    pub speed: String,
    /// Files younger than this are left alone
    pub delay_days: f64,
    /// ffprobe binary
    pub ffprobe_bin: PathBuf,
    /// HandBrakeCLI binary
    pub handbrake_bin: PathBuf,
}

impl Default for ShrinkConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl ShrinkConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            working_path: PathBuf::from("/var/tmp/shrink-video"),
            trash_path: PathBuf::from("/var/tmp/shrink-video-trash"),
            running_path: PathBuf::from("RUNNING"),
            checked_path: PathBuf::from("checked"),
            transcoded_path: PathBuf::from("transcoded"),
            error_path: PathBuf::from("errors"),
            too_big_after_path: PathBuf::from("toobigafter"),
            dotfile_skip: ".donotshrink".to_string(),
            extensions: [".mkv", ".mp4", ".m4v", ".avi", ".mpg"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            mandatory_encode: Vec::new(),
            mandatory_codecs: vec!["hevc".to_string()],
            threshold: 2.4,
            low_res_offset: 1.0,
            max_width: 1920,
            encode_quality: 22,
            speed: "medium".to_string(),
            delay_days: 7.0,
            ffprobe_bin: PathBuf::from("ffprobe"),
            handbrake_bin: PathBuf::from("HandBrakeCLI"),
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist.
    ///
    /// The loaded configuration is normalised and validated.
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                // TOML by extension, JSON otherwise
                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    config = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                } else {
                    config = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                }
            }
        }

        config.normalize();
        config
            .validate()
            .context("Invalid configuration")?;
        Ok(config)
    }

    /// Lower-case every extension and codec so lookups are case-insensitive
    pub fn normalize(&mut self) {
        for ext in self.extensions.iter_mut().chain(self.mandatory_encode.iter_mut()) {
            *ext = ext.to_lowercase();
        }
        for codec in &mut self.mandatory_codecs {
            *codec = codec.to_lowercase();
        }
    }

    /// Check every tunable against its allowed range
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.dotfile_skip.starts_with('.') {
            return Err(ConfigError::DotfileSkip(self.dotfile_skip.clone()));
        }
        if !self.threshold.is_finite() || self.threshold <= 0.0 {
            return Err(ConfigError::OutOfRange {
                field: "threshold",
                bound: "greater than zero",
                value: self.threshold,
            });
        }
        if !self.low_res_offset.is_finite() || self.low_res_offset < 0.0 {
            return Err(ConfigError::OutOfRange {
                field: "low_res_offset",
                bound: "of at least zero",
                value: self.low_res_offset,
            });
        }
        if !self.delay_days.is_finite() || !(0.0..=MAX_DELAY_DAYS).contains(&self.delay_days) {
            return Err(ConfigError::OutOfRange {
                field: "delay_days",
                bound: "between 0 and 36500",
                value: self.delay_days,
            });
        }
        if self.max_width <= 1000 || self.max_width >= 10000 {
            return Err(ConfigError::MaxWidth(self.max_width));
        }
        if !(18..=28).contains(&self.encode_quality) {
            return Err(ConfigError::EncodeQuality(self.encode_quality));
        }
        if !X264_PRESETS.contains(&self.speed.as_str()) {
            return Err(ConfigError::Speed(self.speed.clone()));
        }
        if let Some(ext) = self.extensions.iter().find(|e| !e.starts_with('.')) {
            return Err(ConfigError::Extension(ext.clone(), "extensions"));
        }
        if let Some(ext) = self.mandatory_encode.iter().find(|e| !e.starts_with('.')) {
            return Err(ConfigError::Extension(ext.clone(), "mandatory_encode"));
        }
        if let Some(ext) = self
            .mandatory_encode
            .iter()
            .find(|e| !self.extensions.contains(e))
        {
            return Err(ConfigError::MandatoryNotTracked(ext.clone()));
        }
        Ok(())
    }

    /// Delay before a new file becomes eligible
    pub fn delay(&self) -> chrono::Duration {
        chrono::Duration::milliseconds((self.delay_days * 86_400_000.0) as i64)
    }

    /// Anchor relative state and directory paths at `base` so they do not
    /// depend on the working directory of the run
    pub fn resolve_paths(&mut self, base: &Path) {
        for path in [
            &mut self.working_path,
            &mut self.trash_path,
            &mut self.running_path,
            &mut self.checked_path,
            &mut self.transcoded_path,
            &mut self.error_path,
            &mut self.too_big_after_path,
        ] {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
    }
}
