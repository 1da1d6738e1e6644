//! Application configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{LivemixError, LivemixResult};

/// Global application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Output canvas of the compositor.
    pub canvas: CanvasConfig,

    /// Capture sources and the contract they are forced to.
    pub capture: CaptureConfig,

    /// Local render branch.
    pub playback: PlaybackConfig,

    /// Encode and publish branch.
    pub publish: PublishConfig,

    /// Logging configuration.
    pub logging: LoggingConfig,
}

/// Compositor canvas.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CanvasConfig {
    pub width: u32,
    pub height: u32,

    /// Background layer: "checker", "black", "white" or "transparent".
    pub background: String,
}

/// Capture sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Pixel layout every source is forced to (e.g. "I420").
    pub format: String,
    pub width: u32,
    pub height: u32,
    pub framerate_num: u32,
    pub framerate_den: u32,

    /// One entry per capture stage.
    pub sources: Vec<SourceConfig>,
}

/// A single synthetic capture source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Test pattern name (e.g. "smpte", "ball", "snow").
    pub pattern: String,

    /// Placement offset on the canvas.
    pub x: i32,
    pub y: i32,
}

/// Local render branch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    pub queue_max_buffers: u32,
    pub queue_leaky: bool,

    /// Present frames against the pipeline clock.
    pub sync: bool,

    /// Optional image snapshot of the last rendered frame, written at
    /// shutdown. The format follows the file extension (`.png`, `.ppm`).
    pub snapshot: Option<PathBuf>,
}

/// Encode and publish branch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    /// Destination URI. Usually given on the command line.
    pub location: Option<String>,

    pub queue_max_buffers: u32,
    pub queue_leaky: bool,

    /// Target bitrate in kbit/s.
    pub bitrate_kbps: u32,

    /// Maximum distance between keyframes, in frames.
    pub key_int_max: u32,

    pub speed_preset: String,
    pub tune: String,
    pub sync: bool,

    /// Upper bound for connecting to the endpoint while entering Playing.
    pub connect_timeout_ms: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "livemix=debug,warn").
    pub level: String,

    /// Whether to output structured JSON logs.
    pub json: bool,

    /// Optional log file path.
    pub file: Option<PathBuf>,
}

impl Default for CanvasConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 360,
            background: "black".to_string(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            format: "I420".to_string(),
            width: 640,
            height: 360,
            framerate_num: 30,
            framerate_den: 1,
            sources: vec![
                SourceConfig { pattern: "smpte".to_string(), x: 0, y: 0 },
                SourceConfig { pattern: "smpte".to_string(), x: 640, y: 0 },
                SourceConfig { pattern: "smpte".to_string(), x: 360, y: 360 },
            ],
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            pattern: "smpte".to_string(),
            x: 0,
            y: 0,
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            queue_max_buffers: 5,
            queue_leaky: true,
            sync: false,
            snapshot: None,
        }
    }
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            location: None,
            queue_max_buffers: 5,
            queue_leaky: true,
            bitrate_kbps: 3000,
            key_int_max: 15,
            speed_preset: "ultrafast".to_string(),
            tune: "zerolatency".to_string(),
            sync: false,
            connect_timeout_ms: 5000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file: None,
        }
    }
}

impl AppConfig {
    /// Load config from the standard location, falling back to defaults.
    pub fn load() -> Self {
        let config_path = config_file_path();
        if config_path.exists() {
            match Self::load_from(&config_path) {
                Ok(config) => return config,
                Err(e) => {
                    tracing::warn!("Failed to load config at {:?}: {}", config_path, e);
                }
            }
        }
        Self::default()
    }

    /// Load config from an explicit path. Missing fields take defaults.
    pub fn load_from(path: &Path) -> LivemixResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            LivemixError::config(format!("Failed to read config {}: {e}", path.display()))
        })?;
        let config = serde_json::from_str(&content)?;
        Ok(config)
    }
}

/// Standard config file location.
pub fn config_file_path() -> PathBuf {
    let base = std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".config")
        });
    base.join("livemix").join("config.json")
}
