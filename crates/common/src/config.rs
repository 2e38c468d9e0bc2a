//! Application configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{ClipError, ClipResult};

/// Global application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Live capture settings.
    pub recording: RecordingDefaults,

    /// Client-side overlay recomposition settings.
    pub compose: ComposeDefaults,

    /// Server-side transcode settings.
    pub transcode: TranscodeDefaults,

    /// Logging configuration.
    pub logging: LoggingConfig,
}

/// Default live recording parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingDefaults {
    /// Rate at which the visual surface is sampled.
    pub fps: u32,

    /// Target video bitrate handed to the recorder.
    pub video_bits_per_second: u32,

    /// Interval at which the recorder emits chunks.
    pub chunk_interval_ms: u64,

    /// Ordered mime preferences; first supported entry wins.
    pub format_preferences: Vec<String>,
}

/// Overlay placement shared by the client compositor and the transcoder.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    /// Overlay width as a fraction of the target frame width.
    pub width_fraction: f64,

    /// Distance from the top and right edges in pixels.
    pub margin_px: u32,
}

/// Default recomposition parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ComposeDefaults {
    pub video_bitrate: u32,
    pub fps: u32,
    pub audio_bitrate: u32,
    pub audio_sample_rate: u32,
    pub audio_channels: u16,
    pub overlay: OverlayConfig,

    /// ffmpeg binary used by the compose backend.
    pub ffmpeg_path: PathBuf,
}

/// Server-side transcode parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscodeDefaults {
    /// Output width every upload is scaled to.
    pub canonical_width: u32,

    /// Directory overlay paths are resolved against.
    pub public_dir: PathBuf,

    pub ffmpeg_path: PathBuf,
    pub preset: String,
    pub profile: String,
    pub level: String,
    pub audio_bitrate: String,
    pub overlay: OverlayConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "synthcast=debug,warn").
    pub level: String,

    /// Whether to output structured JSON logs.
    pub json: bool,

    /// Optional log file path.
    pub file: Option<PathBuf>,
}

impl Default for RecordingDefaults {
    fn default() -> Self {
        Self {
            fps: 60,
            video_bits_per_second: 5_000_000,
            chunk_interval_ms: 100,
            format_preferences: vec![
                "video/webm;codecs=h264".to_string(),
                "video/webm;codecs=vp9".to_string(),
                "video/webm".to_string(),
                "video/mp4".to_string(),
            ],
        }
    }
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            width_fraction: 0.15,
            margin_px: 20,
        }
    }
}

impl Default for ComposeDefaults {
    fn default() -> Self {
        Self {
            video_bitrate: 4_000_000,
            fps: 60,
            audio_bitrate: 128_000,
            audio_sample_rate: 44_100,
            audio_channels: 2,
            overlay: OverlayConfig::default(),
            ffmpeg_path: PathBuf::from("ffmpeg"),
        }
    }
}

impl Default for TranscodeDefaults {
    fn default() -> Self {
        Self {
            canonical_width: 1080,
            public_dir: PathBuf::from("public"),
            ffmpeg_path: PathBuf::from("ffmpeg"),
            preset: "veryfast".to_string(),
            profile: "main".to_string(),
            level: "4.1".to_string(),
            audio_bitrate: "128k".to_string(),
            overlay: OverlayConfig::default(),
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
        Self::load_from(&config_file_path())
    }

    /// Load config from an explicit path, falling back to defaults.
    pub fn load_from(config_path: &Path) -> Self {
        if config_path.exists() {
            match std::fs::read_to_string(config_path) {
                Ok(content) => match serde_json::from_str(&content) {
                    Ok(config) => return config,
                    Err(e) => {
                        tracing::warn!("Failed to parse config at {:?}: {}", config_path, e);
                    }
                },
                Err(e) => {
                    tracing::warn!("Failed to read config at {:?}: {}", config_path, e);
                }
            }
        }
        Self::default()
    }

    /// Reject settings the pipelines cannot run with.
    pub fn validate(&self) -> ClipResult<()> {
        if self.recording.fps == 0 || self.compose.fps == 0 {
            return Err(ClipError::config("Frame rate must be at least 1"));
        }
        if self.recording.format_preferences.is_empty() {
            return Err(ClipError::config("No recording formats configured"));
        }
        if self.compose.audio_channels == 0 || self.compose.audio_sample_rate == 0 {
            return Err(ClipError::config("Audio format needs channels and a sample rate"));
        }
        if self.transcode.canonical_width == 0 || self.transcode.canonical_width % 2 != 0 {
            return Err(ClipError::config(format!(
                "Canonical width must be even and non-zero, got {}",
                self.transcode.canonical_width
            )));
        }
        for overlay in [&self.compose.overlay, &self.transcode.overlay] {
            if !(overlay.width_fraction > 0.0 && overlay.width_fraction <= 1.0) {
                return Err(ClipError::config(format!(
                    "Overlay width fraction must be in (0, 1], got {}",
                    overlay.width_fraction
                )));
            }
        }
        Ok(())
    }

    /// Save config to the standard location.
    pub fn save(&self) -> Result<(), std::io::Error> {
        self.save_to(&config_file_path())
    }

    pub fn save_to(&self, config_path: &Path) -> Result<(), std::io::Error> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(config_path, json)
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
    base.join("synthcast").join("config.json")
}
