//! Error types shared across Synthcast crates.

use std::path::PathBuf;

/// Top-level error type for capture and compose operations.
#[derive(Debug, thiserror::Error)]
pub enum ClipError {
    #[error("No visual surface available to capture")]
    MissingSurface,

    #[error("No supported container/codec combination")]
    UnsupportedFormat,

    #[error("A recording is already in progress")]
    AlreadyRecording,

    #[error("Encoder configuration rejected: {message}")]
    EncoderConfigRejected { message: String },

    #[error("Decode failure: {message}")]
    DecodeFailure { message: String },

    #[error("Mux finalize failure: {message}")]
    MuxFinalizeFailure { message: String },

    #[error("Audio engine error: {message}")]
    AudioEngine { message: String },

    #[error("Transcode error: {message}")]
    Transcode { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("File not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias using ClipError.
pub type ClipResult<T> = Result<T, ClipError>;

impl ClipError {
    pub fn encoder_config(msg: impl Into<String>) -> Self {
        Self::EncoderConfigRejected {
            message: msg.into(),
        }
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        Self::DecodeFailure {
            message: msg.into(),
        }
    }

    pub fn mux(msg: impl Into<String>) -> Self {
        Self::MuxFinalizeFailure {
            message: msg.into(),
        }
    }

    pub fn audio_engine(msg: impl Into<String>) -> Self {
        Self::AudioEngine {
            message: msg.into(),
        }
    }

    pub fn transcode(msg: impl Into<String>) -> Self {
        Self::Transcode {
            message: msg.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Whether this error came out of the compose path and the caller can
    /// hand over the uncomposed recording instead.
    pub fn is_compose_failure(&self) -> bool {
        matches!(
            self,
            Self::DecodeFailure { .. }
                | Self::EncoderConfigRejected { .. }
                | Self::MuxFinalizeFailure { .. }
        )
    }
}
