//! Container and codec identification.
//!
//! Formats are written the way recorders advertise them:
//! `video/webm;codecs=vp9`, `video/mp4`, `video/webm;codecs="h264,opus"`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Container family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Container {
    Webm,
    Mp4,
}

/// Video codec carried by a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    H264,
    Vp8,
    Vp9,
}

/// Error raised when a mime string cannot be understood.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormatParseError {
    #[error("unknown container type: {0}")]
    UnknownContainer(String),

    #[error("unknown video codec: {0}")]
    UnknownCodec(String),
}

/// A (container, video codec) pair.
///
/// `video_codec` is `None` when the mime carries no `codecs` parameter; the
/// container's default codec is used in that case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContainerFormat {
    pub container: Container,
    pub video_codec: Option<VideoCodec>,
}

impl ContainerFormat {
    pub const fn new(container: Container, video_codec: Option<VideoCodec>) -> Self {
        Self {
            container,
            video_codec,
        }
    }

    /// The MP4/H.264 output produced by composition and transcoding.
    pub const fn mp4_h264() -> Self {
        Self::new(Container::Mp4, Some(VideoCodec::H264))
    }

    /// Codec that will actually be encoded.
    pub fn effective_video_codec(&self) -> VideoCodec {
        match (self.video_codec, self.container) {
            (Some(codec), _) => codec,
            (None, Container::Webm) => VideoCodec::Vp8,
            (None, Container::Mp4) => VideoCodec::H264,
        }
    }

    /// Mime string as advertised to recorders and uploaders.
    pub fn mime_type(&self) -> String {
        self.to_string()
    }

    pub fn file_extension(&self) -> &'static str {
        match self.container {
            Container::Webm => "webm",
            Container::Mp4 => "mp4",
        }
    }

    /// Guess a format from a file extension.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "webm" | "mkv" => Some(Self::new(Container::Webm, None)),
            "mp4" | "m4v" | "mov" => Some(Self::new(Container::Mp4, None)),
            _ => None,
        }
    }
}

impl VideoCodec {
    fn parse(raw: &str) -> Option<Self> {
        let lower = raw.trim().to_ascii_lowercase();
        if lower == "h264" || lower.starts_with("avc1") {
            Some(Self::H264)
        } else if lower == "vp9" || lower.starts_with("vp09") {
            Some(Self::Vp9)
        } else if lower == "vp8" {
            Some(Self::Vp8)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::H264 => "h264",
            Self::Vp8 => "vp8",
            Self::Vp9 => "vp9",
        }
    }
}

impl fmt::Display for ContainerFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let base = match self.container {
            Container::Webm => "video/webm",
            Container::Mp4 => "video/mp4",
        };
        match self.video_codec {
            Some(codec) => write!(f, "{base};codecs={}", codec.as_str()),
            None => f.write_str(base),
        }
    }
}

impl FromStr for ContainerFormat {
    type Err = FormatParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(';');
        let base = parts.next().unwrap_or_default().trim().to_ascii_lowercase();
        let container = match base.as_str() {
            "video/webm" | "video/x-matroska" => Container::Webm,
            "video/mp4" => Container::Mp4,
            other => return Err(FormatParseError::UnknownContainer(other.to_string())),
        };

        let mut video_codec = None;
        for param in parts {
            let Some((key, value)) = param.split_once('=') else {
                continue;
            };
            if !key.trim().eq_ignore_ascii_case("codecs") {
                continue;
            }
            let value = value.trim().trim_matches('"');
            // Audio codecs may share the list ("vp9,opus"); the first video
            // codec decides.
            for entry in value.split(',') {
                if let Some(codec) = VideoCodec::parse(entry) {
                    video_codec = Some(codec);
                    break;
                }
            }
            if video_codec.is_none() {
                return Err(FormatParseError::UnknownCodec(value.to_string()));
            }
        }

        Ok(Self {
            container,
            video_codec,
        })
    }
}

impl TryFrom<String> for ContainerFormat {
    type Error = FormatParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ContainerFormat> for String {
    fn from(value: ContainerFormat) -> Self {
        value.to_string()
    }
}
