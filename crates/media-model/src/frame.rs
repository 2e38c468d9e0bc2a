//! Decoded frames, audio buffers, and encoded samples.

use image::RgbaImage;
use serde::{Deserialize, Serialize};

/// A decoded (or sampled) video frame in RGBA.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    /// Presentation time in microseconds.
    pub timestamp_micros: i64,
    pub image: RgbaImage,
}

impl VideoFrame {
    pub fn new(timestamp_micros: i64, image: RgbaImage) -> Self {
        Self {
            timestamp_micros,
            image,
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// Layout of PCM audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFormat {
    pub const fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    /// 44.1 kHz stereo, the layout every compose output uses.
    pub const fn cd_stereo() -> Self {
        Self::new(44_100, 2)
    }
}

/// Interleaved f32 PCM with a presentation time.
#[derive(Debug, Clone)]
pub struct AudioBuffer {
    pub timestamp_micros: i64,
    pub format: AudioFormat,
    pub samples: Vec<f32>,
}

impl AudioBuffer {
    pub fn new(timestamp_micros: i64, format: AudioFormat, samples: Vec<f32>) -> Self {
        Self {
            timestamp_micros,
            format,
            samples,
        }
    }

    /// Number of sample frames (samples per channel).
    pub fn frames(&self) -> usize {
        self.samples.len() / self.format.channels.max(1) as usize
    }

    pub fn duration_micros(&self) -> i64 {
        self.frames() as i64 * 1_000_000 / self.format.sample_rate.max(1) as i64
    }

    /// Little-endian byte view used when piping PCM to encoders.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.samples.len() * 4);
        for sample in &self.samples {
            out.extend_from_slice(&sample.to_le_bytes());
        }
        out
    }
}

/// Which track an encoded sample belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Video,
    Audio,
}

/// One encoded access unit (a coded picture or an audio frame), tagged by
/// track. Timestamps increase within a track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodedFrame {
    Video {
        timestamp_micros: i64,
        payload: Vec<u8>,
    },
    Audio {
        timestamp_micros: i64,
        payload: Vec<u8>,
    },
}

impl EncodedFrame {
    pub fn new(track: TrackKind, timestamp_micros: i64, payload: Vec<u8>) -> Self {
        match track {
            TrackKind::Video => Self::Video {
                timestamp_micros,
                payload,
            },
            TrackKind::Audio => Self::Audio {
                timestamp_micros,
                payload,
            },
        }
    }

    pub fn track(&self) -> TrackKind {
        match self {
            Self::Video { .. } => TrackKind::Video,
            Self::Audio { .. } => TrackKind::Audio,
        }
    }

    pub fn timestamp_micros(&self) -> i64 {
        match self {
            Self::Video {
                timestamp_micros, ..
            }
            | Self::Audio {
                timestamp_micros, ..
            } => *timestamp_micros,
        }
    }

    pub fn payload(&self) -> &[u8] {
        match self {
            Self::Video { payload, .. } | Self::Audio { payload, .. } => payload,
        }
    }
}
