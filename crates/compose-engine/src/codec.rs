//! Decoder, encoder and muxer seams used by the recomposer.
//!
//! Backends implement these traits; the recomposer only ever sees frames,
//! buffers and encoded samples.

use tokio::sync::mpsc;

use synthcast_common::config::ComposeDefaults;
use synthcast_common::error::ClipResult;
use synthcast_media_model::{AudioBuffer, AudioFormat, EncodedFrame, RawContainer, VideoFrame};

/// Where encoders deliver their output. One channel is shared by both
/// encoders, so the muxer sees samples in arrival order.
pub type EncodedFrameSink = mpsc::Sender<EncodedFrame>;

/// What the decoder should produce.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodeOptions {
    /// Video is resampled to this constant rate.
    pub frame_rate: u32,
    /// Audio is converted to this layout.
    pub audio_format: AudioFormat,
}

/// A recording opened for decoding.
pub struct DecodedSource {
    pub width: u32,
    pub height: u32,
    /// Source duration, when the container reports one.
    pub duration_micros: Option<i64>,
    pub video: Box<dyn VideoFrameReader>,
    /// Independent audio extraction of the same source; `None` when the
    /// source has no audio track.
    pub audio: Option<Box<dyn AudioBufferReader>>,
}

impl std::fmt::Debug for DecodedSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodedSource")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("duration_micros", &self.duration_micros)
            .field("has_audio", &self.audio.is_some())
            .finish()
    }
}

#[async_trait::async_trait]
pub trait VideoFrameReader: Send {
    /// Next decoded frame, or `None` at end of stream.
    async fn next_frame(&mut self) -> ClipResult<Option<VideoFrame>>;
}

#[async_trait::async_trait]
pub trait AudioBufferReader: Send {
    /// Next decoded buffer, or `None` at end of stream.
    async fn next_buffer(&mut self) -> ClipResult<Option<AudioBuffer>>;

    /// Stop reading early; pending data is discarded.
    async fn cancel(&mut self);
}

/// Opens recordings for decoding.
#[async_trait::async_trait]
pub trait MediaDecoder: Send + Sync {
    /// Fails with `DecodeFailure` when the container cannot be read.
    async fn open(&self, raw: &RawContainer, options: &DecodeOptions)
        -> ClipResult<DecodedSource>;
}

/// Video encoder parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoEncoderConfig {
    /// Codec string, e.g. `avc1.42001f` (H.264 baseline, level 3.1).
    pub codec: String,
    pub width: u32,
    pub height: u32,
    pub bitrate: u32,
    pub frame_rate: u32,
}

/// Audio encoder parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioEncoderConfig {
    /// Codec string, e.g. `mp4a.40.2` (AAC-LC).
    pub codec: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub bitrate: u32,
}

/// Target container parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct MuxTarget {
    pub mime_type: String,
    pub frame_rate: u32,
    pub video: VideoEncoderConfig,
    pub audio: Option<AudioEncoderConfig>,
    /// Move the index to the front for progressive playback.
    pub fast_start: bool,
}

impl MuxTarget {
    /// MP4 with H.264 baseline video and AAC-LC audio.
    pub fn mp4(width: u32, height: u32, with_audio: bool, defaults: &ComposeDefaults) -> Self {
        let video = VideoEncoderConfig {
            codec: "avc1.42001f".to_string(),
            width,
            height,
            bitrate: defaults.video_bitrate,
            frame_rate: defaults.fps.max(1),
        };
        let audio = with_audio.then(|| AudioEncoderConfig {
            codec: "mp4a.40.2".to_string(),
            sample_rate: defaults.audio_sample_rate,
            channels: defaults.audio_channels,
            bitrate: defaults.audio_bitrate,
        });
        Self {
            mime_type: "video/mp4".to_string(),
            frame_rate: defaults.fps.max(1),
            video,
            audio,
            fast_start: true,
        }
    }
}

#[async_trait::async_trait]
pub trait VideoEncoder: Send {
    /// Submit a frame. Output goes to the sink given at creation.
    async fn encode(&mut self, frame: VideoFrame) -> ClipResult<()>;

    /// Emit everything still buffered.
    async fn flush(&mut self) -> ClipResult<()>;

    /// Release the encoder and its sink.
    async fn close(&mut self) -> ClipResult<()>;
}

#[async_trait::async_trait]
pub trait AudioEncoder: Send {
    async fn encode(&mut self, buffer: AudioBuffer) -> ClipResult<()>;

    async fn flush(&mut self) -> ClipResult<()>;

    async fn close(&mut self) -> ClipResult<()>;
}

/// Appends encoded samples and produces the final container.
#[async_trait::async_trait]
pub trait Muxer: Send {
    async fn append(&mut self, frame: EncodedFrame) -> ClipResult<()>;

    /// Write the container and return its bytes. An empty input yields a
    /// minimal (possibly empty) container.
    async fn finalize(&mut self) -> ClipResult<Vec<u8>>;
}

/// Creates the encoder and muxer family for one compose call.
pub trait CodecFactory: Send + Sync {
    /// Fails with `EncoderConfigRejected` for unsupported settings.
    fn video_encoder(
        &self,
        config: &VideoEncoderConfig,
        sink: EncodedFrameSink,
    ) -> ClipResult<Box<dyn VideoEncoder>>;

    fn audio_encoder(
        &self,
        config: &AudioEncoderConfig,
        sink: EncodedFrameSink,
    ) -> ClipResult<Box<dyn AudioEncoder>>;

    fn muxer(&self, target: &MuxTarget) -> ClipResult<Box<dyn Muxer>>;
}
