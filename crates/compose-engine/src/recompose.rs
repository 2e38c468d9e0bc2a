//! Client-side recomposition: draw the overlay onto every frame of a
//! recording and re-encode it as MP4.
//!
//! The video loop, the audio loop and the muxer run as three futures joined
//! on the caller's task and connected by one bounded channel:
//!
//! ```text
//! video reader ─► overlay ─► video encoder ─┐
//!                                           ├─► mpsc ─► muxer ─► bytes
//! audio reader ─────────────► audio encoder ┘
//! ```
//!
//! The audio loop never runs ahead of the encoded video. Once the video
//! reaches end-of-stream, audio keeps going until its next buffer starts at
//! or after the end of the last frame, then the audio reader is cancelled.
//! The muxer finalizes once the channel closes, which only happens after
//! both encoders were flushed and closed.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use synthcast_common::clock::RecordingClock;
use synthcast_common::config::ComposeDefaults;
use synthcast_common::error::{ClipError, ClipResult};
use synthcast_media_model::{AudioFormat, EncodedFrame, FinalContainer, RawContainer};

use crate::codec::{
    AudioBufferReader, AudioEncoder, CodecFactory, DecodeOptions, DecodedSource, MediaDecoder,
    MuxTarget, Muxer, VideoEncoder, VideoFrameReader,
};
use crate::compositor::{FrameCompositor, OverlaySource};

/// Encoded samples buffered between the encoders and the muxer.
const ENCODED_QUEUE_DEPTH: usize = 32;

/// How much of the timeline the video loop has encoded, in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VideoProgress {
    /// Everything before this time is encoded and more frames may follow.
    Running(i64),
    /// End of stream. The video covers everything before this time.
    Ended(i64),
}

/// What one track loop processed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackSummary {
    pub units: u64,
    pub first_micros: Option<i64>,
    pub last_micros: Option<i64>,
}

impl TrackSummary {
    fn record(&mut self, timestamp_micros: i64) {
        self.units += 1;
        if self.first_micros.is_none() {
            self.first_micros = Some(timestamp_micros);
        }
        self.last_micros = Some(timestamp_micros);
    }
}

/// Re-encodes recordings with an overlay.
pub struct Recomposer {
    decoder: Arc<dyn MediaDecoder>,
    codecs: Arc<dyn CodecFactory>,
    defaults: ComposeDefaults,
}

impl Recomposer {
    pub fn new(
        decoder: Arc<dyn MediaDecoder>,
        codecs: Arc<dyn CodecFactory>,
        defaults: ComposeDefaults,
    ) -> Self {
        Self {
            decoder,
            codecs,
            defaults,
        }
    }

    pub fn defaults(&self) -> &ComposeDefaults {
        &self.defaults
    }

    /// Compose the overlay onto the recording.
    ///
    /// Without a usable overlay the recording is returned unchanged. Failures
    /// while decoding, encoding or muxing are returned as typed errors; the
    /// raw container is never modified.
    pub async fn compose(
        &self,
        raw: &RawContainer,
        overlay: Option<&OverlaySource>,
    ) -> ClipResult<FinalContainer> {
        let Some(source) = overlay.cloned() else {
            tracing::debug!("No overlay; passing recording through");
            return Ok(FinalContainer::passthrough(raw));
        };
        // Reading and decoding the image is blocking work.
        let overlay = match tokio::task::spawn_blocking(move || source.load()).await {
            Ok(Ok(overlay)) => overlay,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Overlay unusable; passing recording through");
                return Ok(FinalContainer::passthrough(raw));
            }
            Err(e) => {
                tracing::warn!(error = %e, "Overlay loader failed; passing recording through");
                return Ok(FinalContainer::passthrough(raw));
            }
        };

        let options = DecodeOptions {
            frame_rate: self.defaults.fps.max(1),
            audio_format: AudioFormat::new(
                self.defaults.audio_sample_rate,
                self.defaults.audio_channels,
            ),
        };
        let DecodedSource {
            width,
            height,
            duration_micros,
            video,
            audio,
        } = self.decoder.open(raw, &options).await?;
        if width == 0 || height == 0 {
            return Err(ClipError::decode(format!(
                "Decoded stream has no area ({width}x{height})"
            )));
        }

        let compositor = FrameCompositor::new(&overlay, width, &self.defaults.overlay);
        let target = MuxTarget::mp4(width, height, audio.is_some(), &self.defaults);
        tracing::info!(
            source_mime = raw.mime_type(),
            width,
            height,
            source_duration_secs = duration_micros.map(RecordingClock::micros_to_secs),
            overlay = ?compositor.placement(),
            "Recomposing recording"
        );

        let muxer = self.codecs.muxer(&target)?;
        let (sink, samples) = mpsc::channel(ENCODED_QUEUE_DEPTH);
        let video_encoder = self.codecs.video_encoder(&target.video, sink.clone())?;
        let audio_track = match (audio, &target.audio) {
            (Some(reader), Some(config)) => {
                Some((reader, self.codecs.audio_encoder(config, sink.clone())?))
            }
            _ => None,
        };
        // Only the encoders hold senders from here on.
        drop(sink);

        let frame_interval = RecordingClock::frame_interval_micros(options.frame_rate);
        let (progress, video_progress) = watch::channel(VideoProgress::Running(0));
        let (video_result, audio_result, mux_result) = tokio::join!(
            run_video(video, video_encoder, &compositor, frame_interval, progress),
            run_audio(audio_track, video_progress),
            run_muxer(muxer, samples),
        );

        let video = video_result?;
        let audio = audio_result?;
        let bytes = mux_result?;

        tracing::info!(
            frames = video.units,
            audio_buffers = audio.units,
            bytes = bytes.len(),
            "Recomposition finished"
        );
        Ok(FinalContainer::composed(bytes, target.mime_type))
    }

    /// [`compose`](Self::compose), falling back to the raw recording on any
    /// failure.
    pub async fn compose_or_passthrough(
        &self,
        raw: &RawContainer,
        overlay: Option<&OverlaySource>,
    ) -> FinalContainer {
        match self.compose(raw, overlay).await {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!(error = %e, "Recomposition failed; using raw recording");
                FinalContainer::passthrough(raw)
            }
        }
    }
}

async fn run_video(
    mut reader: Box<dyn VideoFrameReader>,
    mut encoder: Box<dyn VideoEncoder>,
    compositor: &FrameCompositor,
    frame_interval: i64,
    progress: watch::Sender<VideoProgress>,
) -> ClipResult<TrackSummary> {
    let encoded = encode_video(
        reader.as_mut(),
        encoder.as_mut(),
        compositor,
        frame_interval,
        &progress,
    )
    .await;
    // A failed video track ends the audio loop at its next buffer.
    let end = match &encoded {
        Ok(summary) => summary.last_micros.map_or(0, |last| last + frame_interval),
        Err(_) => i64::MIN,
    };
    progress.send_replace(VideoProgress::Ended(end));
    let summary = encoded?;

    encoder.flush().await?;
    encoder.close().await?;
    Ok(summary)
}

async fn encode_video(
    reader: &mut dyn VideoFrameReader,
    encoder: &mut dyn VideoEncoder,
    compositor: &FrameCompositor,
    frame_interval: i64,
    progress: &watch::Sender<VideoProgress>,
) -> ClipResult<TrackSummary> {
    let mut summary = TrackSummary::default();
    while let Some(mut frame) = reader.next_frame().await? {
        compositor.apply(&mut frame.image);
        let timestamp_micros = frame.timestamp_micros;
        summary.record(timestamp_micros);
        encoder.encode(frame).await?;
        progress.send_replace(VideoProgress::Running(timestamp_micros + frame_interval));
    }
    Ok(summary)
}

async fn run_audio(
    track: Option<(Box<dyn AudioBufferReader>, Box<dyn AudioEncoder>)>,
    mut video: watch::Receiver<VideoProgress>,
) -> ClipResult<TrackSummary> {
    let Some((mut reader, mut encoder)) = track else {
        return Ok(TrackSummary::default());
    };

    let mut summary = TrackSummary::default();
    let mut past_video_end = false;
    while let Some(buffer) = reader.next_buffer().await? {
        if !video_covers(&mut video, buffer.timestamp_micros).await {
            past_video_end = true;
            break;
        }
        summary.record(buffer.timestamp_micros);
        encoder.encode(buffer).await?;
    }
    if past_video_end {
        tracing::debug!(
            buffers = summary.units,
            last_micros = summary.last_micros,
            "Audio stopped at video end"
        );
        reader.cancel().await;
    }

    encoder.flush().await?;
    encoder.close().await?;
    Ok(summary)
}

/// Wait until the video has been encoded past `timestamp_micros` or has
/// ended. Returns whether audio starting there falls inside the video.
async fn video_covers(
    video: &mut watch::Receiver<VideoProgress>,
    timestamp_micros: i64,
) -> bool {
    loop {
        let progress = *video.borrow_and_update();
        match progress {
            VideoProgress::Ended(end) => return timestamp_micros < end,
            VideoProgress::Running(covered) if timestamp_micros < covered => return true,
            VideoProgress::Running(_) => {}
        }
        if video.changed().await.is_err() {
            return matches!(*video.borrow(), VideoProgress::Ended(end) if timestamp_micros < end);
        }
    }
}

async fn run_muxer(
    mut muxer: Box<dyn Muxer>,
    mut samples: mpsc::Receiver<EncodedFrame>,
) -> ClipResult<Vec<u8>> {
    while let Some(sample) = samples.recv().await {
        muxer.append(sample).await?;
    }
    muxer.finalize().await
}
