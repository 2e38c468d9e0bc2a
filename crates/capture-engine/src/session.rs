//! Recording session management.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use synthcast_common::clock::{DriftMeasurement, RecordingClock};
use synthcast_common::config::RecordingDefaults;
use synthcast_common::error::{ClipError, ClipResult};
use synthcast_media_model::{ChunkSequence, ContainerFormat, RawContainer};

use crate::joiner::{JoinedStream, StreamInfo, StreamJoiner, StreamStats, VisualSurface};
use crate::mime::MimeNegotiator;
use crate::pipeline::{
    MediaRecorder, RecorderEvent, RecorderEventSink, RecorderFactory, RecorderOptions,
    RecorderStats,
};

/// A/V drift above this is reported at warn level when a session stops.
const DRIFT_WARN_MS: f64 = 100.0;

/// Configuration for recording sessions.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Target frame rate for surface sampling.
    pub frame_rate: u32,

    /// Video encoder bitrate.
    pub video_bits_per_second: u32,

    /// How often the recorder emits a chunk.
    pub chunk_interval: Duration,

    /// Ordered container/codec preferences.
    pub negotiator: MimeNegotiator,
}

impl SessionConfig {
    pub fn from_defaults(defaults: &RecordingDefaults) -> Self {
        Self {
            frame_rate: defaults.fps.max(1),
            video_bits_per_second: defaults.video_bits_per_second,
            chunk_interval: Duration::from_millis(defaults.chunk_interval_ms.max(1)),
            negotiator: MimeNegotiator::from_mime_strings(&defaults.format_preferences),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from_defaults(&RecordingDefaults::default())
    }
}

/// State of a recording session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No recording in progress.
    Idle,
    /// Chunks are being collected.
    Recording,
    /// Waiting for the recorder to flush its tail.
    Finalizing,
}

/// Counters reported for a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub stream: StreamStats,
    pub recorder: RecorderStats,
}

struct CollectedChunks {
    chunks: ChunkSequence,
    empty_chunks: u64,
    errors: u64,
}

struct ActiveRecording {
    format: ContainerFormat,
    stream: JoinedStream,
    recorder: Box<dyn MediaRecorder>,
    events: RecorderEventSink,
    collector: JoinHandle<CollectedChunks>,
    clock: RecordingClock,
}

/// Drives one recording at a time: join, negotiate, record, and hand back
/// the finished container.
pub struct CaptureSession {
    config: SessionConfig,
    joiner: Arc<StreamJoiner>,
    recorders: Arc<dyn RecorderFactory>,
    state: SessionState,
    active: Option<ActiveRecording>,
    last_stats: SessionStats,
}

impl CaptureSession {
    pub fn new(
        config: SessionConfig,
        joiner: Arc<StreamJoiner>,
        recorders: Arc<dyn RecorderFactory>,
    ) -> Self {
        Self {
            config,
            joiner,
            recorders,
            state: SessionState::Idle,
            active: None,
            last_stats: SessionStats::default(),
        }
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        // `stop` holds `&mut self` until it returns; seen from outside,
        // Finalizing with nothing active means that future was dropped.
        if self.state == SessionState::Finalizing && self.active.is_none() {
            return SessionState::Idle;
        }
        self.state
    }

    /// Negotiated format of the recording in progress.
    pub fn format(&self) -> Option<ContainerFormat> {
        self.active.as_ref().map(|active| active.format)
    }

    /// Live counters while recording, else those of the last recording.
    pub fn stats(&self) -> SessionStats {
        match &self.active {
            Some(active) => SessionStats {
                stream: active.stream.stats(),
                recorder: active.recorder.stats(),
            },
            None => self.last_stats.clone(),
        }
    }

    /// Start recording the surface together with the joiner's audio engine.
    ///
    /// On failure the session stays `Idle` and any tap registered on the way
    /// is removed again.
    pub async fn start(
        &mut self,
        surface: Option<Arc<dyn VisualSurface>>,
    ) -> ClipResult<ContainerFormat> {
        if self.state() != SessionState::Idle {
            return Err(ClipError::AlreadyRecording);
        }
        if self.state == SessionState::Finalizing {
            tracing::warn!("Previous stop was abandoned; its stream was released on drop");
            self.state = SessionState::Idle;
        }

        let surface = match surface {
            Some(surface) => {
                let (width, height) = surface.dimensions();
                if width == 0 || height == 0 {
                    return Err(ClipError::MissingSurface);
                }
                surface
            }
            None => return Err(ClipError::MissingSurface),
        };

        self.joiner.ensure_running().await?;
        let mut stream = self.joiner.join(surface, self.config.frame_rate).await?;

        match self.open_recorder(&mut stream) {
            Ok((format, recorder, events, collector)) => {
                tracing::info!(
                    mime = %format,
                    tap = stream.tap().0,
                    "Recording started"
                );
                self.active = Some(ActiveRecording {
                    format,
                    stream,
                    recorder,
                    events,
                    collector,
                    clock: RecordingClock::start(),
                });
                self.state = SessionState::Recording;
                Ok(format)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Recording failed to start; releasing stream");
                self.joiner.unjoin(&mut stream);
                Err(e)
            }
        }
    }

    #[allow(clippy::type_complexity)]
    fn open_recorder(
        &self,
        stream: &mut JoinedStream,
    ) -> ClipResult<(
        ContainerFormat,
        Box<dyn MediaRecorder>,
        RecorderEventSink,
        JoinHandle<CollectedChunks>,
    )> {
        let format = self
            .config
            .negotiator
            .negotiate(self.recorders.as_ref())
            .ok_or(ClipError::UnsupportedFormat)?;

        let info = stream.info();
        let options = RecorderOptions {
            width: info.width,
            height: info.height,
            frame_rate: info.frame_rate,
            audio_format: info.audio_format,
            video_bits_per_second: self.config.video_bits_per_second,
            chunk_interval: self.config.chunk_interval,
        };

        let mut recorder = self.recorders.create(&format, &options)?;
        let tracks = stream
            .take_tracks()
            .ok_or_else(|| ClipError::encoder_config("Stream tracks already taken"))?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        recorder.start(tracks, events_tx.clone()).map_err(|e| match e {
            ClipError::EncoderConfigRejected { .. } => e,
            other => ClipError::encoder_config(other.to_string()),
        })?;
        let collector = tokio::spawn(collect_chunks(events_rx));

        Ok((format, recorder, events_tx, collector))
    }

    /// Stop recording and return the finished container.
    ///
    /// Returns `None` without side effects when nothing is being recorded.
    pub async fn stop(&mut self) -> Option<RawContainer> {
        if self.state() != SessionState::Recording {
            tracing::debug!(state = ?self.state, "Stop requested while not recording");
            return None;
        }
        let mut active = self.active.take()?;
        self.state = SessionState::Finalizing;
        tracing::info!(mime = %active.format, "Finalizing recording");

        // The recorder only returns once its tail chunks are queued, so the
        // Stopped marker below is ordered after every chunk.
        if let Err(e) = active.recorder.stop().await {
            tracing::warn!(
                error = %e,
                "Recorder did not stop cleanly; keeping chunks received so far"
            );
        }
        let _ = active.events.send(RecorderEvent::Stopped);
        drop(active.events);

        let collected = match active.collector.await {
            Ok(collected) => collected,
            Err(e) => {
                tracing::warn!(error = %e, "Chunk collector failed");
                CollectedChunks {
                    chunks: ChunkSequence::new(),
                    empty_chunks: 0,
                    errors: 1,
                }
            }
        };

        let stats = SessionStats {
            stream: active.stream.stats(),
            recorder: active.recorder.stats(),
        };
        self.joiner.unjoin(&mut active.stream);
        log_drift(&stats, active.stream.info());

        let raw = collected.chunks.into_container(active.format.mime_type());
        tracing::info!(
            mime = raw.mime_type(),
            bytes = raw.len(),
            elapsed_secs = active.clock.elapsed_secs(),
            empty_chunks = collected.empty_chunks,
            recorder_errors = collected.errors,
            video_frames = stats.stream.video_frames,
            video_dropped = stats.stream.video_dropped,
            "Recording finished"
        );

        self.last_stats = stats;
        self.state = SessionState::Idle;
        Some(raw)
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            tracing::warn!(mime = %active.format, "Capture session dropped while recording");
            active.collector.abort();
            // The recorder and the joined stream release themselves on drop.
        }
    }
}

fn log_drift(stats: &SessionStats, info: StreamInfo) {
    if stats.stream.video_frames == 0 || stats.stream.audio_frames == 0 {
        return;
    }
    let drift = DriftMeasurement {
        reference_micros: RecordingClock::frame_timestamp_micros(
            stats.stream.video_frames + stats.stream.video_dropped,
            info.frame_rate,
        ),
        measured_micros: RecordingClock::sample_timestamp_micros(
            stats.stream.audio_frames,
            info.audio_format.sample_rate,
        ),
    };
    if drift.exceeds_threshold_ms(DRIFT_WARN_MS) {
        tracing::warn!(drift_ms = drift.drift_ms(), "Audio and video tracks drifted apart");
    } else {
        tracing::debug!(drift_ms = drift.drift_ms(), "A/V drift");
    }
}

async fn collect_chunks(mut events: mpsc::UnboundedReceiver<RecorderEvent>) -> CollectedChunks {
    let mut collected = CollectedChunks {
        chunks: ChunkSequence::new(),
        empty_chunks: 0,
        errors: 0,
    };

    while let Some(event) = events.recv().await {
        match event {
            RecorderEvent::Chunk(bytes) => {
                if !collected.chunks.push(bytes) {
                    collected.empty_chunks += 1;
                }
            }
            RecorderEvent::Error(message) => {
                collected.errors += 1;
                tracing::warn!(error = %message, "Recorder reported an error; continuing");
            }
            RecorderEvent::Stopped => break,
        }
    }

    collected
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.frame_rate, 60);
        assert_eq!(config.video_bits_per_second, 5_000_000);
        assert_eq!(config.chunk_interval, Duration::from_millis(100));
        assert_eq!(config.negotiator.preferences().len(), 4);
    }

    #[tokio::test]
    async fn test_collector_skips_empty_chunks_and_errors() {
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(RecorderEvent::Chunk(vec![1, 2])).unwrap();
        tx.send(RecorderEvent::Chunk(Vec::new())).unwrap();
        tx.send(RecorderEvent::Error("device lost".into())).unwrap();
        tx.send(RecorderEvent::Chunk(vec![3])).unwrap();
        tx.send(RecorderEvent::Stopped).unwrap();
        tx.send(RecorderEvent::Chunk(vec![9])).unwrap();

        let collected = collect_chunks(rx).await;
        assert_eq!(collected.chunks.len(), 2);
        assert_eq!(collected.empty_chunks, 1);
        assert_eq!(collected.errors, 1);
        assert_eq!(collected.chunks.into_container("video/webm").bytes(), &[1, 2, 3]);
    }
}
