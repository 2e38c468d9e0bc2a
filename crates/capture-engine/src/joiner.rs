//! Binding a visual surface and an audio engine into one capturable stream.
//!
//! The video track is produced by sampling the surface on a fixed tick. The
//! audio track is produced by a tap on the engine's output node; the tap is
//! an additional destination, so live playback keeps running untouched.
//!
//! Neither side ever blocks its producer: frames and buffers are handed over
//! with `try_send` and counted as dropped when the queue is full.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use image::RgbaImage;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use synthcast_common::clock::RecordingClock;
use synthcast_common::error::{ClipError, ClipResult};
use synthcast_media_model::{AudioBuffer, AudioFormat, VideoFrame};

/// Frames buffered between the sampler and the recorder.
const VIDEO_QUEUE_DEPTH: usize = 8;

/// Audio buffers buffered between the tap and the recorder.
const AUDIO_QUEUE_DEPTH: usize = 64;

/// The renderer's drawable surface. Read-only from the capture side.
pub trait VisualSurface: Send + Sync {
    /// Current surface size in pixels.
    fn dimensions(&self) -> (u32, u32);

    /// Copy of the current contents, or `None` when nothing has been drawn yet.
    fn snapshot(&self) -> Option<RgbaImage>;
}

/// Lifecycle of the audio engine's processing graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Suspended,
    Running,
    Closed,
}

/// Identifier of a registered tap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TapId(pub u64);

/// Receiving end of a tap: where the engine copies its output.
#[derive(Debug, Clone)]
pub struct TapDestination {
    tx: mpsc::Sender<AudioBuffer>,
    counters: Arc<StreamCounters>,
}

impl TapDestination {
    /// Hand a copy of an output buffer to the recorder side.
    ///
    /// Never blocks. Returns `false` once the destination has been released,
    /// which tells the engine it may drop the tap.
    pub fn deliver(&self, buffer: AudioBuffer) -> bool {
        let frames = buffer.frames() as u64;
        match self.tx.try_send(buffer) {
            Ok(()) => {
                self.counters
                    .audio_frames
                    .fetch_add(frames, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(_)) => {
                self.counters.audio_dropped.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

/// The synthesis engine's output node, as seen by the capture side.
#[async_trait::async_trait]
pub trait AudioEngine: Send + Sync {
    fn state(&self) -> EngineState;

    /// Transition to `Running`. Must be a no-op when already running.
    async fn resume(&self) -> ClipResult<()>;

    /// Layout of the buffers the output node produces.
    fn output_format(&self) -> AudioFormat;

    /// Add a destination to the output node without touching live playback.
    ///
    /// The output node carries at most one tap: while one is registered,
    /// further calls fail with `AlreadyRecording`.
    fn connect_tap(&self, destination: TapDestination) -> ClipResult<TapId>;

    /// Remove exactly the given tap. Unknown ids are ignored.
    fn disconnect_tap(&self, tap: TapId);
}

/// Counters shared between the producers and the session.
#[derive(Debug, Default)]
pub struct StreamCounters {
    video_frames: AtomicU64,
    video_dropped: AtomicU64,
    audio_frames: AtomicU64,
    audio_dropped: AtomicU64,
}

/// Snapshot of [`StreamCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    /// Frames handed to the video track.
    pub video_frames: u64,
    /// Frames skipped because the video queue was full.
    pub video_dropped: u64,
    /// Sample frames handed to the audio track.
    pub audio_frames: u64,
    /// Buffers skipped because the audio queue was full.
    pub audio_dropped: u64,
}

impl StreamCounters {
    fn snapshot(&self) -> StreamStats {
        StreamStats {
            video_frames: self.video_frames.load(Ordering::Relaxed),
            video_dropped: self.video_dropped.load(Ordering::Relaxed),
            audio_frames: self.audio_frames.load(Ordering::Relaxed),
            audio_dropped: self.audio_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Static description of a joined stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamInfo {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub audio_format: AudioFormat,
}

/// The two track receivers, handed to a recorder.
#[derive(Debug)]
pub struct StreamTracks {
    pub info: StreamInfo,
    pub video: mpsc::Receiver<VideoFrame>,
    pub audio: mpsc::Receiver<AudioBuffer>,
}

/// A visual surface and an audio tap bound together for one session.
///
/// Dropping the stream releases it like [`StreamJoiner::unjoin`] does, so an
/// abandoned session never leaves its tap on the engine.
pub struct JoinedStream {
    tap: TapId,
    info: StreamInfo,
    tracks: Option<StreamTracks>,
    sampler_stop: Arc<AtomicBool>,
    sampler: Option<JoinHandle<()>>,
    counters: Arc<StreamCounters>,
    engine: Arc<dyn AudioEngine>,
    active_tap: Arc<Mutex<Option<TapId>>>,
    released: bool,
}

impl std::fmt::Debug for JoinedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinedStream")
            .field("tap", &self.tap)
            .field("info", &self.info)
            .field("released", &self.released)
            .finish()
    }
}

impl JoinedStream {
    pub fn tap(&self) -> TapId {
        self.tap
    }

    pub fn info(&self) -> StreamInfo {
        self.info
    }

    /// Take the track receivers. Only the first call returns them.
    pub fn take_tracks(&mut self) -> Option<StreamTracks> {
        self.tracks.take()
    }

    pub fn stats(&self) -> StreamStats {
        self.counters.snapshot()
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Stop sampling and remove the tap. Returns `false` when already released.
    fn release(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.released = true;

        self.sampler_stop.store(true, Ordering::SeqCst);
        if let Some(sampler) = self.sampler.take() {
            sampler.abort();
        }

        self.engine.disconnect_tap(self.tap);
        let mut active = self.active_tap.lock();
        if *active == Some(self.tap) {
            *active = None;
        }
        true
    }
}

impl Drop for JoinedStream {
    fn drop(&mut self) {
        if self.release() {
            tracing::warn!(tap = self.tap.0, "Joined stream dropped without unjoin; tap removed");
        }
    }
}

/// Owns the audio engine handle and the tap registration it made.
///
/// The single-tap rule lives on the engine, so two joiners over one engine
/// still cannot interleave two recordings onto the same output.
pub struct StreamJoiner {
    engine: Arc<dyn AudioEngine>,
    active_tap: Arc<Mutex<Option<TapId>>>,
}

impl StreamJoiner {
    pub fn new(engine: Arc<dyn AudioEngine>) -> Self {
        Self {
            engine,
            active_tap: Arc::new(Mutex::new(None)),
        }
    }

    pub fn engine(&self) -> &Arc<dyn AudioEngine> {
        &self.engine
    }

    pub fn active_tap(&self) -> Option<TapId> {
        *self.active_tap.lock()
    }

    /// Make sure the engine is running. Idempotent.
    pub async fn ensure_running(&self) -> ClipResult<()> {
        match self.engine.state() {
            EngineState::Running => Ok(()),
            EngineState::Closed => Err(ClipError::audio_engine("Audio engine is closed")),
            EngineState::Suspended => {
                tracing::info!("Resuming audio engine");
                self.engine.resume().await?;
                match self.engine.state() {
                    EngineState::Running => Ok(()),
                    state => Err(ClipError::audio_engine(format!(
                        "Audio engine did not start (state {state:?})"
                    ))),
                }
            }
        }
    }

    /// Bind the surface and the engine output into a [`JoinedStream`].
    ///
    /// Must be called from within a tokio runtime; the surface sampler runs
    /// as a task.
    pub async fn join(
        &self,
        visual: Arc<dyn VisualSurface>,
        frame_rate_hint: u32,
    ) -> ClipResult<JoinedStream> {
        self.ensure_running().await?;

        let (width, height) = visual.dimensions();
        if width == 0 || height == 0 {
            return Err(ClipError::MissingSurface);
        }
        let frame_rate = frame_rate_hint.max(1);

        let counters = Arc::new(StreamCounters::default());
        let (audio_tx, audio_rx) = mpsc::channel(AUDIO_QUEUE_DEPTH);
        let tap = {
            let mut active = self.active_tap.lock();
            if active.is_some() {
                return Err(ClipError::AlreadyRecording);
            }
            let tap = self.engine.connect_tap(TapDestination {
                tx: audio_tx,
                counters: Arc::clone(&counters),
            })?;
            *active = Some(tap);
            tap
        };

        let (video_tx, video_rx) = mpsc::channel(VIDEO_QUEUE_DEPTH);
        let sampler_stop = Arc::new(AtomicBool::new(false));
        let sampler = tokio::spawn(sample_surface(
            visual,
            frame_rate,
            video_tx,
            Arc::clone(&sampler_stop),
            Arc::clone(&counters),
        ));

        let info = StreamInfo {
            width,
            height,
            frame_rate,
            audio_format: self.engine.output_format(),
        };

        tracing::info!(
            tap = tap.0,
            width,
            height,
            frame_rate,
            sample_rate = info.audio_format.sample_rate,
            "Joined visual surface and audio tap"
        );

        Ok(JoinedStream {
            tap,
            info,
            tracks: Some(StreamTracks {
                info,
                video: video_rx,
                audio: audio_rx,
            }),
            sampler_stop,
            sampler: Some(sampler),
            counters,
            engine: Arc::clone(&self.engine),
            active_tap: Arc::clone(&self.active_tap),
            released: false,
        })
    }

    /// Stop sampling and remove the stream's tap. Second calls are no-ops.
    pub fn unjoin(&self, stream: &mut JoinedStream) {
        if stream.release() {
            tracing::info!(tap = stream.tap.0, "Released joined stream");
        } else {
            tracing::debug!(tap = stream.tap.0, "Stream already released");
        }
    }
}

async fn sample_surface(
    surface: Arc<dyn VisualSurface>,
    frame_rate: u32,
    frames: mpsc::Sender<VideoFrame>,
    stop: Arc<AtomicBool>,
    counters: Arc<StreamCounters>,
) {
    let interval = Duration::from_micros(RecordingClock::frame_interval_micros(frame_rate) as u64);
    let mut ticker = tokio::time::interval(interval);
    // Late ticks are skipped: the track stays constant-rate and drops frames
    // rather than duplicating them.
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let epoch = tokio::time::Instant::now();

    loop {
        ticker.tick().await;
        if stop.load(Ordering::SeqCst) {
            break;
        }
        let Some(image) = surface.snapshot() else {
            continue;
        };
        let timestamp_micros = epoch.elapsed().as_micros() as i64;
        match frames.try_send(VideoFrame::new(timestamp_micros, image)) {
            Ok(()) => {
                counters.video_frames.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(_)) => {
                counters.video_dropped.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Closed(_)) => break,
        }
    }

    tracing::debug!("Surface sampler stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::{SyntheticAudioEngine, SyntheticSurface};

    fn joiner() -> (Arc<SyntheticAudioEngine>, StreamJoiner) {
        let engine = Arc::new(SyntheticAudioEngine::new(AudioFormat::cd_stereo()));
        let joiner = StreamJoiner::new(engine.clone());
        (engine, joiner)
    }

    #[tokio::test]
    async fn test_ensure_running_is_idempotent() {
        let (engine, joiner) = joiner();
        assert_eq!(engine.state(), EngineState::Suspended);
        joiner.ensure_running().await.unwrap();
        joiner.ensure_running().await.unwrap();
        assert_eq!(engine.state(), EngineState::Running);
        assert_eq!(engine.resume_count(), 1);
    }

    #[tokio::test]
    async fn test_join_registers_single_tap() {
        let (engine, joiner) = joiner();
        let surface = Arc::new(SyntheticSurface::new(64, 36));
        let stream = joiner.join(surface.clone(), 60).await.unwrap();
        assert_eq!(engine.tap_count(), 1);
        assert_eq!(joiner.active_tap(), Some(stream.tap()));

        let second = joiner.join(surface, 60).await;
        assert!(matches!(second, Err(ClipError::AlreadyRecording)));
        assert_eq!(engine.tap_count(), 1);
    }

    #[tokio::test]
    async fn test_unjoin_twice_is_noop() {
        let (engine, joiner) = joiner();
        let surface = Arc::new(SyntheticSurface::new(64, 36));
        let mut stream = joiner.join(surface, 60).await.unwrap();

        joiner.unjoin(&mut stream);
        assert_eq!(engine.tap_count(), 0);
        assert_eq!(joiner.active_tap(), None);
        assert!(stream.is_released());

        joiner.unjoin(&mut stream);
        assert_eq!(engine.tap_count(), 0);
        assert_eq!(engine.disconnect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tap_keeps_live_playback() {
        let (engine, joiner) = joiner();
        let surface = Arc::new(SyntheticSurface::new(64, 36));
        let mut stream = joiner.join(surface, 60).await.unwrap();
        let mut tracks = stream.take_tracks().unwrap();

        let before = engine.played_buffers();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let during = engine.played_buffers();
        assert!(during > before, "live output stalled while tapped");
        assert!(tracks.audio.recv().await.is_some());

        joiner.unjoin(&mut stream);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(engine.played_buffers() > during);
        assert!(engine.playback_connected());
    }

    #[tokio::test]
    async fn test_dropped_stream_releases_tap() {
        let (engine, joiner) = joiner();
        let surface = Arc::new(SyntheticSurface::new(64, 36));
        let stream = joiner.join(surface.clone(), 60).await.unwrap();
        drop(stream);

        assert_eq!(engine.tap_count(), 0);
        assert_eq!(joiner.active_tap(), None);
        assert_eq!(engine.disconnect_count(), 1);

        let mut again = joiner.join(surface, 60).await.unwrap();
        joiner.unjoin(&mut again);
        drop(again);
        assert_eq!(engine.disconnect_count(), 2);
    }

    #[tokio::test]
    async fn test_second_joiner_on_same_engine_is_refused() {
        let (engine, first) = joiner();
        let second = StreamJoiner::new(engine.clone());
        let surface = Arc::new(SyntheticSurface::new(64, 36));

        let mut stream = first.join(surface.clone(), 60).await.unwrap();
        let refused = second.join(surface.clone(), 60).await;
        assert!(matches!(refused, Err(ClipError::AlreadyRecording)));
        assert_eq!(engine.tap_count(), 1);
        assert_eq!(second.active_tap(), None);

        first.unjoin(&mut stream);
        let mut other = second.join(surface, 60).await.unwrap();
        assert_eq!(engine.tap_count(), 1);
        second.unjoin(&mut other);
    }

    #[tokio::test]
    async fn test_zero_area_surface_is_missing() {
        let (engine, joiner) = joiner();
        let surface = Arc::new(SyntheticSurface::new(0, 360));
        let result = joiner.join(surface, 60).await;
        assert!(matches!(result, Err(ClipError::MissingSurface)));
        assert_eq!(engine.tap_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tracks_deliver_frames_and_audio() {
        let (_engine, joiner) = joiner();
        let surface = Arc::new(SyntheticSurface::new(32, 18));
        let mut stream = joiner.join(surface, 60).await.unwrap();
        let mut tracks = stream.take_tracks().unwrap();
        assert!(stream.take_tracks().is_none());

        let frame = tracks.video.recv().await.unwrap();
        assert_eq!((frame.width(), frame.height()), (32, 18));
        let buffer = tracks.audio.recv().await.unwrap();
        assert_eq!(buffer.format, AudioFormat::cd_stereo());

        joiner.unjoin(&mut stream);
    }
}
