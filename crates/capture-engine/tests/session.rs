use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use image::{Rgba, RgbaImage};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use synthcast_capture_engine::synthetic::SyntheticAudioEngine;
use synthcast_capture_engine::{
    CaptureSession, FormatSupport, MediaRecorder, RecorderEvent, RecorderEventSink,
    RecorderFactory, RecorderOptions, RecorderStats, SessionConfig, SessionState, StreamJoiner,
    StreamTracks, VisualSurface,
};
use synthcast_common::error::{ClipError, ClipResult};
use synthcast_media_model::{AudioFormat, ContainerFormat};

/// A flat-colour canvas; cheap enough to sample at 60 fps in tests.
struct FlatSurface {
    width: u32,
    height: u32,
}

impl VisualSurface for FlatSurface {
    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn snapshot(&self) -> Option<RgbaImage> {
        Some(RgbaImage::from_pixel(
            self.width,
            self.height,
            Rgba([12, 34, 56, 255]),
        ))
    }
}

#[derive(Default)]
struct Script {
    reject_config: bool,
    error_after_first_chunk: bool,
    empty_chunk_every_tick: bool,
}

/// Records what a real recorder would see and emits one chunk per interval
/// describing the frames it consumed.
struct MockFactory {
    supported: Vec<ContainerFormat>,
    script: Script,
    emitted: Arc<Mutex<Vec<Vec<u8>>>>,
    last_options: Mutex<Option<RecorderOptions>>,
}

impl MockFactory {
    fn supporting(mimes: &[&str]) -> Self {
        Self {
            supported: mimes.iter().map(|m| m.parse().unwrap()).collect(),
            script: Script::default(),
            emitted: Arc::new(Mutex::new(Vec::new())),
            last_options: Mutex::new(None),
        }
    }

    fn with_script(mut self, script: Script) -> Self {
        self.script = script;
        self
    }

    fn emitted_non_empty(&self) -> Vec<u8> {
        self.emitted
            .lock()
            .iter()
            .filter(|c| !c.is_empty())
            .flatten()
            .copied()
            .collect()
    }
}

impl FormatSupport for MockFactory {
    fn is_type_supported(&self, format: &ContainerFormat) -> bool {
        self.supported.contains(format)
    }
}

impl RecorderFactory for MockFactory {
    fn create(
        &self,
        format: &ContainerFormat,
        options: &RecorderOptions,
    ) -> ClipResult<Box<dyn MediaRecorder>> {
        *self.last_options.lock() = Some(options.clone());
        if self.script.reject_config {
            return Err(ClipError::encoder_config("bitrate out of range"));
        }
        Ok(Box::new(MockRecorder {
            header: format.mime_type().into_bytes(),
            chunk_interval: options.chunk_interval,
            error_after_first_chunk: self.script.error_after_first_chunk,
            empty_chunk_every_tick: self.script.empty_chunk_every_tick,
            emitted: Arc::clone(&self.emitted),
            stop: None,
            worker: None,
            running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(Mutex::new(RecorderStats::default())),
        }))
    }
}

struct MockRecorder {
    header: Vec<u8>,
    chunk_interval: Duration,
    error_after_first_chunk: bool,
    empty_chunk_every_tick: bool,
    emitted: Arc<Mutex<Vec<Vec<u8>>>>,
    stop: Option<watch::Sender<bool>>,
    worker: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
    stats: Arc<Mutex<RecorderStats>>,
}

#[async_trait::async_trait]
impl MediaRecorder for MockRecorder {
    fn start(&mut self, tracks: StreamTracks, events: RecorderEventSink) -> ClipResult<()> {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let StreamTracks {
            mut video,
            mut audio,
            ..
        } = tracks;
        let mut pending = self.header.clone();
        let interval = self.chunk_interval;
        let error_after_first_chunk = self.error_after_first_chunk;
        let empty_every_tick = self.empty_chunk_every_tick;
        let emitted = Arc::clone(&self.emitted);
        let stats = Arc::clone(&self.stats);

        let error_events = events.clone();
        let emit = move |chunk: Vec<u8>| {
            let mut stats = stats.lock();
            stats.chunks_emitted += 1;
            stats.bytes_emitted += chunk.len() as u64;
            emitted.lock().push(chunk.clone());
            let _ = events.send(RecorderEvent::Chunk(chunk));
        };
        let frame_stats = Arc::clone(&self.stats);

        self.worker = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            let mut chunks = 0u32;
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    Some(_frame) = video.recv() => {
                        frame_stats.lock().video_frames += 1;
                        pending.push(b'V');
                    }
                    Some(_buffer) = audio.recv() => {
                        frame_stats.lock().audio_buffers += 1;
                        pending.push(b'A');
                    }
                    _ = ticker.tick() => {
                        if empty_every_tick {
                            emit(Vec::new());
                        }
                        emit(std::mem::take(&mut pending));
                        chunks += 1;
                        if error_after_first_chunk && chunks == 1 {
                            let _ = error_events
                                .send(RecorderEvent::Error("encoder hiccup".into()));
                        }
                    }
                }
            }
            emit(std::mem::take(&mut pending));
        }));
        self.stop = Some(stop_tx);
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&mut self) -> ClipResult<()> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(true);
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.await;
        }
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn stats(&self) -> RecorderStats {
        self.stats.lock().clone()
    }
}

struct Harness {
    engine: Arc<SyntheticAudioEngine>,
    joiner: Arc<StreamJoiner>,
    factory: Arc<MockFactory>,
}

impl Harness {
    fn new(factory: MockFactory) -> Self {
        let engine = Arc::new(SyntheticAudioEngine::new(AudioFormat::cd_stereo()));
        let joiner = Arc::new(StreamJoiner::new(engine.clone()));
        Self {
            engine,
            joiner,
            factory: Arc::new(factory),
        }
    }

    fn session(&self) -> CaptureSession {
        CaptureSession::new(
            SessionConfig::default(),
            Arc::clone(&self.joiner),
            self.factory.clone(),
        )
    }
}

fn surface(width: u32, height: u32) -> Option<Arc<dyn VisualSurface>> {
    Some(Arc::new(FlatSurface { width, height }))
}

const ALL_FORMATS: [&str; 4] = [
    "video/webm;codecs=h264",
    "video/webm;codecs=vp9",
    "video/webm",
    "video/mp4",
];

#[tokio::test(start_paused = true)]
async fn two_second_recording_yields_container() {
    let harness = Harness::new(MockFactory::supporting(&ALL_FORMATS));
    let mut session = harness.session();

    let format = session.start(surface(640, 360)).await.unwrap();
    assert_eq!(format.mime_type(), "video/webm;codecs=h264");
    assert_eq!(session.state(), SessionState::Recording);

    tokio::time::sleep(Duration::from_secs(2)).await;
    let raw = session.stop().await.unwrap();

    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(raw.mime_type(), "video/webm;codecs=h264");
    assert!(!raw.is_empty());
    assert!(raw.bytes().starts_with(b"video/webm;codecs=h264"));

    let stats = session.stats();
    assert!(
        (100..=125).contains(&stats.stream.video_frames),
        "unexpected frame count {}",
        stats.stream.video_frames
    );
    assert!(stats.stream.audio_frames > 0);
    assert!(stats.recorder.chunks_emitted >= 20);

    let options = harness.factory.last_options.lock().clone().unwrap();
    assert_eq!((options.width, options.height), (640, 360));
    assert_eq!(options.video_bits_per_second, 5_000_000);
    assert_eq!(options.chunk_interval, Duration::from_millis(100));

    assert_eq!(harness.engine.tap_count(), 0);
    assert_eq!(harness.joiner.active_tap(), None);
    assert!(harness.engine.playback_connected());
}

#[tokio::test(start_paused = true)]
async fn container_is_concatenation_of_chunks() {
    let harness = Harness::new(MockFactory::supporting(&["video/mp4"]).with_script(Script {
        empty_chunk_every_tick: true,
        ..Script::default()
    }));
    let mut session = harness.session();

    let format = session.start(surface(64, 36)).await.unwrap();
    assert_eq!(format.mime_type(), "video/mp4");
    tokio::time::sleep(Duration::from_millis(750)).await;
    let raw = session.stop().await.unwrap();

    assert_eq!(raw.mime_type(), "video/mp4");
    assert_eq!(raw.bytes(), harness.factory.emitted_non_empty().as_slice());
    assert!(harness.factory.emitted.lock().iter().any(|c| c.is_empty()));
}

#[tokio::test(start_paused = true)]
async fn start_twice_is_already_recording() {
    let harness = Harness::new(MockFactory::supporting(&ALL_FORMATS));
    let mut session = harness.session();
    session.start(surface(64, 36)).await.unwrap();

    let second = session.start(surface(64, 36)).await;
    assert!(matches!(second, Err(ClipError::AlreadyRecording)));
    assert_eq!(session.state(), SessionState::Recording);
    assert_eq!(harness.engine.tap_count(), 1);

    assert!(session.stop().await.is_some());
}

#[tokio::test(start_paused = true)]
async fn second_session_on_shared_engine_is_refused() {
    let harness = Harness::new(MockFactory::supporting(&ALL_FORMATS));
    let mut first = harness.session();
    let mut second = harness.session();

    first.start(surface(64, 36)).await.unwrap();
    let result = second.start(surface(64, 36)).await;
    assert!(matches!(result, Err(ClipError::AlreadyRecording)));
    assert_eq!(second.state(), SessionState::Idle);
    assert_eq!(harness.engine.tap_count(), 1);

    first.stop().await.unwrap();
    second.start(surface(64, 36)).await.unwrap();
    assert!(second.stop().await.is_some());
}

#[tokio::test]
async fn stop_while_idle_has_no_side_effects() {
    let harness = Harness::new(MockFactory::supporting(&ALL_FORMATS));
    let mut session = harness.session();

    assert!(session.stop().await.is_none());
    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(harness.engine.resume_count(), 0);
    assert_eq!(harness.engine.disconnect_count(), 0);
}

#[tokio::test]
async fn missing_surface_leaves_engine_untouched() {
    let harness = Harness::new(MockFactory::supporting(&ALL_FORMATS));
    let mut session = harness.session();

    let absent = session.start(None).await;
    assert!(matches!(absent, Err(ClipError::MissingSurface)));

    let zero_area = session.start(surface(0, 360)).await;
    assert!(matches!(zero_area, Err(ClipError::MissingSurface)));

    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(harness.engine.resume_count(), 0);
    assert_eq!(harness.engine.tap_count(), 0);
}

#[tokio::test]
async fn unsupported_format_unwinds_tap() {
    let harness = Harness::new(MockFactory::supporting(&[]));
    let mut session = harness.session();

    let result = session.start(surface(64, 36)).await;
    assert!(matches!(result, Err(ClipError::UnsupportedFormat)));
    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(harness.engine.tap_count(), 0);
    assert_eq!(harness.engine.disconnect_count(), 1);
    assert_eq!(harness.joiner.active_tap(), None);
    assert!(harness.factory.last_options.lock().is_none());
}

#[tokio::test]
async fn rejected_encoder_config_unwinds_tap() {
    let harness = Harness::new(MockFactory::supporting(&ALL_FORMATS).with_script(Script {
        reject_config: true,
        ..Script::default()
    }));
    let mut session = harness.session();

    let result = session.start(surface(64, 36)).await;
    assert!(matches!(result, Err(ClipError::EncoderConfigRejected { .. })));
    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(harness.engine.tap_count(), 0);
    assert_eq!(harness.joiner.active_tap(), None);
}

#[tokio::test(start_paused = true)]
async fn recorder_error_mid_session_is_not_fatal() {
    let harness = Harness::new(MockFactory::supporting(&ALL_FORMATS).with_script(Script {
        error_after_first_chunk: true,
        ..Script::default()
    }));
    let mut session = harness.session();

    session.start(surface(64, 36)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(session.state(), SessionState::Recording);

    let raw = session.stop().await.unwrap();
    assert!(!raw.is_empty());
    assert_eq!(raw.bytes(), harness.factory.emitted_non_empty().as_slice());
}

#[tokio::test(start_paused = true)]
async fn dropped_session_releases_tap_for_next_session() {
    let harness = Harness::new(MockFactory::supporting(&ALL_FORMATS));
    let mut abandoned = harness.session();
    abandoned.start(surface(64, 36)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    drop(abandoned);

    assert_eq!(harness.engine.tap_count(), 0);
    assert_eq!(harness.joiner.active_tap(), None);

    let mut next = harness.session();
    next.start(surface(64, 36)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(next.stop().await.is_some());
}

#[tokio::test(start_paused = true)]
async fn abandoned_stop_returns_session_to_idle() {
    let harness = Harness::new(MockFactory::supporting(&ALL_FORMATS));
    let mut session = harness.session();
    session.start(surface(64, 36)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    // The recorder's stop awaits its worker, so a zero timeout abandons it.
    let _ = tokio::time::timeout(Duration::ZERO, session.stop()).await;

    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(harness.engine.tap_count(), 0);
    assert_eq!(harness.joiner.active_tap(), None);

    session.start(surface(64, 36)).await.unwrap();
    assert_eq!(session.state(), SessionState::Recording);
    assert!(session.stop().await.is_some());
}
