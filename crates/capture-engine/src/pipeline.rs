//! Chunked recorders.
//!
//! A recorder consumes the two tracks of a joined stream, encodes and muxes
//! them, and emits the container incrementally as chunks. The GStreamer
//! implementation builds one pipeline per recording:
//!
//! ```text
//! appsrc(video RGBA) ! videoconvert ! <video enc> ─┐
//!                                                  ├─ <muxer> ! appsink ──► chunks
//! appsrc(audio F32)  ! audioconvert ! <audio enc> ─┘
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use gst::prelude::*;
use gstreamer as gst;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use synthcast_common::clock::RecordingClock;
use synthcast_common::error::{ClipError, ClipResult};
use synthcast_media_model::{
    AudioBuffer, AudioFormat, Container, ContainerFormat, VideoCodec, VideoFrame,
};

use crate::joiner::StreamTracks;
use crate::mime::FormatSupport;

/// How long `stop` waits for end-of-stream to drain through the muxer.
const EOS_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Encoding parameters for one recording.
#[derive(Debug, Clone, PartialEq)]
pub struct RecorderOptions {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub audio_format: AudioFormat,
    pub video_bits_per_second: u32,
    /// Target spacing of emitted chunks.
    pub chunk_interval: Duration,
}

/// Output of a running recorder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecorderEvent {
    /// A slice of the container, in output order.
    Chunk(Vec<u8>),
    /// A non-fatal error; recording continues best-effort.
    Error(String),
    /// No further chunks will follow.
    Stopped,
}

pub type RecorderEventSink = mpsc::UnboundedSender<RecorderEvent>;

/// Creates recorders for negotiated formats.
pub trait RecorderFactory: FormatSupport + Send + Sync {
    /// Open a recorder. Fails with `EncoderConfigRejected` when the format
    /// or options cannot be honoured.
    fn create(
        &self,
        format: &ContainerFormat,
        options: &RecorderOptions,
    ) -> ClipResult<Box<dyn MediaRecorder>>;
}

/// A recorder for one session.
#[async_trait::async_trait]
pub trait MediaRecorder: Send {
    /// Begin consuming tracks and emitting chunks.
    fn start(&mut self, tracks: StreamTracks, events: RecorderEventSink) -> ClipResult<()>;

    /// Finalize: stop consuming, flush encoders and muxer, and return once
    /// every pending chunk has been emitted.
    async fn stop(&mut self) -> ClipResult<()>;

    /// Check if the recorder is currently running.
    fn is_running(&self) -> bool;

    fn stats(&self) -> RecorderStats;
}

/// Runtime statistics from a recorder.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecorderStats {
    pub video_frames: u64,
    pub audio_buffers: u64,
    pub chunks_emitted: u64,
    pub bytes_emitted: u64,
    /// Buffers the pipeline refused (flushing or torn down).
    pub rejected_buffers: u64,
}

#[derive(Debug, Default)]
struct RecorderCounters {
    video_frames: AtomicU64,
    audio_buffers: AtomicU64,
    chunks_emitted: AtomicU64,
    bytes_emitted: AtomicU64,
    rejected_buffers: AtomicU64,
}

impl RecorderCounters {
    fn snapshot(&self) -> RecorderStats {
        RecorderStats {
            video_frames: self.video_frames.load(Ordering::Relaxed),
            audio_buffers: self.audio_buffers.load(Ordering::Relaxed),
            chunks_emitted: self.chunks_emitted.load(Ordering::Relaxed),
            bytes_emitted: self.bytes_emitted.load(Ordering::Relaxed),
            rejected_buffers: self.rejected_buffers.load(Ordering::Relaxed),
        }
    }
}

/// GStreamer elements that realise one container format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementChain {
    pub video_encoder: String,
    pub video_parser: Option<&'static str>,
    pub audio_encoder: &'static str,
    pub muxer: String,
}

impl ElementChain {
    /// Chain for a format, or `None` when the combination is not muxable.
    pub fn for_format(format: &ContainerFormat, options: &RecorderOptions) -> Option<Self> {
        let keyint = options.frame_rate.saturating_mul(2).max(2);
        let bitrate = options.video_bits_per_second.max(1);
        let cluster_ns = options.chunk_interval.as_nanos();
        let fragment_ms = options.chunk_interval.as_millis().max(1);

        let x264 = format!(
            "x264enc tune=zerolatency speed-preset=veryfast bitrate={} key-int-max={keyint}",
            (bitrate / 1000).max(1)
        );

        match (format.container, format.effective_video_codec()) {
            // Matroska carries H.264 where strict WebM cannot.
            (Container::Webm, VideoCodec::H264) => Some(Self {
                video_encoder: x264,
                video_parser: Some("h264parse"),
                audio_encoder: "opusenc",
                muxer: format!("matroskamux streamable=true max-cluster-duration={cluster_ns}"),
            }),
            (Container::Webm, VideoCodec::Vp9) => Some(Self {
                video_encoder: format!(
                    "vp9enc target-bitrate={bitrate} deadline=1 cpu-used=8 keyframe-max-dist={keyint}"
                ),
                video_parser: None,
                audio_encoder: "opusenc",
                muxer: format!("webmmux streamable=true max-cluster-duration={cluster_ns}"),
            }),
            (Container::Webm, VideoCodec::Vp8) => Some(Self {
                video_encoder: format!(
                    "vp8enc target-bitrate={bitrate} deadline=1 keyframe-max-dist={keyint}"
                ),
                video_parser: None,
                audio_encoder: "opusenc",
                muxer: format!("webmmux streamable=true max-cluster-duration={cluster_ns}"),
            }),
            (Container::Mp4, VideoCodec::H264) => Some(Self {
                video_encoder: x264,
                video_parser: Some("h264parse"),
                audio_encoder: "avenc_aac",
                muxer: format!("mp4mux streamable=true fragment-duration={fragment_ms}"),
            }),
            (Container::Mp4, _) => None,
        }
    }

    /// Element factory names this chain depends on.
    pub fn required_elements(&self) -> Vec<&str> {
        let mut names = vec![
            "appsrc",
            "appsink",
            "queue",
            "videoconvert",
            "audioconvert",
            "audioresample",
            first_token(&self.video_encoder),
            self.audio_encoder,
            first_token(&self.muxer),
        ];
        if let Some(parser) = self.video_parser {
            names.push(parser);
        }
        names
    }

    /// `gst-launch` description of the whole pipeline.
    pub fn launch_description(&self, options: &RecorderOptions) -> String {
        let parser = self
            .video_parser
            .map(|p| format!(" ! {p}"))
            .unwrap_or_default();
        format!(
            "appsrc name=video format=time is-live=true do-timestamp=false \
             caps=video/x-raw,format=RGBA,width={w},height={h},framerate={fps}/1 \
             ! queue max-size-buffers=8 ! videoconvert ! {venc}{parser} ! queue ! mux. \
             appsrc name=audio format=time is-live=true do-timestamp=false \
             caps=audio/x-raw,format=F32LE,layout=interleaved,rate={rate},channels={ch} \
             ! queue ! audioconvert ! audioresample ! {aenc} ! queue ! mux. \
             {mux} name=mux ! appsink name=sink emit-signals=true sync=false",
            w = options.width,
            h = options.height,
            fps = options.frame_rate,
            venc = self.video_encoder,
            rate = options.audio_format.sample_rate,
            ch = options.audio_format.channels,
            aenc = self.audio_encoder,
            mux = self.muxer,
        )
    }
}

fn first_token(description: &str) -> &str {
    description.split_whitespace().next().unwrap_or(description)
}

/// Recorder factory backed by locally installed GStreamer plugins.
#[derive(Debug, Default, Clone, Copy)]
pub struct GstRecorderFactory;

impl GstRecorderFactory {
    pub fn new() -> Self {
        Self
    }
}

impl FormatSupport for GstRecorderFactory {
    fn is_type_supported(&self, format: &ContainerFormat) -> bool {
        if init_gstreamer().is_err() {
            return false;
        }
        let probe = RecorderOptions {
            width: 2,
            height: 2,
            frame_rate: 30,
            audio_format: AudioFormat::cd_stereo(),
            video_bits_per_second: 1_000_000,
            chunk_interval: Duration::from_millis(100),
        };
        let Some(chain) = ElementChain::for_format(format, &probe) else {
            return false;
        };
        chain
            .required_elements()
            .into_iter()
            .all(|name| gst::ElementFactory::find(name).is_some())
    }
}

impl RecorderFactory for GstRecorderFactory {
    fn create(
        &self,
        format: &ContainerFormat,
        options: &RecorderOptions,
    ) -> ClipResult<Box<dyn MediaRecorder>> {
        let chain = ElementChain::for_format(format, options).ok_or_else(|| {
            ClipError::encoder_config(format!("No element chain for {format}"))
        })?;
        Ok(Box::new(GstRecorder::from_chain(
            format.mime_type(),
            &chain,
            options.clone(),
        )?))
    }
}

/// A running GStreamer recording pipeline.
pub struct GstRecorder {
    name: String,
    pipeline: gst::Pipeline,
    options: RecorderOptions,
    running: Arc<AtomicBool>,
    counters: Arc<RecorderCounters>,
    feed_stop: Option<watch::Sender<bool>>,
    feeders: Vec<JoinHandle<()>>,
    bus_stop: Arc<AtomicBool>,
    eos_rx: Option<oneshot::Receiver<()>>,
}

impl GstRecorder {
    pub fn from_chain(
        name: impl Into<String>,
        chain: &ElementChain,
        options: RecorderOptions,
    ) -> ClipResult<Self> {
        init_gstreamer()?;

        let launch = chain.launch_description(&options);
        tracing::debug!(%launch, "Building recorder pipeline");

        let element = gst::parse::launch(&launch).map_err(|e| {
            ClipError::encoder_config(format!("Failed to build recorder pipeline: {e}"))
        })?;
        let pipeline = element.dynamic_cast::<gst::Pipeline>().map_err(|_| {
            ClipError::encoder_config("Launch string did not produce a pipeline")
        })?;

        Ok(Self {
            name: name.into(),
            pipeline,
            options,
            running: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(RecorderCounters::default()),
            feed_stop: None,
            feeders: Vec::new(),
            bus_stop: Arc::new(AtomicBool::new(false)),
            eos_rx: None,
        })
    }

    fn element(&self, name: &str) -> ClipResult<gst::Element> {
        self.pipeline.by_name(name).ok_or_else(|| {
            ClipError::encoder_config(format!("Recorder pipeline has no element named {name}"))
        })
    }
}

#[async_trait::async_trait]
impl MediaRecorder for GstRecorder {
    fn start(&mut self, tracks: StreamTracks, events: RecorderEventSink) -> ClipResult<()> {
        let video_src = self.element("video")?;
        let audio_src = self.element("audio")?;
        let sink = self.element("sink")?;

        let counters = Arc::clone(&self.counters);
        let chunk_events = events.clone();
        sink.connect("new-sample", false, move |values| {
            let sink = values[0].get::<gst::Element>().ok()?;
            let sample = sink.emit_by_name::<Option<gst::Sample>>("pull-sample", &[]);
            if let Some(buffer) = sample.as_ref().and_then(|s| s.buffer()) {
                if let Ok(map) = buffer.map_readable() {
                    counters.chunks_emitted.fetch_add(1, Ordering::Relaxed);
                    counters
                        .bytes_emitted
                        .fetch_add(map.size() as u64, Ordering::Relaxed);
                    let _ = chunk_events.send(RecorderEvent::Chunk(map.as_slice().to_vec()));
                }
            }
            Some(gst::FlowReturn::Ok.to_value())
        });

        let (eos_tx, eos_rx) = oneshot::channel();
        self.eos_rx = Some(eos_rx);
        spawn_bus_watch(
            self.name.clone(),
            &self.pipeline,
            events,
            eos_tx,
            Arc::clone(&self.bus_stop),
        )?;

        if let Err(e) = self.pipeline.set_state(gst::State::Playing) {
            self.bus_stop.store(true, Ordering::SeqCst);
            let _ = self.pipeline.set_state(gst::State::Null);
            return Err(ClipError::encoder_config(format!(
                "Failed to start {} recorder: {e:?}",
                self.name
            )));
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let StreamTracks { info, video, audio } = tracks;
        self.feeders.push(tokio::spawn(feed_video(
            video,
            video_src,
            info.frame_rate,
            stop_rx.clone(),
            Arc::clone(&self.counters),
        )));
        self.feeders.push(tokio::spawn(feed_audio(
            audio,
            audio_src,
            stop_rx,
            Arc::clone(&self.counters),
        )));
        self.feed_stop = Some(stop_tx);
        self.running.store(true, Ordering::SeqCst);

        tracing::info!(
            recorder = %self.name,
            width = self.options.width,
            height = self.options.height,
            bitrate = self.options.video_bits_per_second,
            "Recorder pipeline playing"
        );
        Ok(())
    }

    async fn stop(&mut self) -> ClipResult<()> {
        if let Some(stop) = self.feed_stop.take() {
            let _ = stop.send(true);
        }
        for feeder in self.feeders.drain(..) {
            if let Err(e) = feeder.await {
                tracing::warn!(recorder = %self.name, error = %e, "Track feeder join failed");
            }
        }

        // End-of-stream on both sources lets the encoders and the muxer flush
        // their tail before the pipeline goes down.
        for name in ["video", "audio"] {
            if let Ok(src) = self.element(name) {
                let flow = src.emit_by_name::<gst::FlowReturn>("end-of-stream", &[]);
                if flow != gst::FlowReturn::Ok {
                    tracing::warn!(recorder = %self.name, source = name, ?flow, "EOS not accepted");
                }
            }
        }

        if let Some(eos_rx) = self.eos_rx.take() {
            match tokio::time::timeout(EOS_DRAIN_TIMEOUT, eos_rx).await {
                Ok(Ok(())) => {
                    tracing::debug!(recorder = %self.name, "EOS received; recorder drained")
                }
                Ok(Err(_)) => {
                    tracing::warn!(recorder = %self.name, "Bus watch ended before EOS")
                }
                Err(_) => tracing::warn!(
                    recorder = %self.name,
                    "EOS drain timed out; output may be truncated"
                ),
            }
        }
        self.bus_stop.store(true, Ordering::SeqCst);

        self.pipeline.set_state(gst::State::Null).map_err(|e| {
            ClipError::mux(format!("Failed to stop {} recorder: {e:?}", self.name))
        })?;
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn stats(&self) -> RecorderStats {
        self.counters.snapshot()
    }
}

impl Drop for GstRecorder {
    fn drop(&mut self) {
        self.bus_stop.store(true, Ordering::SeqCst);
        if self.running.swap(false, Ordering::SeqCst) {
            for feeder in &self.feeders {
                feeder.abort();
            }
            let _ = self.pipeline.set_state(gst::State::Null);
        }
    }
}

fn spawn_bus_watch(
    name: String,
    pipeline: &gst::Pipeline,
    events: RecorderEventSink,
    eos_tx: oneshot::Sender<()>,
    stop: Arc<AtomicBool>,
) -> ClipResult<()> {
    let bus = pipeline
        .bus()
        .ok_or_else(|| ClipError::encoder_config("Recorder pipeline has no bus"))?;

    std::thread::spawn(move || {
        let mut eos_tx = Some(eos_tx);
        while !stop.load(Ordering::SeqCst) {
            let Some(msg) = bus.timed_pop(gst::ClockTime::from_mseconds(100)) else {
                continue;
            };
            match msg.view() {
                gst::MessageView::Eos(_) => {
                    if let Some(tx) = eos_tx.take() {
                        let _ = tx.send(());
                    }
                    break;
                }
                gst::MessageView::Error(e) => {
                    tracing::warn!(recorder = %name, error = %e.error(), "Recorder pipeline error");
                    let _ = events.send(RecorderEvent::Error(e.error().to_string()));
                }
                gst::MessageView::Warning(w) => {
                    tracing::debug!(
                        recorder = %name,
                        warning = %w.error(),
                        "Recorder pipeline warning"
                    );
                }
                _ => {}
            }
        }
    });
    Ok(())
}

async fn feed_video(
    mut frames: mpsc::Receiver<VideoFrame>,
    src: gst::Element,
    frame_rate: u32,
    mut stop: watch::Receiver<bool>,
    counters: Arc<RecorderCounters>,
) {
    let duration = RecordingClock::frame_interval_micros(frame_rate);
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            frame = frames.recv() => {
                let Some(frame) = frame else { break };
                let pts = frame.timestamp_micros;
                if push_buffer(&src, frame.image.into_raw(), pts, duration) {
                    counters.video_frames.fetch_add(1, Ordering::Relaxed);
                } else {
                    counters.rejected_buffers.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }
}

async fn feed_audio(
    mut buffers: mpsc::Receiver<AudioBuffer>,
    src: gst::Element,
    mut stop: watch::Receiver<bool>,
    counters: Arc<RecorderCounters>,
) {
    // Audio is re-stamped from the running sample count so the track stays
    // gapless regardless of the engine's own clock.
    let mut frames_pushed: u64 = 0;
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            buffer = buffers.recv() => {
                let Some(buffer) = buffer else { break };
                let rate = buffer.format.sample_rate;
                let pts = RecordingClock::sample_timestamp_micros(frames_pushed, rate);
                let duration = buffer.duration_micros();
                frames_pushed += buffer.frames() as u64;
                if push_buffer(&src, buffer.to_le_bytes(), pts, duration) {
                    counters.audio_buffers.fetch_add(1, Ordering::Relaxed);
                } else {
                    counters.rejected_buffers.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }
}

fn push_buffer(src: &gst::Element, data: Vec<u8>, pts_micros: i64, duration_micros: i64) -> bool {
    let mut buffer = gst::Buffer::from_mut_slice(data);
    if let Some(buffer) = buffer.get_mut() {
        buffer.set_pts(gst::ClockTime::from_useconds(pts_micros.max(0) as u64));
        buffer.set_duration(gst::ClockTime::from_useconds(duration_micros.max(0) as u64));
    }
    src.emit_by_name::<gst::FlowReturn>("push-buffer", &[&buffer]) == gst::FlowReturn::Ok
}

fn init_gstreamer() -> ClipResult<()> {
    static GST_INIT: OnceLock<Result<(), String>> = OnceLock::new();
    let init_res = GST_INIT.get_or_init(|| gst::init().map_err(|e| e.to_string()));
    match init_res {
        Ok(()) => Ok(()),
        Err(e) => Err(ClipError::encoder_config(format!(
            "Failed to initialize GStreamer: {e}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> RecorderOptions {
        RecorderOptions {
            width: 640,
            height: 360,
            frame_rate: 60,
            audio_format: AudioFormat::cd_stereo(),
            video_bits_per_second: 5_000_000,
            chunk_interval: Duration::from_millis(100),
        }
    }

    #[test]
    fn test_h264_webm_uses_matroska() {
        let format: ContainerFormat = "video/webm;codecs=h264".parse().unwrap();
        let chain = ElementChain::for_format(&format, &options()).unwrap();
        assert!(chain.video_encoder.starts_with("x264enc"));
        assert!(chain.video_encoder.contains("bitrate=5000"));
        assert!(chain.video_encoder.contains("key-int-max=120"));
        assert_eq!(chain.video_parser, Some("h264parse"));
        assert!(chain.muxer.starts_with("matroskamux"));
        assert!(chain.muxer.contains("max-cluster-duration=100000000"));
    }

    #[test]
    fn test_plain_webm_defaults_to_vp8() {
        let format: ContainerFormat = "video/webm".parse().unwrap();
        let chain = ElementChain::for_format(&format, &options()).unwrap();
        assert!(chain.video_encoder.starts_with("vp8enc"));
        assert!(chain.video_encoder.contains("target-bitrate=5000000"));
        assert_eq!(chain.audio_encoder, "opusenc");
    }

    #[test]
    fn test_mp4_fragments_at_chunk_interval() {
        let format: ContainerFormat = "video/mp4".parse().unwrap();
        let chain = ElementChain::for_format(&format, &options()).unwrap();
        assert_eq!(chain.muxer, "mp4mux streamable=true fragment-duration=100");
        assert!(chain.required_elements().contains(&"avenc_aac"));
    }

    #[test]
    fn test_vp9_in_mp4_is_not_muxable() {
        let format: ContainerFormat = "video/mp4;codecs=vp9".parse().unwrap();
        assert!(ElementChain::for_format(&format, &options()).is_none());
    }

    #[test]
    fn test_launch_description_wires_both_sources_to_mux() {
        let format: ContainerFormat = "video/webm;codecs=vp9".parse().unwrap();
        let chain = ElementChain::for_format(&format, &options()).unwrap();
        let launch = chain.launch_description(&options());
        assert!(launch.contains("width=640,height=360,framerate=60/1"));
        assert!(launch.contains("rate=44100,channels=2"));
        assert_eq!(launch.matches("! mux.").count(), 2);
        assert!(launch.contains("name=mux ! appsink name=sink"));
    }
}
