//! Record the synthetic surface and synth into a clip.

use std::f32::consts::TAU;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use synthcast_capture_engine::synthetic::{SyntheticAudioEngine, SyntheticSurface};
use synthcast_capture_engine::{
    CaptureSession, GstRecorderFactory, SessionConfig, StreamJoiner, VisualSurface,
};
use synthcast_common::config::AppConfig;
use synthcast_compose_engine::{ffmpeg_recomposer, OverlaySource};
use synthcast_media_model::AudioFormat;

/// How often the demo pointer moves and retriggers the synth.
const GESTURE_INTERVAL: Duration = Duration::from_millis(250);

pub async fn run(
    config: &AppConfig,
    output: PathBuf,
    duration: f64,
    width: u32,
    height: u32,
    fps: Option<u32>,
    overlay: Option<PathBuf>,
) -> anyhow::Result<()> {
    if !(duration.is_finite() && duration > 0.0) {
        anyhow::bail!("Duration must be a positive number of seconds, got {duration}");
    }

    let mut session_config = SessionConfig::from_defaults(&config.recording);
    if let Some(fps) = fps {
        session_config.frame_rate = fps.max(1);
    }

    println!("Starting synthetic recording");
    println!("  Surface: {width}x{height} @ {} fps", session_config.frame_rate);
    println!("  Duration: {duration:.1}s");
    println!();

    let surface = Arc::new(SyntheticSurface::new(width, height));
    let engine = Arc::new(SyntheticAudioEngine::new(AudioFormat::new(48_000, 2)));
    let joiner = Arc::new(StreamJoiner::new(engine.clone()));
    let mut session = CaptureSession::new(
        session_config,
        joiner,
        Arc::new(GstRecorderFactory::new()),
    );

    let format = session
        .start(Some(surface.clone() as Arc<dyn VisualSurface>))
        .await?;
    println!("Recording as {format} (Ctrl+C to stop early)...");

    let gestures = tokio::spawn(play_gestures(surface, engine.clone()));
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs_f64(duration)) => {}
        _ = tokio::signal::ctrl_c() => println!("Interrupted, finishing clip"),
    }
    gestures.abort();

    let raw = session
        .stop()
        .await
        .ok_or_else(|| anyhow::anyhow!("Recorder produced no data"))?;
    engine.close();

    let stats = session.stats();
    println!(
        "  Video: {} frames ({} dropped); audio: {} sample frames ({} buffers dropped)",
        stats.stream.video_frames,
        stats.stream.video_dropped,
        stats.stream.audio_frames,
        stats.stream.audio_dropped
    );
    println!(
        "  Chunks: {} ({} bytes)",
        stats.recorder.chunks_emitted, stats.recorder.bytes_emitted
    );

    let raw_path = output.with_extension(format.file_extension());
    tokio::fs::write(&raw_path, raw.bytes()).await?;
    println!("Raw clip saved to: {} ({} bytes)", raw_path.display(), raw.len());

    let Some(overlay) = overlay else {
        return Ok(());
    };

    let recomposer = ffmpeg_recomposer(config.compose.clone());
    let clip = recomposer
        .compose_or_passthrough(&raw, Some(&OverlaySource::Path(overlay)))
        .await;
    if !clip.is_composed() {
        println!("Overlay could not be applied; keeping the raw clip only");
        return Ok(());
    }

    let composed_path = composed_path(&output);
    tokio::fs::write(&composed_path, clip.bytes()).await?;
    println!(
        "Composed clip saved to: {} ({} bytes)",
        composed_path.display(),
        clip.len()
    );
    Ok(())
}

fn composed_path(output: &std::path::Path) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "recording".to_string());
    output.with_file_name(format!("{stem}-composed.mp4"))
}

/// Sweep the pointer around an ellipse, triggering a note at each step.
async fn play_gestures(surface: Arc<SyntheticSurface>, engine: Arc<SyntheticAudioEngine>) {
    let mut ticker = tokio::time::interval(GESTURE_INTERVAL);
    let mut step: u32 = 0;
    loop {
        ticker.tick().await;
        let angle = step as f32 * TAU / 16.0;
        let x = 0.5 + 0.4 * angle.cos();
        let y = 0.5 + 0.3 * angle.sin();
        surface.set_pointer(x, y);
        engine.trigger(x, y);
        tracing::trace!(x, y, "Gesture");
        step = step.wrapping_add(1);
    }
}
