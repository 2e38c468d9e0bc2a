//! Check recorder formats and ffmpeg availability.

use synthcast_capture_engine::{FormatSupport, GstRecorderFactory, MimeNegotiator};
use synthcast_common::config::{config_file_path, AppConfig};
use synthcast_compose_engine::ffmpeg::command_exists;
use synthcast_compose_engine::Ffmpeg;

pub fn run(config: &AppConfig, write_config: bool) -> anyhow::Result<()> {
    println!("Synthcast System Check");
    println!("{}", "=".repeat(50));

    let recorders = GstRecorderFactory::new();
    let negotiator = MimeNegotiator::from_mime_strings(&config.recording.format_preferences);
    println!("Recorder formats (in preference order):");
    for format in negotiator.preferences() {
        let status = if recorders.is_type_supported(format) {
            "OK"
        } else {
            "--"
        };
        println!("  [{status}] {format}");
    }
    let negotiated = negotiator.negotiate(&recorders);
    match &negotiated {
        Some(format) => println!("[OK] Recording will use {format}"),
        None => println!("[FAIL] No supported recording format; check GStreamer plugins"),
    }

    println!();
    let composer = Ffmpeg::new(config.compose.ffmpeg_path.clone());
    let compose_ok = composer.is_available();
    if compose_ok {
        println!(
            "[OK] Recomposition: {} and {}",
            composer.ffmpeg_path().display(),
            composer.ffprobe_path().display()
        );
    } else {
        println!("[WARN] Recomposition unavailable: ffmpeg/ffprobe not found; clips pass through");
    }

    let transcode_ok = command_exists(&config.transcode.ffmpeg_path);
    if transcode_ok {
        println!(
            "[OK] Transcoding: {}",
            config.transcode.ffmpeg_path.display()
        );
    } else {
        println!(
            "[WARN] Transcoding unavailable: {} not found",
            config.transcode.ffmpeg_path.display()
        );
    }

    if write_config {
        config.save()?;
        println!("[OK] Configuration written to {}", config_file_path().display());
    }

    println!();
    if negotiated.is_some() && compose_ok {
        println!("All capabilities are available. Synthcast is ready.");
    } else {
        println!("Some capabilities are missing. See above for fixes.");
    }

    Ok(())
}
