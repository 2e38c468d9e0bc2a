//! Transcode an upload the way the share service does.

use std::path::PathBuf;

use anyhow::Context;

use synthcast_common::config::AppConfig;
use synthcast_compose_engine::{TranscodeRequest, Transcoder};
use synthcast_media_model::ContainerFormat;

pub async fn run(
    config: &AppConfig,
    input: PathBuf,
    overlay: Option<String>,
    public_dir: Option<PathBuf>,
    output: PathBuf,
) -> anyhow::Result<()> {
    let mut settings = config.transcode.clone();
    if let Some(dir) = public_dir {
        settings.public_dir = dir;
    }

    println!("Transcoding: {}", input.display());
    println!("  Canonical width: {}", settings.canonical_width);
    println!("  Public dir: {}", settings.public_dir.display());
    if let Some(overlay) = &overlay {
        println!("  Overlay: {overlay}");
    }

    let bytes = tokio::fs::read(&input)
        .await
        .with_context(|| format!("Failed to read {}", input.display()))?;
    let mime_type = input
        .extension()
        .and_then(|ext| ext.to_str())
        .and_then(ContainerFormat::from_extension)
        .map(|format| format.mime_type())
        .unwrap_or_else(|| "video/webm".to_string());

    let transcoder = Transcoder::new(settings);
    let clip = transcoder
        .transcode(TranscodeRequest {
            bytes,
            mime_type,
            overlay,
        })
        .await?;

    tokio::fs::write(&output, clip.bytes())
        .await
        .with_context(|| format!("Failed to write {}", output.display()))?;
    println!("Saved {} ({} bytes)", output.display(), clip.len());
    Ok(())
}
