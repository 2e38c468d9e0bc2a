//! Recompose a recording with an overlay.

use std::path::{Path, PathBuf};

use anyhow::Context;

use synthcast_common::config::AppConfig;
use synthcast_compose_engine::{ffmpeg_recomposer, OverlaySource};
use synthcast_media_model::{ContainerFormat, FinalContainer, RawContainer};

pub async fn run(
    config: &AppConfig,
    input: PathBuf,
    overlay: PathBuf,
    output: PathBuf,
) -> anyhow::Result<()> {
    println!("Recomposing: {}", input.display());
    println!("  Overlay: {}", overlay.display());

    let bytes = tokio::fs::read(&input)
        .await
        .with_context(|| format!("Failed to read {}", input.display()))?;
    let raw = RawContainer::new(bytes, mime_for(&input));

    let recomposer = ffmpeg_recomposer(config.compose.clone());
    let clip = match recomposer
        .compose(&raw, Some(&OverlaySource::Path(overlay)))
        .await
    {
        Ok(clip) => clip,
        Err(e) if e.is_compose_failure() => {
            println!("Recomposition failed ({e}); writing the original recording");
            FinalContainer::passthrough(&raw)
        }
        Err(e) => return Err(e.into()),
    };
    if !clip.is_composed() {
        println!("Overlay unusable; output is a copy of the input");
    }

    tokio::fs::write(&output, clip.bytes())
        .await
        .with_context(|| format!("Failed to write {}", output.display()))?;
    println!(
        "Saved {} ({}, {} bytes)",
        output.display(),
        clip.mime_type(),
        clip.len()
    );
    Ok(())
}

/// Mime type guessed from the file extension; webm when unknown.
fn mime_for(path: &Path) -> String {
    path.extension()
        .and_then(|ext| ext.to_str())
        .and_then(ContainerFormat::from_extension)
        .map(|format| format.mime_type())
        .unwrap_or_else(|| "video/webm".to_string())
}
