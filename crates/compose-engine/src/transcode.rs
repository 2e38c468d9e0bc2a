//! Server-side transcoding of uploaded recordings.
//!
//! Every upload is scaled to a canonical width, optionally overlaid with an
//! image from the public directory using the same placement rule as the
//! client compositor, and re-encoded as web-ready MP4.

use std::path::{Component, Path, PathBuf};

use synthcast_common::config::TranscodeDefaults;
use synthcast_common::error::{ClipError, ClipResult};
use synthcast_media_model::{ContainerFormat, FinalContainer};

use crate::compositor::OverlayPlacement;
use crate::ffmpeg::run_ffmpeg;

/// An upload handed to the transcoder.
#[derive(Debug, Clone)]
pub struct TranscodeRequest {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    /// Overlay path relative to the public directory, e.g. `/frames/a.png`.
    pub overlay: Option<String>,
}

/// Runs the fixed ffmpeg transcode for uploads.
#[derive(Debug, Clone)]
pub struct Transcoder {
    config: TranscodeDefaults,
}

impl Transcoder {
    pub fn new(config: TranscodeDefaults) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TranscodeDefaults {
        &self.config
    }

    /// Resolve a client-supplied overlay path against the public directory.
    ///
    /// Empty, `"null"`, escaping and missing paths resolve to no overlay.
    pub fn resolve_overlay(&self, overlay: Option<&str>) -> Option<PathBuf> {
        let requested = overlay?.trim();
        if requested.is_empty() || requested == "null" {
            return None;
        }

        let relative = Path::new(requested.strip_prefix('/').unwrap_or(requested));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            tracing::warn!(overlay = requested, "Overlay path escapes the public directory");
            return None;
        }

        let path = self.config.public_dir.join(relative);
        if !path.is_file() {
            tracing::warn!(
                path = %path.display(),
                "Overlay file not found; transcoding without it"
            );
            return None;
        }
        Some(path)
    }

    /// Filter arguments for the canonical scale, with or without overlay.
    pub fn filter_args(&self, with_overlay: bool) -> Vec<String> {
        let width = self.config.canonical_width;
        if !with_overlay {
            return vec!["-vf".to_string(), format!("scale={width}:-2")];
        }

        let placement_width = OverlayPlacement::scaled_width(width, &self.config.overlay);
        let margin = self.config.overlay.margin_px;
        vec![
            "-filter_complex".to_string(),
            format!(
                "[0:v]scale={width}:-2[bg];[1:v]scale={placement_width}:-1[fg];\
                 [bg][fg]overlay=main_w-overlay_w-{margin}:{margin}"
            ),
        ]
    }

    /// Encoder and container arguments.
    pub fn output_args(&self) -> Vec<String> {
        [
            "-c:v",
            "libx264",
            "-preset",
            self.config.preset.as_str(),
            "-profile:v",
            self.config.profile.as_str(),
            "-level:v",
            self.config.level.as_str(),
            "-pix_fmt",
            "yuv420p",
            "-movflags",
            "+faststart",
            "-c:a",
            "aac",
            "-b:a",
            self.config.audio_bitrate.as_str(),
        ]
        .into_iter()
        .map(str::to_string)
        .collect()
    }

    /// Full ffmpeg argument list for one job.
    pub fn build_args(&self, input: &Path, overlay: Option<&Path>, output: &Path) -> Vec<String> {
        let mut args = vec![
            "-hide_banner".to_string(),
            "-nostdin".to_string(),
            "-y".to_string(),
            "-v".to_string(),
            "error".to_string(),
            "-i".to_string(),
            input.to_string_lossy().into_owned(),
        ];
        if let Some(overlay) = overlay {
            args.push("-i".to_string());
            args.push(overlay.to_string_lossy().into_owned());
        }
        args.extend(self.filter_args(overlay.is_some()));
        args.extend(self.output_args());
        args.push(output.to_string_lossy().into_owned());
        args
    }

    /// Transcode an upload. Temporary files are removed on every path.
    pub async fn transcode(&self, request: TranscodeRequest) -> ClipResult<FinalContainer> {
        if request.bytes.is_empty() {
            return Err(ClipError::transcode("Missing video payload"));
        }

        let workdir = tempfile::Builder::new()
            .prefix("synthcast-transcode-")
            .tempdir()
            .map_err(|e| ClipError::transcode(format!("Failed to create work dir: {e}")))?;
        let extension = request
            .mime_type
            .parse::<ContainerFormat>()
            .map(|f| f.file_extension())
            .unwrap_or("webm");
        let input = workdir.path().join(format!("input.{extension}"));
        let output = workdir.path().join("output.mp4");
        tokio::fs::write(&input, &request.bytes).await?;

        let overlay = self.resolve_overlay(request.overlay.as_deref());
        tracing::info!(
            input_bytes = request.bytes.len(),
            mime = %request.mime_type,
            overlay = ?overlay,
            "Transcoding upload"
        );

        let args = self.build_args(&input, overlay.as_deref(), &output);
        let ffmpeg = self.config.ffmpeg_path.clone();
        tokio::task::spawn_blocking(move || {
            run_ffmpeg(&ffmpeg, &args, |m| ClipError::transcode(m))
        })
        .await
        .map_err(|e| ClipError::transcode(format!("Transcode task failed: {e}")))??;

        let bytes = tokio::fs::read(&output).await?;
        tracing::info!(output_bytes = bytes.len(), "Transcode finished");
        Ok(FinalContainer::composed(bytes, "video/mp4"))
    }
}

impl Default for Transcoder {
    fn default() -> Self {
        Self::new(TranscodeDefaults::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transcoder_with_public(dir: &Path) -> Transcoder {
        Transcoder::new(TranscodeDefaults {
            public_dir: dir.to_path_buf(),
            ..TranscodeDefaults::default()
        })
    }

    #[test]
    fn test_overlay_filter_matches_fixed_graph() {
        let args = Transcoder::default().filter_args(true);
        assert_eq!(args[0], "-filter_complex");
        assert_eq!(
            args[1],
            "[0:v]scale=1080:-2[bg];[1:v]scale=162:-1[fg];[bg][fg]overlay=main_w-overlay_w-20:20"
        );
    }

    #[test]
    fn test_plain_scale_without_overlay() {
        assert_eq!(
            Transcoder::default().filter_args(false),
            vec!["-vf".to_string(), "scale=1080:-2".to_string()]
        );
    }

    #[test]
    fn test_output_args() {
        let joined = Transcoder::default().output_args().join(" ");
        assert_eq!(
            joined,
            "-c:v libx264 -preset veryfast -profile:v main -level:v 4.1 -pix_fmt yuv420p \
             -movflags +faststart -c:a aac -b:a 128k"
        );
    }

    #[test]
    fn test_build_args_orders_inputs() {
        let args = Transcoder::default().build_args(
            Path::new("/tmp/in.webm"),
            Some(Path::new("/srv/public/frames/a.png")),
            Path::new("/tmp/out.mp4"),
        );
        let joined = args.join(" ");
        assert!(joined.contains("-i /tmp/in.webm -i /srv/public/frames/a.png -filter_complex"));
        assert_eq!(args.last().map(String::as_str), Some("/tmp/out.mp4"));
    }

    #[test]
    fn test_resolve_overlay_strips_leading_slash() {
        let public = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(public.path().join("frames")).unwrap();
        std::fs::write(public.path().join("frames/frame_01.png"), b"png").unwrap();

        let transcoder = transcoder_with_public(public.path());
        assert_eq!(
            transcoder.resolve_overlay(Some("/frames/frame_01.png")),
            Some(public.path().join("frames/frame_01.png"))
        );
        assert_eq!(
            transcoder.resolve_overlay(Some("frames/frame_01.png")),
            Some(public.path().join("frames/frame_01.png"))
        );
    }

    #[test]
    fn test_resolve_overlay_ignores_placeholders_and_missing() {
        let public = tempfile::tempdir().unwrap();
        let transcoder = transcoder_with_public(public.path());
        assert_eq!(transcoder.resolve_overlay(None), None);
        assert_eq!(transcoder.resolve_overlay(Some("")), None);
        assert_eq!(transcoder.resolve_overlay(Some("null")), None);
        assert_eq!(transcoder.resolve_overlay(Some("/frames/missing.png")), None);
    }

    #[test]
    fn test_resolve_overlay_refuses_parent_components() {
        let root = tempfile::tempdir().unwrap();
        let public = root.path().join("public");
        std::fs::create_dir_all(&public).unwrap();
        std::fs::write(root.path().join("secret.png"), b"png").unwrap();

        let transcoder = transcoder_with_public(&public);
        assert_eq!(transcoder.resolve_overlay(Some("/../secret.png")), None);
    }

    #[tokio::test]
    async fn test_empty_upload_is_rejected() {
        let result = Transcoder::default()
            .transcode(TranscodeRequest {
                bytes: Vec::new(),
                mime_type: "video/webm".to_string(),
                overlay: None,
            })
            .await;
        assert!(matches!(result, Err(ClipError::Transcode { .. })));
    }
}
