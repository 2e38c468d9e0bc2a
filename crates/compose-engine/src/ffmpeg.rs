//! FFmpeg-backed decoder, encoders and muxer.
//!
//! Decoding and encoding run as `ffmpeg` child processes streaming raw
//! frames over pipes. Encoders emit elementary streams (H.264 Annex B, AAC
//! ADTS) that are split back into access units before they reach the muxer;
//! the muxer spools both streams to disk and remuxes them into MP4 on
//! finalize.

use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use image::RgbaImage;
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;

use synthcast_common::clock::RecordingClock;
use synthcast_common::error::{ClipError, ClipResult};
use synthcast_media_model::{
    AudioBuffer, AudioFormat, ContainerFormat, EncodedFrame, RawContainer, TrackKind, VideoFrame,
};

use crate::elementary::AccessUnitSplitter;

use crate::codec::{
    AudioBufferReader, AudioEncoder, AudioEncoderConfig, CodecFactory, DecodeOptions,
    DecodedSource, EncodedFrameSink, MediaDecoder, MuxTarget, Muxer, VideoEncoder,
    VideoEncoderConfig, VideoFrameReader,
};

/// Sample frames per decoded audio buffer.
const AUDIO_BUFFER_FRAMES: usize = 1024;

/// Read size for encoder output pipes.
const PIPE_READ_BYTES: usize = 64 * 1024;

/// Decoder and codec family driven by the `ffmpeg` and `ffprobe` binaries.
#[derive(Debug, Clone)]
pub struct Ffmpeg {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl Ffmpeg {
    /// Use the given `ffmpeg`; `ffprobe` is looked up next to it.
    pub fn new(ffmpeg: impl Into<PathBuf>) -> Self {
        let ffmpeg = ffmpeg.into();
        let ffprobe = match ffmpeg.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.join("ffprobe"),
            _ => PathBuf::from("ffprobe"),
        };
        Self { ffmpeg, ffprobe }
    }

    pub fn ffmpeg_path(&self) -> &Path {
        &self.ffmpeg
    }

    pub fn ffprobe_path(&self) -> &Path {
        &self.ffprobe
    }

    /// Whether both binaries can be found.
    pub fn is_available(&self) -> bool {
        command_exists(&self.ffmpeg) && command_exists(&self.ffprobe)
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.ffmpeg);
        cmd.args(["-hide_banner", "-nostdin", "-v", "error"])
            .kill_on_drop(true);
        cmd
    }
}

impl Default for Ffmpeg {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

/// Stream layout reported by `ffprobe`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProbeInfo {
    pub width: u32,
    pub height: u32,
    pub duration_micros: Option<i64>,
    pub has_audio: bool,
}

/// Parse `ffprobe -show_entries stream=codec_type,width,height:format=duration
/// -of default=noprint_wrappers=1` output. The first video stream wins.
pub fn parse_probe_output(raw: &str) -> Option<ProbeInfo> {
    let mut info = ProbeInfo::default();
    let mut current_type = "";
    let mut saw_video = false;

    for line in raw.lines() {
        let Some((key, value)) = line.trim().split_once('=') else {
            continue;
        };
        match key {
            "codec_type" => {
                current_type = if value == "video" {
                    "video"
                } else if value == "audio" {
                    info.has_audio = true;
                    "audio"
                } else {
                    ""
                };
            }
            "width" if current_type == "video" && info.width == 0 => {
                info.width = value.parse().unwrap_or(0);
                saw_video = true;
            }
            "height" if current_type == "video" && info.height == 0 => {
                info.height = value.parse().unwrap_or(0);
            }
            "duration" => {
                if let Ok(secs) = value.parse::<f64>() {
                    info.duration_micros = Some((secs * 1_000_000.0).round() as i64);
                }
            }
            _ => {}
        }
    }

    if !saw_video || info.width == 0 || info.height == 0 {
        return None;
    }
    Some(info)
}

fn probe_source(ffprobe: &Path, path: &Path) -> ClipResult<ProbeInfo> {
    let output = std::process::Command::new(ffprobe)
        .args([
            "-v",
            "error",
            "-show_entries",
            "stream=codec_type,width,height:format=duration",
            "-of",
            "default=noprint_wrappers=1",
        ])
        .arg(path)
        .output()
        .map_err(|e| ClipError::decode(format!("Failed to start ffprobe: {e}")))?;

    if !output.status.success() {
        return Err(ClipError::decode(format!(
            "ffprobe failed (status {}): {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    let raw = String::from_utf8_lossy(&output.stdout);
    parse_probe_output(&raw)
        .ok_or_else(|| ClipError::decode("Recording has no decodable video stream"))
}

/// Map an `avc1.PPCCLL` codec string to x264 profile and level names.
pub fn h264_profile_level(codec: &str) -> ClipResult<(&'static str, String)> {
    let reject = || ClipError::encoder_config(format!("Unsupported video codec {codec}"));
    let hex = codec.strip_prefix("avc1.").ok_or_else(reject)?;
    if hex.len() != 6 {
        return Err(reject());
    }
    let profile_idc = u8::from_str_radix(&hex[0..2], 16).map_err(|_| reject())?;
    let level_idc = u8::from_str_radix(&hex[4..6], 16).map_err(|_| reject())?;
    let profile = match profile_idc {
        0x42 => "baseline",
        0x4d => "main",
        0x64 => "high",
        _ => return Err(reject()),
    };
    if level_idc == 0 {
        return Err(reject());
    }
    Ok((profile, format!("{}.{}", level_idc / 10, level_idc % 10)))
}

#[async_trait::async_trait]
impl MediaDecoder for Ffmpeg {
    async fn open(
        &self,
        raw: &RawContainer,
        options: &DecodeOptions,
    ) -> ClipResult<DecodedSource> {
        if raw.is_empty() {
            return Err(ClipError::decode("Recording is empty"));
        }

        let workdir = tempfile::Builder::new()
            .prefix("synthcast-decode-")
            .tempdir()
            .map_err(|e| ClipError::decode(format!("Failed to create decode dir: {e}")))?;
        let extension = raw
            .mime_type()
            .parse::<ContainerFormat>()
            .map(|f| f.file_extension())
            .unwrap_or("webm");
        let input = workdir.path().join(format!("source.{extension}"));
        tokio::fs::write(&input, raw.bytes())
            .await
            .map_err(|e| ClipError::decode(format!("Failed to stage recording: {e}")))?;

        let ffprobe = self.ffprobe.clone();
        let probe_path = input.clone();
        let info = tokio::task::spawn_blocking(move || probe_source(&ffprobe, &probe_path))
            .await
            .map_err(|e| ClipError::decode(format!("ffprobe task failed: {e}")))??;

        tracing::debug!(
            width = info.width,
            height = info.height,
            has_audio = info.has_audio,
            "Probed recording"
        );

        let workdir = Arc::new(workdir);
        let frame_rate = options.frame_rate.max(1);

        let mut video_cmd = self.command();
        video_cmd
            .arg("-i")
            .arg(&input)
            .args(["-map", "0:v:0", "-vf"])
            .arg(format!("fps={frame_rate}"))
            .args(["-f", "rawvideo", "-pix_fmt", "rgba", "pipe:1"]);
        let video = PipeReader::spawn(video_cmd, Arc::clone(&workdir))
            .map_err(|e| ClipError::decode(format!("Failed to start video decoder: {e}")))?;

        let audio = if info.has_audio {
            let format = options.audio_format;
            let mut audio_cmd = self.command();
            audio_cmd
                .arg("-i")
                .arg(&input)
                .args(["-map", "0:a:0", "-f", "f32le", "-ac"])
                .arg(format.channels.to_string())
                .arg("-ar")
                .arg(format.sample_rate.to_string())
                .arg("pipe:1");
            let reader = PipeReader::spawn(audio_cmd, Arc::clone(&workdir))
                .map_err(|e| ClipError::decode(format!("Failed to start audio decoder: {e}")))?;
            Some(Box::new(FfmpegAudioReader {
                pipe: reader,
                format,
                frames_read: 0,
            }) as Box<dyn AudioBufferReader>)
        } else {
            None
        };

        Ok(DecodedSource {
            width: info.width,
            height: info.height,
            duration_micros: info.duration_micros,
            video: Box::new(FfmpegVideoReader {
                pipe: video,
                width: info.width,
                height: info.height,
                frame_rate,
                index: 0,
            }),
            audio,
        })
    }
}

/// A decoder child process whose stdout carries raw samples.
struct PipeReader {
    child: Child,
    stdout: ChildStdout,
    stderr: Option<JoinHandle<String>>,
    finished: bool,
    _workdir: Arc<TempDir>,
}

impl PipeReader {
    fn spawn(mut cmd: Command, workdir: Arc<TempDir>) -> std::io::Result<Self> {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = cmd.spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("decoder stdout not captured"))?;
        let stderr = child.stderr.take().map(drain_stderr);
        Ok(Self {
            child,
            stdout,
            stderr,
            finished: false,
            _workdir: workdir,
        })
    }

    /// Fill `buf` as far as the stream allows; returns the bytes read.
    async fn read_block(&mut self, buf: &mut [u8]) -> ClipResult<usize> {
        if self.finished {
            return Ok(0);
        }
        let filled = read_full(&mut self.stdout, buf)
            .await
            .map_err(|e| ClipError::decode(format!("Failed reading decoder output: {e}")))?;
        if filled < buf.len() {
            self.finish().await?;
        }
        Ok(filled)
    }

    async fn finish(&mut self) -> ClipResult<()> {
        self.finished = true;
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| ClipError::decode(format!("Failed to wait on decoder: {e}")))?;
        let stderr = match self.stderr.take() {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };
        if !status.success() {
            return Err(ClipError::decode(format!(
                "ffmpeg decode failed (status {status}): {}",
                stderr.trim()
            )));
        }
        Ok(())
    }

    async fn kill(&mut self) {
        self.finished = true;
        if let Err(e) = self.child.kill().await {
            tracing::debug!(error = %e, "Decoder already exited");
        }
    }
}

struct FfmpegVideoReader {
    pipe: PipeReader,
    width: u32,
    height: u32,
    frame_rate: u32,
    index: u64,
}

#[async_trait::async_trait]
impl VideoFrameReader for FfmpegVideoReader {
    async fn next_frame(&mut self) -> ClipResult<Option<VideoFrame>> {
        let frame_bytes = self.width as usize * self.height as usize * 4;
        let mut buf = vec![0u8; frame_bytes];
        let filled = self.pipe.read_block(&mut buf).await?;
        if filled < frame_bytes {
            if filled > 0 {
                tracing::debug!(bytes = filled, "Discarding partial trailing frame");
            }
            return Ok(None);
        }

        let image = RgbaImage::from_raw(self.width, self.height, buf)
            .ok_or_else(|| ClipError::decode("Decoded frame has unexpected size"))?;
        let timestamp = RecordingClock::frame_timestamp_micros(self.index, self.frame_rate);
        self.index += 1;
        Ok(Some(VideoFrame::new(timestamp, image)))
    }
}

struct FfmpegAudioReader {
    pipe: PipeReader,
    format: AudioFormat,
    frames_read: u64,
}

#[async_trait::async_trait]
impl AudioBufferReader for FfmpegAudioReader {
    async fn next_buffer(&mut self) -> ClipResult<Option<AudioBuffer>> {
        let channels = self.format.channels.max(1) as usize;
        let frame_bytes = channels * 4;
        let mut buf = vec![0u8; AUDIO_BUFFER_FRAMES * frame_bytes];
        let filled = self.pipe.read_block(&mut buf).await?;
        let frames = filled / frame_bytes;
        if frames == 0 {
            return Ok(None);
        }

        let samples = buf[..frames * frame_bytes]
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        let timestamp =
            RecordingClock::sample_timestamp_micros(self.frames_read, self.format.sample_rate);
        self.frames_read += frames as u64;
        Ok(Some(AudioBuffer::new(timestamp, self.format, samples)))
    }

    async fn cancel(&mut self) {
        self.pipe.kill().await;
    }
}

/// An encoder child process: raw input on stdin, an elementary stream on
/// stdout forwarded to the muxer by a drain task.
struct PipeEncoder {
    name: &'static str,
    child: Child,
    stdin: Option<ChildStdin>,
    drain: Option<JoinHandle<ClipResult<u64>>>,
    stderr: Option<JoinHandle<String>>,
}

impl PipeEncoder {
    fn spawn(
        name: &'static str,
        mut cmd: Command,
        splitter: AccessUnitSplitter,
        sink: EncodedFrameSink,
    ) -> ClipResult<Self> {
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = cmd.spawn().map_err(|e| {
            ClipError::encoder_config(format!("Failed to start {name} encoder: {e}"))
        })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take().ok_or_else(|| {
            ClipError::encoder_config(format!("Failed to capture {name} encoder output"))
        })?;
        let stderr = child.stderr.take().map(drain_stderr);

        let drain = tokio::spawn(forward_encoded(stdout, splitter, sink));

        tracing::debug!(encoder = name, pid = child.id(), "Encoder process started");
        Ok(Self {
            name,
            child,
            stdin,
            drain: Some(drain),
            stderr,
        })
    }

    async fn write(&mut self, bytes: &[u8]) -> ClipResult<()> {
        let stdin = self.stdin.as_mut().ok_or_else(|| {
            ClipError::encoder_config(format!("{} encoder already flushed", self.name))
        })?;
        stdin.write_all(bytes).await.map_err(|e| {
            ClipError::encoder_config(format!("{} encoder stopped accepting input: {e}", self.name))
        })
    }

    async fn flush(&mut self) -> ClipResult<()> {
        // Closing stdin makes ffmpeg drain its lookahead and exit.
        let Some(mut stdin) = self.stdin.take() else {
            return Ok(());
        };
        let _ = stdin.shutdown().await;
        drop(stdin);

        let forwarded = match self.drain.take() {
            Some(drain) => drain.await.map_err(|e| {
                ClipError::mux(format!("{} encoder drain failed: {e}", self.name))
            })??,
            None => 0,
        };

        let status = self.child.wait().await.map_err(|e| {
            ClipError::encoder_config(format!("Failed to wait on {} encoder: {e}", self.name))
        })?;
        let stderr = match self.stderr.take() {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };
        if !status.success() {
            return Err(ClipError::encoder_config(format!(
                "{} encoder failed (status {status}): {}",
                self.name,
                stderr.trim()
            )));
        }

        tracing::debug!(encoder = self.name, bytes = forwarded, "Encoder flushed");
        Ok(())
    }

    async fn close(&mut self) -> ClipResult<()> {
        if self.stdin.is_some() {
            self.flush().await?;
        }
        if let Some(drain) = self.drain.take() {
            drain.abort();
        }
        Ok(())
    }
}

/// Forward encoder output to the muxer one access unit at a time.
async fn forward_encoded(
    mut stdout: ChildStdout,
    mut splitter: AccessUnitSplitter,
    sink: EncodedFrameSink,
) -> ClipResult<u64> {
    let mut forwarded = 0u64;
    let mut buf = vec![0u8; PIPE_READ_BYTES];
    loop {
        let n = stdout
            .read(&mut buf)
            .await
            .map_err(|e| ClipError::mux(format!("Failed reading encoder output: {e}")))?;
        let units = if n == 0 {
            splitter.finish()
        } else {
            splitter.push(&buf[..n])
        };
        for unit in units {
            forwarded += unit.payload().len() as u64;
            sink.send(unit)
                .await
                .map_err(|_| ClipError::mux("Muxer closed before encoder finished"))?;
        }
        if n == 0 {
            break;
        }
    }
    Ok(forwarded)
}

struct FfmpegVideoEncoder {
    pipe: PipeEncoder,
    width: u32,
    height: u32,
}

#[async_trait::async_trait]
impl VideoEncoder for FfmpegVideoEncoder {
    async fn encode(&mut self, frame: VideoFrame) -> ClipResult<()> {
        if frame.width() != self.width || frame.height() != self.height {
            return Err(ClipError::encoder_config(format!(
                "Frame is {}x{}, encoder expects {}x{}",
                frame.width(),
                frame.height(),
                self.width,
                self.height
            )));
        }
        self.pipe
            .write(frame.image.as_raw())
            .await
    }

    async fn flush(&mut self) -> ClipResult<()> {
        self.pipe.flush().await
    }

    async fn close(&mut self) -> ClipResult<()> {
        self.pipe.close().await
    }
}

struct FfmpegAudioEncoder {
    pipe: PipeEncoder,
    format: AudioFormat,
}

#[async_trait::async_trait]
impl AudioEncoder for FfmpegAudioEncoder {
    async fn encode(&mut self, buffer: AudioBuffer) -> ClipResult<()> {
        if buffer.format != self.format {
            return Err(ClipError::encoder_config(format!(
                "Audio buffer is {:?}, encoder expects {:?}",
                buffer.format, self.format
            )));
        }
        self.pipe
            .write(&buffer.to_le_bytes())
            .await
    }

    async fn flush(&mut self) -> ClipResult<()> {
        self.pipe.flush().await
    }

    async fn close(&mut self) -> ClipResult<()> {
        self.pipe.close().await
    }
}

impl CodecFactory for Ffmpeg {
    fn video_encoder(
        &self,
        config: &VideoEncoderConfig,
        sink: EncodedFrameSink,
    ) -> ClipResult<Box<dyn VideoEncoder>> {
        let (profile, level) = h264_profile_level(&config.codec)?;
        if config.width == 0 || config.height == 0 || config.bitrate == 0 {
            return Err(ClipError::encoder_config(format!(
                "Invalid video encoder settings {config:?}"
            )));
        }
        let fps = config.frame_rate.max(1);

        let mut cmd = self.command();
        cmd.args(["-f", "rawvideo", "-pix_fmt", "rgba", "-s"])
            .arg(format!("{}x{}", config.width, config.height))
            .arg("-r")
            .arg(fps.to_string())
            .args(["-i", "pipe:0", "-c:v", "libx264", "-profile:v", profile, "-level:v"])
            .arg(level)
            .args(["-pix_fmt", "yuv420p", "-b:v"])
            .arg(config.bitrate.to_string())
            .arg("-g")
            .arg((fps * 2).to_string())
            .args(["-f", "h264", "pipe:1"]);

        Ok(Box::new(FfmpegVideoEncoder {
            pipe: PipeEncoder::spawn("video", cmd, AccessUnitSplitter::h264(fps), sink)?,
            width: config.width,
            height: config.height,
        }))
    }

    fn audio_encoder(
        &self,
        config: &AudioEncoderConfig,
        sink: EncodedFrameSink,
    ) -> ClipResult<Box<dyn AudioEncoder>> {
        if config.codec != "mp4a.40.2" {
            return Err(ClipError::encoder_config(format!(
                "Unsupported audio codec {}",
                config.codec
            )));
        }
        if config.sample_rate == 0 || config.channels == 0 {
            return Err(ClipError::encoder_config(format!(
                "Invalid audio encoder settings {config:?}"
            )));
        }

        let mut cmd = self.command();
        cmd.args(["-f", "f32le", "-ar"])
            .arg(config.sample_rate.to_string())
            .arg("-ac")
            .arg(config.channels.to_string())
            .args(["-i", "pipe:0", "-c:a", "aac", "-b:a"])
            .arg(config.bitrate.to_string())
            .args(["-f", "adts", "pipe:1"]);

        Ok(Box::new(FfmpegAudioEncoder {
            pipe: PipeEncoder::spawn(
                "audio",
                cmd,
                AccessUnitSplitter::aac(config.sample_rate),
                sink,
            )?,
            format: AudioFormat::new(config.sample_rate, config.channels),
        }))
    }

    fn muxer(&self, target: &MuxTarget) -> ClipResult<Box<dyn Muxer>> {
        if target.mime_type != "video/mp4" {
            return Err(ClipError::mux(format!(
                "Unsupported target container {}",
                target.mime_type
            )));
        }
        let workdir = tempfile::Builder::new()
            .prefix("synthcast-mux-")
            .tempdir()
            .map_err(|e| ClipError::mux(format!("Failed to create mux dir: {e}")))?;
        Ok(Box::new(FfmpegMuxer {
            ffmpeg: self.ffmpeg.clone(),
            target: target.clone(),
            workdir,
            video: None,
            audio: None,
        }))
    }
}

struct SpoolFile {
    path: PathBuf,
    file: tokio::fs::File,
    bytes: u64,
}

/// Spools elementary streams to disk, then remuxes them into MP4.
struct FfmpegMuxer {
    ffmpeg: PathBuf,
    target: MuxTarget,
    workdir: TempDir,
    video: Option<SpoolFile>,
    audio: Option<SpoolFile>,
}

impl FfmpegMuxer {
    async fn spool(&mut self, track: TrackKind) -> ClipResult<&mut SpoolFile> {
        let (slot, name) = match track {
            TrackKind::Video => (&mut self.video, "video.h264"),
            TrackKind::Audio => (&mut self.audio, "audio.aac"),
        };
        if slot.is_none() {
            let path = self.workdir.path().join(name);
            let file = tokio::fs::File::create(&path)
                .await
                .map_err(|e| ClipError::mux(format!("Failed to create {name}: {e}")))?;
            *slot = Some(SpoolFile {
                path,
                file,
                bytes: 0,
            });
        }
        slot.as_mut()
            .ok_or_else(|| ClipError::mux(format!("Spool file {name} unavailable")))
    }
}

#[async_trait::async_trait]
impl Muxer for FfmpegMuxer {
    async fn append(&mut self, frame: EncodedFrame) -> ClipResult<()> {
        let spool = self.spool(frame.track()).await?;
        spool
            .file
            .write_all(frame.payload())
            .await
            .map_err(|e| ClipError::mux(format!("Failed to spool encoded data: {e}")))?;
        spool.bytes += frame.payload().len() as u64;
        Ok(())
    }

    async fn finalize(&mut self) -> ClipResult<Vec<u8>> {
        for spool in [self.video.as_mut(), self.audio.as_mut()].into_iter().flatten() {
            spool
                .file
                .flush()
                .await
                .map_err(|e| ClipError::mux(format!("Failed to flush spool: {e}")))?;
        }
        let video = self.video.as_ref().filter(|s| s.bytes > 0).map(|s| s.path.as_path());
        let audio = self.audio.as_ref().filter(|s| s.bytes > 0).map(|s| s.path.as_path());

        if video.is_none() && audio.is_none() {
            tracing::warn!("Nothing was encoded; producing an empty container");
            return Ok(Vec::new());
        }

        let output = self.workdir.path().join("output.mp4");
        let args = mux_args(&self.target, video, audio, &output);
        let ffmpeg = self.ffmpeg.clone();
        tokio::task::spawn_blocking(move || run_ffmpeg(&ffmpeg, &args, |m| ClipError::mux(m)))
            .await
            .map_err(|e| ClipError::mux(format!("Mux task failed: {e}")))??;

        let bytes = tokio::fs::read(&output)
            .await
            .map_err(|e| ClipError::mux(format!("Failed to read muxed output: {e}")))?;
        tracing::debug!(bytes = bytes.len(), "Muxed MP4 container");
        Ok(bytes)
    }
}

fn mux_args(
    target: &MuxTarget,
    video: Option<&Path>,
    audio: Option<&Path>,
    output: &Path,
) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-hide_banner".into(),
        "-nostdin".into(),
        "-y".into(),
        "-v".into(),
        "error".into(),
    ];
    if let Some(video) = video {
        // Annex B carries no timestamps; the stream is constant-rate.
        args.extend([
            "-r".into(),
            target.frame_rate.to_string(),
            "-f".into(),
            "h264".into(),
            "-i".into(),
            video.to_string_lossy().into_owned(),
        ]);
    }
    if let Some(audio) = audio {
        args.extend([
            "-f".into(),
            "aac".into(),
            "-i".into(),
            audio.to_string_lossy().into_owned(),
        ]);
    }
    args.extend(["-c".into(), "copy".into()]);
    if audio.is_some() {
        args.extend(["-bsf:a".into(), "aac_adtstoasc".into()]);
    }
    if target.fast_start {
        args.extend(["-movflags".into(), "+faststart".into()]);
    }
    args.extend([
        "-f".into(),
        "mp4".into(),
        output.to_string_lossy().into_owned(),
    ]);
    args
}

fn drain_stderr(stderr: ChildStderr) -> JoinHandle<String> {
    tokio::spawn(async move {
        let mut stderr = stderr;
        let mut output = String::new();
        match stderr.read_to_string(&mut output).await {
            Ok(_) => output,
            Err(err) => format!("<failed to read ffmpeg stderr: {err}>"),
        }
    })
}

async fn read_full<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Run `ffmpeg` to completion, surfacing its stderr on failure.
pub(crate) fn run_ffmpeg(
    binary: &Path,
    args: &[String],
    fail: fn(String) -> ClipError,
) -> ClipResult<()> {
    tracing::debug!(?args, "Running ffmpeg");
    let mut child = std::process::Command::new(binary)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| fail(format!("Failed to start ffmpeg: {e}")))?;

    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| fail("Failed to capture ffmpeg stderr".to_string()))?;

    // Drain stderr concurrently to avoid ffmpeg blocking on a full stderr pipe.
    let stderr_task = std::thread::spawn(move || -> String {
        let mut reader = BufReader::new(stderr);
        let mut output = String::new();
        match reader.read_to_string(&mut output) {
            Ok(_) => output,
            Err(err) => format!("<failed to read ffmpeg stderr: {err}>"),
        }
    });

    let status = child
        .wait()
        .map_err(|e| fail(format!("Failed to wait on ffmpeg: {e}")))?;
    let stderr_output = stderr_task
        .join()
        .unwrap_or_else(|_| "<failed to join stderr reader>".to_string());

    if !status.success() {
        return Err(fail(format!(
            "ffmpeg failed (status {status}): {}",
            stderr_output.trim()
        )));
    }
    Ok(())
}

/// Whether a binary can be executed from this environment.
pub fn command_exists(binary: &Path) -> bool {
    std::process::Command::new(binary)
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_baseline_codec_string() {
        let (profile, level) = h264_profile_level("avc1.42001f").unwrap();
        assert_eq!(profile, "baseline");
        assert_eq!(level, "3.1");
        assert_eq!(h264_profile_level("avc1.4d0029").unwrap(), ("main", "4.1".to_string()));
    }

    #[test]
    fn test_unknown_codec_rejected() {
        for codec in ["vp09.00.10.08", "avc1.58001f", "avc1.42", "avc1.zz001f"] {
            assert!(
                matches!(
                    h264_profile_level(codec),
                    Err(ClipError::EncoderConfigRejected { .. })
                ),
                "{codec} should be rejected"
            );
        }
    }

    #[test]
    fn test_parse_probe_with_audio() {
        let raw = "codec_type=video\nwidth=640\nheight=360\ncodec_type=audio\nduration=2.016000\n";
        let info = parse_probe_output(raw).unwrap();
        assert_eq!((info.width, info.height), (640, 360));
        assert!(info.has_audio);
        assert_eq!(info.duration_micros, Some(2_016_000));
    }

    #[test]
    fn test_parse_probe_webm_without_duration() {
        let raw = "codec_type=audio\nwidth=N/A\nheight=N/A\ncodec_type=video\nwidth=1280\nheight=720\nduration=N/A\n";
        let info = parse_probe_output(raw).unwrap();
        assert_eq!((info.width, info.height), (1280, 720));
        assert_eq!(info.duration_micros, None);
    }

    #[test]
    fn test_parse_probe_audio_only_is_not_decodable() {
        assert!(parse_probe_output("codec_type=audio\nduration=1.0\n").is_none());
    }

    #[test]
    fn test_mux_args_video_only() {
        let target = MuxTarget::mp4(640, 360, false, &Default::default());
        let args = mux_args(
            &target,
            Some(Path::new("/tmp/v.h264")),
            None,
            Path::new("/tmp/out.mp4"),
        );
        let joined = args.join(" ");
        assert!(joined.contains("-r 60 -f h264 -i /tmp/v.h264"));
        assert!(joined.contains("-c copy -movflags +faststart -f mp4 /tmp/out.mp4"));
        assert!(!joined.contains("aac_adtstoasc"));
    }

    #[test]
    fn test_mux_args_with_audio() {
        let target = MuxTarget::mp4(640, 360, true, &Default::default());
        let args = mux_args(
            &target,
            Some(Path::new("/tmp/v.h264")),
            Some(Path::new("/tmp/a.aac")),
            Path::new("/tmp/out.mp4"),
        );
        let joined = args.join(" ");
        assert!(joined.contains("-f aac -i /tmp/a.aac -c copy -bsf:a aac_adtstoasc"));
    }

    #[test]
    fn test_ffprobe_found_next_to_ffmpeg() {
        let backend = Ffmpeg::new("/opt/ffmpeg/bin/ffmpeg");
        assert_eq!(backend.ffprobe_path(), Path::new("/opt/ffmpeg/bin/ffprobe"));
        assert_eq!(Ffmpeg::default().ffprobe_path(), Path::new("ffprobe"));
    }
}
