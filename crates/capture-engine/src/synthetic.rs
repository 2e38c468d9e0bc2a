//! Synthetic visual and audio sources.
//!
//! Stand-ins for the generative renderer and the synth engine, used by the
//! CLI demo and by tests. The audio engine renders a two-operator FM voice
//! whose pitch follows the pointer's x position across an F minor pentatonic
//! scale and whose timbre follows y.

use std::f32::consts::TAU;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use image::{Rgba, RgbaImage};
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use synthcast_common::error::{ClipError, ClipResult};
use synthcast_media_model::{AudioBuffer, AudioFormat};

use crate::joiner::{AudioEngine, EngineState, TapDestination, TapId, VisualSurface};

/// F minor pentatonic, F3 to Eb5.
pub const PENTATONIC_HZ: [f32; 10] = [
    174.61, 207.65, 233.08, 261.63, 311.13, 349.23, 415.30, 466.16, 523.25, 622.25,
];

/// Sample frames rendered per buffer.
const BUFFER_FRAMES: usize = 1024;

/// A generative gradient with a marker that follows the pointer.
pub struct SyntheticSurface {
    width: u32,
    height: u32,
    started: Instant,
    pointer: Mutex<(f32, f32)>,
}

impl SyntheticSurface {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            started: Instant::now(),
            pointer: Mutex::new((0.5, 0.5)),
        }
    }

    /// Move the pointer marker (normalized coordinates).
    pub fn set_pointer(&self, x: f32, y: f32) {
        *self.pointer.lock() = (x.clamp(0.0, 1.0), y.clamp(0.0, 1.0));
    }
}

impl VisualSurface for SyntheticSurface {
    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn snapshot(&self) -> Option<RgbaImage> {
        if self.width == 0 || self.height == 0 {
            return None;
        }
        let phase = self.started.elapsed().as_secs_f32();
        let (px, py) = *self.pointer.lock();
        let marker_x = (px * self.width as f32) as i64;
        let marker_y = (py * self.height as f32) as i64;
        let marker_r = (self.width.min(self.height) / 20).max(1) as i64;

        Some(RgbaImage::from_fn(self.width, self.height, |x, y| {
            let (dx, dy) = (x as i64 - marker_x, y as i64 - marker_y);
            if dx.abs() <= marker_r && dy.abs() <= marker_r {
                return Rgba([255, 255, 255, 255]);
            }
            let u = x as f32 / self.width as f32;
            let v = y as f32 / self.height as f32;
            let r = (0.5 + 0.5 * (TAU * (u + phase * 0.1)).sin()) * 255.0;
            let g = (0.5 + 0.5 * (TAU * (v + phase * 0.07)).sin()) * 255.0;
            let b = (0.5 + 0.5 * (TAU * (u + v + phase * 0.05)).cos()) * 255.0;
            Rgba([r as u8, g as u8, b as u8, 255])
        }))
    }
}

/// Pitch and timbre of the FM voice.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Voice {
    pub frequency_hz: f32,
    pub harmonicity: f32,
    pub modulation_index: f32,
    pub velocity: f32,
}

impl Voice {
    /// Map a normalized pointer position to a voice: x picks the note,
    /// y drives harmonicity (0.5..3.5) and modulation index (1..1+max_mod).
    pub fn from_pointer(x: f32, y: f32, max_modulation: f32) -> Self {
        let x = x.clamp(0.0, 1.0);
        let y = y.clamp(0.0, 1.0);
        let idx = ((x * PENTATONIC_HZ.len() as f32) as usize).min(PENTATONIC_HZ.len() - 1);
        Self {
            frequency_hz: PENTATONIC_HZ[idx],
            harmonicity: 0.5 + y * 3.0,
            modulation_index: 1.0 + y * max_modulation,
            velocity: 0.75,
        }
    }
}

struct EngineInner {
    format: AudioFormat,
    state: Mutex<EngineState>,
    taps: Mutex<Vec<(TapId, TapDestination)>>,
    voice: Mutex<(Voice, u64)>,
    next_tap: AtomicU64,
    played_buffers: AtomicU64,
    resumes: AtomicU64,
    disconnects: AtomicU64,
}

/// An FM synth that renders in real time once resumed.
///
/// Rendered buffers always go to the live playback path (counted, then
/// discarded here) and a copy goes to every registered tap.
pub struct SyntheticAudioEngine {
    inner: Arc<EngineInner>,
    generator: Mutex<Option<JoinHandle<()>>>,
}

impl SyntheticAudioEngine {
    pub fn new(format: AudioFormat) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                format,
                state: Mutex::new(EngineState::Suspended),
                taps: Mutex::new(Vec::new()),
                voice: Mutex::new((Voice::from_pointer(0.5, 0.5, 10.0), 0)),
                next_tap: AtomicU64::new(1),
                played_buffers: AtomicU64::new(0),
                resumes: AtomicU64::new(0),
                disconnects: AtomicU64::new(0),
            }),
            generator: Mutex::new(None),
        }
    }

    /// Trigger a note from a pointer position.
    pub fn trigger(&self, x: f32, y: f32) {
        let mut voice = self.inner.voice.lock();
        voice.0 = Voice::from_pointer(x, y, 10.0);
        voice.1 = 0;
    }

    /// Shut the engine down; taps stop receiving.
    pub fn close(&self) {
        *self.inner.state.lock() = EngineState::Closed;
        if let Some(handle) = self.generator.lock().take() {
            handle.abort();
        }
    }

    pub fn tap_count(&self) -> usize {
        self.inner.taps.lock().len()
    }

    pub fn resume_count(&self) -> u64 {
        self.inner.resumes.load(Ordering::Relaxed)
    }

    pub fn disconnect_count(&self) -> u64 {
        self.inner.disconnects.load(Ordering::Relaxed)
    }

    pub fn played_buffers(&self) -> u64 {
        self.inner.played_buffers.load(Ordering::Relaxed)
    }

    /// The live playback path is never detached by tapping.
    pub fn playback_connected(&self) -> bool {
        *self.inner.state.lock() != EngineState::Closed
    }
}

#[async_trait::async_trait]
impl AudioEngine for SyntheticAudioEngine {
    fn state(&self) -> EngineState {
        *self.inner.state.lock()
    }

    async fn resume(&self) -> ClipResult<()> {
        {
            let mut state = self.inner.state.lock();
            match *state {
                EngineState::Running => return Ok(()),
                EngineState::Closed => {
                    return Err(ClipError::audio_engine("Cannot resume a closed engine"))
                }
                EngineState::Suspended => *state = EngineState::Running,
            }
        }
        self.inner.resumes.fetch_add(1, Ordering::Relaxed);
        let handle = tokio::spawn(render_loop(Arc::clone(&self.inner)));
        *self.generator.lock() = Some(handle);
        Ok(())
    }

    fn output_format(&self) -> AudioFormat {
        self.inner.format
    }

    fn connect_tap(&self, destination: TapDestination) -> ClipResult<TapId> {
        if *self.inner.state.lock() == EngineState::Closed {
            return Err(ClipError::audio_engine("Cannot tap a closed engine"));
        }
        let mut taps = self.inner.taps.lock();
        if !taps.is_empty() {
            return Err(ClipError::AlreadyRecording);
        }
        let id = TapId(self.inner.next_tap.fetch_add(1, Ordering::Relaxed));
        taps.push((id, destination));
        Ok(id)
    }

    fn disconnect_tap(&self, tap: TapId) {
        let mut taps = self.inner.taps.lock();
        let before = taps.len();
        taps.retain(|(id, _)| *id != tap);
        if taps.len() != before {
            self.inner.disconnects.fetch_add(1, Ordering::Relaxed);
        }
    }
}

async fn render_loop(inner: Arc<EngineInner>) {
    let format = inner.format;
    let period = Duration::from_micros(
        (BUFFER_FRAMES as u64 * 1_000_000) / format.sample_rate.max(1) as u64,
    );
    let mut ticker = tokio::time::interval(period);
    let mut rendered_frames: u64 = 0;

    loop {
        ticker.tick().await;
        if *inner.state.lock() != EngineState::Running {
            break;
        }

        let buffer = {
            let mut voice = inner.voice.lock();
            let buffer = render_fm(voice.0, voice.1, rendered_frames, format);
            voice.1 += BUFFER_FRAMES as u64;
            buffer
        };
        rendered_frames += BUFFER_FRAMES as u64;

        // Live output first.
        inner.played_buffers.fetch_add(1, Ordering::Relaxed);

        let mut taps = inner.taps.lock();
        taps.retain(|(_, destination)| destination.deliver(buffer.clone()));
    }
}

fn render_fm(voice: Voice, age_frames: u64, start_frame: u64, format: AudioFormat) -> AudioBuffer {
    let rate = format.sample_rate.max(1) as f32;
    let channels = format.channels.max(1) as usize;
    let mut samples = Vec::with_capacity(BUFFER_FRAMES * channels);

    for i in 0..BUFFER_FRAMES {
        let t = (start_frame + i as u64) as f32 / rate;
        let note_age = (age_frames + i as u64) as f32 / rate;
        // Fast attack, exponential decay towards a sustain floor.
        let envelope = (note_age / 0.01).min(1.0) * (0.5 + 0.5 * (-note_age / 0.2).exp());
        let modulator = (TAU * voice.frequency_hz * voice.harmonicity * t).sin();
        let carrier = (TAU * voice.frequency_hz * t + voice.modulation_index * modulator).sin();
        let value = carrier * envelope * voice.velocity * 0.3;
        for _ in 0..channels {
            samples.push(value);
        }
    }

    let timestamp_micros = (start_frame as i128 * 1_000_000 / rate as i128) as i64;
    AudioBuffer::new(timestamp_micros, format, samples)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pointer_maps_to_pentatonic_note() {
        assert_eq!(Voice::from_pointer(0.0, 0.0, 10.0).frequency_hz, 174.61);
        assert_eq!(Voice::from_pointer(1.0, 0.0, 10.0).frequency_hz, 622.25);
        assert_eq!(Voice::from_pointer(0.35, 0.0, 10.0).frequency_hz, 261.63);
    }

    #[test]
    fn test_pointer_y_drives_timbre() {
        let low = Voice::from_pointer(0.5, 0.0, 10.0);
        let high = Voice::from_pointer(0.5, 1.0, 10.0);
        assert!((low.harmonicity - 0.5).abs() < 1e-6);
        assert!((high.harmonicity - 3.5).abs() < 1e-6);
        assert!((high.modulation_index - 11.0).abs() < 1e-6);
    }

    #[test]
    fn test_render_fm_is_bounded() {
        let voice = Voice::from_pointer(0.2, 0.8, 10.0);
        let buffer = render_fm(voice, 0, 0, AudioFormat::cd_stereo());
        assert_eq!(buffer.frames(), BUFFER_FRAMES);
        assert!(buffer.samples.iter().all(|s| s.abs() <= 1.0));
    }

    #[test]
    fn test_surface_snapshot_dimensions() {
        let surface = SyntheticSurface::new(40, 20);
        surface.set_pointer(0.9, 0.1);
        let frame = surface.snapshot().unwrap();
        assert_eq!(frame.dimensions(), (40, 20));
        assert!(SyntheticSurface::new(0, 0).snapshot().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_engine_cannot_resume() {
        let engine = SyntheticAudioEngine::new(AudioFormat::cd_stereo());
        engine.resume().await.unwrap();
        engine.close();
        assert_eq!(engine.state(), EngineState::Closed);
        assert!(engine.resume().await.is_err());
    }
}
