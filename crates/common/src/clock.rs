//! Clock and timing utilities for stream synchronization.
//!
//! Every captured stream is stamped relative to a monotonic epoch taken
//! when the recording starts. This module provides:
//! - The recording clock itself
//! - Conversions between microseconds, seconds, and frame/sample counts
//! - Drift measurement between the video and audio tracks

use std::time::Instant;

/// A recording clock that provides monotonic timestamps relative to
/// a fixed epoch (the moment recording started).
#[derive(Debug, Clone)]
pub struct RecordingClock {
    /// The instant recording started.
    epoch: Instant,

    /// Wall-clock time at epoch (RFC 3339 string).
    epoch_wall: String,
}

impl RecordingClock {
    /// Create a new recording clock anchored to now.
    pub fn start() -> Self {
        Self {
            epoch: Instant::now(),
            epoch_wall: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Microseconds elapsed since recording start.
    pub fn elapsed_micros(&self) -> i64 {
        self.epoch.elapsed().as_micros() as i64
    }

    /// Seconds elapsed since recording start.
    pub fn elapsed_secs(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    /// Wall-clock time at recording start.
    pub fn epoch_wall(&self) -> &str {
        &self.epoch_wall
    }

    pub fn micros_to_secs(micros: i64) -> f64 {
        micros as f64 / 1_000_000.0
    }

    /// Duration of one frame at `fps`, in microseconds.
    pub fn frame_interval_micros(fps: u32) -> i64 {
        1_000_000 / fps.max(1) as i64
    }

    /// Presentation time of the `index`-th frame at a constant rate.
    pub fn frame_timestamp_micros(index: u64, fps: u32) -> i64 {
        (index as i128 * 1_000_000 / fps.max(1) as i128) as i64
    }

    /// Presentation time after `frames` sample frames at `sample_rate`.
    pub fn sample_timestamp_micros(frames: u64, sample_rate: u32) -> i64 {
        (frames as i128 * 1_000_000 / sample_rate.max(1) as i128) as i64
    }
}

/// Drift measurement between two streams.
#[derive(Debug, Clone, Copy)]
pub struct DriftMeasurement {
    /// Duration covered by the reference stream (µs).
    pub reference_micros: i64,
    /// Duration covered by the measured stream (µs).
    pub measured_micros: i64,
}

impl DriftMeasurement {
    /// Drift in microseconds (positive = measured is ahead).
    pub fn drift_micros(&self) -> i64 {
        self.measured_micros - self.reference_micros
    }

    /// Drift in milliseconds.
    pub fn drift_ms(&self) -> f64 {
        self.drift_micros() as f64 / 1_000.0
    }

    /// Whether drift exceeds an acceptable threshold.
    pub fn exceeds_threshold_ms(&self, threshold_ms: f64) -> bool {
        self.drift_ms().abs() > threshold_ms
    }
}
