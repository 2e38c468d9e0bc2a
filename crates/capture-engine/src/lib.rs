//! Synthcast Capture Engine
//!
//! Turns a live generative canvas and the synth that accompanies it into a
//! single recorded clip. Live playback is never interrupted: the audio side
//! is captured through an extra tap on the engine output, and the canvas is
//! only ever read.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────┐
//! │                   CaptureSession                   │
//! │  ┌───────────────┐         ┌────────────────────┐  │
//! │  │ StreamJoiner  │ tracks  │ MediaRecorder      │  │
//! │  │  surface tick ├────────►│  encode + mux      │  │
//! │  │  engine tap   │         │  chunk every 100ms │  │
//! │  └───────────────┘         └─────────┬──────────┘  │
//! │          MimeNegotiator              │ chunks      │
//! │                                      ▼             │
//! │                              ChunkSequence         │
//! └──────────────────────────────────────┬─────────────┘
//!                                        ▼
//!                                  RawContainer
//! ```

pub mod joiner;
pub mod mime;
pub mod pipeline;
pub mod session;
pub mod synthetic;

pub use joiner::{
    AudioEngine, EngineState, JoinedStream, StreamInfo, StreamJoiner, StreamStats, StreamTracks,
    TapDestination, TapId, VisualSurface,
};
pub use mime::{negotiate, FormatSupport, MimeNegotiator};
pub use pipeline::{
    GstRecorderFactory, MediaRecorder, RecorderEvent, RecorderEventSink, RecorderFactory,
    RecorderOptions, RecorderStats,
};
pub use session::*;
