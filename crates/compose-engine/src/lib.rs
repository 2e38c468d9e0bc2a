//! Synthcast Compose Engine
//!
//! Post-processing for finished recordings:
//! - **Recomposer:** draws an overlay onto every frame and re-encodes the
//!   recording as MP4 (H.264 baseline + AAC-LC)
//! - **Transcoder:** the server-side variant, scaling uploads to a canonical
//!   width with the same overlay placement
//!
//! # Pipeline Architecture
//!
//! ```text
//! RawContainer ──► decode ──► frames ──► overlay ──► H.264 ──┐
//!                    │                                       ├──► MP4 mux ──► FinalContainer
//!                    └──────► audio  ──────────────► AAC ────┘
//! ```
//!
//! Without an overlay the recording passes through byte-for-byte.

pub mod codec;
pub mod compositor;
mod elementary;
pub mod ffmpeg;
pub mod recompose;
pub mod transcode;

pub use codec::*;
pub use compositor::{FrameCompositor, OverlayImage, OverlayPlacement, OverlaySource};
pub use ffmpeg::Ffmpeg;
pub use recompose::*;
pub use transcode::{TranscodeRequest, Transcoder};

use std::sync::Arc;

use synthcast_common::config::ComposeDefaults;

/// A recomposer backed by the configured `ffmpeg` binary.
pub fn ffmpeg_recomposer(defaults: ComposeDefaults) -> Recomposer {
    let backend = Arc::new(Ffmpeg::new(defaults.ffmpeg_path.clone()));
    Recomposer::new(backend.clone(), backend, defaults)
}
