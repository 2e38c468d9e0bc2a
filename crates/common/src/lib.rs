//! Synthcast Common Utilities
//!
//! Shared infrastructure for all Synthcast crates:
//! - Error taxonomy and result aliases
//! - Clock and drift utilities for keeping audio and video aligned
//! - Tracing/logging initialization
//! - Configuration loading

pub mod clock;
pub mod config;
pub mod error;
pub mod logging;

pub use clock::*;
pub use config::*;
pub use error::*;
