//! Synthcast Media Model
//!
//! Defines the data contracts passed between capture and compose:
//! - **Formats:** Container/codec combinations and their mime strings
//! - **Containers:** Immutable raw recordings and composed outputs
//! - **Frames:** Decoded video frames, audio buffers, and encoded samples
//!
//! Every byte sequence in this crate is immutable once produced. Containers
//! share their payload through `Arc<[u8]>` so handing one downstream never
//! copies or mutates it.

pub mod container;
pub mod format;
pub mod frame;

pub use container::*;
pub use format::*;
pub use frame::*;
