//! On-device sync journal
//!
//! Every `tracing` event is appended as one JSON line to a per-device,
//! per-day file, so a device that spent weeks offline still has a trail of
//! what it queued, retried and dropped.
//!
//! ```text
//! <data_dir>/logs/
//! └── raw/
//!     ├── 2024-03-11_kabwe-01.jsonl
//!     └── 2024-03-12_kabwe-01.jsonl
//! ```
//!
//! ```ignore
//! use schoolsync_core::logging::JournalLayer;
//! use tracing_subscriber::prelude::*;
//!
//! let journal = JournalLayer::new(data_dir.join("logs"), "kabwe-01")?;
//! tracing_subscriber::registry()
//!     .with(journal)
//!     .with(tracing_subscriber::fmt::layer())
//!     .init();
//! ```
//!
//! The files are plain JSONL, so `jq 'select(.level == "warn")'` works too.

pub mod entry;
pub mod layer;
pub mod writer;

pub use entry::JournalEntry;
pub use layer::JournalLayer;
pub use writer::{read_journal, JournalFilter, JournalWriter};
