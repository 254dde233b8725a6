//! SchoolSync Core Library
//!
//! Offline-first record storage and sync for school dashboards.
//!
//! ## Overview
//!
//! Schools on intermittent links record attendance, grades and student
//! data locally. Every mutation is persisted, compressed when it pays off,
//! and queued. When connectivity returns the queue drains to the remote
//! service in priority order, with backoff on failure and conflict
//! resolution when the remote copy has moved on.
//!
//! ## Core Principles
//!
//! - **Durable first**: a write is on disk and queued before it returns
//! - **Unsynced data is sacred**: storage relief only ever purges synced records
//! - **One drain at a time**: overlapping sync requests return immediately
//!
//! ## Quick Start
//!
//! ```ignore
//! use schoolsync_core::{HttpRemote, OfflineConfig, OfflineCoordinator, Priority, RecordFilter};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let remote = HttpRemote::new("https://sync.example.zm/api", Duration::from_secs(30))?;
//!     let coordinator = OfflineCoordinator::open(
//!         "~/.schoolsync/data",
//!         OfflineConfig::default(),
//!         Arc::new(remote),
//!     )?;
//!
//!     coordinator
//!         .store_offline_data("attendance", json!({"studentId": "ZM-0042", "present": true}), Priority::Normal)
//!         .await?;
//!
//!     let summary = coordinator.synchronize_offline_data().await?;
//!     println!("{}", summary);
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod conflict;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod logging;
pub mod memory;
pub mod remote;
pub mod storage;
pub mod types;

// Re-exports
pub use codec::{Codec, CodecKind, CompressedPayload, TokenCodec, ZstdCodec};
pub use config::OfflineConfig;
pub use conflict::{ConflictResolver, ConflictStrategy, Resolution, Winner};
pub use coordinator::{
    CoordinatorBuilder, OfflineCoordinator, PendingConflict, ResolutionChoice, UpdateOutcome,
};
pub use error::{SyncError, SyncResult};
pub use events::{OfflineEvent, OfflineStatus, PowerMode, PurgeReport, SyncSummary};
pub use memory::MemoryStore;
pub use remote::{HttpRemote, RemoteEndpoint, RemoteRequest, RemoteResponse, UnconfiguredRemote};
pub use storage::{QueueStore, RecordStore, Storage};
pub use types::*;
