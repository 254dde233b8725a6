//! Persistent storage using redb.
//!
//! This module provides ACID-compliant storage for:
//! - Records, with secondary indexes by data type, timestamp and priority
//! - The sync queue, ordered by a monotonically increasing sequence
//! - Failed (dead-letter) queue items
//!
//! The [`RecordStore`] and [`QueueStore`] traits are the seams the
//! coordinator depends on; [`crate::memory::MemoryStore`] implements them
//! without a database file.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use redb::{Database, TableDefinition};

use crate::error::SyncError;
use crate::types::{
    DataType, FailedItem, QueueItemDraft, QueueItemId, Record, RecordQuery, SyncQueueItem,
};

// Submodules
mod queue;
mod records;

use queue::{FAILED_ITEMS_TABLE, QUEUE_ID_INDEX, QUEUE_TABLE};
use records::{PRIORITY_INDEX, RECORDS_TABLE, TIME_INDEX, TYPE_INDEX};

/// Default database file name inside the data directory
pub const DATABASE_FILE: &str = "schoolsync.redb";

const META_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");
const SCHEMA_VERSION_KEY: &str = "schema_version";
const SCHEMA_VERSION: u8 = 1;

/// Key-indexed record persistence
pub trait RecordStore: Send + Sync {
    /// Insert or replace a record by key
    fn put(&self, record: &Record) -> Result<(), SyncError>;

    fn get(&self, key: &str) -> Result<Option<Record>, SyncError>;

    fn get_by_type(&self, data_type: &DataType) -> Result<Vec<Record>, SyncError>;

    fn get_all(&self) -> Result<BTreeMap<String, Record>, SyncError>;

    /// Remove a record; returns whether it existed
    fn delete(&self, key: &str) -> Result<bool, SyncError>;

    fn query(&self, query: &RecordQuery) -> Result<Vec<Record>, SyncError>;

    /// All records ordered by timestamp, oldest first
    fn oldest_first(&self) -> Result<Vec<Record>, SyncError>;

    /// Bytes occupied by stored records
    fn total_bytes(&self) -> Result<u64, SyncError>;
}

/// Ordered, persisted queue of pending mutations
pub trait QueueStore: Send + Sync {
    /// Append a mutation; the store assigns id and `added_at`
    fn add(&self, draft: QueueItemDraft) -> Result<SyncQueueItem, SyncError>;

    /// Snapshot in insertion order
    fn get_all(&self) -> Result<Vec<SyncQueueItem>, SyncError>;

    /// Replace an item in place, keeping its position
    fn update(&self, item: &SyncQueueItem) -> Result<(), SyncError>;

    fn remove(&self, id: &QueueItemId) -> Result<bool, SyncError>;

    /// Remove everything; returns how many items were dropped
    fn clear(&self) -> Result<usize, SyncError>;

    fn size(&self) -> Result<usize, SyncError>;

    /// Record an item dropped after exhausting retries
    fn record_failure(&self, item: &SyncQueueItem, reason: &str) -> Result<(), SyncError>;

    fn failed_items(&self) -> Result<Vec<FailedItem>, SyncError>;

    /// Remove and return a failed item, e.g. to requeue it
    fn take_failed(&self, id: &QueueItemId) -> Result<Option<FailedItem>, SyncError>;
}

/// Storage layer using redb for ACID-compliant persistence
#[derive(Clone)]
pub struct Storage {
    db: Arc<RwLock<Database>>,
}

impl Storage {
    /// Create a new storage instance at the given path.
    ///
    /// This will:
    /// - Create the database directory if it doesn't exist
    /// - Initialize the database file
    /// - Create all required tables
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(RECORDS_TABLE)?;
            let _ = write_txn.open_table(TYPE_INDEX)?;
            let _ = write_txn.open_table(TIME_INDEX)?;
            let _ = write_txn.open_table(PRIORITY_INDEX)?;
            let _ = write_txn.open_table(QUEUE_TABLE)?;
            let _ = write_txn.open_table(QUEUE_ID_INDEX)?;
            let _ = write_txn.open_table(FAILED_ITEMS_TABLE)?;

            let mut meta = write_txn.open_table(META_TABLE)?;
            meta.insert(SCHEMA_VERSION_KEY, [SCHEMA_VERSION].as_slice())?;
        }
        records::ensure_record_bytes(&write_txn)?;
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
        })
    }

    /// Open the database inside a data directory
    pub fn open_in(data_dir: impl AsRef<Path>) -> Result<Self, SyncError> {
        Self::new(data_dir.as_ref().join(DATABASE_FILE))
    }

    /// Get a reference to the shared database handle
    pub fn db_handle(&self) -> Arc<RwLock<Database>> {
        self.db.clone()
    }
}
