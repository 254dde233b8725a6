//! Sync queue item types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::Ulid;

use super::{DataType, Priority, Record, RecordKey};

/// Identifier of a queued mutation, distinct from the record key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueueItemId(pub Ulid);

impl QueueItemId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parse from string representation
    pub fn from_string(s: &str) -> Result<Self, ulid::DecodeError> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

impl Default for QueueItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for QueueItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of local mutation to replay against the remote service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncAction {
    Store,
    Update,
    Delete,
}

impl std::fmt::Display for SyncAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncAction::Store => write!(f, "store"),
            SyncAction::Update => write!(f, "update"),
            SyncAction::Delete => write!(f, "delete"),
        }
    }
}

/// A mutation waiting to be pushed to the remote service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncQueueItem {
    pub id: QueueItemId,
    pub action: SyncAction,
    pub data_type: DataType,
    pub record_key: RecordKey,
    /// Decompressed payload; absent for deletes
    pub payload: Option<Value>,
    /// Record version this mutation produced
    pub record_version: u64,
    pub priority: Priority,
    pub added_at: DateTime<Utc>,
    pub retry_count: u32,
    /// Backoff gate: the item is skipped by a drain until this instant
    #[serde(default)]
    pub next_attempt_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl SyncQueueItem {
    /// Materialize a draft into a fresh item with a new id
    pub fn from_draft(draft: QueueItemDraft) -> Self {
        Self {
            id: QueueItemId::new(),
            action: draft.action,
            data_type: draft.data_type,
            record_key: draft.record_key,
            payload: draft.payload,
            record_version: draft.record_version,
            priority: draft.priority,
            added_at: Utc::now(),
            retry_count: 0,
            next_attempt_at: None,
            last_error: None,
        }
    }

    /// Whether the backoff gate has passed
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.map_or(true, |at| at <= now)
    }
}

/// Everything needed to enqueue a mutation; the queue assigns id and time
#[derive(Debug, Clone, PartialEq)]
pub struct QueueItemDraft {
    pub action: SyncAction,
    pub data_type: DataType,
    pub record_key: RecordKey,
    pub payload: Option<Value>,
    pub record_version: u64,
    pub priority: Priority,
}

impl QueueItemDraft {
    /// Draft a `store` for a freshly created record
    pub fn store(record: &Record, payload: Value) -> Self {
        Self {
            action: SyncAction::Store,
            data_type: record.data_type.clone(),
            record_key: record.key.clone(),
            payload: Some(payload),
            record_version: record.version,
            priority: record.priority,
        }
    }

    /// Draft an `update` carrying the full decompressed payload
    pub fn update(record: &Record, payload: Value) -> Self {
        Self {
            action: SyncAction::Update,
            ..Self::store(record, payload)
        }
    }

    /// Draft a `delete`; deletes always drain with high priority
    pub fn delete(record: &Record) -> Self {
        Self {
            action: SyncAction::Delete,
            data_type: record.data_type.clone(),
            record_key: record.key.clone(),
            payload: None,
            record_version: record.version,
            priority: Priority::High,
        }
    }
}

/// A queue item dropped after exhausting its retries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedItem {
    pub item: SyncQueueItem,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}
