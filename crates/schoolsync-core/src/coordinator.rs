//! Offline coordinator: the public face of the sync engine
//!
//! The coordinator owns the write path (compress → persist → enqueue), the
//! queue drain, connectivity transitions and background maintenance.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  OfflineCoordinator                                             │
//! │  ├── records: Arc<dyn RecordStore>     durable records          │
//! │  ├── queue: Arc<dyn QueueStore>        pending mutations        │
//! │  ├── codec: Arc<dyn Codec>             payload compression      │
//! │  ├── resolver: ConflictResolver        remote divergence        │
//! │  ├── remote: Arc<dyn RemoteEndpoint>   where mutations go       │
//! │  ├── write_lock: tokio Mutex           serializes mutations     │
//! │  ├── syncing: AtomicBool               one drain at a time      │
//! │  ├── tasks: Vec<JoinHandle>            watcher + maintenance    │
//! │  └── event_tx: broadcast::Sender<OfflineEvent>                  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! let coordinator = Arc::new(OfflineCoordinator::open(
//!     "~/.schoolsync/data",
//!     OfflineConfig::default(),
//!     Arc::new(HttpRemote::new("https://sync.example.zm", Duration::from_secs(30))?),
//! )?);
//! let (online_tx, online_rx) = tokio::sync::watch::channel(false);
//! coordinator.init(Some(online_rx));
//!
//! let key = coordinator
//!     .store_offline_data("attendance", json!({"studentId": "ZM-0042", "present": true}), Priority::Normal)
//!     .await?;
//!
//! // Link comes back: the watcher drains the queue
//! online_tx.send(true)?;
//! ```

mod conflicts;
mod drain;
mod maintenance;

pub use conflicts::{PendingConflict, ResolutionChoice};

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::codec::{self, Codec, CompressedPayload};
use crate::config::OfflineConfig;
use crate::conflict::{merge_payloads, ConflictResolver};
use crate::error::{SyncError, SyncResult};
use crate::events::{OfflineEvent, OfflineStatus, PowerMode, EVENT_CHANNEL_CAPACITY};
use crate::memory::MemoryStore;
use crate::remote::RemoteEndpoint;
use crate::storage::{QueueStore, RecordStore, Storage};
use crate::types::{
    DataType, FailedItem, Priority, QueueItemDraft, QueueItemId, Record, RecordFilter, RecordKey,
    RecordQuery, SyncAction, SyncQueueItem,
};

/// Result of `update_offline_data`
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    Updated(RecordKey),
    NotFound,
    /// `expected_version` did not match; carries the current record
    Conflict { current: Box<Record> },
}

/// Connectivity and power bookkeeping
#[derive(Debug, Clone)]
struct ConnectivityState {
    online: bool,
    offline_since: Option<DateTime<Utc>>,
    power_mode: PowerMode,
    last_sync_at: Option<DateTime<Utc>>,
}

enum Transition {
    WentOffline,
    CameOnline { offline_for: Option<chrono::Duration> },
}

impl ConnectivityState {
    fn new(online: bool) -> Self {
        Self {
            online,
            offline_since: (!online).then(Utc::now),
            power_mode: if online {
                PowerMode::Normal
            } else {
                PowerMode::UltraLow
            },
            last_sync_at: None,
        }
    }

    /// Apply a connectivity report; `None` when nothing changed
    fn apply(&mut self, online: bool, now: DateTime<Utc>) -> Option<Transition> {
        if self.online == online {
            return None;
        }
        self.online = online;
        if online {
            self.power_mode = PowerMode::Normal;
            let offline_for = self.offline_since.take().map(|since| now - since);
            Some(Transition::CameOnline { offline_for })
        } else {
            self.power_mode = PowerMode::UltraLow;
            self.offline_since = Some(now);
            Some(Transition::WentOffline)
        }
    }

    fn offline_days(&self, now: DateTime<Utc>) -> f64 {
        match (self.online, self.offline_since) {
            (false, Some(since)) => (now - since).num_milliseconds().max(0) as f64 / 86_400_000.0,
            _ => 0.0,
        }
    }
}

/// Builder for [`OfflineCoordinator`]
pub struct CoordinatorBuilder {
    records: Arc<dyn RecordStore>,
    queue: Arc<dyn QueueStore>,
    remote: Arc<dyn RemoteEndpoint>,
    codec: Option<Arc<dyn Codec>>,
    resolver: Option<ConflictResolver>,
    config: OfflineConfig,
}

impl CoordinatorBuilder {
    /// Override the codec chosen by `config.codec`
    pub fn codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Override the resolver built from `config.conflict_strategy`
    pub fn resolver(mut self, resolver: ConflictResolver) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn config(mut self, config: OfflineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> SyncResult<OfflineCoordinator> {
        self.config.validate()?;
        let codec = self.codec.unwrap_or_else(|| self.config.codec.build());
        let resolver = self
            .resolver
            .unwrap_or_else(|| ConflictResolver::new(self.config.conflict_strategy));
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        info!(
            codec = codec.name(),
            strategy = %resolver.default_strategy(),
            online = self.config.start_online,
            "Offline coordinator created"
        );

        Ok(OfflineCoordinator {
            records: self.records,
            queue: self.queue,
            codec,
            resolver,
            remote: self.remote,
            connectivity: parking_lot::RwLock::new(ConnectivityState::new(
                self.config.start_online,
            )),
            config: self.config,
            write_lock: Mutex::new(()),
            syncing: AtomicBool::new(false),
            pending_conflicts: parking_lot::Mutex::new(BTreeMap::new()),
            event_tx,
            tasks: parking_lot::Mutex::new(Vec::new()),
        })
    }
}

/// Ties storage, queue, codec, resolver and remote together
pub struct OfflineCoordinator {
    records: Arc<dyn RecordStore>,
    queue: Arc<dyn QueueStore>,
    codec: Arc<dyn Codec>,
    resolver: ConflictResolver,
    remote: Arc<dyn RemoteEndpoint>,
    config: OfflineConfig,
    connectivity: parking_lot::RwLock<ConnectivityState>,
    /// Held for every local mutation
    write_lock: Mutex<()>,
    syncing: AtomicBool,
    pending_conflicts: parking_lot::Mutex<BTreeMap<RecordKey, PendingConflict>>,
    event_tx: broadcast::Sender<OfflineEvent>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl OfflineCoordinator {
    pub fn builder(
        records: Arc<dyn RecordStore>,
        queue: Arc<dyn QueueStore>,
        remote: Arc<dyn RemoteEndpoint>,
    ) -> CoordinatorBuilder {
        CoordinatorBuilder {
            records,
            queue,
            remote,
            codec: None,
            resolver: None,
            config: OfflineConfig::default(),
        }
    }

    /// Coordinator over a redb database in `data_dir`
    pub fn open(
        data_dir: impl AsRef<Path>,
        config: OfflineConfig,
        remote: Arc<dyn RemoteEndpoint>,
    ) -> SyncResult<Self> {
        let storage = Arc::new(Storage::open_in(data_dir)?);
        Self::builder(storage.clone(), storage, remote)
            .config(config)
            .build()
    }

    /// Coordinator whose records and queue live only in memory
    pub fn in_memory(config: OfflineConfig, remote: Arc<dyn RemoteEndpoint>) -> SyncResult<Self> {
        let store = Arc::new(MemoryStore::new());
        Self::builder(store.clone(), store, remote)
            .config(config)
            .build()
    }

    pub fn config(&self) -> &OfflineConfig {
        &self.config
    }

    /// Subscribe to coordinator events; drop the receiver to unsubscribe
    pub fn subscribe(&self) -> broadcast::Receiver<OfflineEvent> {
        self.event_tx.subscribe()
    }

    pub fn is_online(&self) -> bool {
        self.connectivity.read().online
    }

    pub fn power_mode(&self) -> PowerMode {
        self.connectivity.read().power_mode
    }

    /// Whether a queue drain is in progress
    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::Acquire)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Record Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Store a new record and queue it for sync.
    ///
    /// The payload is compressed when the codec round-trips it exactly;
    /// otherwise it is stored as is. Returns the generated record key.
    pub async fn store_offline_data(
        &self,
        data_type: &str,
        data: Value,
        priority: Priority,
    ) -> SyncResult<RecordKey> {
        let data_type = DataType::new(data_type)?;
        let _guard = self.write_lock.lock().await;

        let mut record = Record::new(data_type, data, priority);
        let plain = record.payload.clone();
        self.encode_for_storage(&mut record);
        self.persist_and_enqueue(&record, None, QueueItemDraft::store(&record, plain))?;

        info!(
            key = %record.key,
            priority = %record.priority,
            compressed = record.compressed,
            original_size = record.original_size,
            stored_size = record.stored_size,
            "Stored offline record"
        );
        Ok(record.key)
    }

    /// Records of one data type, decompressed, oldest first
    pub async fn get_offline_data(
        &self,
        data_type: &str,
        filter: &RecordFilter,
    ) -> SyncResult<Vec<Record>> {
        let data_type = DataType::new(data_type)?;
        filter.validate()?;

        let query = RecordQuery::for_type(data_type).with_filter(filter);
        let mut records = self
            .records
            .query(&query)?
            .into_iter()
            .map(|record| self.decode_record(record))
            .collect::<SyncResult<Vec<_>>>()?;
        records.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.key.cmp(&b.key)));
        Ok(records)
    }

    /// A single record by key, decompressed
    pub async fn get_record(&self, key: &str) -> SyncResult<Option<Record>> {
        self.records
            .get(key)?
            .map(|record| self.decode_record(record))
            .transpose()
    }

    /// Merge `updates` into an existing record and queue the change.
    ///
    /// Object updates are merged field by field; anything else replaces the
    /// payload. With `expected_version`, the update only applies if the
    /// stored version still matches.
    pub async fn update_offline_data(
        &self,
        data_type: &str,
        id: &str,
        updates: Value,
        expected_version: Option<u64>,
    ) -> SyncResult<UpdateOutcome> {
        let data_type = DataType::new(data_type)?;
        let _guard = self.write_lock.lock().await;

        let existing = match self.records.get(id)? {
            Some(record) if record.data_type == data_type => record,
            _ => {
                debug!(%id, %data_type, "Update target not found");
                return Ok(UpdateOutcome::NotFound);
            }
        };

        let mut record = self.decode_record(existing.clone())?;
        if let Some(expected) = expected_version {
            if expected != record.version {
                warn!(
                    %id,
                    expected,
                    current = record.version,
                    "Version conflict on update"
                );
                return Ok(UpdateOutcome::Conflict {
                    current: Box::new(record),
                });
            }
        }

        let merged = merge_payloads(&record.payload, &updates);
        record.set_plain_payload(merged.clone());
        record.touch();
        record.user_initiated = true;
        record.merged = false;
        self.encode_for_storage(&mut record);
        self.persist_and_enqueue(&record, Some(&existing), QueueItemDraft::update(&record, merged))?;

        info!(key = %record.key, version = record.version, "Updated offline record");
        Ok(UpdateOutcome::Updated(record.key))
    }

    /// Delete a record and queue a high priority delete.
    ///
    /// Queued stores and updates for the record are dropped. When its store
    /// has never been attempted the remote has no copy, so no delete is
    /// queued either. Returns `false` (and queues nothing) when the record
    /// does not exist.
    pub async fn delete_offline_data(&self, data_type: &str, id: &str) -> SyncResult<bool> {
        let data_type = DataType::new(data_type)?;
        let _guard = self.write_lock.lock().await;

        let existing = match self.records.get(id)? {
            Some(record) if record.data_type == data_type => record,
            _ => return Ok(false),
        };

        // A drain may have the store in flight
        let unsent = !self.is_syncing()
            && self.pending_writes(&existing.key)?.iter().any(|item| {
                item.action == SyncAction::Store
                    && item.retry_count == 0
                    && item.last_error.is_none()
            });

        self.records.delete(id)?;
        if !unsent {
            if let Err(e) = self.enqueue(QueueItemDraft::delete(&existing)) {
                self.restore_record(&existing.key, Some(&existing));
                return Err(e);
            }
        }
        let dropped = self.drop_pending_writes(&existing.key, None)?;
        self.pending_conflicts.lock().remove(&existing.key);

        info!(
            key = %existing.key,
            dropped,
            remote_delete = !unsent,
            "Deleted offline record"
        );
        Ok(true)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Queue & Status
    // ═══════════════════════════════════════════════════════════════════════

    pub fn get_status(&self) -> SyncResult<OfflineStatus> {
        let now = Utc::now();
        let (is_online, offline_duration_days, power_mode, last_sync_at) = {
            let state = self.connectivity.read();
            (
                state.online,
                state.offline_days(now),
                state.power_mode,
                state.last_sync_at,
            )
        };

        Ok(OfflineStatus {
            is_online,
            offline_duration_days,
            pending_sync_count: self.queue.size()?,
            storage_usage_percent: self.storage_usage()? * 100.0,
            power_mode,
            last_sync_at,
        })
    }

    /// Queued mutations in insertion order
    pub fn pending_items(&self) -> SyncResult<Vec<SyncQueueItem>> {
        self.queue.get_all()
    }

    /// Items dropped after exhausting their retries
    pub fn failed_items(&self) -> SyncResult<Vec<FailedItem>> {
        self.queue.failed_items()
    }

    /// Move a failed item back into the queue with a fresh retry budget
    pub fn retry_failed_item(&self, id: &QueueItemId) -> SyncResult<Option<SyncQueueItem>> {
        let Some(failed) = self.queue.take_failed(id)? else {
            return Ok(None);
        };
        let item = failed.item;
        let requeued = self.queue.add(QueueItemDraft {
            action: item.action,
            data_type: item.data_type,
            record_key: item.record_key,
            payload: item.payload,
            record_version: item.record_version,
            priority: item.priority,
        })?;
        info!(old_id = %id, new_id = %requeued.id, "Requeued failed item");
        Ok(Some(requeued))
    }

    /// Drop every queued mutation without syncing it
    pub fn clear_queue(&self) -> SyncResult<usize> {
        let cleared = self.queue.clear()?;
        warn!(cleared, "Sync queue cleared");
        Ok(cleared)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Internals
    // ═══════════════════════════════════════════════════════════════════════

    fn emit(&self, event: OfflineEvent) {
        // No subscribers is fine
        let _ = self.event_tx.send(event);
    }

    fn enqueue(&self, draft: QueueItemDraft) -> SyncResult<SyncQueueItem> {
        let item = self.queue.add(draft)?;
        debug!(
            item_id = %item.id,
            key = %item.record_key,
            action = %item.action,
            priority = %item.priority,
            "Queued for sync"
        );
        Ok(item)
    }

    /// Persist a mutated record together with its queue item.
    ///
    /// When the enqueue fails the record is put back to `previous` (or
    /// removed if it is new), so no local change exists without a queue
    /// item. Caller holds the write lock.
    fn persist_and_enqueue(
        &self,
        record: &Record,
        previous: Option<&Record>,
        draft: QueueItemDraft,
    ) -> SyncResult<SyncQueueItem> {
        self.persist_with_relief(record)?;
        match self.enqueue(draft) {
            Ok(item) => Ok(item),
            Err(e) => {
                warn!(key = %record.key, error = %e, "Enqueue failed, rolling back record write");
                self.restore_record(&record.key, previous);
                Err(e)
            }
        }
    }

    /// Put back a record's earlier stored state after a failed change
    fn restore_record(&self, key: &RecordKey, previous: Option<&Record>) {
        let restored = match previous {
            Some(previous) => self.records.put(previous),
            None => self.records.delete(key.as_str()).map(|_| ()),
        };
        if let Err(e) = restored {
            error!(%key, error = %e, "Failed to roll back record");
        }
    }

    /// Queued stores and updates for `key`, in queue order
    fn pending_writes(&self, key: &RecordKey) -> SyncResult<Vec<SyncQueueItem>> {
        Ok(self
            .queue
            .get_all()?
            .into_iter()
            .filter(|item| &item.record_key == key && item.action != SyncAction::Delete)
            .collect())
    }

    /// Remove queued stores and updates for `key` other than `keep`
    fn drop_pending_writes(
        &self,
        key: &RecordKey,
        keep: Option<&QueueItemId>,
    ) -> SyncResult<usize> {
        let mut dropped = 0;
        for item in self.pending_writes(key)? {
            if keep == Some(&item.id) {
                continue;
            }
            if self.queue.remove(&item.id)? {
                debug!(item_id = %item.id, %key, action = %item.action, "Dropped superseded queue item");
                dropped += 1;
            }
        }
        Ok(dropped)
    }

    /// Compress the (plain) payload in place if the codec round-trips it
    fn encode_for_storage(&self, record: &mut Record) {
        if record.compressed {
            return;
        }
        if let Some(compressed) = codec::compress_verified(self.codec.as_ref(), &record.payload) {
            record.stored_size = compressed.len();
            record.payload = compressed.into_value();
            record.compressed = true;
        }
    }

    /// Return the record with its payload decompressed
    fn decode_record(&self, mut record: Record) -> SyncResult<Record> {
        if !record.compressed {
            return Ok(record);
        }
        let encoded = CompressedPayload::from_value(&record.payload)?;
        let payload = match self.codec.decompress(&encoded) {
            Ok(payload) => payload,
            Err(_) => codec::decompress_any(&encoded).map_err(|e| {
                SyncError::Codec(format!("record {}: {}", record.key, e))
            })?,
        };
        record.payload = payload;
        record.compressed = false;
        Ok(record)
    }

    fn storage_usage(&self) -> SyncResult<f64> {
        let used = self.records.total_bytes()?;
        Ok(used as f64 / self.config.storage_quota_bytes as f64)
    }
}
