//! Sync queue persistence
//!
//! ## Storage Design
//!
//! - **Queue table**: `sync_queue` - keyed by a u64 sequence, JSON-encoded item
//! - **Id index**: `sync_queue_ids` - item id → sequence
//! - **Failed items**: `failed_items` - item id → JSON-encoded `FailedItem`
//!
//! New items take `last sequence + 1`, so iteration order is insertion order
//! and survives a restart. Updating an item keeps its sequence.

use chrono::Utc;
use redb::{ReadableTable, ReadableTableMetadata, TableDefinition};

use super::{QueueStore, Storage};
use crate::error::SyncError;
use crate::types::{FailedItem, QueueItemDraft, QueueItemId, SyncQueueItem};

pub(crate) const QUEUE_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("sync_queue");

pub(crate) const QUEUE_ID_INDEX: TableDefinition<&str, u64> =
    TableDefinition::new("sync_queue_ids");

pub(crate) const FAILED_ITEMS_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("failed_items");

impl QueueStore for Storage {
    fn add(&self, draft: QueueItemDraft) -> Result<SyncQueueItem, SyncError> {
        let item = SyncQueueItem::from_draft(draft);
        let data = serde_json::to_vec(&item)?;
        let id = item.id.to_string();

        let db = self.db_handle();
        let db_guard = db.read();
        let write_txn = db_guard.begin_write()?;
        {
            let mut queue = write_txn.open_table(QUEUE_TABLE)?;
            let mut ids = write_txn.open_table(QUEUE_ID_INDEX)?;

            let seq = queue.last()?.map(|(key, _)| key.value() + 1).unwrap_or(0);
            queue.insert(seq, data.as_slice())?;
            ids.insert(id.as_str(), seq)?;
        }
        write_txn.commit()?;
        Ok(item)
    }

    fn get_all(&self) -> Result<Vec<SyncQueueItem>, SyncError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        let table = read_txn.open_table(QUEUE_TABLE)?;

        let mut items = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            items.push(serde_json::from_slice(value.value())?);
        }
        Ok(items)
    }

    fn update(&self, item: &SyncQueueItem) -> Result<(), SyncError> {
        let data = serde_json::to_vec(item)?;
        let id = item.id.to_string();

        let db = self.db_handle();
        let db_guard = db.read();
        let write_txn = db_guard.begin_write()?;
        {
            let ids = write_txn.open_table(QUEUE_ID_INDEX)?;
            let mut queue = write_txn.open_table(QUEUE_TABLE)?;

            let seq = ids
                .get(id.as_str())?
                .map(|seq| seq.value())
                .ok_or_else(|| SyncError::Storage(format!("queue item {} not found", id)))?;
            queue.insert(seq, data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn remove(&self, id: &QueueItemId) -> Result<bool, SyncError> {
        let id = id.to_string();

        let db = self.db_handle();
        let db_guard = db.read();
        let write_txn = db_guard.begin_write()?;
        let removed = {
            let mut ids = write_txn.open_table(QUEUE_ID_INDEX)?;
            let mut queue = write_txn.open_table(QUEUE_TABLE)?;

            let seq = ids.remove(id.as_str())?.map(|seq| seq.value());
            match seq {
                Some(seq) => {
                    queue.remove(seq)?;
                    true
                }
                None => false,
            }
        };
        write_txn.commit()?;
        Ok(removed)
    }

    fn clear(&self) -> Result<usize, SyncError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let write_txn = db_guard.begin_write()?;
        let count = {
            let mut queue = write_txn.open_table(QUEUE_TABLE)?;
            let mut ids = write_txn.open_table(QUEUE_ID_INDEX)?;

            let seqs = queue
                .iter()?
                .map(|entry| entry.map(|(key, _)| key.value()))
                .collect::<Result<Vec<_>, _>>()?;
            let id_keys = ids
                .iter()?
                .map(|entry| entry.map(|(key, _)| key.value().to_string()))
                .collect::<Result<Vec<_>, _>>()?;

            for seq in &seqs {
                queue.remove(*seq)?;
            }
            for key in &id_keys {
                ids.remove(key.as_str())?;
            }
            seqs.len()
        };
        write_txn.commit()?;
        Ok(count)
    }

    fn size(&self) -> Result<usize, SyncError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        let table = read_txn.open_table(QUEUE_TABLE)?;
        Ok(table.len()? as usize)
    }

    fn record_failure(&self, item: &SyncQueueItem, reason: &str) -> Result<(), SyncError> {
        let failed = FailedItem {
            item: item.clone(),
            reason: reason.to_string(),
            failed_at: Utc::now(),
        };
        let data = serde_json::to_vec(&failed)?;
        let id = item.id.to_string();

        let db = self.db_handle();
        let db_guard = db.read();
        let write_txn = db_guard.begin_write()?;
        {
            let mut table = write_txn.open_table(FAILED_ITEMS_TABLE)?;
            table.insert(id.as_str(), data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn failed_items(&self) -> Result<Vec<FailedItem>, SyncError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        let table = read_txn.open_table(FAILED_ITEMS_TABLE)?;

        let mut failed = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            failed.push(serde_json::from_slice(value.value())?);
        }
        Ok(failed)
    }

    fn take_failed(&self, id: &QueueItemId) -> Result<Option<FailedItem>, SyncError> {
        let id = id.to_string();

        let db = self.db_handle();
        let db_guard = db.read();
        let write_txn = db_guard.begin_write()?;
        let taken: Option<FailedItem> = {
            let mut table = write_txn.open_table(FAILED_ITEMS_TABLE)?;
            let removed = table.remove(id.as_str())?;
            match removed {
                Some(value) => Some(serde_json::from_slice(value.value())?),
                None => None,
            }
        };
        write_txn.commit()?;
        Ok(taken)
    }
}
