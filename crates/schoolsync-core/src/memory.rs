//! In-memory record and queue store
//!
//! Same contracts as [`crate::storage::Storage`] without a database file.
//! Used by tests and by callers that only need an ephemeral session.

use std::collections::BTreeMap;

use chrono::Utc;
use parking_lot::RwLock;

use crate::error::SyncError;
use crate::storage::{QueueStore, RecordStore};
use crate::types::{
    DataType, FailedItem, QueueItemDraft, QueueItemId, Record, RecordQuery, SyncQueueItem,
};

#[derive(Default)]
struct MemoryState {
    records: BTreeMap<String, Record>,
    /// Sum of `encoded_len` over `records`
    record_bytes: u64,
    queue: Vec<SyncQueueItem>,
    failed: BTreeMap<QueueItemId, FailedItem>,
}

/// Volatile store holding everything behind one lock
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordStore for MemoryStore {
    fn put(&self, record: &Record) -> Result<(), SyncError> {
        let mut state = self.state.write();
        let added = record.encoded_len() as u64;
        let removed = state
            .records
            .insert(record.key.to_string(), record.clone())
            .map_or(0, |previous| previous.encoded_len() as u64);
        state.record_bytes = state.record_bytes.saturating_sub(removed) + added;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Record>, SyncError> {
        Ok(self.state.read().records.get(key).cloned())
    }

    fn get_by_type(&self, data_type: &DataType) -> Result<Vec<Record>, SyncError> {
        Ok(self
            .state
            .read()
            .records
            .values()
            .filter(|record| &record.data_type == data_type)
            .cloned()
            .collect())
    }

    fn get_all(&self) -> Result<BTreeMap<String, Record>, SyncError> {
        Ok(self.state.read().records.clone())
    }

    fn delete(&self, key: &str) -> Result<bool, SyncError> {
        let mut state = self.state.write();
        match state.records.remove(key) {
            Some(previous) => {
                state.record_bytes = state
                    .record_bytes
                    .saturating_sub(previous.encoded_len() as u64);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn query(&self, query: &RecordQuery) -> Result<Vec<Record>, SyncError> {
        let mut records: Vec<Record> = self
            .state
            .read()
            .records
            .values()
            .filter(|record| query.matches(record))
            .cloned()
            .collect();
        records.sort_by_key(|record| record.timestamp);
        Ok(records)
    }

    fn oldest_first(&self) -> Result<Vec<Record>, SyncError> {
        let mut records: Vec<Record> = self.state.read().records.values().cloned().collect();
        records.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.key.cmp(&b.key)));
        Ok(records)
    }

    fn total_bytes(&self) -> Result<u64, SyncError> {
        Ok(self.state.read().record_bytes)
    }
}

impl QueueStore for MemoryStore {
    fn add(&self, draft: QueueItemDraft) -> Result<SyncQueueItem, SyncError> {
        let item = SyncQueueItem::from_draft(draft);
        self.state.write().queue.push(item.clone());
        Ok(item)
    }

    fn get_all(&self) -> Result<Vec<SyncQueueItem>, SyncError> {
        Ok(self.state.read().queue.clone())
    }

    fn update(&self, item: &SyncQueueItem) -> Result<(), SyncError> {
        let mut state = self.state.write();
        match state.queue.iter_mut().find(|queued| queued.id == item.id) {
            Some(queued) => {
                *queued = item.clone();
                Ok(())
            }
            None => Err(SyncError::Storage(format!(
                "queue item {} not found",
                item.id
            ))),
        }
    }

    fn remove(&self, id: &QueueItemId) -> Result<bool, SyncError> {
        let mut state = self.state.write();
        let before = state.queue.len();
        state.queue.retain(|item| &item.id != id);
        Ok(state.queue.len() != before)
    }

    fn clear(&self) -> Result<usize, SyncError> {
        let mut state = self.state.write();
        let count = state.queue.len();
        state.queue.clear();
        Ok(count)
    }

    fn size(&self) -> Result<usize, SyncError> {
        Ok(self.state.read().queue.len())
    }

    fn record_failure(&self, item: &SyncQueueItem, reason: &str) -> Result<(), SyncError> {
        self.state.write().failed.insert(
            item.id,
            FailedItem {
                item: item.clone(),
                reason: reason.to_string(),
                failed_at: Utc::now(),
            },
        );
        Ok(())
    }

    fn failed_items(&self) -> Result<Vec<FailedItem>, SyncError> {
        Ok(self.state.read().failed.values().cloned().collect())
    }

    fn take_failed(&self, id: &QueueItemId) -> Result<Option<FailedItem>, SyncError> {
        Ok(self.state.write().failed.remove(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Priority, RecordFilter};
    use chrono::Duration;
    use serde_json::json;

    fn record(data_type: &str, age_hours: i64) -> Record {
        let mut record = Record::new(
            DataType::new(data_type).unwrap(),
            json!({"name": "Mutale"}),
            Priority::Normal,
        );
        record.timestamp = Utc::now() - Duration::hours(age_hours);
        record
    }

    #[test]
    fn test_records_crud() {
        let store = MemoryStore::new();
        let record = record("student_data", 0);
        store.put(&record).unwrap();
        assert_eq!(store.get(record.key.as_str()).unwrap(), Some(record.clone()));
        assert_eq!(
            store
                .get_by_type(&DataType::new("student_data").unwrap())
                .unwrap()
                .len(),
            1
        );
        assert!(store.delete(record.key.as_str()).unwrap());
        assert!(!store.delete(record.key.as_str()).unwrap());
        assert_eq!(store.total_bytes().unwrap(), 0);
    }

    #[test]
    fn test_total_bytes_follows_replacements() {
        let store = MemoryStore::new();
        let mut edited = record("grades", 0);
        store.put(&edited).unwrap();
        assert_eq!(store.total_bytes().unwrap(), edited.encoded_len() as u64);

        edited.payload = json!({"name": "Mutale Banda", "notes": "moved to grade 7 in term two"});
        store.put(&edited).unwrap();
        assert_eq!(store.total_bytes().unwrap(), edited.encoded_len() as u64);

        let other = record("grades", 3);
        store.put(&other).unwrap();
        assert_eq!(
            store.total_bytes().unwrap(),
            (edited.encoded_len() + other.encoded_len()) as u64
        );
    }

    #[test]
    fn test_oldest_first_and_query() {
        let store = MemoryStore::new();
        let old = record("grades", 48);
        let new = record("grades", 1);
        store.put(&new).unwrap();
        store.put(&old).unwrap();

        let ordered = store.oldest_first().unwrap();
        assert_eq!(ordered[0].key, old.key);

        let found = store
            .query(
                &RecordQuery::for_type(DataType::new("grades").unwrap())
                    .with_filter(&RecordFilter::default().with_priority(Priority::Normal)),
            )
            .unwrap();
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn test_queue_fifo_and_failures() {
        let store = MemoryStore::new();
        let r = record("attendance", 0);
        let a = store.add(QueueItemDraft::store(&r, r.payload.clone())).unwrap();
        let b = store.add(QueueItemDraft::delete(&r)).unwrap();

        let ids: Vec<_> = QueueStore::get_all(&store)
            .unwrap()
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(ids, vec![a.id, b.id]);

        store.record_failure(&a, "timeout").unwrap();
        assert!(store.remove(&a.id).unwrap());
        assert_eq!(store.size().unwrap(), 1);
        assert_eq!(store.failed_items().unwrap().len(), 1);
        assert!(store.take_failed(&a.id).unwrap().is_some());
        assert_eq!(store.clear().unwrap(), 1);
    }
}
