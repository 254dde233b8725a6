//! Applying conflict resolutions reported by the remote endpoint

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::OfflineCoordinator;
use crate::conflict::{ConflictStrategy, Resolution, Winner};
use crate::error::SyncResult;
use crate::events::OfflineEvent;
use crate::types::{QueueItemDraft, Record, RecordKey, SyncAction, SyncQueueItem};

/// A divergence waiting for an operator decision
#[derive(Debug, Clone, PartialEq)]
pub struct PendingConflict {
    pub local: Record,
    pub remote: Record,
    pub detected_at: DateTime<Utc>,
}

/// Operator decision for a pending conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionChoice {
    KeepLocal,
    KeepRemote,
    Merge,
}

impl OfflineCoordinator {
    /// Resolve a remote-reported conflict for `item` with the configured
    /// strategy and write the outcome back.
    ///
    /// The queue item is consumed either way. When a winner is settled,
    /// the other queued stores and updates for the record are dropped: a
    /// remote winner replaces them, and a local or merged winner is queued
    /// again as one `update` carrying a version above both sides.
    pub(super) async fn apply_remote_conflict(
        &self,
        item: &SyncQueueItem,
        mut remote: Record,
    ) -> SyncResult<()> {
        remote.key = item.record_key.clone();
        remote.data_type = item.data_type.clone();
        let remote = self.decode_record(remote)?;
        let key = item.record_key.clone();

        let _guard = self.write_lock.lock().await;
        let Some(stored) = self.records.get(key.as_str())? else {
            self.queue.remove(&item.id)?;
            let deleting = self
                .queue
                .get_all()?
                .iter()
                .any(|queued| queued.record_key == key && queued.action == SyncAction::Delete);
            if deleting {
                info!(%key, "Remote kept a record deleted locally, delete still queued");
            } else {
                info!(%key, "Remote kept a record deleted locally, restoring it");
                self.write_synced(remote, 0)?;
                self.drop_pending_writes(&key, None)?;
            }
            return Ok(());
        };
        let local = self.decode_record(stored.clone())?;

        let resolution = self.resolver.resolve(&local, &remote, None);
        self.queue.remove(&item.id)?;

        match resolution {
            Resolution::Resolved {
                record,
                winner: Winner::Remote,
            } => {
                info!(%key, "Conflict resolved in favour of remote copy");
                self.write_synced(record, local.version)?;
                self.drop_pending_writes(&key, None)?;
            }
            Resolution::Resolved { record, winner } => {
                info!(%key, ?winner, "Conflict resolved locally, re-queueing");
                let floor = local.version.max(remote.version) + 1;
                self.write_and_requeue(record, floor, Some(&stored))?;
            }
            Resolution::Manual { local, remote } => {
                warn!(%key, "Conflict needs manual resolution");
                self.pending_conflicts.lock().insert(
                    key.clone(),
                    PendingConflict {
                        local,
                        remote,
                        detected_at: Utc::now(),
                    },
                );
                self.emit(OfflineEvent::ConflictNeedsResolution { record_key: key });
            }
        }
        Ok(())
    }

    /// Conflicts parked by the manual strategy
    pub fn pending_conflicts(&self) -> Vec<PendingConflict> {
        self.pending_conflicts.lock().values().cloned().collect()
    }

    /// Settle a parked conflict. Returns the record now stored, or `None`
    /// if no conflict is pending for `key`.
    ///
    /// The local side is the record as stored now, which may carry edits
    /// made after the conflict was parked.
    pub async fn resolve_pending_conflict(
        &self,
        key: &RecordKey,
        choice: ResolutionChoice,
    ) -> SyncResult<Option<Record>> {
        let Some(pending) = self.pending_conflicts.lock().remove(key) else {
            return Ok(None);
        };

        let _guard = self.write_lock.lock().await;
        let stored = self.records.get(key.as_str())?;
        let local = match &stored {
            Some(stored) => self.decode_record(stored.clone())?,
            None => pending.local,
        };
        let floor = local.version.max(pending.remote.version) + 1;

        let record = match choice {
            ResolutionChoice::KeepRemote => {
                let record = self.write_synced(pending.remote, local.version)?;
                self.drop_pending_writes(key, None)?;
                record
            }
            ResolutionChoice::KeepLocal => {
                let mut local = local;
                local.user_initiated = true;
                local.timestamp = Utc::now();
                self.write_and_requeue(local, floor, stored.as_ref())?
            }
            ResolutionChoice::Merge => {
                let merged = self
                    .resolver
                    .resolve(&local, &pending.remote, Some(ConflictStrategy::Merge))
                    .into_record()
                    .unwrap_or(local);
                self.write_and_requeue(merged, floor, stored.as_ref())?
            }
        };

        info!(%key, ?choice, version = record.version, "Pending conflict resolved");
        Ok(Some(record))
    }

    /// Store a record as confirmed by the remote, never below `floor`
    /// (caller holds the write lock)
    fn write_synced(&self, mut record: Record, floor: u64) -> SyncResult<Record> {
        let payload = record.payload.clone();
        record.set_plain_payload(payload);
        record.version = record.version.max(floor);
        record.synced = true;
        let returned = record.clone();
        self.encode_for_storage(&mut record);
        self.persist_with_relief(&record)?;
        Ok(returned)
    }

    /// Store a locally winning record with a version of at least `floor`
    /// and queue it as the record's only pending write (caller holds the
    /// write lock). `previous` is the stored form the write replaces.
    fn write_and_requeue(
        &self,
        mut record: Record,
        floor: u64,
        previous: Option<&Record>,
    ) -> SyncResult<Record> {
        let payload = record.payload.clone();
        record.set_plain_payload(payload.clone());
        record.version = record.version.max(floor);
        record.synced = false;
        let returned = record.clone();
        self.encode_for_storage(&mut record);
        let queued = self.persist_and_enqueue(
            &record,
            previous,
            QueueItemDraft::update(&record, payload),
        )?;
        self.drop_pending_writes(&record.key, Some(&queued.id))?;
        Ok(returned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::config::OfflineConfig;
    use crate::remote::UnconfiguredRemote;
    use crate::types::{Priority, SyncAction};
    use serde_json::json;

    fn coordinator(strategy: ConflictStrategy) -> OfflineCoordinator {
        OfflineCoordinator::in_memory(
            OfflineConfig::default()
                .with_start_online(false)
                .with_conflict_strategy(strategy),
            Arc::new(UnconfiguredRemote),
        )
        .unwrap()
    }

    async fn stored(coordinator: &OfflineCoordinator) -> (Record, SyncQueueItem) {
        let key = coordinator
            .store_offline_data(
                "student_data",
                json!({"name": "Chilufya", "grade": 6}),
                Priority::Normal,
            )
            .await
            .unwrap();
        let record = coordinator.get_record(key.as_str()).await.unwrap().unwrap();
        let item = coordinator.pending_items().unwrap().remove(0);
        (record, item)
    }

    #[tokio::test]
    async fn test_remote_winner_is_stored_synced() {
        let coordinator = coordinator(ConflictStrategy::Timestamp);
        let (local, item) = stored(&coordinator).await;

        let mut remote = local.clone();
        remote.payload = json!({"name": "Chilufya M.", "grade": 7});
        remote.version = 4;
        remote.timestamp = local.timestamp + chrono::Duration::minutes(5);

        coordinator.apply_remote_conflict(&item, remote).await.unwrap();

        let stored = coordinator.get_record(local.key.as_str()).await.unwrap().unwrap();
        assert!(stored.synced);
        assert_eq!(stored.version, 4);
        assert_eq!(stored.payload, json!({"name": "Chilufya M.", "grade": 7}));
        assert!(coordinator.pending_items().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_merge_winner_is_requeued() {
        let coordinator = coordinator(ConflictStrategy::Merge);
        let (local, item) = stored(&coordinator).await;

        let mut remote = local.clone();
        remote.payload = json!({"school": "Kabwe Basic"});
        remote.version = 3;

        coordinator.apply_remote_conflict(&item, remote).await.unwrap();

        let stored = coordinator.get_record(local.key.as_str()).await.unwrap().unwrap();
        assert!(!stored.synced);
        assert!(stored.merged);
        assert_eq!(stored.version, 4);
        assert_eq!(
            stored.payload,
            json!({"name": "Chilufya", "grade": 6, "school": "Kabwe Basic"})
        );

        let queued = coordinator.pending_items().unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].action, SyncAction::Update);
        assert_eq!(queued[0].record_version, 4);
    }

    #[tokio::test]
    async fn test_manual_conflict_waits_for_operator() {
        let coordinator = coordinator(ConflictStrategy::Manual);
        let mut events = coordinator.subscribe();
        let (local, item) = stored(&coordinator).await;

        let mut remote = local.clone();
        remote.payload = json!({"name": "Other"});
        remote.version = 2;
        coordinator.apply_remote_conflict(&item, remote).await.unwrap();

        assert_eq!(coordinator.pending_conflicts().len(), 1);
        assert_eq!(
            events.try_recv().unwrap(),
            OfflineEvent::ConflictNeedsResolution {
                record_key: local.key.clone()
            }
        );

        let resolved = coordinator
            .resolve_pending_conflict(&local.key, ResolutionChoice::KeepLocal)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resolved.version, 3);
        assert_eq!(resolved.payload, json!({"name": "Chilufya", "grade": 6}));
        assert!(coordinator.pending_conflicts().is_empty());
        assert_eq!(coordinator.pending_items().unwrap().len(), 1);

        // Nothing left to resolve
        assert!(coordinator
            .resolve_pending_conflict(&local.key, ResolutionChoice::KeepRemote)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_conflict_on_locally_deleted_record_restores_remote() {
        let coordinator = coordinator(ConflictStrategy::Timestamp);
        let (local, item) = stored(&coordinator).await;
        coordinator
            .delete_offline_data("student_data", local.key.as_str())
            .await
            .unwrap();

        coordinator
            .apply_remote_conflict(&item, local.clone())
            .await
            .unwrap();
        let restored = coordinator.get_record(local.key.as_str()).await.unwrap().unwrap();
        assert!(restored.synced);
    }
}
