//! Queue drain: replaying queued mutations against the remote endpoint

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use super::OfflineCoordinator;
use crate::error::SyncError;
use crate::events::{OfflineEvent, SyncSummary};
use crate::remote::{RemoteRequest, RemoteResponse};
use crate::types::{Priority, RecordKey, SyncAction, SyncQueueItem};

/// Clears the in-progress flag however the drain ends
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// What happened to a single queue item
enum ItemOutcome {
    Synced,
    Conflict,
    Retrying,
    Dropped,
}

impl OfflineCoordinator {
    /// Push queued mutations to the remote endpoint.
    ///
    /// Items drain high → normal → low, FIFO within a priority. All items of
    /// one record drain at the most urgent priority among them, so a record's
    /// mutations reach the remote in the order they were made. Items still
    /// in backoff are skipped. Losing connectivity stops the drain and the
    /// remaining items stay queued. A call made while another drain runs
    /// returns at once with `already_running` set.
    pub async fn synchronize_offline_data(&self) -> Result<SyncSummary, SyncError> {
        if self
            .syncing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Drain already in progress, skipping");
            return Ok(SyncSummary::already_running());
        }
        let _guard = DrainGuard(&self.syncing);
        self.drain().await
    }

    async fn drain(&self) -> Result<SyncSummary, SyncError> {
        let mut summary = SyncSummary::default();
        if !self.is_online() {
            debug!("Offline, nothing to drain");
            summary.aborted = true;
            return Ok(summary);
        }

        let mut items = self.queue.get_all()?;
        let mut key_priority: HashMap<RecordKey, Priority> = HashMap::new();
        for item in &items {
            key_priority
                .entry(item.record_key.clone())
                .and_modify(|priority| *priority = (*priority).min(item.priority))
                .or_insert(item.priority);
        }
        // Stable sort keeps insertion order within a priority
        items.sort_by_key(|item| {
            key_priority
                .get(&item.record_key)
                .copied()
                .unwrap_or(item.priority)
        });

        let now = Utc::now();
        let (due, deferred): (Vec<_>, Vec<_>) = items.into_iter().partition(|item| item.is_due(now));
        summary.deferred_items = deferred.len();

        let total = due.len();
        info!(pending = total, deferred = summary.deferred_items, "Starting sync drain");
        self.emit(OfflineEvent::SyncStarted { pending: total });

        let delay = self.config.inter_item_delay();
        // Records whose pending writes were settled by a conflict this pass
        let mut settled: HashSet<RecordKey> = HashSet::new();
        for (index, item) in due.into_iter().enumerate() {
            if !self.is_online() {
                warn!(
                    remaining = total - index,
                    "Connectivity lost, stopping drain"
                );
                summary.aborted = true;
                break;
            }
            if settled.contains(&item.record_key) {
                debug!(item_id = %item.id, key = %item.record_key, "Record settled by conflict, skipping");
                self.emit(OfflineEvent::SyncProgress {
                    processed: index + 1,
                    total,
                });
                continue;
            }
            if index > 0 && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            summary.total_items += 1;
            match self.process_item(&item).await {
                ItemOutcome::Synced => summary.synced_items += 1,
                ItemOutcome::Conflict => {
                    summary.conflicts += 1;
                    settled.insert(item.record_key.clone());
                }
                ItemOutcome::Retrying => summary.retried_items += 1,
                ItemOutcome::Dropped => summary.failed_items += 1,
            }
            self.emit(OfflineEvent::SyncProgress {
                processed: index + 1,
                total,
            });
        }

        self.connectivity.write().last_sync_at = Some(Utc::now());
        info!(
            synced = summary.synced_items,
            failed = summary.failed_items,
            retrying = summary.retried_items,
            conflicts = summary.conflicts,
            aborted = summary.aborted,
            "Sync drain finished: {}",
            summary
        );
        self.emit(OfflineEvent::SyncCompleted(summary.clone()));
        Ok(summary)
    }

    async fn process_item(&self, item: &SyncQueueItem) -> ItemOutcome {
        let request = RemoteRequest::from_item(item);
        let timeout = self.config.request_timeout();

        let result = match tokio::time::timeout(timeout, self.remote.push(&request)).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout(timeout)),
        };

        match result {
            Ok(RemoteResponse::Accepted) => {
                self.confirm_item(item).await;
                ItemOutcome::Synced
            }
            Ok(RemoteResponse::Conflict(remote)) => {
                match self.apply_remote_conflict(item, *remote).await {
                    Ok(()) => ItemOutcome::Conflict,
                    Err(e) => {
                        error!(key = %item.record_key, error = %e, "Failed to apply conflict resolution");
                        self.retry_or_drop(item, e)
                    }
                }
            }
            Err(e) => self.retry_or_drop(item, e),
        }
    }

    /// Remote accepted the item: dequeue it and mark the record synced
    async fn confirm_item(&self, item: &SyncQueueItem) {
        if let Err(e) = self.queue.remove(&item.id) {
            error!(item_id = %item.id, error = %e, "Failed to dequeue synced item");
        }
        if item.action == SyncAction::Delete {
            debug!(key = %item.record_key, "Remote delete confirmed");
            return;
        }

        let _guard = self.write_lock.lock().await;
        match self.records.get(item.record_key.as_str()) {
            // A newer local version is still queued; leave it unsynced
            Ok(Some(mut record)) if record.version == item.record_version => {
                record.synced = true;
                if let Err(e) = self.records.put(&record) {
                    error!(key = %record.key, error = %e, "Failed to mark record synced");
                } else {
                    debug!(key = %record.key, version = record.version, "Record synced");
                }
            }
            Ok(_) => debug!(key = %item.record_key, "Record changed or removed since queued"),
            Err(e) => error!(key = %item.record_key, error = %e, "Failed to load synced record"),
        }
    }

    /// Schedule a backoff retry, or move the item to the failed log once
    /// the retry budget is spent
    fn retry_or_drop(&self, item: &SyncQueueItem, err: SyncError) -> ItemOutcome {
        let reason = err.to_string();

        if item.retry_count >= self.config.max_retries {
            error!(
                item_id = %item.id,
                key = %item.record_key,
                action = %item.action,
                retries = item.retry_count,
                error = %reason,
                "Dropping sync item after exhausting retries"
            );
            if let Err(e) = self.queue.record_failure(item, &reason) {
                error!(item_id = %item.id, error = %e, "Failed to record failed item");
            }
            if let Err(e) = self.queue.remove(&item.id) {
                error!(item_id = %item.id, error = %e, "Failed to dequeue dropped item");
            }
            self.emit(OfflineEvent::ItemFailed {
                item_id: item.id,
                record_key: item.record_key.clone(),
                reason,
                dropped: true,
            });
            return ItemOutcome::Dropped;
        }

        let mut retry = item.clone();
        retry.retry_count += 1;
        let backoff = self.config.retry_delay(retry.retry_count);
        retry.next_attempt_at = Some(
            chrono::Duration::from_std(backoff)
                .ok()
                .and_then(|backoff| Utc::now().checked_add_signed(backoff))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        );
        retry.last_error = Some(reason.clone());

        warn!(
            item_id = %item.id,
            key = %item.record_key,
            retry = retry.retry_count,
            max_retries = self.config.max_retries,
            backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
            error = %reason,
            "Sync item failed, will retry"
        );
        if let Err(e) = self.queue.update(&retry) {
            error!(item_id = %item.id, error = %e, "Failed to persist retry state");
        }
        self.emit(OfflineEvent::ItemFailed {
            item_id: item.id,
            record_key: item.record_key.clone(),
            reason,
            dropped: false,
        });
        ItemOutcome::Retrying
    }
}
