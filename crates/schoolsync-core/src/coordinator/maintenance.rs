//! Connectivity transitions, background maintenance and storage pressure

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::{OfflineCoordinator, Transition};
use crate::codec;
use crate::error::{SyncError, SyncResult};
use crate::events::{OfflineEvent, PowerMode, PurgeReport, SyncSummary};
use crate::types::Record;

impl OfflineCoordinator {
    // ═══════════════════════════════════════════════════════════════════════
    // Connectivity
    // ═══════════════════════════════════════════════════════════════════════

    /// Apply a connectivity report.
    ///
    /// Going offline switches to ultra-low-power mode. Coming back online
    /// restores normal mode and drains the queue; the drain summary is
    /// returned. Repeated reports of the same state do nothing.
    pub async fn handle_connectivity_change(&self, online: bool) -> Option<SyncSummary> {
        let transition = self.connectivity.write().apply(online, Utc::now());

        match transition? {
            Transition::WentOffline => {
                warn!("Connectivity lost, entering offline mode");
                self.emit(OfflineEvent::ConnectivityChanged {
                    online: false,
                    offline_for: None,
                });
                self.emit(OfflineEvent::PowerModeChanged(PowerMode::UltraLow));
                None
            }
            Transition::CameOnline { offline_for } => {
                info!(
                    offline_mins = offline_for.map(|d| d.num_minutes()),
                    "Connectivity restored"
                );
                self.emit(OfflineEvent::ConnectivityChanged {
                    online: true,
                    offline_for,
                });
                self.emit(OfflineEvent::PowerModeChanged(PowerMode::Normal));

                match self.synchronize_offline_data().await {
                    Ok(summary) => Some(summary),
                    Err(e) => {
                        error!(error = %e, "Sync after reconnect failed");
                        None
                    }
                }
            }
        }
    }

    /// Start background tasks: a connectivity watcher (when a source is
    /// given) and the maintenance loop. Calling it again is a no-op.
    pub fn init(self: &Arc<Self>, connectivity: Option<watch::Receiver<bool>>) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            debug!("Coordinator already initialized");
            return;
        }

        if let Some(mut rx) = connectivity {
            let this = Arc::clone(self);
            tasks.push(tokio::spawn(async move {
                let initial = *rx.borrow_and_update();
                this.handle_connectivity_change(initial).await;
                while rx.changed().await.is_ok() {
                    let online = *rx.borrow_and_update();
                    this.handle_connectivity_change(online).await;
                }
                debug!("Connectivity source closed");
            }));
        }

        tasks.push(tokio::spawn(Arc::clone(self).maintenance_loop()));
        info!(tasks = tasks.len(), "Background tasks started");
    }

    /// Stop background tasks started by [`init`](Self::init)
    pub fn shutdown(&self) {
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        if tasks.is_empty() {
            return;
        }
        for task in &tasks {
            task.abort();
        }
        info!(tasks = tasks.len(), "Background tasks stopped");
    }

    async fn maintenance_loop(self: Arc<Self>) {
        let mut last_sync = Instant::now();
        let mut last_compression = Instant::now();

        loop {
            let low_power = self.power_mode() == PowerMode::UltraLow;
            tokio::time::sleep(self.config.poll_interval(low_power)).await;

            self.run_health_check().await;

            if self.is_online() && last_sync.elapsed() >= self.config.sync_interval() {
                last_sync = Instant::now();
                let pending = self.queue.size().unwrap_or(0);
                if pending > 0 {
                    debug!(pending, "Periodic sync");
                    if let Err(e) = self.synchronize_offline_data().await {
                        error!(error = %e, "Periodic sync failed");
                    }
                }
            }

            // Compression is skipped entirely in ultra-low-power mode
            if !low_power && last_compression.elapsed() >= self.config.compression_interval() {
                last_compression = Instant::now();
                match self.run_compression_sweep().await {
                    Ok(0) => {}
                    Ok(count) => info!(count, "Compressed stored records"),
                    Err(e) => error!(error = %e, "Compression sweep failed"),
                }
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Health
    // ═══════════════════════════════════════════════════════════════════════

    /// One maintenance pass: retention warning and storage pressure
    pub async fn run_health_check(&self) {
        self.check_offline_retention();
        if let Err(e) = self.check_storage_pressure().await {
            error!(error = %e, "Storage pressure check failed");
        }
    }

    /// Warn when the device has been offline close to the retention limit.
    ///
    /// Returns the offline duration in days when a warning was emitted.
    pub fn check_offline_retention(&self) -> Option<f64> {
        let days = self.connectivity.read().offline_days(Utc::now());
        if self.is_online() || days < f64::from(self.config.offline_warning_days) {
            return None;
        }

        warn!(
            days_offline = days,
            max_offline_days = self.config.max_offline_days,
            "Offline retention limit approaching, connect to sync"
        );
        self.emit(OfflineEvent::RetentionWarning {
            days_offline: days,
            max_offline_days: self.config.max_offline_days,
        });
        Some(days)
    }

    /// Purge expired synced records when usage is above the threshold.
    ///
    /// Only synced records older than the retention window are candidates,
    /// oldest first, until usage drops to the threshold. While a drain runs
    /// nothing is purged and the current usage is reported.
    pub async fn check_storage_pressure(&self) -> SyncResult<PurgeReport> {
        if self.is_syncing() {
            debug!("Drain in progress, deferring storage pressure check");
            let usage = self.storage_usage()?;
            return Ok(PurgeReport {
                usage_before: usage,
                usage_after: usage,
                ..PurgeReport::default()
            });
        }
        let _guard = self.write_lock.lock().await;

        let usage_before = self.storage_usage()?;
        if usage_before <= self.config.storage_threshold {
            return Ok(PurgeReport {
                usage_before,
                usage_after: usage_before,
                ..PurgeReport::default()
            });
        }

        let target = (self.config.storage_quota_bytes as f64 * self.config.storage_threshold) as u64;
        let (removed, bytes_freed) = self.purge_until(self.expired_records(None)?, target)?;
        let report = PurgeReport {
            removed,
            bytes_freed,
            usage_before,
            usage_after: self.storage_usage()?,
        };

        if report.usage_after > self.config.storage_threshold {
            warn!(
                usage = report.usage_after,
                removed, "Storage still above threshold after purge"
            );
        } else {
            info!(removed, bytes_freed, "Purged expired synced records");
        }
        self.emit(OfflineEvent::StoragePressure(report));
        Ok(report)
    }

    /// Compress records that were stored uncompressed.
    ///
    /// Skipped while a drain runs or a mutation holds the write lock.
    /// Versions and sync flags are left untouched.
    pub async fn run_compression_sweep(&self) -> SyncResult<usize> {
        if self.is_syncing() {
            debug!("Drain in progress, skipping compression sweep");
            return Ok(0);
        }
        let Ok(_guard) = self.write_lock.try_lock() else {
            debug!("Write in progress, skipping compression sweep");
            return Ok(0);
        };

        let mut compressed = 0;
        for mut record in self.records.oldest_first()? {
            if record.compressed {
                continue;
            }
            let Some(encoded) = codec::compress_verified(self.codec.as_ref(), &record.payload)
            else {
                continue;
            };
            record.stored_size = encoded.len();
            record.payload = encoded.into_value();
            record.compressed = true;
            self.records.put(&record)?;
            compressed += 1;
        }
        Ok(compressed)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Quota
    // ═══════════════════════════════════════════════════════════════════════

    /// Write a record, freeing space when the store is full.
    ///
    /// On a storage failure, expired synced records are purged first, then
    /// any synced record (lowest priority, oldest first). Unsynced records
    /// are never removed. Caller holds the write lock.
    pub(super) fn persist_with_relief(&self, record: &Record) -> SyncResult<()> {
        let err = match self.try_persist(record) {
            Err(e) if e.is_storage_failure() => e,
            other => return other,
        };

        let incoming = record.encoded_len() as u64;
        let target = self.config.storage_quota_bytes.saturating_sub(incoming);
        warn!(key = %record.key, error = %err, "Write failed, purging expired records");

        let (removed, _) = self.purge_until(self.expired_records(Some(record))?, target)?;
        let err = match self.try_persist(record) {
            Err(e) if e.is_storage_failure() => e,
            other => {
                info!(removed, "Write succeeded after purging expired records");
                return other;
            }
        };

        warn!(key = %record.key, error = %err, "Still failing, dropping synced records");
        let mut candidates: Vec<Record> = self
            .records
            .oldest_first()?
            .into_iter()
            .filter(|candidate| candidate.synced && candidate.key != record.key)
            .collect();
        // Stable sort keeps oldest first within a priority
        candidates.sort_by_key(|candidate| std::cmp::Reverse(candidate.priority));
        self.purge_until(candidates, target)?;

        self.try_persist(record)
    }

    fn try_persist(&self, record: &Record) -> SyncResult<()> {
        let used = self.records.total_bytes()?;
        let existing = self
            .records
            .get(record.key.as_str())?
            .map_or(0, |current| current.encoded_len() as u64);
        let incoming = record.encoded_len() as u64;
        let quota = self.config.storage_quota_bytes;

        if used.saturating_sub(existing) + incoming > quota {
            return Err(SyncError::QuotaExceeded {
                used,
                requested: incoming,
                quota,
            });
        }
        self.records.put(record)
    }

    /// Synced records past the retention window, oldest first
    fn expired_records(&self, keep: Option<&Record>) -> SyncResult<Vec<Record>> {
        let cutoff = Utc::now() - self.config.retention();
        Ok(self
            .records
            .oldest_first()?
            .into_iter()
            .filter(|record| record.synced && record.timestamp < cutoff)
            .filter(|record| keep.map_or(true, |keep| keep.key != record.key))
            .collect())
    }

    /// Delete candidates in order until usage is at most `target` bytes
    fn purge_until(&self, candidates: Vec<Record>, target: u64) -> SyncResult<(usize, u64)> {
        let mut used = self.records.total_bytes()?;
        let mut removed = 0;
        let mut freed = 0;

        for record in candidates {
            if used <= target {
                break;
            }
            let size = record.encoded_len() as u64;
            if self.records.delete(record.key.as_str())? {
                debug!(key = %record.key, size, "Purged record");
                used = used.saturating_sub(size);
                freed += size;
                removed += 1;
            }
        }
        Ok((removed, freed))
    }
}
