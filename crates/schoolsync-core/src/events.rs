//! Coordinator events and status snapshots
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  OfflineEvent: broadcast to every subscriber                    │
//! │  ├── ConnectivityChanged / PowerModeChanged                     │
//! │  ├── SyncStarted / SyncProgress / SyncCompleted                 │
//! │  ├── ItemFailed: retry scheduled or item dropped                │
//! │  ├── ConflictNeedsResolution: manual strategy hit               │
//! │  └── StoragePressure / RetentionWarning                         │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{QueueItemId, RecordKey};

/// Channel capacity for coordinator events
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Device power posture while disconnected
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerMode {
    #[default]
    Normal,
    /// Background work slowed down and compression suspended
    UltraLow,
}

impl fmt::Display for PowerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PowerMode::Normal => write!(f, "normal"),
            PowerMode::UltraLow => write!(f, "ultra-low"),
        }
    }
}

/// Result of one queue drain
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSummary {
    /// Items confirmed by the remote service
    pub synced_items: usize,
    /// Items dropped after exhausting retries
    pub failed_items: usize,
    /// Items attempted in this drain
    pub total_items: usize,
    /// Items that failed but stay queued for another attempt
    pub retried_items: usize,
    /// Items answered with a conflict and resolved
    pub conflicts: usize,
    /// Items skipped because their backoff has not elapsed
    pub deferred_items: usize,
    /// Drain stopped early because connectivity was lost
    pub aborted: bool,
    /// Another drain was already running; nothing was done
    pub already_running: bool,
}

impl SyncSummary {
    pub(crate) fn already_running() -> Self {
        Self {
            already_running: true,
            ..Self::default()
        }
    }
}

impl fmt::Display for SyncSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.already_running {
            return write!(f, "sync already in progress");
        }
        write!(
            f,
            "{} of {} synced, {} failed",
            self.synced_items, self.total_items, self.failed_items
        )?;
        if self.retried_items > 0 {
            write!(f, ", {} will retry", self.retried_items)?;
        }
        if self.conflicts > 0 {
            write!(f, ", {} conflicts resolved", self.conflicts)?;
        }
        if self.aborted {
            write!(f, " (interrupted: offline)")?;
        }
        Ok(())
    }
}

/// Outcome of a storage pressure check
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PurgeReport {
    pub removed: usize,
    pub bytes_freed: u64,
    pub usage_before: f64,
    pub usage_after: f64,
}

/// Point-in-time view of the coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineStatus {
    pub is_online: bool,
    /// Fractional days since connectivity was lost; 0 while online
    pub offline_duration_days: f64,
    pub pending_sync_count: usize,
    /// Local storage use as a percentage of the quota
    pub storage_usage_percent: f64,
    pub power_mode: PowerMode,
    pub last_sync_at: Option<DateTime<Utc>>,
}

/// Notifications emitted by the coordinator
#[derive(Debug, Clone, PartialEq)]
pub enum OfflineEvent {
    ConnectivityChanged {
        online: bool,
        /// How long the device was offline, on reconnect
        offline_for: Option<chrono::Duration>,
    },
    PowerModeChanged(PowerMode),
    SyncStarted {
        pending: usize,
    },
    SyncProgress {
        processed: usize,
        total: usize,
    },
    SyncCompleted(SyncSummary),
    ItemFailed {
        item_id: QueueItemId,
        record_key: RecordKey,
        reason: String,
        /// True when the item was moved to the failed-items log
        dropped: bool,
    },
    ConflictNeedsResolution {
        record_key: RecordKey,
    },
    StoragePressure(PurgeReport),
    RetentionWarning {
        days_offline: f64,
        max_offline_days: u32,
    },
}

impl fmt::Display for OfflineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OfflineEvent::ConnectivityChanged { online: true, .. } => write!(f, "Back online"),
            OfflineEvent::ConnectivityChanged { online: false, .. } => {
                write!(f, "Offline mode enabled")
            }
            OfflineEvent::PowerModeChanged(mode) => write!(f, "Power mode: {}", mode),
            OfflineEvent::SyncStarted { pending } => write!(f, "Syncing {} items", pending),
            OfflineEvent::SyncProgress { processed, total } => {
                write!(f, "Synced {}/{}", processed, total)
            }
            OfflineEvent::SyncCompleted(summary) => write!(f, "Sync finished: {}", summary),
            OfflineEvent::ItemFailed {
                record_key,
                reason,
                dropped,
                ..
            } => {
                if *dropped {
                    write!(f, "Gave up syncing {}: {}", record_key, reason)
                } else {
                    write!(f, "Sync of {} failed, will retry: {}", record_key, reason)
                }
            }
            OfflineEvent::ConflictNeedsResolution { record_key } => {
                write!(f, "Conflict on {} needs a decision", record_key)
            }
            OfflineEvent::StoragePressure(report) => write!(
                f,
                "Storage at {:.0}%, purged {} records",
                report.usage_after * 100.0,
                report.removed
            ),
            OfflineEvent::RetentionWarning {
                days_offline,
                max_offline_days,
            } => write!(
                f,
                "Offline for {:.1} days; data is kept for at most {} days",
                days_offline, max_offline_days
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_display() {
        let summary = SyncSummary {
            synced_items: 3,
            failed_items: 1,
            total_items: 5,
            retried_items: 1,
            ..SyncSummary::default()
        };
        assert_eq!(summary.to_string(), "3 of 5 synced, 1 failed, 1 will retry");

        let aborted = SyncSummary {
            total_items: 2,
            aborted: true,
            ..SyncSummary::default()
        };
        assert_eq!(aborted.to_string(), "0 of 2 synced, 0 failed (interrupted: offline)");
        assert_eq!(
            SyncSummary::already_running().to_string(),
            "sync already in progress"
        );
    }

    #[test]
    fn test_power_mode_display() {
        assert_eq!(PowerMode::default(), PowerMode::Normal);
        assert_eq!(PowerMode::UltraLow.to_string(), "ultra-low");
    }

    #[test]
    fn test_event_display() {
        let event = OfflineEvent::ConnectivityChanged {
            online: false,
            offline_for: None,
        };
        assert_eq!(event.to_string(), "Offline mode enabled");
        let event = OfflineEvent::SyncProgress {
            processed: 2,
            total: 4,
        };
        assert_eq!(event.to_string(), "Synced 2/4");
    }
}
