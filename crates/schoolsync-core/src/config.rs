//! Coordinator configuration

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::CodecKind;
use crate::conflict::ConflictStrategy;
use crate::error::{SyncError, SyncResult};

/// Tunables for the offline coordinator
///
/// Every field has a default, so a JSON config file only needs the values
/// it wants to change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OfflineConfig {
    /// Failures tolerated before an item is dropped (the next one drops it)
    pub max_retries: u32,
    /// Backoff base; the n-th retry waits `base * 2^n`
    pub retry_base_delay_ms: u64,
    /// Pause between items during a drain
    pub inter_item_delay_ms: u64,
    /// Per-item remote call timeout
    pub request_timeout_secs: u64,
    /// Synced records younger than this are never purged
    pub retention_days: u32,
    pub storage_quota_bytes: u64,
    /// Usage ratio above which a purge starts
    pub storage_threshold: f64,
    pub compression_interval_secs: u64,
    /// Maintenance loop tick while in normal power mode
    pub poll_interval_secs: u64,
    /// Tick stretch factor in ultra-low-power mode
    pub low_power_poll_multiplier: u32,
    /// Background drain cadence while online with pending items
    pub sync_interval_secs: u64,
    pub max_offline_days: u32,
    /// Offline duration that triggers a retention warning
    pub offline_warning_days: u32,
    pub conflict_strategy: ConflictStrategy,
    pub codec: CodecKind,
    /// Connectivity assumed before the first signal arrives
    pub start_online: bool,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base_delay_ms: 1_000,
            inter_item_delay_ms: 100,
            request_timeout_secs: 30,
            retention_days: 7,
            storage_quota_bytes: 50 * 1024 * 1024,
            storage_threshold: 0.8,
            compression_interval_secs: 6 * 60 * 60,
            poll_interval_secs: 60,
            low_power_poll_multiplier: 5,
            sync_interval_secs: 300,
            max_offline_days: 30,
            offline_warning_days: 25,
            conflict_strategy: ConflictStrategy::Timestamp,
            codec: CodecKind::Token,
            start_online: true,
        }
    }
}

impl OfflineConfig {
    /// Load from a JSON file and validate
    pub fn from_json_file(path: impl AsRef<Path>) -> SyncResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| SyncError::Configuration(format!("{}: {}", path.as_ref().display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SyncResult<()> {
        if !(self.storage_threshold > 0.0 && self.storage_threshold <= 1.0) {
            return Err(SyncError::Configuration(format!(
                "storage_threshold must be in (0, 1], got {}",
                self.storage_threshold
            )));
        }
        if self.storage_quota_bytes == 0 {
            return Err(SyncError::Configuration(
                "storage_quota_bytes must be positive".into(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(SyncError::Configuration(
                "request_timeout_secs must be positive".into(),
            ));
        }
        if self.poll_interval_secs == 0 || self.low_power_poll_multiplier == 0 {
            return Err(SyncError::Configuration(
                "poll interval and low power multiplier must be positive".into(),
            ));
        }
        if self.offline_warning_days > self.max_offline_days {
            return Err(SyncError::Configuration(format!(
                "offline_warning_days ({}) exceeds max_offline_days ({})",
                self.offline_warning_days, self.max_offline_days
            )));
        }
        Ok(())
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay_ms = saturating_millis(delay);
        self
    }

    pub fn with_inter_item_delay(mut self, delay: Duration) -> Self {
        self.inter_item_delay_ms = saturating_millis(delay);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn with_retention_days(mut self, days: u32) -> Self {
        self.retention_days = days;
        self
    }

    pub fn with_storage_quota(mut self, bytes: u64) -> Self {
        self.storage_quota_bytes = bytes;
        self
    }

    pub fn with_storage_threshold(mut self, threshold: f64) -> Self {
        self.storage_threshold = threshold;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_secs = interval.as_secs().max(1);
        self
    }

    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval_secs = interval.as_secs();
        self
    }

    pub fn with_compression_interval(mut self, interval: Duration) -> Self {
        self.compression_interval_secs = interval.as_secs();
        self
    }

    pub fn with_conflict_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.conflict_strategy = strategy;
        self
    }

    pub fn with_codec(mut self, codec: CodecKind) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_start_online(mut self, online: bool) -> Self {
        self.start_online = online;
        self
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn inter_item_delay(&self) -> Duration {
        Duration::from_millis(self.inter_item_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retention_days))
    }

    pub fn compression_interval(&self) -> Duration {
        Duration::from_secs(self.compression_interval_secs)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    /// Maintenance tick for the given power mode
    pub fn poll_interval(&self, low_power: bool) -> Duration {
        let base = Duration::from_secs(self.poll_interval_secs);
        if low_power {
            base * self.low_power_poll_multiplier
        } else {
            base
        }
    }

    /// Backoff before attempt number `retry_count` (1-based)
    pub fn retry_delay(&self, retry_count: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry_count.min(16));
        self.retry_base_delay()
            .checked_mul(factor)
            .unwrap_or(Duration::MAX)
    }
}

fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = OfflineConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retention_days, 7);
        assert_eq!(config.storage_threshold, 0.8);
        assert_eq!(config.compression_interval(), Duration::from_secs(21_600));
        assert_eq!(config.conflict_strategy, ConflictStrategy::Timestamp);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_retry_delay_doubles() {
        let config = OfflineConfig::default();
        assert_eq!(config.retry_delay(1), Duration::from_secs(2));
        assert_eq!(config.retry_delay(2), Duration::from_secs(4));
        assert_eq!(config.retry_delay(3), Duration::from_secs(8));

        let instant = config.with_retry_base_delay(Duration::ZERO);
        assert_eq!(instant.retry_delay(3), Duration::ZERO);
    }

    #[test]
    fn test_huge_delays_saturate() {
        let config = OfflineConfig::default()
            .with_retry_base_delay(Duration::MAX)
            .with_inter_item_delay(Duration::MAX);
        assert_eq!(config.retry_base_delay_ms, u64::MAX);
        assert_eq!(config.inter_item_delay_ms, u64::MAX);
        assert_eq!(config.retry_delay(3), Duration::MAX);
    }

    #[test]
    fn test_low_power_stretches_poll() {
        let config = OfflineConfig::default().with_poll_interval(Duration::from_secs(10));
        assert_eq!(config.poll_interval(false), Duration::from_secs(10));
        assert_eq!(config.poll_interval(true), Duration::from_secs(50));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(OfflineConfig::default()
            .with_storage_threshold(1.5)
            .validate()
            .is_err());
        assert!(OfflineConfig::default()
            .with_storage_quota(0)
            .validate()
            .is_err());
        let mut config = OfflineConfig::default();
        config.offline_warning_days = 40;
        assert!(matches!(
            config.validate(),
            Err(SyncError::Configuration(_))
        ));
    }

    #[test]
    fn test_load_partial_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"max_retries": 5, "conflict_strategy": "merge", "codec": "zstd"}}"#
        )
        .unwrap();

        let config = OfflineConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.conflict_strategy, ConflictStrategy::Merge);
        assert_eq!(config.codec, CodecKind::Zstd);
        assert_eq!(config.retention_days, 7);
    }

    #[test]
    fn test_load_invalid_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{\"storage_threshold\": 0}}").unwrap();
        assert!(OfflineConfig::from_json_file(file.path()).is_err());
    }
}
