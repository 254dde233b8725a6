//! Conflict resolution between a local record and its remote counterpart
//!
//! Resolution is a pure function of the two records and a strategy; the
//! coordinator decides what to persist and enqueue afterwards.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::types::Record;

/// How to settle a divergence between local and remote copies
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ConflictStrategy {
    /// Later timestamp wins; equal timestamps go to the remote copy
    #[default]
    Timestamp,
    /// Operator-initiated changes beat automatic ones, then timestamp
    UserPriority,
    /// Field-wise union, remote as base and local on top
    Merge,
    /// Keep both and wait for an operator decision
    Manual,
}

impl ConflictStrategy {
    /// Parse a strategy name, falling back to `Timestamp` for unknown names
    pub fn parse_lenient(name: &str) -> Self {
        match name.trim() {
            "timestamp" => ConflictStrategy::Timestamp,
            "userPriority" | "user_priority" => ConflictStrategy::UserPriority,
            "merge" => ConflictStrategy::Merge,
            "manual" => ConflictStrategy::Manual,
            other => {
                warn!(strategy = other, "Unknown conflict strategy, using timestamp");
                ConflictStrategy::Timestamp
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConflictStrategy::Timestamp => "timestamp",
            ConflictStrategy::UserPriority => "userPriority",
            ConflictStrategy::Merge => "merge",
            ConflictStrategy::Manual => "manual",
        }
    }
}

impl From<String> for ConflictStrategy {
    fn from(value: String) -> Self {
        Self::parse_lenient(&value)
    }
}

impl From<ConflictStrategy> for String {
    fn from(value: ConflictStrategy) -> Self {
        value.as_str().to_string()
    }
}

impl std::fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side a resolved record came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Winner {
    Local,
    Remote,
    Merged,
}

/// Outcome of a resolution
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Resolved { record: Record, winner: Winner },
    /// Both versions, untouched, for an operator to choose from
    Manual { local: Record, remote: Record },
}

impl Resolution {
    pub fn requires_manual_resolution(&self) -> bool {
        matches!(self, Resolution::Manual { .. })
    }

    pub fn winner(&self) -> Option<Winner> {
        match self {
            Resolution::Resolved { winner, .. } => Some(*winner),
            Resolution::Manual { .. } => None,
        }
    }

    pub fn record(&self) -> Option<&Record> {
        match self {
            Resolution::Resolved { record, .. } => Some(record),
            Resolution::Manual { .. } => None,
        }
    }

    pub fn into_record(self) -> Option<Record> {
        match self {
            Resolution::Resolved { record, .. } => Some(record),
            Resolution::Manual { .. } => None,
        }
    }
}

/// Stateless resolver with a configurable default strategy
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictResolver {
    default_strategy: ConflictStrategy,
}

impl ConflictResolver {
    pub fn new(default_strategy: ConflictStrategy) -> Self {
        Self { default_strategy }
    }

    pub fn default_strategy(&self) -> ConflictStrategy {
        self.default_strategy
    }

    /// Resolve with `strategy`, or the default when `None`
    ///
    /// Both records are expected to carry decompressed payloads.
    pub fn resolve(
        &self,
        local: &Record,
        remote: &Record,
        strategy: Option<ConflictStrategy>,
    ) -> Resolution {
        match strategy.unwrap_or(self.default_strategy) {
            ConflictStrategy::Timestamp => by_timestamp(local, remote),
            ConflictStrategy::UserPriority => by_user_priority(local, remote),
            ConflictStrategy::Merge => merge(local, remote),
            ConflictStrategy::Manual => Resolution::Manual {
                local: local.clone(),
                remote: remote.clone(),
            },
        }
    }

    /// Resolve with a strategy given by name (unknown names mean `timestamp`)
    pub fn resolve_named(&self, local: &Record, remote: &Record, strategy: &str) -> Resolution {
        self.resolve(local, remote, Some(ConflictStrategy::parse_lenient(strategy)))
    }
}

fn by_timestamp(local: &Record, remote: &Record) -> Resolution {
    if local.timestamp > remote.timestamp {
        Resolution::Resolved {
            record: local.clone(),
            winner: Winner::Local,
        }
    } else {
        Resolution::Resolved {
            record: remote.clone(),
            winner: Winner::Remote,
        }
    }
}

fn by_user_priority(local: &Record, remote: &Record) -> Resolution {
    match (local.user_initiated, remote.user_initiated) {
        (true, false) => Resolution::Resolved {
            record: local.clone(),
            winner: Winner::Local,
        },
        (false, true) => Resolution::Resolved {
            record: remote.clone(),
            winner: Winner::Remote,
        },
        _ => by_timestamp(local, remote),
    }
}

fn merge(local: &Record, remote: &Record) -> Resolution {
    let mut record = local.clone();
    record.set_plain_payload(merge_payloads(&remote.payload, &local.payload));
    record.timestamp = Utc::now();
    record.version = local.version.max(remote.version) + 1;
    record.synced = false;
    record.merged = true;
    Resolution::Resolved {
        record,
        winner: Winner::Merged,
    }
}

/// Shallow union of two payloads: `overlay` fields replace `base` fields.
///
/// If either side is not an object the overlay replaces the base outright.
pub fn merge_payloads(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            let mut merged = base.clone();
            for (field, value) in overlay {
                merged.insert(field.clone(), value.clone());
            }
            Value::Object(merged)
        }
        (_, overlay) => overlay.clone(),
    }
}
