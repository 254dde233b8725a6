//! Core types for SchoolSync

pub mod query;
pub mod queue;

pub use query::{DateRange, RecordFilter, RecordQuery};
pub use queue::{FailedItem, QueueItemDraft, QueueItemId, SyncAction, SyncQueueItem};

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::Ulid;

use crate::error::SyncError;

/// Tag describing what kind of data a record holds
///
/// Open-ended (`student_data`, `attendance`, `grades`, ...). Restricted to
/// ASCII alphanumerics, `_` and `-` so it can be embedded in record keys,
/// index keys and URL paths without escaping.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DataType(String);

impl DataType {
    /// Validate and wrap a data type tag
    pub fn new(name: impl Into<String>) -> Result<Self, SyncError> {
        let name = name.into();
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(SyncError::InvalidDataType(name));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for DataType {
    type Error = SyncError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<DataType> for String {
    fn from(value: DataType) -> Self {
        value.0
    }
}

impl FromStr for DataType {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique key of a stored record, `{data_type}_{ulid}`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordKey(String);

impl RecordKey {
    /// Generate a fresh key for the given data type
    pub fn generate(data_type: &DataType) -> Self {
        Self(format!("{}_{}", data_type, Ulid::new()))
    }

    /// Wrap a key string received from a caller or the remote service
    pub fn from_string(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RecordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Sync priority of a record or queue item
///
/// Variant order is drain order: sorting ascending yields high first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Numeric rank used in index keys (0 = high)
    pub fn rank(self) -> u8 {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

impl FromStr for Priority {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            other => Err(SyncError::InvalidFilter(format!(
                "unknown priority '{other}'"
            ))),
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_true() -> bool {
    true
}

/// A locally stored piece of school data
///
/// When `compressed` is true, `payload` is a JSON string holding the codec
/// output; callers of the coordinator only ever see decompressed records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub key: RecordKey,
    pub data_type: DataType,
    pub payload: Value,
    pub compressed: bool,
    pub priority: Priority,
    pub timestamp: DateTime<Utc>,
    pub version: u64,
    pub synced: bool,
    #[serde(default = "default_true")]
    pub user_initiated: bool,
    /// Serialized payload size before compression
    pub original_size: usize,
    /// Serialized payload size as stored
    pub stored_size: usize,
    /// Set when the record is the product of a merge resolution
    #[serde(default)]
    pub merged: bool,
}

impl Record {
    /// Create a new, unsynced, version 1 record with a generated key
    pub fn new(data_type: DataType, payload: Value, priority: Priority) -> Self {
        let size = payload_size(&payload);
        Self {
            key: RecordKey::generate(&data_type),
            data_type,
            payload,
            compressed: false,
            priority,
            timestamp: Utc::now(),
            version: 1,
            synced: false,
            user_initiated: true,
            original_size: size,
            stored_size: size,
            merged: false,
        }
    }

    /// Record a local mutation: bump version, refresh timestamp, clear synced
    pub fn touch(&mut self) {
        self.version += 1;
        self.timestamp = Utc::now();
        self.synced = false;
    }

    /// Replace the payload with a plain (uncompressed) value
    pub fn set_plain_payload(&mut self, payload: Value) {
        let size = payload_size(&payload);
        self.payload = payload;
        self.compressed = false;
        self.original_size = size;
        self.stored_size = size;
    }

    /// Bytes this record occupies in a store (its JSON encoding)
    pub fn encoded_len(&self) -> usize {
        serde_json::to_vec(self).map(|bytes| bytes.len()).unwrap_or(0)
    }
}

/// Serialized JSON size of a payload in bytes
pub fn payload_size(payload: &Value) -> usize {
    serde_json::to_vec(payload)
        .map(|bytes| bytes.len())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_data_type_validation() {
        assert!(DataType::new("student_data").is_ok());
        assert!(DataType::new("grades-2024").is_ok());
        assert!(matches!(
            DataType::new(""),
            Err(SyncError::InvalidDataType(_))
        ));
        assert!(DataType::new("bad type").is_err());
        assert!(DataType::new("a/b").is_err());
    }

    #[test]
    fn test_data_type_deserialize_validates() {
        let ok: DataType = serde_json::from_str("\"attendance\"").unwrap();
        assert_eq!(ok.as_str(), "attendance");
        assert!(serde_json::from_str::<DataType>("\"no spaces\"").is_err());
    }

    #[test]
    fn test_record_key_format() {
        let data_type = DataType::new("attendance").unwrap();
        let key = RecordKey::generate(&data_type);
        let (prefix, ulid) = key.as_str().rsplit_once('_').unwrap();
        assert_eq!(prefix, "attendance");
        assert!(Ulid::from_string(ulid).is_ok());
    }

    #[test]
    fn test_record_keys_unique() {
        let data_type = DataType::new("grades").unwrap();
        let a = RecordKey::generate(&data_type);
        let b = RecordKey::generate(&data_type);
        assert_ne!(a, b);
    }

    #[test]
    fn test_priority_order_and_parse() {
        let mut priorities = vec![Priority::Low, Priority::High, Priority::Normal];
        priorities.sort();
        assert_eq!(
            priorities,
            vec![Priority::High, Priority::Normal, Priority::Low]
        );
        assert_eq!("HIGH".parse::<Priority>().unwrap(), Priority::High);
        assert!("urgent".parse::<Priority>().is_err());
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn test_new_record_defaults() {
        let record = Record::new(
            DataType::new("attendance").unwrap(),
            json!({"studentId": "s1", "present": true}),
            Priority::Normal,
        );
        assert_eq!(record.version, 1);
        assert!(!record.synced);
        assert!(!record.compressed);
        assert!(record.user_initiated);
        assert_eq!(record.original_size, record.stored_size);
        assert!(record.key.as_str().starts_with("attendance_"));
    }

    #[test]
    fn test_touch_bumps_version() {
        let mut record = Record::new(
            DataType::new("grades").unwrap(),
            json!({"score": 70}),
            Priority::Low,
        );
        record.synced = true;
        let before = record.timestamp;
        record.touch();
        assert_eq!(record.version, 2);
        assert!(!record.synced);
        assert!(record.timestamp >= before);
    }

    #[test]
    fn test_record_json_shape() {
        let record = Record::new(
            DataType::new("grades").unwrap(),
            json!({"score": 70}),
            Priority::High,
        );
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["priority"], "high");
        assert_eq!(value["data_type"], "grades");

        // user_initiated and merged are optional on the wire
        let mut object = value.as_object().unwrap().clone();
        object.remove("user_initiated");
        object.remove("merged");
        let parsed: Record = serde_json::from_value(Value::Object(object)).unwrap();
        assert!(parsed.user_initiated);
        assert!(!parsed.merged);
    }
}
