//! Journal line format

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One journal line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// RFC 3339 with milliseconds, UTC
    pub ts: String,
    pub level: String,
    pub device: String,
    pub target: String,
    pub msg: String,
    /// Record key, lifted out of the event fields when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub fields: Map<String, Value>,
}

impl JournalEntry {
    pub fn new(
        level: impl Into<String>,
        device: impl Into<String>,
        target: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self {
            ts: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            level: level.into(),
            device: device.into(),
            target: target.into(),
            msg: msg.into(),
            key: None,
            fields: Map::new(),
        }
    }

    /// Attach event fields; a `key` field becomes [`JournalEntry::key`]
    pub fn with_fields(mut self, mut fields: Map<String, Value>) -> Self {
        if let Some(key) = fields.remove("key") {
            self.key = Some(match key {
                Value::String(s) => s,
                other => other.to_string(),
            });
        }
        self.fields = fields;
        self
    }

    /// `YYYY-MM-DD` part of the timestamp
    pub fn date(&self) -> &str {
        self.ts.get(..10).unwrap_or(&self.ts)
    }

    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }
}
