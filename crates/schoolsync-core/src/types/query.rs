//! Record query and filter types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{DataType, Priority, Record};
use crate::error::{SyncError, SyncResult};

/// Inclusive timestamp range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DateRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> SyncResult<Self> {
        if start > end {
            return Err(SyncError::InvalidFilter(format!(
                "date range start {start} is after end {end}"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at <= self.end
    }
}

/// Caller-facing filters for `get_offline_data`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFilter {
    pub date_range: Option<DateRange>,
    pub priority: Option<Priority>,
}

impl RecordFilter {
    pub fn with_date_range(mut self, range: DateRange) -> Self {
        self.date_range = Some(range);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Reject filters that can never match (an inverted range)
    pub fn validate(&self) -> SyncResult<()> {
        if let Some(range) = &self.date_range {
            DateRange::new(range.start, range.end)?;
        }
        Ok(())
    }
}

/// Store-level query: every set field must match
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordQuery {
    pub data_type: Option<DataType>,
    pub date_range: Option<DateRange>,
    pub priority: Option<Priority>,
}

impl RecordQuery {
    pub fn for_type(data_type: DataType) -> Self {
        Self {
            data_type: Some(data_type),
            ..Self::default()
        }
    }

    pub fn with_filter(mut self, filter: &RecordFilter) -> Self {
        self.date_range = filter.date_range;
        self.priority = filter.priority;
        self
    }

    pub fn matches(&self, record: &Record) -> bool {
        self.data_type
            .as_ref()
            .map_or(true, |data_type| &record.data_type == data_type)
            && self
                .date_range
                .map_or(true, |range| range.contains(record.timestamp))
            && self
                .priority
                .map_or(true, |priority| record.priority == priority)
    }
}
