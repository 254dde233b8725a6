//! Record storage with secondary indexes
//!
//! ## Storage Design
//!
//! - **Primary table**: `records` - keyed by record key, JSON-encoded `Record`
//! - **Type index**: `records_by_type` - `{data_type}\x01{key}` → key
//! - **Time index**: `records_by_time` - `{millis:020}\x01{key}` → key
//! - **Priority index**: `records_by_priority` - `{rank}\x01{key}` → key
//!
//! Index keys share a prefix per indexed value, so a lookup is a range scan
//! from `{prefix}\x01` to `{prefix}\x02`. Timestamps are zero-padded so
//! lexicographic order is chronological order.
//!
//! The `meta` table carries `record_bytes`, the summed size of the primary
//! table's values, maintained in the same transaction as every put and
//! delete so quota checks never scan.

use std::collections::BTreeMap;

use redb::{ReadableTable, Table, TableDefinition, WriteTransaction};

use super::{RecordStore, Storage, META_TABLE};
use crate::error::SyncError;
use crate::types::{DataType, Priority, Record, RecordQuery};

/// Table for records (key: record key, value: serialized Record)
pub(crate) const RECORDS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("records");

pub(crate) const TYPE_INDEX: TableDefinition<&str, &str> =
    TableDefinition::new("records_by_type");

pub(crate) const TIME_INDEX: TableDefinition<&str, &str> =
    TableDefinition::new("records_by_time");

pub(crate) const PRIORITY_INDEX: TableDefinition<&str, &str> =
    TableDefinition::new("records_by_priority");

const SEP: char = '\u{1}';
const SEP_END: char = '\u{2}';

fn type_index_key(record: &Record) -> String {
    format!("{}{SEP}{}", record.data_type, record.key)
}

fn time_prefix(millis: i64) -> String {
    format!("{:020}", millis.max(0))
}

fn time_index_key(record: &Record) -> String {
    format!(
        "{}{SEP}{}",
        time_prefix(record.timestamp.timestamp_millis()),
        record.key
    )
}

fn priority_index_key(record: &Record) -> String {
    format!("{}{SEP}{}", record.priority.rank(), record.key)
}

const RECORD_BYTES_KEY: &str = "record_bytes";

fn read_record_bytes(
    meta: &impl ReadableTable<&'static str, &'static [u8]>,
) -> Result<u64, SyncError> {
    Ok(meta
        .get(RECORD_BYTES_KEY)?
        .and_then(|value| <[u8; 8]>::try_from(value.value()).ok())
        .map(u64::from_le_bytes)
        .unwrap_or(0))
}

/// Adjust the stored byte total by `added - removed`
fn adjust_record_bytes(
    meta: &mut Table<'_, &'static str, &'static [u8]>,
    removed: u64,
    added: u64,
) -> Result<(), SyncError> {
    let total = read_record_bytes(&*meta)?.saturating_sub(removed) + added;
    meta.insert(RECORD_BYTES_KEY, total.to_le_bytes().as_slice())?;
    Ok(())
}

/// Seed the byte total for databases written before it was tracked
pub(super) fn ensure_record_bytes(write_txn: &WriteTransaction) -> Result<(), SyncError> {
    let mut meta = write_txn.open_table(META_TABLE)?;
    if meta.get(RECORD_BYTES_KEY)?.is_some() {
        return Ok(());
    }

    let records = write_txn.open_table(RECORDS_TABLE)?;
    let mut total = 0u64;
    for entry in records.iter()? {
        let (_, value) = entry?;
        total += value.value().len() as u64;
    }
    meta.insert(RECORD_BYTES_KEY, total.to_le_bytes().as_slice())?;
    Ok(())
}

impl Storage {
    // ═══════════════════════════════════════════════════════════════════════
    // Index Scans
    // ═══════════════════════════════════════════════════════════════════════

    /// Record keys whose index entry lies in `[lower, upper)`
    fn scan_index(
        &self,
        index: TableDefinition<'static, &'static str, &'static str>,
        lower: &str,
        upper: &str,
    ) -> Result<Vec<String>, SyncError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        let table = read_txn.open_table(index)?;

        let mut keys = Vec::new();
        for entry in table.range(lower..upper)? {
            let (_, value) = entry?;
            keys.push(value.value().to_string());
        }
        Ok(keys)
    }

    /// Load records for a list of keys, skipping keys with no record
    fn load_records(&self, keys: &[String]) -> Result<Vec<Record>, SyncError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        let table = read_txn.open_table(RECORDS_TABLE)?;

        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = table.get(key.as_str())? {
                records.push(serde_json::from_slice(value.value())?);
            }
        }
        Ok(records)
    }

    fn keys_for_type(&self, data_type: &DataType) -> Result<Vec<String>, SyncError> {
        let lower = format!("{data_type}{SEP}");
        let upper = format!("{data_type}{SEP_END}");
        self.scan_index(TYPE_INDEX, &lower, &upper)
    }

    fn keys_for_priority(&self, priority: Priority) -> Result<Vec<String>, SyncError> {
        let lower = format!("{}{SEP}", priority.rank());
        let upper = format!("{}{SEP_END}", priority.rank());
        self.scan_index(PRIORITY_INDEX, &lower, &upper)
    }

    fn keys_between(&self, start_millis: i64, end_millis: i64) -> Result<Vec<String>, SyncError> {
        let lower = format!("{}{SEP}", time_prefix(start_millis));
        let upper = format!("{}{SEP_END}", time_prefix(end_millis));
        self.scan_index(TIME_INDEX, &lower, &upper)
    }
}

impl RecordStore for Storage {
    fn put(&self, record: &Record) -> Result<(), SyncError> {
        let data = serde_json::to_vec(record)?;
        let key = record.key.as_str();

        let db = self.db_handle();
        let db_guard = db.read();
        let write_txn = db_guard.begin_write()?;
        {
            let mut records = write_txn.open_table(RECORDS_TABLE)?;
            let mut by_type = write_txn.open_table(TYPE_INDEX)?;
            let mut by_time = write_txn.open_table(TIME_INDEX)?;
            let mut by_priority = write_txn.open_table(PRIORITY_INDEX)?;
            let mut meta = write_txn.open_table(META_TABLE)?;

            let previous: Option<(Record, u64)> = match records.get(key)? {
                Some(value) => {
                    let bytes = value.value();
                    Some((serde_json::from_slice(bytes)?, bytes.len() as u64))
                }
                None => None,
            };

            // Drop stale index entries before re-indexing
            let mut removed = 0;
            if let Some((previous, len)) = previous {
                by_type.remove(type_index_key(&previous).as_str())?;
                by_time.remove(time_index_key(&previous).as_str())?;
                by_priority.remove(priority_index_key(&previous).as_str())?;
                removed = len;
            }

            records.insert(key, data.as_slice())?;
            by_type.insert(type_index_key(record).as_str(), key)?;
            by_time.insert(time_index_key(record).as_str(), key)?;
            by_priority.insert(priority_index_key(record).as_str(), key)?;
            adjust_record_bytes(&mut meta, removed, data.len() as u64)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Record>, SyncError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        let table = read_txn.open_table(RECORDS_TABLE)?;

        match table.get(key)? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    fn get_by_type(&self, data_type: &DataType) -> Result<Vec<Record>, SyncError> {
        let keys = self.keys_for_type(data_type)?;
        self.load_records(&keys)
    }

    fn get_all(&self) -> Result<BTreeMap<String, Record>, SyncError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        let table = read_txn.open_table(RECORDS_TABLE)?;

        let mut records = BTreeMap::new();
        for entry in table.iter()? {
            let (key, value) = entry?;
            let record: Record = serde_json::from_slice(value.value())?;
            records.insert(key.value().to_string(), record);
        }
        Ok(records)
    }

    fn delete(&self, key: &str) -> Result<bool, SyncError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let write_txn = db_guard.begin_write()?;
        let existed = {
            let mut records = write_txn.open_table(RECORDS_TABLE)?;
            let mut by_type = write_txn.open_table(TYPE_INDEX)?;
            let mut by_time = write_txn.open_table(TIME_INDEX)?;
            let mut by_priority = write_txn.open_table(PRIORITY_INDEX)?;
            let mut meta = write_txn.open_table(META_TABLE)?;

            let previous: Option<(Record, u64)> = match records.remove(key)? {
                Some(value) => {
                    let bytes = value.value();
                    Some((serde_json::from_slice(bytes)?, bytes.len() as u64))
                }
                None => None,
            };

            match previous {
                Some((previous, len)) => {
                    by_type.remove(type_index_key(&previous).as_str())?;
                    by_time.remove(time_index_key(&previous).as_str())?;
                    by_priority.remove(priority_index_key(&previous).as_str())?;
                    adjust_record_bytes(&mut meta, len, 0)?;
                    true
                }
                None => false,
            }
        };
        write_txn.commit()?;
        Ok(existed)
    }

    fn query(&self, query: &RecordQuery) -> Result<Vec<Record>, SyncError> {
        let keys = if let Some(range) = &query.date_range {
            self.keys_between(
                range.start.timestamp_millis(),
                range.end.timestamp_millis(),
            )?
        } else if let Some(data_type) = &query.data_type {
            self.keys_for_type(data_type)?
        } else if let Some(priority) = query.priority {
            self.keys_for_priority(priority)?
        } else {
            return self.oldest_first();
        };

        Ok(self
            .load_records(&keys)?
            .into_iter()
            .filter(|record| query.matches(record))
            .collect())
    }

    fn oldest_first(&self) -> Result<Vec<Record>, SyncError> {
        let keys = self.keys_between(0, i64::MAX)?;
        self.load_records(&keys)
    }

    fn total_bytes(&self) -> Result<u64, SyncError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        let meta = read_txn.open_table(META_TABLE)?;
        read_record_bytes(&meta)
    }
}
