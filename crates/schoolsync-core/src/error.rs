//! Error types for SchoolSync

use std::time::Duration;

use thiserror::Error;

/// Main error type for SchoolSync operations
#[derive(Error, Debug)]
pub enum SyncError {
    /// Data type tag is empty or contains characters outside `[A-Za-z0-9_-]`
    #[error("Invalid data type: {0:?}")]
    InvalidDataType(String),

    /// Record query filter is malformed (e.g. inverted date range)
    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    /// Record was not found where one was required
    #[error("Record not found: {0}")]
    RecordNotFound(String),

    /// Error during storage operations (redb)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// Writing the record would push local storage past its quota
    #[error("Storage quota exceeded: {used} of {quota} bytes in use, {requested} more requested")]
    QuotaExceeded { used: u64, requested: u64, quota: u64 },

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Payload could not be encoded or decoded by a codec
    #[error("Codec error: {0}")]
    Codec(String),

    /// Remote service answered with a non-success status
    #[error("Remote returned HTTP {status}: {message}")]
    Remote { status: u16, message: String },

    /// Network-related error
    #[error("Network error: {0}")]
    Network(String),

    /// Remote call did not complete in time
    #[error("Remote call timed out after {0:?}")]
    Timeout(Duration),

    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid operation for current state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl SyncError {
    /// True when the error came from the local quota check.
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, SyncError::QuotaExceeded { .. })
    }

    /// True when the error is a failure of the local database.
    pub fn is_storage_failure(&self) -> bool {
        matches!(
            self,
            SyncError::Storage(_)
                | SyncError::Database(_)
                | SyncError::Transaction(_)
                | SyncError::Table(_)
                | SyncError::StorageOp(_)
                | SyncError::Commit(_)
                | SyncError::QuotaExceeded { .. }
        )
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

/// Result type alias using SyncError
pub type SyncResult<T> = Result<T, SyncError>;
