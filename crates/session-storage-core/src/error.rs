use std::time::Duration;

use thiserror::Error;

/// Errors reported by a storage adapter.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// A unique constraint on `sid` rejected the insert.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl StorageError {
    /// Whether this error is a uniqueness violation rather than a transient failure.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StorageError::Conflict(_))
    }
}

/// Errors surfaced by the lock manager and session coordinator.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Timed out after {waited:?} waiting for session lock on {sid}")]
    LockTimeout { sid: String, waited: Duration },

    #[error("Programming error: {0}")]
    Programming(String),

    #[error("Backend write error: {0}")]
    BackendWrite(String),

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Consistency violation: {0}")]
    ConsistencyViolation(String),

    #[error("Failed to release session lock for {0}")]
    LockReleaseFailed(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}
