use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// The two logical collections every backend provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    /// Session data records (`sid` unique, `timemodified` indexed).
    Sessions,
    /// Session lock records (`sid` unique, `timemodified` indexed).
    Locks,
}

impl Collection {
    /// Name of the table/directory backing this collection.
    pub fn name(&self) -> &'static str {
        match self {
            Collection::Sessions => "sessions",
            Collection::Locks => "session_locks",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Opaque handle of a stored record, assigned by the backend on insert.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordId(String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Projection returned by the cheap existence check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMeta {
    pub id: RecordId,
    pub timemodified: DateTime<Utc>,
}

/// A full record as stored by the backend.
///
/// Lock records never carry `sessdata`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub id: RecordId,
    pub sid: String,
    pub sessdata: Option<Vec<u8>>,
    pub timemodified: DateTime<Utc>,
}

impl StoredRecord {
    pub fn meta(&self) -> RecordMeta {
        RecordMeta {
            id: self.id.clone(),
            timemodified: self.timemodified,
        }
    }
}

/// A record to insert.
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub sid: String,
    pub sessdata: Option<Vec<u8>>,
    pub timemodified: DateTime<Utc>,
}

impl NewRecord {
    /// A lock record for `sid` stamped at `now`.
    pub fn lock(sid: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            sid: sid.into(),
            sessdata: None,
            timemodified: now,
        }
    }

    /// A session record carrying already-encoded data.
    pub fn session(sid: impl Into<String>, sessdata: Vec<u8>, now: DateTime<Utc>) -> Self {
        Self {
            sid: sid.into(),
            sessdata: Some(sessdata),
            timemodified: now,
        }
    }
}

/// Fields to change on an existing record. `None` leaves the field untouched.
#[derive(Debug, Clone, Default)]
pub struct RecordUpdate {
    pub sessdata: Option<Vec<u8>>,
    pub timemodified: Option<DateTime<Utc>>,
}

/// Storage adapter abstraction shared by the document and relational backends.
///
/// Adapters own no session semantics: they store uninterpreted records keyed by
/// `sid` and enforce uniqueness of `sid` per collection. A second insert for the
/// same `sid` must fail with [`StorageError::Conflict`] so the lock manager can
/// tell contention apart from transient failures.
#[async_trait]
pub trait SessionStorage: Send + Sync {
    /// Returns the backend identifier (e.g., "document", "sql").
    fn backend_name(&self) -> &'static str;

    /// Check that the backing store is reachable.
    async fn ping(&self) -> Result<(), StorageError>;

    // =========================================================================
    // Point lookups
    // =========================================================================

    /// Look up a record by `sid`, projecting only its handle and timestamp.
    async fn find_by_sid(
        &self,
        collection: Collection,
        sid: &str,
    ) -> Result<Option<RecordMeta>, StorageError>;

    /// Fetch a full record by handle.
    async fn get(
        &self,
        collection: Collection,
        id: &RecordId,
    ) -> Result<Option<StoredRecord>, StorageError>;

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Insert a record and return its handle.
    async fn insert(
        &self,
        collection: Collection,
        record: NewRecord,
    ) -> Result<RecordId, StorageError>;

    /// Update a record by handle. Returns `false` if no record was affected.
    async fn update(
        &self,
        collection: Collection,
        id: &RecordId,
        update: RecordUpdate,
    ) -> Result<bool, StorageError>;

    /// Delete the record for `sid`. Returns the number of records removed.
    async fn delete_by_sid(&self, collection: Collection, sid: &str) -> Result<u64, StorageError>;

    /// Delete a record by handle. Returns the number of records removed.
    async fn delete_by_id(
        &self,
        collection: Collection,
        id: &RecordId,
    ) -> Result<u64, StorageError>;

    /// Delete every record with `timemodified < cutoff`, returning the removed sids.
    async fn delete_older_than(
        &self,
        collection: Collection,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<String>, StorageError>;

    /// Delete every record in the collection.
    async fn delete_all(&self, collection: Collection) -> Result<u64, StorageError>;

    // =========================================================================
    // Provisioning
    // =========================================================================

    /// Create collections, the unique `sid` constraints and timestamp indexes.
    /// Must be idempotent.
    async fn ensure_schema(&self) -> Result<(), StorageError>;

    /// Read an auxiliary config value.
    async fn get_meta(&self, name: &str) -> Result<Option<String>, StorageError>;

    /// Write an auxiliary config value, replacing any previous one.
    async fn set_meta(&self, name: &str, value: &str) -> Result<(), StorageError>;
}

/// Convert a stored unix timestamp back into a `DateTime`.
pub fn timestamp_to_datetime(secs: i64) -> Result<DateTime<Utc>, StorageError> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| StorageError::Serialization(format!("Invalid timestamp: {}", secs)))
}
