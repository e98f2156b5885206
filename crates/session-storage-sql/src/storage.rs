use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use session_storage_core::{
    timestamp_to_datetime, Collection, NewRecord, RecordId, RecordMeta, RecordUpdate,
    SessionStorage, StorageError, StoredRecord,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::{debug, instrument};

const CONFIG_TABLE: &str = "session_config";

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS sessions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        sid TEXT NOT NULL,
        sessdata BLOB,
        timemodified INTEGER NOT NULL
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS sessions_sid_uix ON sessions (sid)",
    "CREATE INDEX IF NOT EXISTS sessions_timemodified_ix ON sessions (timemodified)",
    "CREATE TABLE IF NOT EXISTS session_locks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        sid TEXT NOT NULL,
        timemodified INTEGER NOT NULL
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS session_locks_sid_uix ON session_locks (sid)",
    "CREATE INDEX IF NOT EXISTS session_locks_timemodified_ix ON session_locks (timemodified)",
    "CREATE TABLE IF NOT EXISTS session_config (
        name TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )",
];

/// SQLite-backed session storage.
#[derive(Debug, Clone)]
pub struct SqlStorage {
    pool: SqlitePool,
}

/// Map a driver error, keeping unique violations distinguishable.
fn db_error(context: &str, err: sqlx::Error) -> StorageError {
    if let Some(db_err) = err.as_database_error() {
        if db_err.is_unique_violation() {
            return StorageError::Conflict(format!("{}: {}", context, db_err.message()));
        }
    }
    match err {
        sqlx::Error::Io(e) => StorageError::Io(format!("{}: {}", context, e)),
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            StorageError::Io(format!("{}: {}", context, err))
        }
        other => StorageError::Database(format!("{}: {}", context, other)),
    }
}

/// Row ids are integers; foreign handles match nothing.
fn row_id(id: &RecordId) -> Option<i64> {
    id.as_str().parse().ok()
}

impl SqlStorage {
    /// Connect to a SQLite database URL such as `sqlite:///var/lib/app/sessions.db`.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| StorageError::InvalidArgument(format!("Bad database URL {}: {}", url, e)))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            // Writers queue on SQLite's lock instead of failing immediately.
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await
            .map_err(|e| db_error("Failed to connect", e))?;
        debug!("Connected to {} (max {} connections)", url, max_connections);
        Ok(Self { pool })
    }

    /// A private in-memory database. Lives as long as the returned storage.
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StorageError::InvalidArgument(e.to_string()))?;
        // One connection that never recycles: each new connection would see a
        // fresh, empty database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| db_error("Failed to open in-memory database", e))?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl SessionStorage for SqlStorage {
    fn backend_name(&self) -> &'static str {
        "sql"
    }

    async fn ping(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("Ping failed", e))?;
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn find_by_sid(
        &self,
        collection: Collection,
        sid: &str,
    ) -> Result<Option<RecordMeta>, StorageError> {
        let sql = format!("SELECT id, timemodified FROM {} WHERE sid = ?", collection.name());
        let row: Option<(i64, i64)> = sqlx::query_as(&sql)
            .bind(sid)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("Lookup by sid failed", e))?;

        let Some((id, timemodified)) = row else {
            return Ok(None);
        };
        Ok(Some(RecordMeta {
            id: RecordId::new(id.to_string()),
            timemodified: timestamp_to_datetime(timemodified)?,
        }))
    }

    #[instrument(skip(self), level = "debug")]
    async fn get(
        &self,
        collection: Collection,
        id: &RecordId,
    ) -> Result<Option<StoredRecord>, StorageError> {
        let Some(key) = row_id(id) else {
            return Ok(None);
        };

        let row: Option<(i64, String, Option<Vec<u8>>, i64)> = match collection {
            Collection::Sessions => {
                sqlx::query_as::<_, (i64, String, Option<Vec<u8>>, i64)>(
                    "SELECT id, sid, sessdata, timemodified FROM sessions WHERE id = ?",
                )
                .bind(key)
                .fetch_optional(&self.pool)
                .await
            }
            Collection::Locks => {
                sqlx::query_as::<_, (i64, String, i64)>(
                    "SELECT id, sid, timemodified FROM session_locks WHERE id = ?",
                )
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .map(|row| row.map(|(id, sid, timemodified)| (id, sid, None, timemodified)))
            }
        }
        .map_err(|e| db_error("Lookup by id failed", e))?;

        let Some((id, sid, sessdata, timemodified)) = row else {
            return Ok(None);
        };
        Ok(Some(StoredRecord {
            id: RecordId::new(id.to_string()),
            sid,
            sessdata,
            timemodified: timestamp_to_datetime(timemodified)?,
        }))
    }

    #[instrument(skip(self, record), level = "debug", fields(sid = %record.sid))]
    async fn insert(
        &self,
        collection: Collection,
        record: NewRecord,
    ) -> Result<RecordId, StorageError> {
        let result = match collection {
            Collection::Sessions => {
                sqlx::query("INSERT INTO sessions (sid, sessdata, timemodified) VALUES (?, ?, ?)")
                    .bind(record.sid.as_str())
                    .bind(record.sessdata)
                    .bind(record.timemodified.timestamp())
                    .execute(&self.pool)
                    .await
            }
            Collection::Locks => {
                sqlx::query("INSERT INTO session_locks (sid, timemodified) VALUES (?, ?)")
                    .bind(record.sid.as_str())
                    .bind(record.timemodified.timestamp())
                    .execute(&self.pool)
                    .await
            }
        }
        .map_err(|e| db_error(&format!("Insert into {} failed", collection), e))?;

        let id = result.last_insert_rowid();
        debug!("Inserted {} row {} for {}", collection, id, record.sid);
        Ok(RecordId::new(id.to_string()))
    }

    #[instrument(skip(self, update), level = "debug")]
    async fn update(
        &self,
        collection: Collection,
        id: &RecordId,
        update: RecordUpdate,
    ) -> Result<bool, StorageError> {
        let Some(key) = row_id(id) else {
            return Ok(false);
        };
        let timemodified = update.timemodified.map(|t| t.timestamp());

        let result = match collection {
            Collection::Sessions => {
                sqlx::query(
                    "UPDATE sessions
                     SET sessdata = COALESCE(?, sessdata), timemodified = COALESCE(?, timemodified)
                     WHERE id = ?",
                )
                .bind(update.sessdata)
                .bind(timemodified)
                .bind(key)
                .execute(&self.pool)
                .await
            }
            Collection::Locks => {
                if update.sessdata.is_some() {
                    return Err(StorageError::InvalidArgument(
                        "Lock records carry no session data".to_string(),
                    ));
                }
                sqlx::query(
                    "UPDATE session_locks SET timemodified = COALESCE(?, timemodified) WHERE id = ?",
                )
                .bind(timemodified)
                .bind(key)
                .execute(&self.pool)
                .await
            }
        }
        .map_err(|e| db_error(&format!("Update of {} failed", collection), e))?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete_by_sid(&self, collection: Collection, sid: &str) -> Result<u64, StorageError> {
        let sql = format!("DELETE FROM {} WHERE sid = ?", collection.name());
        let result = sqlx::query(&sql)
            .bind(sid)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("Delete by sid failed", e))?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete_by_id(
        &self,
        collection: Collection,
        id: &RecordId,
    ) -> Result<u64, StorageError> {
        let Some(key) = row_id(id) else {
            return Ok(0);
        };
        let sql = format!("DELETE FROM {} WHERE id = ?", collection.name());
        let result = sqlx::query(&sql)
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("Delete by id failed", e))?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete_older_than(
        &self,
        collection: Collection,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<String>, StorageError> {
        let sql = format!(
            "DELETE FROM {} WHERE timemodified < ? RETURNING sid",
            collection.name()
        );
        let sids = sqlx::query_scalar::<_, String>(&sql)
            .bind(cutoff.timestamp())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error("Range delete failed", e))?;
        debug!("Removed {} stale row(s) from {}", sids.len(), collection);
        Ok(sids)
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete_all(&self, collection: Collection) -> Result<u64, StorageError> {
        let sql = format!("DELETE FROM {}", collection.name());
        let result = sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("Delete all failed", e))?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self), level = "debug")]
    async fn ensure_schema(&self) -> Result<(), StorageError> {
        for statement in SCHEMA {
            sqlx::query(*statement)
                .execute(&self.pool)
                .await
                .map_err(|e| db_error("Schema setup failed", e))?;
        }
        Ok(())
    }

    async fn get_meta(&self, name: &str) -> Result<Option<String>, StorageError> {
        let sql = format!("SELECT value FROM {} WHERE name = ?", CONFIG_TABLE);
        sqlx::query_scalar::<_, String>(&sql)
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("Config lookup failed", e))
    }

    async fn set_meta(&self, name: &str, value: &str) -> Result<(), StorageError> {
        let sql = format!(
            "INSERT INTO {} (name, value) VALUES (?, ?)
             ON CONFLICT(name) DO UPDATE SET value = excluded.value",
            CONFIG_TABLE
        );
        sqlx::query(&sql)
            .bind(name)
            .bind(value)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("Config write failed", e))?;
        Ok(())
    }
}
