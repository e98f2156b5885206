//! In-memory storage adapter.
//!
//! [`MemoryStorage`] keeps both collections in process memory. It is intended
//! for tests and single-process embedding: uniqueness of `sid` is enforced under
//! one mutex, so it gives the same contention semantics as the persistent
//! backends, but nothing survives a restart.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StorageError;
use crate::storage::{
    Collection, NewRecord, RecordId, RecordMeta, RecordUpdate, SessionStorage, StoredRecord,
};

#[derive(Debug, Default)]
struct Table {
    rows: BTreeMap<u64, StoredRecord>,
    by_sid: HashMap<String, u64>,
}

#[derive(Debug, Default)]
struct State {
    sessions: Table,
    locks: Table,
    meta: HashMap<String, String>,
    next_id: u64,
}

impl State {
    fn table(&mut self, collection: Collection) -> &mut Table {
        match collection {
            Collection::Sessions => &mut self.sessions,
            Collection::Locks => &mut self.locks,
        }
    }
}

/// Cheaply cloneable; all clones share the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    state: Arc<Mutex<State>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, StorageError> {
        self.state
            .lock()
            .map_err(|_| StorageError::Internal("memory storage mutex poisoned".to_string()))
    }

    /// Number of records currently held in `collection`.
    pub fn len(&self, collection: Collection) -> Result<usize, StorageError> {
        let mut state = self.lock()?;
        Ok(state.table(collection).rows.len())
    }

    pub fn is_empty(&self, collection: Collection) -> Result<bool, StorageError> {
        Ok(self.len(collection)? == 0)
    }
}

fn parse_id(id: &RecordId) -> Option<u64> {
    id.as_str().parse().ok()
}

fn remove_row(table: &mut Table, key: u64) -> Option<StoredRecord> {
    let record = table.rows.remove(&key)?;
    if table.by_sid.get(&record.sid) == Some(&key) {
        table.by_sid.remove(&record.sid);
    }
    Some(record)
}

#[async_trait]
impl SessionStorage for MemoryStorage {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> Result<(), StorageError> {
        self.lock().map(|_| ())
    }

    async fn find_by_sid(
        &self,
        collection: Collection,
        sid: &str,
    ) -> Result<Option<RecordMeta>, StorageError> {
        let mut state = self.lock()?;
        let table = state.table(collection);
        Ok(table
            .by_sid
            .get(sid)
            .and_then(|key| table.rows.get(key))
            .map(StoredRecord::meta))
    }

    async fn get(
        &self,
        collection: Collection,
        id: &RecordId,
    ) -> Result<Option<StoredRecord>, StorageError> {
        let Some(key) = parse_id(id) else {
            return Ok(None);
        };
        let mut state = self.lock()?;
        Ok(state.table(collection).rows.get(&key).cloned())
    }

    async fn insert(
        &self,
        collection: Collection,
        record: NewRecord,
    ) -> Result<RecordId, StorageError> {
        let mut state = self.lock()?;
        state.next_id += 1;
        let key = state.next_id;
        let table = state.table(collection);
        if table.by_sid.contains_key(&record.sid) {
            return Err(StorageError::Conflict(format!(
                "{} already has a record for {}",
                collection, record.sid
            )));
        }
        let id = RecordId::new(key.to_string());
        table.by_sid.insert(record.sid.clone(), key);
        table.rows.insert(
            key,
            StoredRecord {
                id: id.clone(),
                sid: record.sid,
                sessdata: record.sessdata,
                timemodified: record.timemodified,
            },
        );
        Ok(id)
    }

    async fn update(
        &self,
        collection: Collection,
        id: &RecordId,
        update: RecordUpdate,
    ) -> Result<bool, StorageError> {
        let Some(key) = parse_id(id) else {
            return Ok(false);
        };
        let mut state = self.lock()?;
        let Some(row) = state.table(collection).rows.get_mut(&key) else {
            return Ok(false);
        };
        if let Some(data) = update.sessdata {
            row.sessdata = Some(data);
        }
        if let Some(timemodified) = update.timemodified {
            row.timemodified = timemodified;
        }
        Ok(true)
    }

    async fn delete_by_sid(&self, collection: Collection, sid: &str) -> Result<u64, StorageError> {
        let mut state = self.lock()?;
        let table = state.table(collection);
        let Some(key) = table.by_sid.get(sid).copied() else {
            return Ok(0);
        };
        Ok(remove_row(table, key).map_or(0, |_| 1))
    }

    async fn delete_by_id(
        &self,
        collection: Collection,
        id: &RecordId,
    ) -> Result<u64, StorageError> {
        let Some(key) = parse_id(id) else {
            return Ok(0);
        };
        let mut state = self.lock()?;
        Ok(remove_row(state.table(collection), key).map_or(0, |_| 1))
    }

    async fn delete_older_than(
        &self,
        collection: Collection,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<String>, StorageError> {
        let mut state = self.lock()?;
        let table = state.table(collection);
        let stale: Vec<u64> = table
            .rows
            .iter()
            .filter(|(_, row)| row.timemodified < cutoff)
            .map(|(key, _)| *key)
            .collect();
        Ok(stale
            .into_iter()
            .filter_map(|key| remove_row(table, key))
            .map(|row| row.sid)
            .collect())
    }

    async fn delete_all(&self, collection: Collection) -> Result<u64, StorageError> {
        let mut state = self.lock()?;
        let table = state.table(collection);
        let removed = table.rows.len() as u64;
        table.rows.clear();
        table.by_sid.clear();
        Ok(removed)
    }

    async fn ensure_schema(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn get_meta(&self, name: &str) -> Result<Option<String>, StorageError> {
        Ok(self.lock()?.meta.get(name).cloned())
    }

    async fn set_meta(&self, name: &str, value: &str) -> Result<(), StorageError> {
        self.lock()?.meta.insert(name.to_string(), value.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn test_insert_conflict_on_same_sid() {
        let store = MemoryStorage::new();
        let now = Utc::now();
        store
            .insert(Collection::Locks, NewRecord::lock("s1", now))
            .await
            .unwrap();
        let err = store
            .insert(Collection::Locks, NewRecord::lock("s1", now))
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        // Collections are independent
        store
            .insert(Collection::Sessions, NewRecord::session("s1", vec![], now))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_delete_older_than_is_strict() {
        let store = MemoryStorage::new();
        let now = Utc::now();
        store
            .insert(Collection::Sessions, NewRecord::session("old", vec![], now - Duration::seconds(100)))
            .await
            .unwrap();
        store
            .insert(Collection::Sessions, NewRecord::session("edge", vec![], now))
            .await
            .unwrap();

        let removed = store
            .delete_older_than(Collection::Sessions, now)
            .await
            .unwrap();
        assert_eq!(removed, vec!["old".to_string()]);
        assert!(store.find_by_sid(Collection::Sessions, "edge").await.unwrap().is_some());
        assert!(store.find_by_sid(Collection::Sessions, "old").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_deleted_sid_can_be_reinserted() {
        let store = MemoryStorage::new();
        let now = Utc::now();
        let id = store
            .insert(Collection::Locks, NewRecord::lock("s1", now))
            .await
            .unwrap();
        assert_eq!(store.delete_by_id(Collection::Locks, &id).await.unwrap(), 1);
        assert_eq!(store.delete_by_id(Collection::Locks, &id).await.unwrap(), 0);
        let again = store
            .insert(Collection::Locks, NewRecord::lock("s1", now))
            .await
            .unwrap();
        assert_ne!(id, again);
    }

    #[test]
    fn test_poisoned_store_reports_error() {
        let store = MemoryStorage::new();
        let clone = store.clone();
        let _ = std::thread::spawn(move || {
            let _guard = clone.state.lock().unwrap();
            panic!("poison the mutex");
        })
        .join();

        assert!(matches!(
            store.len(Collection::Sessions),
            Err(StorageError::Internal(_))
        ));
        assert!(store.is_empty(Collection::Locks).is_err());
    }
}
