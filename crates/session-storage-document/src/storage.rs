use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use session_storage_core::{
    timestamp_to_datetime, Collection, NewRecord, RecordId, RecordMeta, RecordUpdate,
    SessionStorage, StorageError, StoredRecord,
};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Document-store backend keeping one JSON document per record.
///
/// Layout:
/// ```text
/// {root}/
///   config.json
///   sessions/
///     .lock
///     docs/{id}.json
///     keys/{sha256(sid)}
///   session_locks/
///     .lock
///     docs/{id}.json
///     keys/{sha256(sid)}
/// ```
///
/// The `keys/` directory is the unique index on `sid`: each key file holds the
/// handle of the one document owning that `sid`. Every mutation of a collection
/// runs under an exclusive OS lock on its `.lock` file, so uniqueness holds
/// across processes sharing the directory. Reads take no lock; documents are
/// replaced atomically via rename.
#[derive(Debug, Clone)]
pub struct DocumentStorage {
    root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Document {
    id: String,
    sid: String,
    /// Base64 of the stored bytes; absent for lock documents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sessdata: Option<String>,
    timemodified: i64,
}

impl Document {
    fn into_record(self) -> Result<StoredRecord, StorageError> {
        let sessdata = self
            .sessdata
            .map(|encoded| STANDARD.decode(encoded))
            .transpose()
            .map_err(|e| {
                StorageError::Serialization(format!("Corrupt sessdata in {}: {}", self.id, e))
            })?;
        Ok(StoredRecord {
            id: RecordId::new(self.id),
            sid: self.sid,
            sessdata,
            timemodified: timestamp_to_datetime(self.timemodified)?,
        })
    }
}

/// Exclusive lock on a collection's `.lock` file, released on drop.
struct CollectionGuard {
    file: File,
}

impl CollectionGuard {
    fn acquire(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            create_dir(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| io_error("open lock file", path, e))?;
        FileExt::lock_exclusive(&file).map_err(|e| io_error("lock", path, e))?;
        Ok(Self { file })
    }
}

impl Drop for CollectionGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn io_error(action: &str, path: &Path, e: std::io::Error) -> StorageError {
    StorageError::Io(format!("Failed to {} {}: {}", action, path.display(), e))
}

fn create_dir(dir: &Path) -> Result<(), StorageError> {
    fs::create_dir_all(dir).map_err(|e| io_error("create dir", dir, e))
}

fn collection_dir(root: &Path, collection: Collection) -> PathBuf {
    root.join(collection.name())
}

fn docs_dir(root: &Path, collection: Collection) -> PathBuf {
    collection_dir(root, collection).join("docs")
}

fn keys_dir(root: &Path, collection: Collection) -> PathBuf {
    collection_dir(root, collection).join("keys")
}

fn guard_path(root: &Path, collection: Collection) -> PathBuf {
    collection_dir(root, collection).join(".lock")
}

fn doc_path(root: &Path, collection: Collection, id: &str) -> PathBuf {
    docs_dir(root, collection).join(format!("{}.json", id))
}

/// Key file name for a sid. Hashed so arbitrary sids map to safe, bounded names.
fn key_path(root: &Path, collection: Collection, sid: &str) -> PathBuf {
    keys_dir(root, collection).join(hex::encode(Sha256::digest(sid.as_bytes())))
}

fn config_path(root: &Path) -> PathBuf {
    root.join("config.json")
}

/// Handles are UUIDs; anything else cannot name a document.
fn valid_id(id: &RecordId) -> bool {
    Uuid::parse_str(id.as_str()).is_ok()
}

fn write_atomic(path: &Path, content: &[u8]) -> Result<(), StorageError> {
    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, content).map_err(|e| io_error("write", &temp_path, e))?;
    fs::rename(&temp_path, path).map_err(|e| io_error("rename to", path, e))
}

fn remove_if_exists(path: &Path) -> Result<bool, StorageError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(io_error("remove", path, e)),
    }
}

fn read_doc(path: &Path) -> Result<Option<Document>, StorageError> {
    match fs::read_to_string(path) {
        Ok(json) => serde_json::from_str(&json).map(Some).map_err(|e| {
            StorageError::Serialization(format!("Failed to parse {}: {}", path.display(), e))
        }),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io_error("read", path, e)),
    }
}

fn write_doc(root: &Path, collection: Collection, doc: &Document) -> Result<(), StorageError> {
    let json = serde_json::to_vec(doc).map_err(|e| {
        StorageError::Serialization(format!("Failed to serialize document {}: {}", doc.id, e))
    })?;
    write_atomic(&doc_path(root, collection, &doc.id), &json)
}

fn read_key(path: &Path) -> Result<Option<String>, StorageError> {
    match fs::read_to_string(path) {
        Ok(id) => Ok(Some(id.trim().to_string())),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io_error("read", path, e)),
    }
}

/// Resolve a sid through the key index to its document.
fn find_doc(root: &Path, collection: Collection, sid: &str) -> Result<Option<Document>, StorageError> {
    let Some(id) = read_key(&key_path(root, collection, sid))? else {
        return Ok(None);
    };
    Ok(read_doc(&doc_path(root, collection, &id))?.filter(|doc| doc.sid == sid))
}

/// Documents of a collection, split into parseable and corrupt ones.
#[derive(Debug, Default)]
struct DocScan {
    docs: Vec<Document>,
    corrupt: Vec<PathBuf>,
}

impl DocScan {
    /// Delete the corrupt documents. Caller holds the collection guard.
    fn purge_corrupt(&self) -> Result<u64, StorageError> {
        let mut removed = 0;
        for path in &self.corrupt {
            warn!("Removing corrupt document {}", path.display());
            if remove_if_exists(path)? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Scan a collection's documents. Files that cannot be read at all are skipped.
fn list_docs(root: &Path, collection: Collection) -> Result<DocScan, StorageError> {
    let dir = docs_dir(root, collection);
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(DocScan::default()),
        Err(e) => return Err(io_error("read dir", &dir, e)),
    };

    let mut scan = DocScan::default();
    for entry in entries {
        let path = entry.map_err(|e| io_error("read entry in", &dir, e))?.path();
        if path.extension().is_none_or(|ext| ext != "json") {
            continue;
        }
        match read_doc(&path) {
            Ok(Some(doc)) => scan.docs.push(doc),
            Ok(None) => {}
            Err(StorageError::Serialization(_)) => scan.corrupt.push(path),
            Err(e) => warn!("Skipping unreadable document: {}", e),
        }
    }
    Ok(scan)
}

/// Remove every key file of a collection. Caller holds the collection guard.
fn clear_keys(root: &Path, collection: Collection) -> Result<(), StorageError> {
    let keys = keys_dir(root, collection);
    let entries = match fs::read_dir(&keys) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(io_error("read dir", &keys, e)),
    };
    for entry in entries {
        let entry = entry.map_err(|e| io_error("read entry in", &keys, e))?;
        remove_if_exists(&entry.path())?;
    }
    Ok(())
}

/// Remove a document and its key entry. Caller holds the collection guard.
fn remove_doc(root: &Path, collection: Collection, doc: &Document) -> Result<bool, StorageError> {
    let key = key_path(root, collection, &doc.sid);
    if read_key(&key)?.as_deref() == Some(doc.id.as_str()) {
        remove_if_exists(&key)?;
    }
    remove_if_exists(&doc_path(root, collection, &doc.id))
}

/// Rebuild the key index from the documents, dropping duplicates and dangling keys.
fn reindex(root: &Path, collection: Collection) -> Result<(), StorageError> {
    create_dir(&docs_dir(root, collection))?;
    create_dir(&keys_dir(root, collection))?;
    let _guard = CollectionGuard::acquire(&guard_path(root, collection))?;

    let mut owners: HashMap<String, Document> = HashMap::new();
    let scan = list_docs(root, collection)?;
    scan.purge_corrupt()?;
    let mut docs = scan.docs;
    // Newest document wins a duplicated sid
    docs.sort_by_key(|doc| std::cmp::Reverse(doc.timemodified));
    for doc in docs {
        if owners.contains_key(&doc.sid) {
            warn!("Removing duplicate {} document {} for {}", collection, doc.id, doc.sid);
            remove_if_exists(&doc_path(root, collection, &doc.id))?;
            continue;
        }
        let key = key_path(root, collection, &doc.sid);
        if read_key(&key)?.as_deref() != Some(doc.id.as_str()) {
            write_atomic(&key, doc.id.as_bytes())?;
        }
        owners.insert(doc.sid.clone(), doc);
    }

    let keys = keys_dir(root, collection);
    let entries = fs::read_dir(&keys).map_err(|e| io_error("read dir", &keys, e))?;
    let live: HashSet<String> = owners
        .keys()
        .filter_map(|sid| {
            key_path(root, collection, sid)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
        })
        .collect();
    for entry in entries {
        let entry = entry.map_err(|e| io_error("read entry in", &keys, e))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !live.contains(&name) {
            debug!("Removing dangling {} key {}", collection, name);
            remove_if_exists(&entry.path())?;
        }
    }
    Ok(())
}

fn read_config(root: &Path) -> Result<HashMap<String, String>, StorageError> {
    let path = config_path(root);
    match fs::read_to_string(&path) {
        Ok(json) => serde_json::from_str(&json).map_err(|e| {
            StorageError::Serialization(format!("Failed to parse {}: {}", path.display(), e))
        }),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(HashMap::new()),
        Err(e) => Err(io_error("read", &path, e)),
    }
}

impl DocumentStorage {
    /// Create a DocumentStorage rooted at the given directory.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Run blocking filesystem work off the async executor.
    async fn run<T, F>(&self, op: F) -> Result<T, StorageError>
    where
        F: FnOnce(&Path) -> Result<T, StorageError> + Send + 'static,
        T: Send + 'static,
    {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || op(&root))
            .await
            .map_err(|e| StorageError::Internal(format!("Blocking task failed: {}", e)))?
    }
}

#[async_trait]
impl SessionStorage for DocumentStorage {
    fn backend_name(&self) -> &'static str {
        "document"
    }

    #[instrument(skip(self), level = "debug")]
    async fn ping(&self) -> Result<(), StorageError> {
        self.run(|root| {
            // A missing root is created on first write, so check the nearest
            // existing ancestor instead.
            let existing = root
                .ancestors()
                .find(|dir| !dir.as_os_str().is_empty() && dir.exists())
                .unwrap_or_else(|| Path::new("."));
            let meta = fs::metadata(existing).map_err(|e| io_error("stat", existing, e))?;
            if !meta.is_dir() {
                return Err(StorageError::Io(format!(
                    "{} is not a directory",
                    existing.display()
                )));
            }
            if meta.permissions().readonly() {
                return Err(StorageError::Io(format!("{} is read-only", existing.display())));
            }
            Ok(())
        })
        .await
    }

    #[instrument(skip(self), level = "debug")]
    async fn find_by_sid(
        &self,
        collection: Collection,
        sid: &str,
    ) -> Result<Option<RecordMeta>, StorageError> {
        let sid = sid.to_string();
        self.run(move |root| {
            let Some(doc) = find_doc(root, collection, &sid)? else {
                return Ok(None);
            };
            Ok(Some(RecordMeta {
                id: RecordId::new(doc.id),
                timemodified: timestamp_to_datetime(doc.timemodified)?,
            }))
        })
        .await
    }

    #[instrument(skip(self), level = "debug")]
    async fn get(
        &self,
        collection: Collection,
        id: &RecordId,
    ) -> Result<Option<StoredRecord>, StorageError> {
        if !valid_id(id) {
            return Ok(None);
        }
        let id = id.clone();
        self.run(move |root| {
            read_doc(&doc_path(root, collection, id.as_str()))?
                .map(Document::into_record)
                .transpose()
        })
        .await
    }

    #[instrument(skip(self, record), level = "debug", fields(sid = %record.sid))]
    async fn insert(
        &self,
        collection: Collection,
        record: NewRecord,
    ) -> Result<RecordId, StorageError> {
        self.run(move |root| {
            create_dir(&docs_dir(root, collection))?;
            create_dir(&keys_dir(root, collection))?;
            let _guard = CollectionGuard::acquire(&guard_path(root, collection))?;

            if let Some(existing) = find_doc(root, collection, &record.sid)? {
                return Err(StorageError::Conflict(format!(
                    "{} already has document {} for {}",
                    collection, existing.id, record.sid
                )));
            }

            let doc = Document {
                id: Uuid::new_v4().to_string(),
                sid: record.sid,
                sessdata: record.sessdata.map(|data| STANDARD.encode(data)),
                timemodified: record.timemodified.timestamp(),
            };
            // Document first, so a key never points at a missing document
            write_doc(root, collection, &doc)?;
            write_atomic(&key_path(root, collection, &doc.sid), doc.id.as_bytes())?;

            debug!("Inserted {} document {} for {}", collection, doc.id, doc.sid);
            Ok(RecordId::new(doc.id))
        })
        .await
    }

    #[instrument(skip(self, update), level = "debug")]
    async fn update(
        &self,
        collection: Collection,
        id: &RecordId,
        update: RecordUpdate,
    ) -> Result<bool, StorageError> {
        if !valid_id(id) {
            return Ok(false);
        }
        let id = id.clone();
        self.run(move |root| {
            let _guard = CollectionGuard::acquire(&guard_path(root, collection))?;
            let Some(mut doc) = read_doc(&doc_path(root, collection, id.as_str()))? else {
                return Ok(false);
            };
            if let Some(data) = update.sessdata {
                doc.sessdata = Some(STANDARD.encode(data));
            }
            if let Some(timemodified) = update.timemodified {
                doc.timemodified = timemodified.timestamp();
            }
            write_doc(root, collection, &doc)?;
            Ok(true)
        })
        .await
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete_by_sid(&self, collection: Collection, sid: &str) -> Result<u64, StorageError> {
        let sid = sid.to_string();
        self.run(move |root| {
            let _guard = CollectionGuard::acquire(&guard_path(root, collection))?;
            match find_doc(root, collection, &sid)? {
                Some(doc) => Ok(u64::from(remove_doc(root, collection, &doc)?)),
                None => {
                    remove_if_exists(&key_path(root, collection, &sid))?;
                    Ok(0)
                }
            }
        })
        .await
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete_by_id(
        &self,
        collection: Collection,
        id: &RecordId,
    ) -> Result<u64, StorageError> {
        if !valid_id(id) {
            return Ok(0);
        }
        let id = id.clone();
        self.run(move |root| {
            let _guard = CollectionGuard::acquire(&guard_path(root, collection))?;
            match read_doc(&doc_path(root, collection, id.as_str()))? {
                Some(doc) => Ok(u64::from(remove_doc(root, collection, &doc)?)),
                None => Ok(0),
            }
        })
        .await
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete_older_than(
        &self,
        collection: Collection,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<String>, StorageError> {
        let cutoff = cutoff.timestamp();
        self.run(move |root| {
            let _guard = CollectionGuard::acquire(&guard_path(root, collection))?;
            let mut removed = Vec::new();
            let scan = list_docs(root, collection)?;
            if !scan.corrupt.is_empty() {
                warn!(
                    "{} corrupt {} document(s) left for reindexing",
                    scan.corrupt.len(),
                    collection
                );
            }
            for doc in scan.docs {
                if doc.timemodified < cutoff && remove_doc(root, collection, &doc)? {
                    removed.push(doc.sid);
                }
            }
            debug!("Removed {} stale {} document(s)", removed.len(), collection);
            Ok(removed)
        })
        .await
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete_all(&self, collection: Collection) -> Result<u64, StorageError> {
        self.run(move |root| {
            let _guard = CollectionGuard::acquire(&guard_path(root, collection))?;
            let scan = list_docs(root, collection)?;
            let mut removed = scan.purge_corrupt()?;
            for doc in &scan.docs {
                if remove_doc(root, collection, doc)? {
                    removed += 1;
                }
            }
            // Keys of corrupt documents would otherwise dangle
            clear_keys(root, collection)?;
            Ok(removed)
        })
        .await
    }

    #[instrument(skip(self), level = "debug")]
    async fn ensure_schema(&self) -> Result<(), StorageError> {
        self.run(|root| {
            create_dir(root)?;
            for collection in [Collection::Sessions, Collection::Locks] {
                reindex(root, collection)?;
            }
            Ok(())
        })
        .await
    }

    #[instrument(skip(self), level = "debug")]
    async fn get_meta(&self, name: &str) -> Result<Option<String>, StorageError> {
        let name = name.to_string();
        self.run(move |root| Ok(read_config(root)?.remove(&name)))
            .await
    }

    #[instrument(skip(self), level = "debug")]
    async fn set_meta(&self, name: &str, value: &str) -> Result<(), StorageError> {
        let (name, value) = (name.to_string(), value.to_string());
        self.run(move |root| {
            let _guard = CollectionGuard::acquire(&root.join(".config.lock"))?;
            let mut config = read_config(root)?;
            config.insert(name, value);
            let json = serde_json::to_vec_pretty(&config).map_err(|e| {
                StorageError::Serialization(format!("Failed to serialize config: {}", e))
            })?;
            write_atomic(&config_path(root), &json)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use session_storage_core::{
        HandlerConfig, SessionError, SessionHandler, SessionManager, WriteOutcome,
    };
    use tempfile::TempDir;

    fn setup() -> (DocumentStorage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let storage = DocumentStorage::new(temp_dir.path());
        (storage, temp_dir)
    }

    fn config() -> HandlerConfig {
        HandlerConfig {
            acquire_timeout_secs: 1,
            poll_interval_ms: 10,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_insert_find_get() {
        let (storage, _temp) = setup();
        let now = Utc::now();
        let id = storage
            .insert(Collection::Sessions, NewRecord::session("s1", b"\x00bin".to_vec(), now))
            .await
            .unwrap();

        let meta = storage
            .find_by_sid(Collection::Sessions, "s1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(meta.id, id);
        assert_eq!(meta.timemodified.timestamp(), now.timestamp());

        let record = storage.get(Collection::Sessions, &id).await.unwrap().unwrap();
        assert_eq!(record.sid, "s1");
        assert_eq!(record.sessdata, Some(b"\x00bin".to_vec()));

        // Locks live in their own collection
        assert!(storage.find_by_sid(Collection::Locks, "s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unique_sid_conflict() {
        let (storage, _temp) = setup();
        let now = Utc::now();
        storage
            .insert(Collection::Locks, NewRecord::lock("s1", now))
            .await
            .unwrap();
        let err = storage
            .insert(Collection::Locks, NewRecord::lock("s1", now))
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        // A second instance on the same directory sees the same index
        let other = DocumentStorage::new(storage.root());
        let err = other
            .insert(Collection::Locks, NewRecord::lock("s1", now))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_update_and_delete_by_id() {
        let (storage, _temp) = setup();
        let then = Utc::now() - chrono::Duration::seconds(100);
        let id = storage
            .insert(Collection::Sessions, NewRecord::session("s1", b"a".to_vec(), then))
            .await
            .unwrap();

        let update = RecordUpdate {
            sessdata: Some(b"b".to_vec()),
            timemodified: None,
        };
        assert!(storage.update(Collection::Sessions, &id, update).await.unwrap());
        let record = storage.get(Collection::Sessions, &id).await.unwrap().unwrap();
        assert_eq!(record.sessdata, Some(b"b".to_vec()));
        assert_eq!(record.timemodified.timestamp(), then.timestamp());

        assert_eq!(storage.delete_by_id(Collection::Sessions, &id).await.unwrap(), 1);
        assert_eq!(storage.delete_by_id(Collection::Sessions, &id).await.unwrap(), 0);
        assert!(!storage
            .update(Collection::Sessions, &id, RecordUpdate::default())
            .await
            .unwrap());

        // The sid is free again
        storage
            .insert(Collection::Sessions, NewRecord::session("s1", vec![], Utc::now()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_foreign_handles_are_ignored() {
        let (storage, _temp) = setup();
        let bogus = RecordId::new("../../etc/passwd");
        assert!(storage.get(Collection::Sessions, &bogus).await.unwrap().is_none());
        assert_eq!(storage.delete_by_id(Collection::Locks, &bogus).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delete_older_than_and_all() {
        let (storage, _temp) = setup();
        let now = Utc::now();
        storage
            .insert(Collection::Sessions, NewRecord::session("old", vec![], now - chrono::Duration::seconds(500)))
            .await
            .unwrap();
        storage
            .insert(Collection::Sessions, NewRecord::session("new", vec![], now))
            .await
            .unwrap();

        let removed = storage
            .delete_older_than(Collection::Sessions, now - chrono::Duration::seconds(100))
            .await
            .unwrap();
        assert_eq!(removed, vec!["old".to_string()]);
        assert!(storage.find_by_sid(Collection::Sessions, "new").await.unwrap().is_some());

        assert_eq!(storage.delete_all(Collection::Sessions).await.unwrap(), 1);
        assert!(storage.find_by_sid(Collection::Sessions, "new").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ensure_schema_repairs_index() {
        let (storage, temp) = setup();
        let id = storage
            .insert(Collection::Sessions, NewRecord::session("s1", vec![], Utc::now()))
            .await
            .unwrap();

        // Lose the key file, and leave a dangling one behind
        let keys = temp.path().join("sessions").join("keys");
        for entry in fs::read_dir(&keys).unwrap() {
            fs::remove_file(entry.unwrap().path()).unwrap();
        }
        fs::write(keys.join("deadbeef"), "00000000-0000-0000-0000-000000000000").unwrap();
        assert!(storage.find_by_sid(Collection::Sessions, "s1").await.unwrap().is_none());

        storage.ensure_schema().await.unwrap();
        let meta = storage.find_by_sid(Collection::Sessions, "s1").await.unwrap().unwrap();
        assert_eq!(meta.id, id);
        assert!(!keys.join("deadbeef").exists());
    }

    #[tokio::test]
    async fn test_ping_leaves_missing_root_alone() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("nested").join("store");
        let storage = DocumentStorage::new(&root);

        storage.ping().await.unwrap();
        assert!(!root.exists());
        assert!(!temp.path().join("nested").exists());

        let file = temp.path().join("plain-file");
        fs::write(&file, "x").unwrap();
        let err = DocumentStorage::new(file.join("store")).ping().await.unwrap_err();
        assert!(matches!(err, StorageError::Io(_)));
    }

    #[tokio::test]
    async fn test_corrupt_documents_are_purged() {
        let (storage, temp) = setup();
        let docs = temp.path().join("sessions").join("docs");
        storage
            .insert(Collection::Sessions, NewRecord::session("good", vec![], Utc::now()))
            .await
            .unwrap();
        fs::write(docs.join("stray.json"), "{not json").unwrap();

        storage.ensure_schema().await.unwrap();
        assert!(!docs.join("stray.json").exists());
        assert!(storage.find_by_sid(Collection::Sessions, "good").await.unwrap().is_some());

        // Corrupt an indexed document in place
        let bad = storage
            .insert(Collection::Sessions, NewRecord::session("bad", vec![], Utc::now()))
            .await
            .unwrap();
        fs::write(docs.join(format!("{}.json", bad)), "\u{0}garbage").unwrap();
        assert!(storage.find_by_sid(Collection::Sessions, "bad").await.is_err());

        assert_eq!(storage.delete_all(Collection::Sessions).await.unwrap(), 2);
        assert_eq!(fs::read_dir(&docs).unwrap().count(), 0);
        let keys = temp.path().join("sessions").join("keys");
        assert_eq!(fs::read_dir(&keys).unwrap().count(), 0);
        assert!(storage.find_by_sid(Collection::Sessions, "bad").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_meta_round_trip() {
        let (storage, _temp) = setup();
        assert!(storage.get_meta("last_provisioned").await.unwrap().is_none());
        storage.set_meta("last_provisioned", "42").await.unwrap();
        storage.set_meta("other", "x").await.unwrap();
        assert_eq!(
            storage.get_meta("last_provisioned").await.unwrap(),
            Some("42".to_string())
        );
    }

    #[tokio::test]
    async fn test_session_protocol_over_documents() {
        let (storage, _temp) = setup();
        let manager = SessionManager::new(Arc::new(storage), config());
        assert!(manager.setup_storage(false).await.unwrap());
        assert!(!manager.setup_storage(false).await.unwrap());

        let mut first = manager.handler();
        first.open().await.unwrap();
        assert!(first.read("s1").await.unwrap().is_empty());
        assert_eq!(first.write("s1", b"A").await, WriteOutcome::Inserted);
        assert_eq!(first.write("s1", b"A").await, WriteOutcome::Unchanged);
        assert_eq!(first.write("s1", b"B").await, WriteOutcome::Updated);
        first.close().await;

        let mut second = manager.handler();
        assert_eq!(second.read("s1").await.unwrap(), b"B");
        assert!(second.is_locked());

        let mut third = manager.handler();
        let err = third.read("s1").await.unwrap_err();
        assert!(matches!(err, SessionError::LockTimeout { .. }));

        second.destroy("s1").await.unwrap();
        assert!(!manager.session_exists("s1").await.unwrap());
        assert!(third.read("s1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_contending_processes_serialize() {
        let temp_dir = TempDir::new().unwrap();
        // Two storages on one directory stand in for two processes
        let a = SessionManager::new(Arc::new(DocumentStorage::new(temp_dir.path())), config());
        let b = SessionManager::new(Arc::new(DocumentStorage::new(temp_dir.path())), config());

        let mut seed = a.handler();
        seed.write("shared", b"0").await;
        seed.close().await;

        let mut holder = a.handler();
        holder.read("shared").await.unwrap();

        let waiter = tokio::spawn(async move {
            let mut handler = b.handler();
            let data = handler.read("shared").await;
            (handler, data)
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(holder.write("shared", b"1").await, WriteOutcome::Updated);
        holder.close().await;

        let (mut handler, data) = waiter.await.unwrap();
        assert_eq!(data.unwrap(), b"1");
        handler.close().await;
    }
}
