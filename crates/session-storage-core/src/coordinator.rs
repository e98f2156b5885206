use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, error, instrument, warn};

use crate::codec::content_hash;
use crate::config::HandlerConfig;
use crate::error::SessionError;
use crate::lock::{LockHandle, LockManager};
use crate::maintenance::{collect_garbage, GcReport};
use crate::storage::{Collection, NewRecord, RecordId, RecordUpdate, SessionStorage};

/// The session lifecycle callbacks a web framework registers.
///
/// A request runs `open`, `read`, `write`, `close`; `destroy` may replace
/// `read`/`write`. Only `read` can surface a lock timeout mid-request, and
/// `write`/`close` never fail.
#[async_trait]
pub trait SessionHandler: Send {
    async fn open(&mut self) -> Result<(), SessionError>;
    async fn close(&mut self);
    async fn read(&mut self, sid: &str) -> Result<Vec<u8>, SessionError>;
    async fn write(&mut self, sid: &str, data: &[u8]) -> WriteOutcome;
    async fn destroy(&mut self, sid: &str) -> Result<(), SessionError>;
    async fn gc(&mut self, max_lifetime: Option<Duration>) -> Result<GcReport, SessionError>;
}

/// What `write` did with the data it was given.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The preceding read failed; nothing was written.
    Skipped,
    /// Content hash matched the last read/written data.
    Unchanged,
    Updated,
    Inserted,
    /// The backend rejected the write. Already logged.
    Failed,
}

/// Per-request state. Never shared between concurrent requests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandlerState {
    pub sid: Option<String>,
    pub sessdata_id: Option<RecordId>,
    pub timemodified: Option<DateTime<Utc>>,
    pub lasthash: Option<String>,
    pub failed: bool,
}

impl HandlerState {
    fn failed() -> Self {
        Self {
            failed: true,
            ..Self::default()
        }
    }
}

/// Runs the lock/read/write protocol for one request context.
pub struct SessionCoordinator {
    store: Arc<dyn SessionStorage>,
    config: Arc<HandlerConfig>,
    locks: LockManager,
    state: HandlerState,
    current_sid: Option<String>,
}

impl SessionCoordinator {
    pub fn new(store: Arc<dyn SessionStorage>, config: Arc<HandlerConfig>) -> Self {
        let locks = LockManager::new(store.clone(), &config);
        Self {
            store,
            config,
            locks,
            state: HandlerState::default(),
            current_sid: None,
        }
    }

    /// Tell the handler which session the surrounding request considers current.
    pub fn set_current_session_id(&mut self, sid: Option<String>) {
        self.current_sid = sid;
    }

    pub fn state(&self) -> &HandlerState {
        &self.state
    }

    pub fn lock(&self) -> Option<&LockHandle> {
        self.locks.held()
    }

    pub fn is_locked(&self) -> bool {
        self.locks.held().is_some()
    }

    fn current_session_id(&self) -> Option<&str> {
        self.current_sid.as_deref().or(self.state.sid.as_deref())
    }

    /// Release the held lock, logging instead of failing.
    async fn release_lock(&mut self) {
        if let Err(e) = self.locks.release().await {
            warn!("Session lock release failed: {}", e);
        }
    }

    fn fail_read(&mut self) -> Vec<u8> {
        self.state.failed = true;
        Vec::new()
    }

    async fn read_locked(&mut self, sid: &str, id: RecordId) -> Vec<u8> {
        let record = match self.store.get(Collection::Sessions, &id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!("Session record {} for {} vanished after locking", id, sid);
                return self.fail_read();
            }
            Err(e) => {
                warn!("Failed to fetch session data for {}: {}", sid, e);
                return self.fail_read();
            }
        };

        let data = match record.sessdata {
            None => Vec::new(),
            Some(stored) => match self.config.encoding.decode(&stored) {
                Ok(data) => data,
                Err(e) => {
                    warn!("Failed to decode session data for {}: {}", sid, e);
                    return self.fail_read();
                }
            },
        };

        self.state = HandlerState {
            sid: Some(sid.to_string()),
            sessdata_id: Some(record.id),
            timemodified: Some(record.timemodified),
            lasthash: Some(content_hash(&data)),
            failed: false,
        };
        debug!("Read {} bytes for session {}", data.len(), sid);
        data
    }

    fn timestamp_due(&self, now: DateTime<Utc>) -> bool {
        let Some(last) = self.state.timemodified else {
            return true;
        };
        (now - last)
            .to_std()
            .is_ok_and(|age| age >= self.config.update_frequency())
    }
}

#[async_trait]
impl SessionHandler for SessionCoordinator {
    #[instrument(skip(self), level = "debug")]
    async fn open(&mut self) -> Result<(), SessionError> {
        self.store.ping().await.map_err(|e| {
            SessionError::BackendUnavailable(format!(
                "{} backend unreachable: {}",
                self.store.backend_name(),
                e
            ))
        })?;
        if self.is_locked() {
            self.release_lock().await;
        }
        self.state = HandlerState::default();
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn close(&mut self) {
        if self.is_locked() {
            self.release_lock().await;
        }
        self.state = HandlerState::default();
    }

    #[instrument(skip(self), level = "debug")]
    async fn read(&mut self, sid: &str) -> Result<Vec<u8>, SessionError> {
        let existing = match self.store.find_by_sid(Collection::Sessions, sid).await {
            Ok(existing) => existing,
            Err(e) => {
                warn!("Session lookup failed for {}: {}", sid, e);
                return Ok(self.fail_read());
            }
        };

        let Some(meta) = existing else {
            // First access: the record is created lazily on first write.
            if self.is_locked() {
                self.release_lock().await;
            }
            self.state = HandlerState {
                sid: Some(sid.to_string()),
                lasthash: Some(content_hash(b"")),
                ..HandlerState::default()
            };
            debug!("No session record for {}", sid);
            return Ok(Vec::new());
        };

        if let Some(bound) = &self.state.sessdata_id {
            if *bound != meta.id {
                let violation = SessionError::ConsistencyViolation(format!(
                    "session {} resolved to record {} but this context is bound to {}",
                    sid, meta.id, bound
                ));
                warn!("{}", violation);
                if self.is_locked() {
                    self.release_lock().await;
                }
                self.state = HandlerState::failed();
                return Ok(Vec::new());
            }
        }

        let locked_sid = self.locks.held().map(|held| held.sid.clone());
        match locked_sid {
            Some(held) if held == sid => {}
            Some(held) => {
                warn!(
                    "Read of {} while holding the lock for {}; refusing",
                    sid, held
                );
                return Ok(self.fail_read());
            }
            None => match self.locks.acquire(sid, self.config.acquire_timeout()).await {
                Ok(_) => {}
                Err(e @ SessionError::LockTimeout { .. }) => {
                    error!("{}", e);
                    self.state.failed = true;
                    return Err(e);
                }
                Err(e) => {
                    warn!("Unexpected error locking session {}: {}", sid, e);
                    return Ok(self.fail_read());
                }
            },
        }

        Ok(self.read_locked(sid, meta.id).await)
    }

    #[instrument(skip(self, data), level = "debug", fields(data_len = data.len()))]
    async fn write(&mut self, sid: &str, data: &[u8]) -> WriteOutcome {
        if self.state.failed {
            debug!("Skipping write for {}: read failed", sid);
            return WriteOutcome::Skipped;
        }
        if let Some(bound) = self.state.sid.as_deref() {
            if self.state.sessdata_id.is_some() && bound != sid {
                warn!(
                    "Refusing to write {} through a context bound to {}",
                    sid, bound
                );
                return WriteOutcome::Failed;
            }
        }

        let hash = content_hash(data);
        if self.state.lasthash.as_deref() == Some(hash.as_str()) {
            debug!("Session {} unchanged, skipping write", sid);
            return WriteOutcome::Unchanged;
        }

        let now = Utc::now();
        let encoded = self.config.encoding.encode(data);

        if let Some(id) = self.state.sessdata_id.clone() {
            let refresh = self.timestamp_due(now);
            let update = RecordUpdate {
                sessdata: Some(encoded),
                timemodified: refresh.then_some(now),
            };
            return match self.store.update(Collection::Sessions, &id, update).await {
                Ok(true) => {
                    if refresh {
                        self.state.timemodified = Some(now);
                    }
                    self.state.lasthash = Some(hash);
                    debug!("Updated session {} ({} bytes)", sid, data.len());
                    WriteOutcome::Updated
                }
                Ok(false) => {
                    warn!("Session record {} for {} disappeared before write", id, sid);
                    WriteOutcome::Failed
                }
                Err(e) => {
                    warn!("Failed to update session {}: {}", sid, e);
                    WriteOutcome::Failed
                }
            };
        }

        match self
            .store
            .insert(Collection::Sessions, NewRecord::session(sid, encoded, now))
            .await
        {
            Ok(id) => {
                debug!("Inserted session {} as {} ({} bytes)", sid, id, data.len());
                self.state.sid = Some(sid.to_string());
                self.state.sessdata_id = Some(id);
                self.state.timemodified = Some(now);
                self.state.lasthash = Some(hash);
                WriteOutcome::Inserted
            }
            Err(e) => {
                warn!("Failed to insert session {}: {}", sid, e);
                WriteOutcome::Failed
            }
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn destroy(&mut self, sid: &str) -> Result<(), SessionError> {
        let ours = self.current_session_id() == Some(sid)
            || self.locks.held().is_some_and(|held| held.sid == sid);

        let existing = match self.store.find_by_sid(Collection::Sessions, sid).await {
            Ok(existing) => existing,
            Err(e) => {
                warn!("Session lookup failed while destroying {}: {}", sid, e);
                None
            }
        };

        let bound = match &existing {
            Some(meta) => self.state.sessdata_id.as_ref() == Some(&meta.id),
            None => false,
        };
        if ours || bound {
            if self.is_locked() {
                self.release_lock().await;
            }
            self.state = HandlerState::default();
        }

        // The lookup only decides whose state to clear; the delete always runs.
        let removed = self
            .store
            .delete_by_sid(Collection::Sessions, sid)
            .await
            .map_err(|e| {
                SessionError::BackendWrite(format!("Failed to delete session {}: {}", sid, e))
            })?;
        if let Err(e) = self.store.delete_by_sid(Collection::Locks, sid).await {
            warn!("Failed to delete lock for destroyed session {}: {}", sid, e);
        }

        debug!("Destroyed session {} ({} record(s) removed)", sid, removed);
        Ok(())
    }

    async fn gc(&mut self, max_lifetime: Option<Duration>) -> Result<GcReport, SessionError> {
        collect_garbage(self.store.as_ref(), max_lifetime).await
    }
}
