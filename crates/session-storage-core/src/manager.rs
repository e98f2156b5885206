use std::sync::Arc;

use tracing::{info, instrument};

use crate::config::HandlerConfig;
use crate::coordinator::SessionCoordinator;
use crate::error::SessionError;
use crate::maintenance::{collect_garbage, reclaim_stale_locks, GcReport};
use crate::provision::setup_storage;
use crate::storage::{Collection, SessionStorage};

/// Process-wide entry point: shares one store and config between requests.
///
/// Each request gets its own [`SessionCoordinator`] from [`handler`](Self::handler).
/// The administrative operations here bypass the lock protocol.
#[derive(Clone)]
pub struct SessionManager {
    store: Arc<dyn SessionStorage>,
    config: Arc<HandlerConfig>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn SessionStorage>, config: HandlerConfig) -> Self {
        Self {
            store,
            config: Arc::new(config),
        }
    }

    pub fn store(&self) -> &Arc<dyn SessionStorage> {
        &self.store
    }

    pub fn config(&self) -> &HandlerConfig {
        &self.config
    }

    /// A fresh handler for one request.
    pub fn handler(&self) -> SessionCoordinator {
        SessionCoordinator::new(self.store.clone(), self.config.clone())
    }

    /// Whether a session record exists for `sid`. Takes no lock.
    pub async fn session_exists(&self, sid: &str) -> Result<bool, SessionError> {
        Ok(self
            .store
            .find_by_sid(Collection::Sessions, sid)
            .await?
            .is_some())
    }

    /// Delete a session and its lock regardless of who holds it.
    #[instrument(skip(self), level = "debug")]
    pub async fn kill_session(&self, sid: &str) -> Result<bool, SessionError> {
        let removed = self
            .store
            .delete_by_sid(Collection::Sessions, sid)
            .await
            .map_err(|e| SessionError::BackendWrite(format!("Failed to kill session {}: {}", sid, e)))?;
        self.store
            .delete_by_sid(Collection::Locks, sid)
            .await
            .map_err(|e| SessionError::BackendWrite(format!("Failed to kill lock {}: {}", sid, e)))?;
        Ok(removed > 0)
    }

    /// Delete every session and every lock.
    #[instrument(skip(self), level = "debug")]
    pub async fn kill_all_sessions(&self) -> Result<u64, SessionError> {
        let sessions = self
            .store
            .delete_all(Collection::Sessions)
            .await
            .map_err(|e| SessionError::BackendWrite(format!("Failed to kill sessions: {}", e)))?;
        let locks = self
            .store
            .delete_all(Collection::Locks)
            .await
            .map_err(|e| SessionError::BackendWrite(format!("Failed to kill locks: {}", e)))?;
        info!("Killed {} session(s) and {} lock(s)", sessions, locks);
        Ok(sessions)
    }

    /// Provision the backing store; see [`setup_storage`].
    pub async fn setup_storage(&self, force_reindex: bool) -> Result<bool, SessionError> {
        setup_storage(self.store.as_ref(), self.config.reindex_timestamp, force_reindex).await
    }

    /// Collect expired sessions, then locks older than the lock expiry.
    pub async fn gc(&self) -> Result<GcReport, SessionError> {
        let mut report = collect_garbage(self.store.as_ref(), self.config.session_timeout()).await?;
        report.locks += reclaim_stale_locks(self.store.as_ref(), self.config.lock_expiry()).await?;
        Ok(report)
    }
}
