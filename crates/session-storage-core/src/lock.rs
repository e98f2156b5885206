use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::{sleep, Instant};
use tracing::{debug, instrument, warn};

use crate::config::HandlerConfig;
use crate::error::SessionError;
use crate::storage::{Collection, NewRecord, RecordId, SessionStorage};

/// A lock record inserted by this manager and not yet released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    pub id: RecordId,
    pub sid: String,
    pub acquired_at: DateTime<Utc>,
}

/// Exclusive per-session lock built on the store's unique `sid` constraint.
///
/// Whoever inserts the lock record for a `sid` first holds the lock; everyone
/// else polls until the record is released, reclaimed as stale, or their
/// timeout elapses. There is no queue: under heavy contention a waiter can be
/// starved until its timeout.
///
/// One manager belongs to one request context and holds at most one lock.
pub struct LockManager {
    store: Arc<dyn SessionStorage>,
    lock_expiry: Duration,
    poll_interval: Duration,
    held: Option<LockHandle>,
}

impl LockManager {
    pub fn new(store: Arc<dyn SessionStorage>, config: &HandlerConfig) -> Self {
        Self {
            store,
            lock_expiry: config.lock_expiry(),
            poll_interval: config.poll_interval(),
            held: None,
        }
    }

    /// The lock currently held by this context, if any.
    pub fn held(&self) -> Option<&LockHandle> {
        self.held.as_ref()
    }

    /// Acquire the lock for `sid`, polling until `timeout` elapses.
    ///
    /// Fails with [`SessionError::Programming`] if this manager already holds a
    /// lock and with [`SessionError::LockTimeout`] if the lock stays taken.
    /// Store failures other than a uniqueness conflict are returned as-is.
    #[instrument(skip(self), level = "debug")]
    pub async fn acquire(&mut self, sid: &str, timeout: Duration) -> Result<LockHandle, SessionError> {
        if let Some(held) = &self.held {
            return Err(SessionError::Programming(format!(
                "Cannot acquire lock on {} while still holding lock on {}",
                sid, held.sid
            )));
        }

        let started = Instant::now();
        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            let now = Utc::now();
            let reclaimed = match self
                .store
                .insert(Collection::Locks, NewRecord::lock(sid, now))
                .await
            {
                Ok(id) => {
                    let handle = LockHandle {
                        id,
                        sid: sid.to_string(),
                        acquired_at: now,
                    };
                    debug!(
                        "Acquired lock on {} ({}) after {} attempt(s)",
                        sid, handle.id, attempts
                    );
                    self.held = Some(handle.clone());
                    return Ok(handle);
                }
                Err(e) if e.is_conflict() => self.reclaim_if_stale(sid, now).await,
                Err(e) => return Err(e.into()),
            };

            let waited = started.elapsed();
            if waited >= timeout {
                debug!("Gave up on lock for {} after {} attempt(s)", sid, attempts);
                return Err(SessionError::LockTimeout {
                    sid: sid.to_string(),
                    waited,
                });
            }
            if !reclaimed {
                sleep(self.poll_interval.min(timeout - waited)).await;
            }
        }
    }

    /// Delete the lock record held by this context.
    ///
    /// The handle is forgotten even when the delete fails. Zero affected rows
    /// means something else already removed the record and is reported as
    /// [`SessionError::LockReleaseFailed`].
    #[instrument(skip(self), level = "debug")]
    pub async fn release(&mut self) -> Result<(), SessionError> {
        let Some(handle) = self.held.take() else {
            debug!("No lock held, nothing to release");
            return Ok(());
        };

        let removed = self.store.delete_by_id(Collection::Locks, &handle.id).await?;
        if removed == 0 {
            return Err(SessionError::LockReleaseFailed(handle.sid));
        }
        debug!("Released lock on {} ({})", handle.sid, handle.id);
        Ok(())
    }

    /// Remove the current holder's record if it is older than the lock expiry.
    ///
    /// Deletes by handle so a lock re-taken in the meantime is never touched.
    async fn reclaim_if_stale(&self, sid: &str, now: DateTime<Utc>) -> bool {
        if self.lock_expiry.is_zero() {
            return false;
        }
        let holder = match self.store.find_by_sid(Collection::Locks, sid).await {
            Ok(Some(holder)) => holder,
            // Released between our insert and this lookup; retry right away.
            Ok(None) => return true,
            Err(e) => {
                warn!("Failed to inspect lock holder for {}: {}", sid, e);
                return false;
            }
        };

        let stale = (now - holder.timemodified)
            .to_std()
            .is_ok_and(|age| age >= self.lock_expiry);
        if !stale {
            return false;
        }

        match self.store.delete_by_id(Collection::Locks, &holder.id).await {
            Ok(removed) if removed > 0 => {
                warn!(
                    "Reclaimed stale lock on {} (held since {})",
                    sid, holder.timemodified
                );
                true
            }
            Ok(_) => false,
            Err(e) => {
                warn!("Failed to reclaim stale lock on {}: {}", sid, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStorage;

    fn config() -> HandlerConfig {
        HandlerConfig {
            lock_expiry_secs: 7200,
            poll_interval_ms: 10,
            ..Default::default()
        }
    }

    fn setup() -> (Arc<MemoryStorage>, LockManager, LockManager) {
        let store = Arc::new(MemoryStorage::new());
        let a = LockManager::new(store.clone(), &config());
        let b = LockManager::new(store.clone(), &config());
        (store, a, b)
    }

    #[tokio::test]
    async fn test_acquire_release() {
        let (store, mut a, mut b) = setup();
        let handle = a.acquire("s1", Duration::from_secs(1)).await.unwrap();
        assert_eq!(handle.sid, "s1");
        assert_eq!(a.held(), Some(&handle));
        assert_eq!(store.len(Collection::Locks).unwrap(), 1);

        let err = b.acquire("s1", Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(err, SessionError::LockTimeout { .. }));
        assert!(b.held().is_none());

        a.release().await.unwrap();
        assert!(a.held().is_none());
        assert!(store.is_empty(Collection::Locks).unwrap());

        b.acquire("s1", Duration::from_millis(100)).await.unwrap();
    }

    #[tokio::test]
    async fn test_double_acquire_is_programming_error() {
        let (_store, mut a, _b) = setup();
        a.acquire("s1", Duration::from_secs(1)).await.unwrap();
        let err = a.acquire("s2", Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, SessionError::Programming(_)));
    }

    #[tokio::test]
    async fn test_release_of_removed_lock_fails() {
        let (store, mut a, _b) = setup();
        a.acquire("s1", Duration::from_secs(1)).await.unwrap();
        store.delete_all(Collection::Locks).await.unwrap();

        let err = a.release().await.unwrap_err();
        assert!(matches!(err, SessionError::LockReleaseFailed(sid) if sid == "s1"));
        // The handle is dropped either way
        assert!(a.held().is_none());
        a.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_waiter_acquires_after_release() {
        let (_store, mut a, mut b) = setup();
        a.acquire("s1", Duration::from_secs(1)).await.unwrap();

        let waiter = tokio::spawn(async move {
            let result = b.acquire("s1", Duration::from_secs(5)).await;
            (b, result)
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        a.release().await.unwrap();

        let (b, result) = waiter.await.unwrap();
        assert!(result.is_ok());
        assert_eq!(b.held().map(|h| h.sid.as_str()), Some("s1"));
    }

    #[tokio::test]
    async fn test_stale_lock_is_reclaimed() {
        let (store, mut a, _b) = setup();
        let stale_at = Utc::now() - chrono::Duration::seconds(10_000);
        store
            .insert(Collection::Locks, NewRecord::lock("s2", stale_at))
            .await
            .unwrap();

        let handle = a.acquire("s2", Duration::from_secs(1)).await.unwrap();
        assert!(handle.acquired_at > stale_at);
        assert_eq!(store.len(Collection::Locks).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_fresh_lock_is_not_reclaimed() {
        let (store, mut a, _b) = setup();
        let recent = Utc::now() - chrono::Duration::seconds(60);
        store
            .insert(Collection::Locks, NewRecord::lock("s3", recent))
            .await
            .unwrap();

        let err = a.acquire("s3", Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, SessionError::LockTimeout { .. }));
    }

    #[tokio::test]
    async fn test_concurrent_acquire_only_one_wins() {
        let store = Arc::new(MemoryStorage::new());
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let mut manager = LockManager::new(store.clone(), &config());
            tasks.push(tokio::spawn(async move {
                manager.acquire("hot", Duration::from_millis(30)).await.is_ok()
            }));
        }
        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
