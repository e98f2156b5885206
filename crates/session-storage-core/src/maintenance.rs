use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tracing::{debug, info, instrument, warn};

use crate::error::SessionError;
use crate::storage::{Collection, SessionStorage};

/// Counts of records removed by one GC pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcReport {
    pub sessions: u64,
    pub locks: u64,
}

fn cutoff_for(threshold: Duration) -> Result<DateTime<Utc>, SessionError> {
    let age = chrono::Duration::from_std(threshold).map_err(|e| {
        SessionError::Programming(format!("GC threshold {:?} out of range: {}", threshold, e))
    })?;
    Ok(Utc::now() - age)
}

/// Delete sessions (and their locks) not modified within `threshold`.
///
/// Also removes any lock older than the same cutoff. `None` or a zero
/// threshold disables collection and reports nothing removed.
#[instrument(skip(store), level = "debug")]
pub async fn collect_garbage(
    store: &dyn SessionStorage,
    threshold: Option<Duration>,
) -> Result<GcReport, SessionError> {
    let Some(threshold) = threshold.filter(|t| !t.is_zero()) else {
        debug!("Session GC disabled");
        return Ok(GcReport::default());
    };
    let cutoff = cutoff_for(threshold)?;

    let sids = store
        .delete_older_than(Collection::Sessions, cutoff)
        .await
        .map_err(|e| SessionError::BackendWrite(format!("Failed to delete stale sessions: {}", e)))?;

    let mut locks = 0;
    let results = join_all(
        sids.iter()
            .map(|sid| store.delete_by_sid(Collection::Locks, sid)),
    )
    .await;
    for (sid, result) in sids.iter().zip(results) {
        match result {
            Ok(removed) => locks += removed,
            Err(e) => warn!("Failed to delete lock of expired session {}: {}", sid, e),
        }
    }

    locks += reclaim_locks_older_than(store, cutoff).await?;

    let report = GcReport {
        sessions: sids.len() as u64,
        locks,
    };
    info!(
        "Session GC removed {} session(s) and {} lock(s) older than {}",
        report.sessions, report.locks, cutoff
    );
    Ok(report)
}

/// Delete locks older than `lock_expiry`, left behind by crashed holders.
#[instrument(skip(store), level = "debug")]
pub async fn reclaim_stale_locks(
    store: &dyn SessionStorage,
    lock_expiry: Duration,
) -> Result<u64, SessionError> {
    if lock_expiry.is_zero() {
        return Ok(0);
    }
    let removed = reclaim_locks_older_than(store, cutoff_for(lock_expiry)?).await?;
    if removed > 0 {
        info!("Reclaimed {} stale session lock(s)", removed);
    }
    Ok(removed)
}

async fn reclaim_locks_older_than(
    store: &dyn SessionStorage,
    cutoff: DateTime<Utc>,
) -> Result<u64, SessionError> {
    let sids = store
        .delete_older_than(Collection::Locks, cutoff)
        .await
        .map_err(|e| SessionError::BackendWrite(format!("Failed to delete stale locks: {}", e)))?;
    Ok(sids.len() as u64)
}
