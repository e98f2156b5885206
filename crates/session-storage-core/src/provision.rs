use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::error::SessionError;
use crate::storage::SessionStorage;

/// Meta record holding the unix time of the last successful provisioning.
pub const LAST_PROVISIONED_KEY: &str = "last_provisioned";

/// Create collections, unique constraints and expiry indexes if needed.
///
/// Runs when forced, when the store was never provisioned, or when the stored
/// marker predates `reindex_timestamp`. Returns whether provisioning ran.
#[instrument(skip(store), level = "debug")]
pub async fn setup_storage(
    store: &dyn SessionStorage,
    reindex_timestamp: i64,
    force: bool,
) -> Result<bool, SessionError> {
    // The meta record may live inside the schema being provisioned, so a
    // lookup failure just means "not provisioned yet".
    let last = match store.get_meta(LAST_PROVISIONED_KEY).await {
        Ok(value) => value.and_then(|raw| match raw.parse::<i64>() {
            Ok(ts) => Some(ts),
            Err(e) => {
                warn!("Ignoring malformed provisioning marker {:?}: {}", raw, e);
                None
            }
        }),
        Err(e) => {
            debug!("No provisioning marker readable: {}", e);
            None
        }
    };

    let due = force || last.is_none_or(|ts| ts < reindex_timestamp);
    if !due {
        debug!("Storage already provisioned at {:?}", last);
        return Ok(false);
    }

    store.ensure_schema().await.map_err(|e| {
        SessionError::BackendWrite(format!(
            "Failed to provision {} storage: {}",
            store.backend_name(),
            e
        ))
    })?;

    let now = Utc::now().timestamp();
    store
        .set_meta(LAST_PROVISIONED_KEY, &now.to_string())
        .await
        .map_err(|e| SessionError::BackendWrite(format!("Failed to record provisioning: {}", e)))?;

    info!(
        "Provisioned {} session storage (forced: {}, previous: {:?})",
        store.backend_name(),
        force,
        last
    );
    Ok(true)
}
