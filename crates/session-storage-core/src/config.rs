use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::DataEncoding;

/// Settings read once when a handler or manager is constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandlerConfig {
    /// How long `read` may wait for the session lock.
    pub acquire_timeout_secs: u64,
    /// Age after which a lock record is considered abandoned.
    pub lock_expiry_secs: u64,
    /// Age after which session data is garbage. 0 disables GC.
    pub session_timeout_secs: u64,
    /// Minimum interval between `timemodified` refreshes on write.
    pub update_frequency_secs: u64,
    /// Sleep between lock insert attempts.
    pub poll_interval_ms: u64,
    /// Storage encoding of session data.
    pub encoding: DataEncoding,
    /// Unix time; provisioning re-runs when the stored marker is older.
    pub reindex_timestamp: i64,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            acquire_timeout_secs: 120,
            lock_expiry_secs: 7200,
            session_timeout_secs: 7200,
            update_frequency_secs: 20,
            poll_interval_ms: 50,
            encoding: DataEncoding::Raw,
            reindex_timestamp: 0,
        }
    }
}

impl HandlerConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn lock_expiry(&self) -> Duration {
        Duration::from_secs(self.lock_expiry_secs)
    }

    /// GC threshold, or `None` when GC is disabled.
    pub fn session_timeout(&self) -> Option<Duration> {
        (self.session_timeout_secs > 0).then(|| Duration::from_secs(self.session_timeout_secs))
    }

    pub fn update_frequency(&self) -> Duration {
        Duration::from_secs(self.update_frequency_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: HandlerConfig =
            serde_json::from_str(r#"{"acquire_timeout_secs": 5, "encoding": "base64"}"#).unwrap();
        assert_eq!(config.acquire_timeout(), Duration::from_secs(5));
        assert_eq!(config.encoding, DataEncoding::Base64);
        assert_eq!(config.lock_expiry_secs, 7200);
        assert_eq!(config.poll_interval(), Duration::from_millis(50));
    }

    #[test]
    fn test_zero_session_timeout_disables_gc() {
        let config = HandlerConfig {
            session_timeout_secs: 0,
            ..Default::default()
        };
        assert!(config.session_timeout().is_none());
    }
}
