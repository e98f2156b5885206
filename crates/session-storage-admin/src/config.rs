use std::path::PathBuf;

use clap::{Parser, Subcommand};
use session_storage_core::{DataEncoding, HandlerConfig};

/// Configuration for the session-storage-admin tool.
#[derive(Parser, Debug, Clone)]
#[command(name = "session-storage-admin")]
#[command(about = "Provisioning and maintenance for session storage backends")]
pub struct Config {
    /// Storage backend: document or sql
    #[arg(long, default_value = "document", env = "SESSION_BACKEND")]
    pub backend: Backend,

    /// Root directory of the document store
    #[arg(long, env = "SESSION_DOCUMENT_DIR")]
    pub document_dir: Option<PathBuf>,

    /// SQLite database URL (for sql backend)
    #[arg(long, env = "SESSION_DATABASE_URL")]
    pub database_url: Option<String>,

    /// Connection pool size (for sql backend)
    #[arg(long, default_value = "4", env = "SESSION_DB_MAX_CONNECTIONS")]
    pub max_connections: u32,

    /// Seconds a reader may wait for a session lock
    #[arg(long, default_value = "120", env = "SESSION_ACQUIRE_TIMEOUT")]
    pub acquire_timeout_secs: u64,

    /// Age in seconds after which a lock is considered abandoned
    #[arg(long, default_value = "7200", env = "SESSION_LOCK_EXPIRY")]
    pub lock_expiry_secs: u64,

    /// Idle seconds after which a session is garbage (0 disables GC)
    #[arg(long, default_value = "7200", env = "SESSION_TIMEOUT")]
    pub session_timeout_secs: u64,

    /// Minimum seconds between timemodified refreshes
    #[arg(long, default_value = "20", env = "SESSION_UPDATE_FREQUENCY")]
    pub update_frequency_secs: u64,

    /// Milliseconds between lock attempts
    #[arg(long, default_value = "50", env = "SESSION_POLL_INTERVAL_MS")]
    pub poll_interval_ms: u64,

    /// Encoding of stored session data
    #[arg(long, default_value = "raw", env = "SESSION_ENCODING")]
    pub encoding: Encoding,

    /// Unix time; setup re-runs when the store was provisioned before it
    #[arg(long, default_value = "0", env = "SESSION_REINDEX_TIMESTAMP")]
    pub reindex_timestamp: i64,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Create collections and indexes
    Setup {
        /// Re-run even if the store is already provisioned
        #[arg(long)]
        force: bool,
    },
    /// Delete expired sessions and abandoned locks
    Gc {
        /// Keep running, collecting every N seconds until interrupted
        #[arg(long)]
        interval_secs: Option<u64>,
    },
    /// Report whether a session exists
    Exists { sid: String },
    /// Delete one session and its lock
    Kill { sid: String },
    /// Delete every session and lock
    KillAll,
}

impl Config {
    fn data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("session-storage")
    }

    /// Get the effective document store directory.
    pub fn effective_document_dir(&self) -> PathBuf {
        self.document_dir
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("documents"))
    }

    /// Get the effective database URL, defaulting to a file under the data dir.
    pub fn effective_database_url(&self) -> String {
        self.database_url.clone().unwrap_or_else(|| {
            format!("sqlite://{}", Self::data_dir().join("sessions.db").display())
        })
    }

    pub fn handler_config(&self) -> HandlerConfig {
        HandlerConfig {
            acquire_timeout_secs: self.acquire_timeout_secs,
            lock_expiry_secs: self.lock_expiry_secs,
            session_timeout_secs: self.session_timeout_secs,
            update_frequency_secs: self.update_frequency_secs,
            poll_interval_ms: self.poll_interval_ms,
            encoding: self.encoding.into(),
            reindex_timestamp: self.reindex_timestamp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Backend {
    Document,
    Sql,
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::Document => write!(f, "document"),
            Backend::Sql => write!(f, "sql"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Encoding {
    Raw,
    Base64,
}

impl From<Encoding> for DataEncoding {
    fn from(value: Encoding) -> Self {
        match value {
            Encoding::Raw => DataEncoding::Raw,
            Encoding::Base64 => DataEncoding::Base64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_handler_defaults() {
        let config = Config::try_parse_from(["session-storage-admin", "gc"]).unwrap();
        assert_eq!(config.backend, Backend::Document);
        assert_eq!(config.command, Command::Gc { interval_secs: None });
        assert_eq!(config.handler_config(), HandlerConfig::default());
    }

    #[test]
    fn test_sql_backend_and_overrides() {
        let config = Config::try_parse_from([
            "session-storage-admin",
            "--backend",
            "sql",
            "--database-url",
            "sqlite::memory:",
            "--encoding",
            "base64",
            "--session-timeout-secs",
            "0",
            "kill",
            "abc",
        ])
        .unwrap();
        assert_eq!(config.backend, Backend::Sql);
        assert_eq!(config.effective_database_url(), "sqlite::memory:");
        assert_eq!(config.command, Command::Kill { sid: "abc".into() });

        let handler = config.handler_config();
        assert_eq!(handler.encoding, DataEncoding::Base64);
        assert_eq!(handler.session_timeout(), None);
    }

    #[test]
    fn test_setup_force_flag() {
        let config =
            Config::try_parse_from(["session-storage-admin", "setup", "--force"]).unwrap();
        assert_eq!(config.command, Command::Setup { force: true });
    }
}
