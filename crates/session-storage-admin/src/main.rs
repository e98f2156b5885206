mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use session_storage_core::{SessionManager, SessionStorage};
use session_storage_document::DocumentStorage;
use session_storage_sql::SqlStorage;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use config::{Backend, Command, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();

    info!("Starting session-storage-admin");
    info!("  Backend: {}", config.backend);

    let store = open_store(&config).await?;
    let manager = SessionManager::new(store, config.handler_config());

    match config.command {
        Command::Setup { force } => {
            if manager.setup_storage(force).await? {
                info!("Storage provisioned");
            } else {
                info!("Storage already provisioned, nothing to do");
            }
        }
        Command::Gc { interval_secs: None } => {
            let report = manager.gc().await?;
            println!("{} session(s), {} lock(s) removed", report.sessions, report.locks);
        }
        Command::Gc {
            interval_secs: Some(secs),
        } => {
            run_gc_loop(&manager, Duration::from_secs(secs.max(1))).await;
        }
        Command::Exists { sid } => {
            println!("{}", manager.session_exists(&sid).await?);
        }
        Command::Kill { sid } => {
            if !manager.kill_session(&sid).await? {
                warn!("No session {}", sid);
            }
        }
        Command::KillAll => {
            let removed = manager.kill_all_sessions().await?;
            println!("{} session(s) removed", removed);
        }
    }

    Ok(())
}

async fn open_store(config: &Config) -> anyhow::Result<Arc<dyn SessionStorage>> {
    let store: Arc<dyn SessionStorage> = match config.backend {
        Backend::Document => {
            let dir = config.effective_document_dir();
            info!("  Document dir: {}", dir.display());
            Arc::new(DocumentStorage::new(&dir))
        }
        Backend::Sql => {
            let url = config.effective_database_url();
            info!("  Database: {}", url);
            if let Some(parent) = sqlite_file(&url).as_deref().and_then(|p| p.parent()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
            Arc::new(SqlStorage::connect(&url, config.max_connections).await?)
        }
    };

    store
        .ping()
        .await
        .with_context(|| format!("{} backend is unreachable", config.backend))?;
    Ok(store)
}

/// Filesystem path of a SQLite URL, if it names a file.
fn sqlite_file(url: &str) -> Option<PathBuf> {
    let rest = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))?;
    let path = rest.split('?').next().unwrap_or_default();
    if path.is_empty() || path == ":memory:" {
        return None;
    }
    Some(PathBuf::from(path))
}

/// Collect garbage every `period` until Ctrl+C or SIGTERM.
async fn run_gc_loop(manager: &SessionManager, period: Duration) {
    let mut shutdown_rx = create_shutdown_signal();
    let mut ticker = tokio::time::interval(period);
    info!("Collecting garbage every {:?}", period);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                // A failed pass is retried on the next tick.
                if let Err(e) = manager.gc().await {
                    error!("Garbage collection failed: {}", e);
                }
            }
            _ = shutdown_rx.wait_for(|&v| v) => break,
        }
    }

    info!("Garbage collector stopped");
}

/// Create a shutdown signal that triggers on Ctrl+C or SIGTERM.
fn create_shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);

    tokio::spawn(async move {
        let ctrl_c = async {
            match signal::ctrl_c().await {
                Ok(()) => info!("Received Ctrl+C, initiating shutdown"),
                Err(e) => {
                    error!("Failed to install Ctrl+C handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                    info!("Received SIGTERM, initiating shutdown");
                }
                Err(e) => {
                    error!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }

        let _ = tx.send(true);
    });

    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlite_file_paths() {
        assert_eq!(
            sqlite_file("sqlite:///var/lib/app/sessions.db"),
            Some(PathBuf::from("/var/lib/app/sessions.db"))
        );
        assert_eq!(
            sqlite_file("sqlite:data/sessions.db?mode=rwc"),
            Some(PathBuf::from("data/sessions.db"))
        );
        assert_eq!(sqlite_file("sqlite::memory:"), None);
        assert_eq!(sqlite_file("postgres://localhost/db"), None);
    }

    #[tokio::test]
    async fn test_open_document_store() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = Config::try_parse_from([
            "session-storage-admin",
            "--document-dir",
            temp_dir.path().to_str().unwrap(),
            "setup",
        ])
        .unwrap();

        let store = open_store(&config).await.unwrap();
        let manager = SessionManager::new(store, config.handler_config());
        assert!(manager.setup_storage(false).await.unwrap());
        assert!(!manager.session_exists("missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_open_sql_store_creates_parent_dir() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db = temp_dir.path().join("nested").join("sessions.db");
        let url = format!("sqlite://{}", db.display());
        let config = Config::try_parse_from([
            "session-storage-admin",
            "--backend",
            "sql",
            "--database-url",
            url.as_str(),
            "kill-all",
        ])
        .unwrap();

        let store = open_store(&config).await.unwrap();
        let manager = SessionManager::new(store, config.handler_config());
        manager.setup_storage(true).await.unwrap();
        assert_eq!(manager.kill_all_sessions().await.unwrap(), 0);
        assert!(db.exists());
    }
}
