//! Core traits and session protocol for pluggable session storage backends.
//!
//! This crate defines what the document and relational backends share:
//! - `SessionStorage`: uninterpreted record storage with a unique `sid` per collection
//! - `LockManager`: exclusive per-session locks built on insert uniqueness
//! - `SessionCoordinator`: the open/read/write/close/destroy protocol for one request
//! - `SessionManager`: process-wide administration, provisioning and GC

mod codec;
mod config;
mod coordinator;
mod error;
mod lock;
mod maintenance;
mod manager;
pub mod memory;
mod provision;
mod storage;

pub use codec::{content_hash, DataEncoding};
pub use config::HandlerConfig;
pub use coordinator::{HandlerState, SessionCoordinator, SessionHandler, WriteOutcome};
pub use error::{SessionError, StorageError};
pub use lock::{LockHandle, LockManager};
pub use maintenance::{collect_garbage, reclaim_stale_locks, GcReport};
pub use manager::SessionManager;
pub use memory::MemoryStorage;
pub use provision::{setup_storage, LAST_PROVISIONED_KEY};
pub use storage::{
    timestamp_to_datetime, Collection, NewRecord, RecordId, RecordMeta, RecordUpdate,
    SessionStorage, StoredRecord,
};
