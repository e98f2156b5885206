//! Filesystem document-store backend for session storage.

mod storage;

pub use storage::DocumentStorage;
