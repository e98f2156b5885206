//! Relational backend for session storage.
//!
//! Sessions and locks live in two tables with a unique index on `sid` and a
//! plain index on `timemodified`; a third table holds provisioning metadata.
//! The unique index is what makes lock acquisition safe across processes.

mod storage;

pub use storage::SqlStorage;
