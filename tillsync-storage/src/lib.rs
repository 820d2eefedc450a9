//! Local storage layer for tillsync.
//!
//! The sync core consumes storage only through the [`LocalStore`] capability
//! contract: point lookups, indexed range queries, and atomic multi-write
//! transactions over [`StoreTxn`]. Records, outbox operations, pull cursors,
//! retained conflicts and the audit log all live in the same store so a
//! single transaction can cover an entity write and its outbox entry.
//!
//! # Architecture
//!
//! - Records are persisted as JSON snapshots with their envelope fields
//!   extracted into typed, indexed columns (`is_deleted` is a real boolean
//!   column backed by an explicit tombstone index)
//! - The outbox is keyed by `(entity_id, version)` and ordered by
//!   `(priority, seq)`
//! - [`SqliteStore`] is the production implementation; `open_in_memory`
//!   gives tests an isolated substitute

mod error;
mod sqlite;
mod store;

pub use error::{StorageError, StorageResult};
pub use sqlite::SqliteStore;
pub use store::{Expected, LocalStore, RecordQuery, StoreTxn};
