//! Syncable record model for tillsync.
//!
//! Defines the shapes every sync subsystem agrees on:
//! - [`Envelope`]: versioning, vector clock, sync status and tombstone
//!   metadata carried by every record
//! - [`Record<T>`]: an envelope plus typed domain data
//! - [`StoredRecord`]: the type-erased form persisted locally and sent over
//!   the wire
//! - [`SyncOperation`]: an outbox item
//! - [`SyncableData`]: the hook domain types implement (class, derived
//!   fields, validation)
//! - [`ConflictRecord`] and [`AuditEntry`]: retained conflict snapshots and
//!   the resolution audit trail

mod audit;
mod data;
mod envelope;
mod operation;
mod record;

pub use audit::{AuditAction, AuditEntry, ConflictRecord};
pub use data::SyncableData;
pub use envelope::{Actor, Envelope, Scope, SyncStatus};
pub use operation::{OperationStatus, SyncAction, SyncOperation};
pub use record::{Record, StoredRecord};

/// Result type for model conversions.
pub type ModelResult<T> = Result<T, ModelError>;

/// Errors raised while converting between typed and stored records.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("entity type mismatch: expected {expected}, found {found}")]
    EntityTypeMismatch { expected: String, found: String },

    #[error("unknown {kind}: {value}")]
    UnknownVariant { kind: &'static str, value: String },
}
