//! Core type definitions for tillsync.
//!
//! This crate defines the fundamental, schema-agnostic types used by every
//! layer of the sync core:
//! - Entity, device and operation identifiers (UUID v7)
//! - Tenant, store and user partitioning keys
//! - Millisecond timestamps and injectable time sources
//! - Entity classes and their sync policies (priority, retention, conflicts)
//!
//! Business schemas (tickets, appointments, gift cards, ...) live with the
//! application, not here.

mod class;
mod ids;
mod timestamp;

pub use class::{ClassPolicies, ClassPolicy, ClassPolicyOverride, ConflictPolicy, EntityClass};
pub use ids::{Cursor, DeviceId, EntityId, OperationId, StoreId, TenantId, UserId};
pub use timestamp::{ManualTimeSource, SystemTimeSource, TimeSource, Timestamp};

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),

    #[error("invalid policy: {0}")]
    InvalidPolicy(String),
}
