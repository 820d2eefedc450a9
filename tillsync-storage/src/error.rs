//! Error types for the storage layer.

use thiserror::Error;
use tillsync_model::ModelError;
use tillsync_types::EntityId;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur in storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored value could not be mapped back to a model type.
    #[error("model error: {0}")]
    Model(#[from] ModelError),

    /// Compare-and-swap on a record version failed.
    #[error("version mismatch for {id}: expected {expected:?}, found {found:?}")]
    VersionMismatch {
        id: EntityId,
        expected: Option<u64>,
        found: Option<u64>,
    },

    /// Invalid data.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// A thread panicked while holding the connection lock.
    #[error("store lock poisoned")]
    Poisoned,
}
