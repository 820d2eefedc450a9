//! Error types for the sync layer.

use crate::remote::RemoteError;
use thiserror::Error;
use tillsync_model::ModelError;
use tillsync_storage::StorageError;
use tillsync_types::EntityId;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in sync operations.
///
/// A missing record is not an error (reads return `Option`), and a
/// concurrent edit is an outcome, not a failure.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The record failed its domain validation; nothing was written.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Another writer moved the record's version first.
    #[error("version conflict for {id}: expected {expected}, found {found:?}")]
    VersionConflict {
        id: EntityId,
        expected: u64,
        found: Option<u64>,
    },

    /// The record has no retained conflict to resolve.
    #[error("record {0} is not in conflict")]
    NotInConflict(EntityId),

    /// Dropping the operation would leave the record's unsent changes with
    /// nothing to carry them.
    #[error("record {0} has unsent changes only its failed operation carries")]
    UnsentChanges(EntityId),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(StorageError),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored value could not be mapped to a model type.
    #[error("model error: {0}")]
    Model(ModelError),

    /// A record was read back as the wrong domain type.
    #[error("entity type mismatch: expected {expected}, found {found}")]
    EntityTypeMismatch { expected: String, found: String },

    /// Remote API error.
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    /// Channel closed.
    #[error("channel closed")]
    ChannelClosed,

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Reading configuration from disk failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A blocking store task panicked or was cancelled.
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl From<StorageError> for SyncError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::VersionMismatch {
                id,
                expected: Some(expected),
                found,
            } => Self::VersionConflict {
                id,
                expected,
                found,
            },
            StorageError::Model(model) => model.into(),
            other => Self::Storage(other),
        }
    }
}

impl From<ModelError> for SyncError {
    fn from(err: ModelError) -> Self {
        match err {
            ModelError::EntityTypeMismatch { expected, found } => {
                Self::EntityTypeMismatch { expected, found }
            }
            ModelError::Serialization(e) => Self::Serialization(e),
            other => Self::Model(other),
        }
    }
}
