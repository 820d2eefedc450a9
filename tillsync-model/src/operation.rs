//! Outbox operations.

use crate::{ModelError, StoredRecord};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tillsync_types::{EntityId, OperationId, Timestamp};

/// What a queued operation does to the server-side record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncAction {
    Create,
    Update,
    Delete,
}

impl SyncAction {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for SyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncAction {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATE" => Ok(Self::Create),
            "UPDATE" => Ok(Self::Update),
            "DELETE" => Ok(Self::Delete),
            other => Err(ModelError::UnknownVariant {
                kind: "sync action",
                value: other.to_string(),
            }),
        }
    }
}

/// Delivery state of an outbox operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Waiting to be sent (possibly behind a backoff gate).
    Pending,
    /// Handed to the remote API; not yet settled.
    InFlight,
    /// Out of attempts or permanently rejected. Needs attention.
    Failed,
    /// Acknowledged by the server.
    Done,
}

impl OperationStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Failed => "failed",
            Self::Done => "done",
        }
    }

    /// Whether the operation still blocks later operations for its entity.
    #[must_use]
    pub const fn is_unresolved(&self) -> bool {
        !matches!(self, Self::Done)
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationStatus {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_flight" => Ok(Self::InFlight),
            "failed" => Ok(Self::Failed),
            "done" => Ok(Self::Done),
            other => Err(ModelError::UnknownVariant {
                kind: "operation status",
                value: other.to_string(),
            }),
        }
    }
}

/// A durable, not-yet-acknowledged local mutation.
///
/// Keyed by `(entity_id, version)`: the snapshot in `payload` is the full
/// record state at that version, so delivery is state-convergent and
/// retransmission is harmless.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOperation {
    pub id: OperationId,
    /// Insertion order assigned by the store. Zero until enqueued.
    #[serde(default)]
    pub seq: u64,
    pub entity_type: String,
    pub entity_id: EntityId,
    pub version: u64,
    pub action: SyncAction,
    pub payload: StoredRecord,
    pub priority: u8,
    pub attempts: u32,
    pub max_attempts: u32,
    pub status: OperationStatus,
    pub created_at: Timestamp,
    pub next_attempt_at: Timestamp,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl SyncOperation {
    /// Builds a pending operation for a record snapshot.
    #[must_use]
    pub fn new(
        action: SyncAction,
        payload: StoredRecord,
        priority: u8,
        max_attempts: u32,
        now: Timestamp,
    ) -> Self {
        Self {
            id: OperationId::new(),
            seq: 0,
            entity_type: payload.entity_type.clone(),
            entity_id: payload.meta.id,
            version: payload.meta.version,
            action,
            payload,
            priority,
            attempts: 0,
            max_attempts,
            status: OperationStatus::Pending,
            created_at: now,
            next_attempt_at: now,
            last_error: None,
        }
    }

    /// The durable idempotency key.
    #[must_use]
    pub fn key(&self) -> (EntityId, u64) {
        (self.entity_id, self.version)
    }

    /// Whether the retry budget is used up.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// Whether the operation has never been handed to the remote API.
    #[must_use]
    pub fn is_unsent(&self) -> bool {
        self.status == OperationStatus::Pending && self.attempts == 0
    }
}
