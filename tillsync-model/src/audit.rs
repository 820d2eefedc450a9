//! Conflict snapshots and the resolution audit trail.

use crate::{ModelError, StoredRecord};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tillsync_types::{EntityId, Timestamp};

/// Both sides of an unresolved concurrent edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub entity_type: String,
    pub entity_id: EntityId,
    /// The local state at detection time, including unsent edits.
    pub local: StoredRecord,
    /// The diverging remote state.
    pub remote: StoredRecord,
    pub detected_at: Timestamp,
}

/// Kind of decision recorded in the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// Concurrent edit handed to manual resolution.
    ConflictDetected,
    /// A conflict was resolved by an explicit choice.
    ConflictResolved,
    /// Concurrent edit settled by last-writer-wins class policy.
    LastWriterWins,
    /// Identical clocks with different content; later `updated_at` kept.
    DegenerateTie,
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ConflictDetected => "conflict_detected",
            Self::ConflictResolved => "conflict_resolved",
            Self::LastWriterWins => "last_writer_wins",
            Self::DegenerateTie => "degenerate_tie",
        };
        f.write_str(name)
    }
}

impl FromStr for AuditAction {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "conflict_detected" => Ok(Self::ConflictDetected),
            "conflict_resolved" => Ok(Self::ConflictResolved),
            "last_writer_wins" => Ok(Self::LastWriterWins),
            "degenerate_tie" => Ok(Self::DegenerateTie),
            other => Err(ModelError::UnknownVariant {
                kind: "audit action",
                value: other.to_string(),
            }),
        }
    }
}

/// One entry in the sync audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub entity_type: String,
    pub entity_id: EntityId,
    pub action: AuditAction,
    pub detail: String,
    pub timestamp: Timestamp,
}

impl AuditEntry {
    pub fn new(
        record: &StoredRecord,
        action: AuditAction,
        detail: impl Into<String>,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            entity_type: record.entity_type.clone(),
            entity_id: record.meta.id,
            action,
            detail: detail.into(),
            timestamp,
        }
    }
}
