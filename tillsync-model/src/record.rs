//! Typed and type-erased records.

use crate::{Envelope, ModelError, ModelResult, SyncableData};
use serde::{Deserialize, Serialize};
use tillsync_types::{EntityClass, EntityId};

/// A record as seen by application code: envelope plus typed data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record<T> {
    pub meta: Envelope,
    pub data: T,
}

impl<T> Record<T> {
    #[must_use]
    pub fn id(&self) -> EntityId {
        self.meta.id
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.meta.version
    }
}

impl<T: SyncableData> Record<T> {
    /// Erases the data type for storage or transmission.
    pub fn to_stored(&self) -> ModelResult<StoredRecord> {
        Ok(StoredRecord {
            entity_type: T::ENTITY_TYPE.to_string(),
            class: T::CLASS,
            meta: self.meta.clone(),
            data: serde_json::to_value(&self.data)?,
        })
    }
}

/// A record with its data kept as JSON.
///
/// This is what the local store persists, what outbox operations carry as
/// their payload, and what the remote API exchanges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub entity_type: String,
    pub class: EntityClass,
    pub meta: Envelope,
    pub data: serde_json::Value,
}

impl StoredRecord {
    #[must_use]
    pub fn id(&self) -> EntityId {
        self.meta.id
    }

    /// Restores the typed record, checking the entity type.
    pub fn to_record<T: SyncableData>(&self) -> ModelResult<Record<T>> {
        if self.entity_type != T::ENTITY_TYPE {
            return Err(ModelError::EntityTypeMismatch {
                expected: T::ENTITY_TYPE.to_string(),
                found: self.entity_type.clone(),
            });
        }
        Ok(Record {
            meta: self.meta.clone(),
            data: serde_json::from_value(self.data.clone())?,
        })
    }

    /// Whether two snapshots carry the same domain content.
    #[must_use]
    pub fn same_content(&self, other: &Self) -> bool {
        self.entity_type == other.entity_type
            && self.data == other.data
            && self.meta.is_deleted == other.meta.is_deleted
    }
}
