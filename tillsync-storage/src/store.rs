//! The local store capability contract.

use crate::{StorageError, StorageResult};
use tillsync_model::{
    AuditEntry, ConflictRecord, OperationStatus, StoredRecord, SyncOperation, SyncStatus,
};
use tillsync_types::{Cursor, EntityId, OperationId, StoreId, Timestamp};

/// What a write expects to find before it lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expected {
    /// The record must not exist yet.
    Absent,
    /// The stored record must be at exactly this version.
    Version(u64),
    /// Overwrite whatever is there.
    Any,
}

/// Range query over stored records.
///
/// Deleted records are excluded unless [`RecordQuery::including_deleted`] is
/// set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordQuery {
    pub entity_type: Option<String>,
    pub store_id: Option<StoreId>,
    pub status: Option<SyncStatus>,
    pub include_deleted: bool,
    pub limit: Option<usize>,
}

impl RecordQuery {
    /// All visible records of a type.
    pub fn of_type(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: Some(entity_type.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn in_store(mut self, store_id: StoreId) -> Self {
        self.store_id = Some(store_id);
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: SyncStatus) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn including_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Writes (and consistent reads) inside one atomic store transaction.
///
/// Nothing written through a `StoreTxn` is visible to other callers until
/// the enclosing [`LocalStore::transaction`] closure returns `Ok`.
pub trait StoreTxn {
    /// Reads a record, including tombstones.
    fn get(&self, id: &EntityId) -> StorageResult<Option<StoredRecord>>;

    /// Writes a record after checking the expected stored version.
    fn put(&mut self, record: &StoredRecord, expected: Expected) -> StorageResult<()>;

    /// Physically removes a record and any retained conflict for it.
    fn remove(&mut self, id: &EntityId) -> StorageResult<bool>;

    /// Appends an operation to the outbox.
    ///
    /// Returns the assigned sequence number, or `None` when an operation
    /// with the same `(entity_id, version)` key is already queued.
    fn enqueue(&mut self, op: &SyncOperation) -> StorageResult<Option<u64>>;

    /// Rewrites the mutable fields of a queued operation.
    fn update_operation(&mut self, op: &SyncOperation) -> StorageResult<()>;

    /// Removes an operation from the outbox.
    fn remove_operation(&mut self, id: &OperationId) -> StorageResult<()>;

    /// All operations for one entity in insertion order.
    fn operations_for_entity(&self, id: &EntityId) -> StorageResult<Vec<SyncOperation>>;

    /// Stores the pull position for a store.
    fn set_cursor(
        &mut self,
        store_id: &StoreId,
        cursor: &Cursor,
        now: Timestamp,
    ) -> StorageResult<()>;

    /// A retained conflict for one entity.
    fn conflict(&self, id: &EntityId) -> StorageResult<Option<ConflictRecord>>;

    /// Retains both sides of a concurrent edit.
    fn save_conflict(&mut self, conflict: &ConflictRecord) -> StorageResult<()>;

    /// Drops a retained conflict once it is resolved.
    fn clear_conflict(&mut self, id: &EntityId) -> StorageResult<()>;

    /// Appends to the sync audit log.
    fn append_audit(&mut self, entry: &AuditEntry) -> StorageResult<()>;
}

/// Capability contract of the local store consumed by the sync core.
pub trait LocalStore: Send + Sync + 'static {
    /// Point lookup by id, including tombstones.
    fn get(&self, id: &EntityId) -> StorageResult<Option<StoredRecord>>;

    /// Indexed range query.
    fn query(&self, query: &RecordQuery) -> StorageResult<Vec<StoredRecord>>;

    /// Tombstones whose retention window ended before `now`, synced or not.
    fn expired_tombstones(&self, now: Timestamp) -> StorageResult<Vec<StoredRecord>>;

    /// Runs `f` inside one atomic transaction.
    ///
    /// The transaction commits only if `f` returns `Ok`; any error rolls
    /// every write back.
    fn transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn StoreTxn) -> Result<T, E>,
        E: From<StorageError>;

    /// Looks up one outbox operation.
    fn operation(&self, id: &OperationId) -> StorageResult<Option<SyncOperation>>;

    /// Outbox operations in the given states, ordered by `(priority, seq)`.
    fn operations(&self, statuses: &[OperationStatus]) -> StorageResult<Vec<SyncOperation>>;

    /// All operations for one entity in insertion order.
    fn operations_for_entity(&self, id: &EntityId) -> StorageResult<Vec<SyncOperation>>;

    /// Deletes acknowledged operations; returns how many were removed.
    fn purge_done_operations(&self) -> StorageResult<usize>;

    /// The stored pull position for a store.
    fn cursor(&self, store_id: &StoreId) -> StorageResult<Option<Cursor>>;

    /// A retained conflict for one entity.
    fn conflict(&self, id: &EntityId) -> StorageResult<Option<ConflictRecord>>;

    /// All retained conflicts, oldest first.
    fn conflicts(&self) -> StorageResult<Vec<ConflictRecord>>;

    /// Audit log entries, newest first.
    fn audit_log(&self, limit: usize, offset: usize) -> StorageResult<Vec<AuditEntry>>;
}
