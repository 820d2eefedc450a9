//! The local write path.
//!
//! [`SyncRepository`] is the only code that moves a record's version and
//! vector clock forward for a local edit. Every create, update and delete
//! writes the record and enqueues its outbox operation in one store
//! transaction, so a crash can never leave one without the other.

use crate::outbox::{drop_superseded, enqueue_snapshot};
use crate::{SyncConfig, SyncError, SyncResult};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tillsync_model::{
    Actor, AuditAction, AuditEntry, Envelope, Record, Scope, StoredRecord, SyncAction,
    SyncStatus, SyncableData,
};
use tillsync_storage::{Expected, LocalStore, RecordQuery, StorageError, StoreTxn};
use tillsync_types::{ClassPolicies, EntityId, StoreId, SystemTimeSource, TimeSource};
use tracing::{debug, info};

/// Explicit answer to a retained conflict.
#[derive(Debug, Clone, PartialEq)]
pub enum ConflictChoice<T> {
    /// Keep this device's state.
    KeepLocal,
    /// Take the server's state.
    TakeRemote,
    /// Replace both with a reconciled value.
    Replace(T),
}

/// Generic create/update/delete for every syncable type.
pub struct SyncRepository<S> {
    store: Arc<S>,
    actor: Actor,
    policies: ClassPolicies,
    max_attempts: u32,
    clock: Arc<dyn TimeSource>,
    locks: Mutex<HashMap<EntityId, Arc<Mutex<()>>>>,
}

impl<S: LocalStore> SyncRepository<S> {
    pub fn new(
        store: Arc<S>,
        actor: Actor,
        policies: ClassPolicies,
        max_attempts: u32,
        clock: Arc<dyn TimeSource>,
    ) -> Self {
        Self {
            store,
            actor,
            policies,
            max_attempts,
            clock,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Builds a repository for the configured device and user.
    pub fn from_config(store: Arc<S>, config: &SyncConfig) -> SyncResult<Self> {
        Self::from_config_with_clock(store, config, Arc::new(SystemTimeSource))
    }

    pub fn from_config_with_clock(
        store: Arc<S>,
        config: &SyncConfig,
        clock: Arc<dyn TimeSource>,
    ) -> SyncResult<Self> {
        config.validate()?;
        Ok(Self::new(
            store,
            Actor::new(config.user_id.clone(), config.device_id),
            config.class_policies()?,
            config.max_attempts,
            clock,
        ))
    }

    pub fn actor(&self) -> &Actor {
        &self.actor
    }

    /// Creates a record at version 1 and enqueues a `CREATE`.
    pub fn create<T: SyncableData>(&self, scope: &Scope, mut data: T) -> SyncResult<Record<T>> {
        data.recompute_derived();
        data.validate().map_err(SyncError::Validation)?;

        let now = self.clock.now();
        let record = Record {
            meta: Envelope::new(EntityId::new(), scope, &self.actor, now),
            data,
        };
        let stored = record.to_stored()?;

        self.store.transaction(|tx| {
            tx.put(&stored, Expected::Absent)?;
            self.enqueue(tx, SyncAction::Create, &stored)
        })?;
        debug!("created {} {}", T::ENTITY_TYPE, record.id());
        Ok(record)
    }

    /// Applies `patch` to a live record, bumps its version and enqueues an
    /// `UPDATE`. Returns `None` if the record is missing or deleted.
    pub fn update<T, F>(&self, id: &EntityId, patch: F) -> SyncResult<Option<Record<T>>>
    where
        T: SyncableData,
        F: FnOnce(&mut T),
    {
        self.locked(id, || {
            self.store.transaction(|tx| {
                let Some(current) = tx.get(id)? else {
                    return Ok(None);
                };
                if current.meta.is_deleted {
                    return Ok(None);
                }

                let mut record: Record<T> = current.to_record()?;
                patch(&mut record.data);
                record.data.recompute_derived();
                record.data.validate().map_err(SyncError::Validation)?;

                let was_conflict = current.meta.sync_status == SyncStatus::Conflict;
                record.meta.bump(&self.actor, self.clock.now());
                if was_conflict {
                    record.meta.sync_status = SyncStatus::Conflict;
                }

                let stored = record.to_stored()?;
                tx.put(&stored, Expected::Version(current.meta.version))?;
                self.enqueue(tx, SyncAction::Update, &stored)?;
                debug!("updated {} {} to v{}", T::ENTITY_TYPE, id, stored.meta.version);
                Ok(Some(record))
            })
        })
    }

    /// Soft-deletes a record and enqueues a `DELETE`.
    ///
    /// Returns false if the record is missing or already deleted.
    pub fn delete(&self, id: &EntityId) -> SyncResult<bool> {
        self.locked(id, || {
            self.store.transaction(|tx| {
                let Some(mut record) = tx.get(id)? else {
                    return Ok(false);
                };
                if record.meta.is_deleted {
                    return Ok(false);
                }

                let expected = record.meta.version;
                let was_conflict = record.meta.sync_status == SyncStatus::Conflict;
                let retention = self.policies.get(record.class).retention();
                record
                    .meta
                    .mark_deleted(&self.actor, self.clock.now(), retention);
                if was_conflict {
                    record.meta.sync_status = SyncStatus::Conflict;
                }

                tx.put(&record, Expected::Version(expected))?;
                self.enqueue(tx, SyncAction::Delete, &record)?;
                debug!("deleted {} {} at v{}", record.entity_type, id, record.meta.version);
                Ok(true)
            })
        })
    }

    /// Point lookup, including tombstones that have not been purged yet.
    pub fn get<T: SyncableData>(&self, id: &EntityId) -> SyncResult<Option<Record<T>>> {
        self.store
            .get(id)?
            .map(|stored| stored.to_record().map_err(SyncError::from))
            .transpose()
    }

    /// Live records of a type in one store.
    pub fn list<T: SyncableData>(&self, store_id: &StoreId) -> SyncResult<Vec<Record<T>>> {
        self.query(RecordQuery::of_type(T::ENTITY_TYPE).in_store(store_id.clone()))
    }

    /// Live records of a type in one store with the given sync status.
    pub fn list_with_status<T: SyncableData>(
        &self,
        store_id: &StoreId,
        status: SyncStatus,
    ) -> SyncResult<Vec<Record<T>>> {
        self.query(
            RecordQuery::of_type(T::ENTITY_TYPE)
                .in_store(store_id.clone())
                .with_status(status),
        )
    }

    /// Settles a retained conflict.
    ///
    /// The chosen state is written as a new local version whose clock
    /// dominates both sides, and queued as an `UPDATE` (or `DELETE` when the
    /// chosen state is a tombstone). Returns `None` if the record is gone.
    pub fn resolve_conflict<T: SyncableData>(
        &self,
        id: &EntityId,
        choice: ConflictChoice<T>,
    ) -> SyncResult<Option<Record<T>>> {
        self.locked(id, || {
            self.store.transaction(|tx| {
                let Some(local) = tx.get(id)? else {
                    return Ok(None);
                };
                let Some(conflict) = tx.conflict(id)? else {
                    return Err(SyncError::NotInConflict(*id));
                };
                let remote = &conflict.remote;

                let (mut chosen, label) = match choice {
                    ConflictChoice::KeepLocal => (local.clone(), "kept local"),
                    ConflictChoice::TakeRemote => {
                        let mut taken = local.clone();
                        taken.data = remote.data.clone();
                        copy_deletion(&mut taken.meta, &remote.meta);
                        (taken, "took remote")
                    }
                    ConflictChoice::Replace(mut data) => {
                        data.recompute_derived();
                        data.validate().map_err(SyncError::Validation)?;
                        let mut replaced = local.clone();
                        replaced.data = serde_json::to_value(&data)?;
                        (replaced, "replaced")
                    }
                };

                chosen.meta.vector_clock =
                    local.meta.vector_clock.merged(&remote.meta.vector_clock);
                chosen.meta.version = local.meta.version.max(remote.meta.version);
                chosen.meta.bump(&self.actor, self.clock.now());

                let mut record: Record<T> = chosen.to_record()?;
                record.data.recompute_derived();
                let stored = record.to_stored()?;

                tx.put(&stored, Expected::Version(local.meta.version))?;
                tx.clear_conflict(id)?;
                drop_superseded(tx, id)?;
                let action = if stored.meta.is_deleted {
                    SyncAction::Delete
                } else {
                    SyncAction::Update
                };
                self.enqueue(tx, action, &stored)?;
                tx.append_audit(&AuditEntry::new(
                    &stored,
                    AuditAction::ConflictResolved,
                    format!("{label} at v{}", stored.meta.version),
                    self.clock.now(),
                ))?;
                info!("resolved conflict on {} {}: {}", T::ENTITY_TYPE, id, label);
                Ok(Some(record))
            })
        })
    }

    fn query<T: SyncableData>(&self, query: RecordQuery) -> SyncResult<Vec<Record<T>>> {
        self.store
            .query(&query)?
            .iter()
            .map(|stored| stored.to_record().map_err(SyncError::from))
            .collect()
    }

    fn enqueue(
        &self,
        tx: &mut dyn StoreTxn,
        action: SyncAction,
        record: &StoredRecord,
    ) -> Result<(), StorageError> {
        enqueue_snapshot(
            tx,
            action,
            record,
            &self.policies,
            self.max_attempts,
            self.clock.now(),
        )
    }

    /// Runs `f` while holding the write lock for one record.
    fn locked<R>(&self, id: &EntityId, f: impl FnOnce() -> SyncResult<R>) -> SyncResult<R> {
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .map_err(|_| SyncError::Storage(StorageError::Poisoned))?;
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(*id).or_default())
        };
        let _guard = lock
            .lock()
            .map_err(|_| SyncError::Storage(StorageError::Poisoned))?;
        f()
    }
}

fn copy_deletion(target: &mut Envelope, source: &Envelope) {
    target.is_deleted = source.is_deleted;
    target.deleted_at = source.deleted_at;
    target.deleted_by = source.deleted_by.clone();
    target.deleted_by_device = source.deleted_by_device;
    target.tombstone_expires_at = source.tombstone_expires_at;
}
