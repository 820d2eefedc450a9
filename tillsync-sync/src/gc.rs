//! Tombstone garbage collection.

use crate::SyncResult;
use std::sync::Arc;
use tillsync_storage::{LocalStore, StorageError};
use tillsync_types::{EntityId, Timestamp};
use tracing::{debug, info};

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    /// Tombstones physically removed.
    pub purged: Vec<EntityId>,
    /// Expired tombstones kept because the server has not acknowledged them.
    pub retained_unsynced: usize,
    /// Acknowledged outbox rows removed.
    pub purged_operations: usize,
}

/// Purges expired tombstones, but only once the server has seen the delete.
pub struct TombstoneCollector<S> {
    store: Arc<S>,
}

impl<S> Clone for TombstoneCollector<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: LocalStore> TombstoneCollector<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn sweep(&self, now: Timestamp) -> SyncResult<GcReport> {
        let expired = self.store.expired_tombstones(now)?;
        let mut report = GcReport::default();

        if !expired.is_empty() {
            let (purged, retained) = self.store.transaction(|tx| {
                let mut purged = Vec::new();
                let mut retained = 0;
                for candidate in &expired {
                    let id = candidate.id();
                    // Re-read under the transaction; an ack may have landed.
                    let Some(current) = tx.get(&id)? else {
                        continue;
                    };
                    if !current.meta.is_purgeable(now) {
                        retained += 1;
                        continue;
                    }
                    for op in tx.operations_for_entity(&id)? {
                        tx.remove_operation(&op.id)?;
                    }
                    tx.remove(&id)?;
                    debug!("purged tombstone {} {}", current.entity_type, id);
                    purged.push(id);
                }
                Ok::<_, StorageError>((purged, retained))
            })?;
            report.purged = purged;
            report.retained_unsynced = retained;
        }

        report.purged_operations = self.store.purge_done_operations()?;
        info!(
            "gc: purged {} tombstones, kept {} unsynced, removed {} done operations",
            report.purged.len(),
            report.retained_unsynced,
            report.purged_operations
        );
        Ok(report)
    }
}
