//! The durable outbox of unacknowledged local mutations.
//!
//! Operations are dequeued by ascending class priority, then insertion
//! order. An entity's operations are always sent one at a time and in the
//! order they were produced: a later operation waits while an earlier one for
//! the same entity is pending, in flight or failed.

use crate::{SyncError, SyncResult};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tillsync_model::{OperationStatus, StoredRecord, SyncAction, SyncOperation, SyncStatus};
use tillsync_storage::{Expected, LocalStore, StorageResult, StoreTxn};
use tillsync_types::{ClassPolicies, EntityId, OperationId, Timestamp};
use tracing::{debug, info, warn};

/// Exponential retry delay with full jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: bool,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter: true,
        }
    }

    /// Always waits the full ceiling. Used where timing must be exact.
    #[must_use]
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Upper bound of the delay after `attempts` failures.
    pub fn ceiling(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max)
            .min(self.max)
    }

    /// Delay before the next attempt after `attempts` failures.
    pub fn delay(&self, attempts: u32) -> Duration {
        let ceiling = self.ceiling(attempts);
        if !self.jitter {
            return ceiling;
        }
        let millis = u64::try_from(ceiling.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(300))
    }
}

/// Counts of outbox operations by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutboxStats {
    pub pending: usize,
    pub in_flight: usize,
    pub failed: usize,
    pub done: usize,
}

/// Queue operations over the store's outbox table.
pub struct Outbox<S> {
    store: Arc<S>,
    backoff: Backoff,
}

impl<S> Clone for Outbox<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            backoff: self.backoff,
        }
    }
}

impl<S: LocalStore> Outbox<S> {
    pub fn new(store: Arc<S>, backoff: Backoff) -> Self {
        Self { store, backoff }
    }

    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    /// Operations ready to send at `now`, in dispatch order.
    pub fn next_batch(&self, now: Timestamp, limit: usize) -> SyncResult<Vec<SyncOperation>> {
        self.next_batch_excluding(now, limit, &HashSet::new())
    }

    /// Like [`next_batch`](Self::next_batch), skipping operations in `skip`.
    ///
    /// At most one operation per entity is returned: the entity's oldest
    /// unresolved one, and only if it is pending and past its backoff gate.
    /// Entities in `conflict` status are held until resolved.
    pub fn next_batch_excluding(
        &self,
        now: Timestamp,
        limit: usize,
        skip: &HashSet<OperationId>,
    ) -> SyncResult<Vec<SyncOperation>> {
        let unresolved = self.store.operations(&[
            OperationStatus::Pending,
            OperationStatus::InFlight,
            OperationStatus::Failed,
        ])?;

        let mut head_seq: HashMap<EntityId, u64> = HashMap::new();
        for op in &unresolved {
            head_seq
                .entry(op.entity_id)
                .and_modify(|seq| *seq = (*seq).min(op.seq))
                .or_insert(op.seq);
        }

        let mut batch = Vec::new();
        for op in unresolved {
            if batch.len() >= limit {
                break;
            }
            if op.status != OperationStatus::Pending
                || head_seq.get(&op.entity_id) != Some(&op.seq)
                || now.is_before(&op.next_attempt_at)
                || skip.contains(&op.id)
            {
                continue;
            }
            let held = self
                .store
                .get(&op.entity_id)?
                .is_some_and(|r| r.meta.sync_status == SyncStatus::Conflict);
            if held {
                debug!("holding {} for {} until its conflict is resolved", op.id, op.entity_id);
                continue;
            }
            batch.push(op);
        }
        Ok(batch)
    }

    /// Marks an operation as handed to the remote API.
    pub fn mark_in_flight(&self, op: &SyncOperation) -> SyncResult<SyncOperation> {
        let mut op = op.clone();
        op.status = OperationStatus::InFlight;
        self.store.transaction(|tx| tx.update_operation(&op))?;
        Ok(op)
    }

    /// Records a transient failure. Returns the operation as persisted.
    pub fn record_failure(
        &self,
        op: &SyncOperation,
        error: &str,
        now: Timestamp,
    ) -> SyncResult<SyncOperation> {
        let op = self
            .store
            .transaction(|tx| self.fail_in(tx, op, error, now))?;
        Ok(op)
    }

    /// Marks an operation as permanently refused.
    pub fn reject(&self, op: &SyncOperation, reason: &str) -> SyncResult<SyncOperation> {
        let mut op = op.clone();
        op.status = OperationStatus::Failed;
        op.last_error = Some(reason.to_string());
        self.store.transaction(|tx| tx.update_operation(&op))?;
        warn!("operation {} for {} rejected: {}", op.id, op.entity_id, reason);
        Ok(op)
    }

    /// Settles an acknowledged operation and acknowledges its record.
    ///
    /// Returns true if the record is now fully synced.
    pub fn settle_done(&self, op: &SyncOperation, acked_version: u64) -> SyncResult<bool> {
        let synced = self
            .store
            .transaction(|tx| settle_done_in(tx, op, acked_version))?;
        Ok(synced)
    }

    /// Turns operations left in flight by an interrupted cycle back into
    /// pending ones. Returns how many were recovered.
    pub fn recover(&self) -> SyncResult<usize> {
        let stranded = self.store.operations(&[OperationStatus::InFlight])?;
        if stranded.is_empty() {
            return Ok(0);
        }
        let count = self.store.transaction(|tx| {
            for op in &stranded {
                let mut op = op.clone();
                op.status = OperationStatus::Pending;
                tx.update_operation(&op)?;
            }
            Ok::<_, tillsync_storage::StorageError>(stranded.len())
        })?;
        info!("recovered {count} in-flight operations");
        Ok(count)
    }

    /// Collapses runs of unsent operations per entity.
    ///
    /// Consecutive `UPDATE`s collapse into the latest one; a `CREATE`
    /// followed by `UPDATE`s becomes one `CREATE` carrying the latest
    /// snapshot. A `DELETE` is never folded, and anything already attempted
    /// breaks the run. Returns the number of operations removed.
    pub fn compact(&self) -> SyncResult<usize> {
        let pending = self.store.operations(&[OperationStatus::Pending])?;
        let entities: Vec<EntityId> = {
            let mut seen = HashSet::new();
            pending
                .iter()
                .filter(|op| op.is_unsent() && seen.insert(op.entity_id))
                .map(|op| op.entity_id)
                .collect()
        };
        if entities.is_empty() {
            return Ok(0);
        }

        let removed = self.store.transaction(|tx| {
            let mut removed = 0;
            for id in &entities {
                removed += compact_entity(tx, id)?;
            }
            Ok::<_, tillsync_storage::StorageError>(removed)
        })?;
        if removed > 0 {
            debug!("compacted {removed} outbox operations");
        }
        Ok(removed)
    }

    /// Operations that need attention: out of attempts or rejected.
    pub fn failed(&self) -> SyncResult<Vec<SyncOperation>> {
        Ok(self.store.operations(&[OperationStatus::Failed])?)
    }

    /// Re-arms a failed operation with a fresh retry budget.
    ///
    /// Returns false if the operation is unknown or not failed.
    pub fn retry_failed(&self, id: &OperationId, now: Timestamp) -> SyncResult<bool> {
        let Some(mut op) = self.store.operation(id)? else {
            return Ok(false);
        };
        if op.status != OperationStatus::Failed {
            return Ok(false);
        }
        op.status = OperationStatus::Pending;
        op.attempts = 0;
        op.next_attempt_at = now;
        op.last_error = None;
        self.store.transaction(|tx| tx.update_operation(&op))?;
        info!("re-armed failed operation {id}");
        Ok(true)
    }

    /// Drops a failed operation, unblocking later operations for its entity.
    ///
    /// Returns false if the operation is unknown or not failed. The last
    /// unresolved operation of a record with unsent changes cannot be
    /// dropped: it is the only thing that would carry those changes.
    pub fn discard_failed(&self, id: &OperationId) -> SyncResult<bool> {
        let Some(op) = self.store.operation(id)? else {
            return Ok(false);
        };
        let entity_id = op.entity_id;
        let discarded = self.store.transaction::<_, SyncError, _>(|tx| {
            let ops = tx.operations_for_entity(&entity_id)?;
            if !ops
                .iter()
                .any(|o| o.id == *id && o.status == OperationStatus::Failed)
            {
                return Ok(false);
            }
            let last = !ops
                .iter()
                .any(|o| o.id != *id && o.status != OperationStatus::Done);
            let unsent = tx
                .get(&entity_id)?
                .is_some_and(|r| r.meta.sync_status.has_unsent_changes());
            if last && unsent {
                return Err(SyncError::UnsentChanges(entity_id));
            }
            tx.remove_operation(id)?;
            Ok(true)
        })?;
        if discarded {
            warn!("discarded failed operation {id} for {entity_id}");
        }
        Ok(discarded)
    }

    pub fn stats(&self) -> SyncResult<OutboxStats> {
        let mut stats = OutboxStats::default();
        for op in self.store.operations(&[
            OperationStatus::Pending,
            OperationStatus::InFlight,
            OperationStatus::Failed,
            OperationStatus::Done,
        ])? {
            match op.status {
                OperationStatus::Pending => stats.pending += 1,
                OperationStatus::InFlight => stats.in_flight += 1,
                OperationStatus::Failed => stats.failed += 1,
                OperationStatus::Done => stats.done += 1,
            }
        }
        Ok(stats)
    }

    /// Records a failed attempt inside an open transaction.
    pub(crate) fn fail_in(
        &self,
        tx: &mut dyn StoreTxn,
        op: &SyncOperation,
        error: &str,
        now: Timestamp,
    ) -> StorageResult<SyncOperation> {
        let mut op = op.clone();
        op.attempts += 1;
        op.last_error = Some(error.to_string());
        if op.is_exhausted() {
            op.status = OperationStatus::Failed;
            warn!(
                "operation {} for {} failed after {} attempts: {}",
                op.id, op.entity_id, op.attempts, error
            );
        } else {
            op.status = OperationStatus::Pending;
            op.next_attempt_at = now.plus(self.backoff.delay(op.attempts));
            debug!(
                "operation {} attempt {} failed, retrying at {}",
                op.id, op.attempts, op.next_attempt_at
            );
        }
        tx.update_operation(&op)?;
        Ok(op)
    }
}

/// Marks `op` done and acknowledges `acked_version` on its record.
pub(crate) fn settle_done_in(
    tx: &mut dyn StoreTxn,
    op: &SyncOperation,
    acked_version: u64,
) -> StorageResult<bool> {
    let mut done = op.clone();
    done.status = OperationStatus::Done;
    done.last_error = None;
    tx.update_operation(&done)?;

    let Some(mut record) = tx.get(&op.entity_id)? else {
        return Ok(false);
    };
    let current = record.meta.version;
    record.meta.acknowledge(acked_version);
    tx.put(&record, Expected::Version(current))?;
    Ok(record.meta.sync_status == SyncStatus::Synced)
}

/// Removes operations that a newer authoritative state makes redundant.
///
/// Pending and failed operations for the entity are dropped; an in-flight
/// one is left for the push that owns it to settle.
pub(crate) fn drop_superseded(tx: &mut dyn StoreTxn, entity_id: &EntityId) -> StorageResult<usize> {
    let mut dropped = 0;
    for op in tx.operations_for_entity(entity_id)? {
        if matches!(op.status, OperationStatus::Pending | OperationStatus::Failed) {
            tx.remove_operation(&op.id)?;
            dropped += 1;
        }
    }
    Ok(dropped)
}

/// Enqueues a full snapshot of `record` at its current version.
pub(crate) fn enqueue_snapshot(
    tx: &mut dyn StoreTxn,
    action: SyncAction,
    record: &StoredRecord,
    policies: &ClassPolicies,
    max_attempts: u32,
    now: Timestamp,
) -> StorageResult<()> {
    let priority = policies.get(record.class).priority;
    let op = SyncOperation::new(action, record.clone(), priority, max_attempts, now);
    if tx.enqueue(&op)?.is_none() {
        debug!("{} v{} already queued", record.id(), record.meta.version);
    }
    Ok(())
}

fn compact_entity(tx: &mut dyn StoreTxn, entity_id: &EntityId) -> StorageResult<usize> {
    let mut removed = 0;
    let mut head: Option<SyncOperation> = None;

    for op in tx.operations_for_entity(entity_id)? {
        if op.status == OperationStatus::Done {
            continue;
        }
        if !op.is_unsent() || op.action == SyncAction::Delete {
            head = None;
            continue;
        }
        if op.action == SyncAction::Update {
            if let Some(run) = head.as_mut() {
                tx.remove_operation(&op.id)?;
                run.version = op.version;
                run.payload = op.payload;
                tx.update_operation(run)?;
                removed += 1;
                continue;
            }
        }
        head = Some(op);
    }
    Ok(removed)
}
