mod common;

use common::*;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tillsync_model::{OperationStatus, SyncAction, SyncOperation, SyncStatus};
use tillsync_storage::{Expected, LocalStore, StorageError};
use tillsync_sync::remote::mock::InMemoryRemote;
use tillsync_sync::{Backoff, OutboxStats, SyncConfig, SyncError};
use tillsync_types::{EntityId, Timestamp};

fn device() -> Device {
    Device::new(&Arc::new(InMemoryRemote::new()), &manual_clock())
}

fn device_with_attempts(max_attempts: u32) -> Device {
    let config = SyncConfig {
        max_attempts,
        ..config()
    };
    Device::with_config(&Arc::new(InMemoryRemote::new()), &manual_clock(), config)
}

fn at(offset_ms: i64) -> Timestamp {
    Timestamp::from_millis(T0 + offset_ms)
}

fn keys(ops: &[SyncOperation]) -> Vec<(EntityId, u64)> {
    ops.iter().map(SyncOperation::key).collect()
}

fn ops_for(d: &Device, id: &EntityId) -> Vec<SyncOperation> {
    d.store.operations_for_entity(id).unwrap()
}

// ── Ordering ─────────────────────────────────────────────────────

#[test]
fn batch_orders_by_class_priority_then_insertion() {
    let d = device();
    let service = d.repo.create(&scope(), Service::new("Haircut", 3_500)).unwrap();
    let ticket_a = d.repo.create(&scope(), Ticket::new(vec![("Cut", 3_000)])).unwrap();
    let appt = d
        .repo
        .create(
            &scope(),
            Appointment {
                client: "Ana".into(),
                slot: "10:00".into(),
            },
        )
        .unwrap();
    let ticket_b = d.repo.create(&scope(), Ticket::new(vec![("Wash", 1_000)])).unwrap();

    let batch = d.engine.outbox().next_batch(at(0), 10).unwrap();
    assert_eq!(
        keys(&batch),
        vec![
            (ticket_a.id(), 1),
            (ticket_b.id(), 1),
            (appt.id(), 1),
            (service.id(), 1),
        ]
    );
}

#[test]
fn batch_respects_limit() {
    let d = device();
    for i in 0..5 {
        d.repo.create(&scope(), Service::new("S", i)).unwrap();
    }
    assert_eq!(d.engine.outbox().next_batch(at(0), 3).unwrap().len(), 3);
}

#[test]
fn only_the_oldest_operation_of_an_entity_is_ready() {
    let d = device();
    let outbox = d.engine.outbox();
    let record = d.repo.create(&scope(), Service::new("Haircut", 1)).unwrap();
    for price in 2..4 {
        d.repo
            .update(&record.id(), |s: &mut Service| s.price_cents = price)
            .unwrap();
    }

    let batch = outbox.next_batch(at(0), 10).unwrap();
    assert_eq!(keys(&batch), vec![(record.id(), 1)]);

    let in_flight = outbox.mark_in_flight(&batch[0]).unwrap();
    assert!(outbox.next_batch(at(0), 10).unwrap().is_empty());

    assert!(!outbox.settle_done(&in_flight, 1).unwrap());
    let batch = outbox.next_batch(at(0), 10).unwrap();
    assert_eq!(keys(&batch), vec![(record.id(), 2)]);
}

#[test]
fn entities_in_conflict_are_held() {
    let d = device();
    let held = d.repo.create(&scope(), Service::new("A", 1)).unwrap();
    let free = d.repo.create(&scope(), Service::new("B", 2)).unwrap();

    d.store
        .transaction(|tx| {
            let mut record = tx.get(&held.id())?.unwrap();
            record.meta.sync_status = SyncStatus::Conflict;
            tx.put(&record, Expected::Any)?;
            Ok::<_, StorageError>(())
        })
        .unwrap();

    let batch = d.engine.outbox().next_batch(at(0), 10).unwrap();
    assert_eq!(keys(&batch), vec![(free.id(), 1)]);
}

// ── Retry and failure ────────────────────────────────────────────

#[test]
fn failed_attempt_waits_for_backoff() {
    let d = device();
    let outbox = d.engine.outbox();
    let record = d.repo.create(&scope(), Service::new("A", 1)).unwrap();
    let op = outbox.next_batch(at(0), 1).unwrap().remove(0);

    let op = outbox.record_failure(&op, "timeout", at(0)).unwrap();
    assert_eq!(op.attempts, 1);
    assert_eq!(op.status, OperationStatus::Pending);
    assert_eq!(op.next_attempt_at, at(500));
    assert_eq!(op.last_error.as_deref(), Some("timeout"));

    assert!(outbox.next_batch(at(499), 10).unwrap().is_empty());
    let ready = outbox.next_batch(at(500), 10).unwrap();
    assert_eq!(keys(&ready), vec![(record.id(), 1)]);

    let op = outbox.record_failure(&ready[0], "timeout", at(500)).unwrap();
    assert_eq!(op.next_attempt_at, at(1_500));
}

#[test]
fn exhausted_operation_blocks_only_its_entity() {
    let d = device_with_attempts(2);
    let outbox = d.engine.outbox();
    let stuck = d.repo.create(&scope(), Ticket::new(vec![("Cut", 1)])).unwrap();
    d.repo
        .update(&stuck.id(), |t: &mut Ticket| t.tip_cents = 5)
        .unwrap();
    let other = d.repo.create(&scope(), Service::new("B", 2)).unwrap();

    let op = outbox.next_batch(at(0), 1).unwrap().remove(0);
    assert_eq!(op.key(), (stuck.id(), 1));
    let op = outbox.record_failure(&op, "503", at(0)).unwrap();
    let op = outbox.record_failure(&op, "503", at(10_000)).unwrap();
    assert_eq!(op.status, OperationStatus::Failed);
    assert_eq!(op.attempts, 2);

    let batch = outbox.next_batch(at(60_000), 10).unwrap();
    assert_eq!(keys(&batch), vec![(other.id(), 1)]);
    assert_eq!(keys(&outbox.failed().unwrap()), vec![(stuck.id(), 1)]);
}

#[test]
fn retry_failed_rearms_the_operation() {
    let d = device_with_attempts(1);
    let outbox = d.engine.outbox();
    let record = d.repo.create(&scope(), Service::new("A", 1)).unwrap();
    let op = outbox.next_batch(at(0), 1).unwrap().remove(0);
    let op = outbox.record_failure(&op, "boom", at(0)).unwrap();
    assert_eq!(op.status, OperationStatus::Failed);

    assert!(outbox.retry_failed(&op.id, at(1_000)).unwrap());
    let rearmed = d.store.operation(&op.id).unwrap().unwrap();
    assert_eq!(rearmed.status, OperationStatus::Pending);
    assert_eq!(rearmed.attempts, 0);
    assert_eq!(rearmed.last_error, None);
    assert_eq!(keys(&outbox.next_batch(at(1_000), 10).unwrap()), vec![(record.id(), 1)]);

    // Only failed operations can be re-armed.
    assert!(!outbox.retry_failed(&op.id, at(1_000)).unwrap());
}

#[test]
fn discard_failed_unblocks_the_next_operation() {
    let d = device_with_attempts(1);
    let outbox = d.engine.outbox();
    let record = d.repo.create(&scope(), Service::new("A", 1)).unwrap();
    d.repo
        .update(&record.id(), |s: &mut Service| s.price_cents = 2)
        .unwrap();
    let op = outbox.next_batch(at(0), 1).unwrap().remove(0);
    outbox.record_failure(&op, "boom", at(0)).unwrap();
    assert!(outbox.next_batch(at(60_000), 10).unwrap().is_empty());

    assert!(outbox.discard_failed(&op.id).unwrap());
    assert!(d.store.operation(&op.id).unwrap().is_none());
    assert_eq!(keys(&outbox.next_batch(at(60_000), 10).unwrap()), vec![(record.id(), 2)]);
    assert!(!outbox.discard_failed(&op.id).unwrap());
}

#[test]
fn discard_keeps_the_only_operation_carrying_unsent_changes() {
    let d = device_with_attempts(1);
    let outbox = d.engine.outbox();
    let record = d.repo.create(&scope(), Service::new("A", 1)).unwrap();
    let op = outbox.next_batch(at(0), 1).unwrap().remove(0);
    outbox.record_failure(&op, "boom", at(0)).unwrap();

    let err = outbox.discard_failed(&op.id).unwrap_err();
    assert!(matches!(err, SyncError::UnsentChanges(id) if id == record.id()));
    let kept = d.store.operation(&op.id).unwrap().unwrap();
    assert_eq!(kept.status, OperationStatus::Failed);
    assert_eq!(
        d.store.get(&record.id()).unwrap().unwrap().meta.sync_status,
        SyncStatus::Local
    );

    // A newer snapshot carries the changes, so the failed one can go.
    d.repo
        .update(&record.id(), |s: &mut Service| s.price_cents = 2)
        .unwrap();
    assert!(outbox.discard_failed(&op.id).unwrap());
    assert_eq!(keys(&ops_for(&d, &record.id())), vec![(record.id(), 2)]);
    assert_eq!(keys(&outbox.next_batch(at(60_000), 10).unwrap()), vec![(record.id(), 2)]);
}

#[test]
fn reject_marks_failed_with_reason() {
    let d = device();
    let outbox = d.engine.outbox();
    d.repo.create(&scope(), Service::new("A", 1)).unwrap();
    let op = outbox.next_batch(at(0), 1).unwrap().remove(0);

    let rejected = outbox.reject(&op, "store closed").unwrap();
    assert_eq!(rejected.status, OperationStatus::Failed);
    assert_eq!(rejected.last_error.as_deref(), Some("store closed"));
    assert_eq!(outbox.failed().unwrap().len(), 1);
}

#[test]
fn recover_returns_in_flight_operations_to_pending() {
    let d = device();
    let outbox = d.engine.outbox();
    d.repo.create(&scope(), Service::new("A", 1)).unwrap();
    d.repo.create(&scope(), Service::new("B", 2)).unwrap();
    for op in outbox.next_batch(at(0), 10).unwrap() {
        outbox.mark_in_flight(&op).unwrap();
    }
    assert_eq!(outbox.stats().unwrap().in_flight, 2);

    assert_eq!(outbox.recover().unwrap(), 2);
    assert_eq!(outbox.stats().unwrap().pending, 2);
    assert_eq!(outbox.next_batch(at(0), 10).unwrap().len(), 2);
    assert_eq!(outbox.recover().unwrap(), 0);
}

// ── Acknowledgment ───────────────────────────────────────────────

#[test]
fn settle_done_syncs_the_record_when_current() {
    let d = device();
    let outbox = d.engine.outbox();
    let record = d.repo.create(&scope(), Service::new("A", 1)).unwrap();
    let op = outbox.next_batch(at(0), 1).unwrap().remove(0);

    assert!(outbox.settle_done(&op, 1).unwrap());
    let stored = d.repo.get::<Service>(&record.id()).unwrap().unwrap();
    assert_eq!(stored.meta.sync_status, SyncStatus::Synced);
    assert_eq!(stored.meta.last_synced_version, 1);
    assert_eq!(d.store.operation(&op.id).unwrap().unwrap().status, OperationStatus::Done);
}

#[test]
fn settle_done_of_an_older_version_keeps_record_pending() {
    let d = device();
    let outbox = d.engine.outbox();
    let record = d.repo.create(&scope(), Service::new("A", 1)).unwrap();
    let op = outbox.next_batch(at(0), 1).unwrap().remove(0);
    d.repo
        .update(&record.id(), |s: &mut Service| s.price_cents = 2)
        .unwrap();

    assert!(!outbox.settle_done(&op, 1).unwrap());
    let stored = d.repo.get::<Service>(&record.id()).unwrap().unwrap();
    assert_eq!(stored.meta.sync_status, SyncStatus::Pending);
    assert_eq!(stored.meta.last_synced_version, 1);
    assert_eq!(stored.meta.version, 2);
}

// ── Compaction ───────────────────────────────────────────────────

#[test]
fn compact_folds_updates_into_unsent_create() {
    let d = device();
    let record = d.repo.create(&scope(), Service::new("A", 1)).unwrap();
    for price in 2..5 {
        d.repo
            .update(&record.id(), |s: &mut Service| s.price_cents = price)
            .unwrap();
    }

    assert_eq!(d.engine.outbox().compact().unwrap(), 3);
    let ops = ops_for(&d, &record.id());
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].action, SyncAction::Create);
    assert_eq!(ops[0].version, 4);
    assert_eq!(ops[0].payload.meta.version, 4);
    assert_eq!(ops[0].payload.data["price_cents"], 4);
}

#[test]
fn compact_never_folds_a_delete() {
    let d = device();
    let record = d.repo.create(&scope(), Service::new("A", 1)).unwrap();
    d.repo
        .update(&record.id(), |s: &mut Service| s.price_cents = 2)
        .unwrap();
    d.repo.delete(&record.id()).unwrap();

    assert_eq!(d.engine.outbox().compact().unwrap(), 1);
    let actions: Vec<_> = ops_for(&d, &record.id())
        .iter()
        .map(|op| (op.action, op.version))
        .collect();
    assert_eq!(actions, vec![(SyncAction::Create, 2), (SyncAction::Delete, 3)]);
}

#[test]
fn compact_leaves_attempted_operations_alone() {
    let d = device();
    let outbox = d.engine.outbox();
    let record = d.repo.create(&scope(), Service::new("A", 1)).unwrap();
    let op = outbox.next_batch(at(0), 1).unwrap().remove(0);
    outbox.record_failure(&op, "timeout", at(0)).unwrap();
    for price in 2..4 {
        d.repo
            .update(&record.id(), |s: &mut Service| s.price_cents = price)
            .unwrap();
    }

    assert_eq!(outbox.compact().unwrap(), 1);
    let ops = ops_for(&d, &record.id());
    let actions: Vec<_> = ops.iter().map(|op| (op.action, op.version)).collect();
    assert_eq!(actions, vec![(SyncAction::Create, 1), (SyncAction::Update, 3)]);
    assert_eq!(ops[0].attempts, 1);
}

#[test]
fn stats_count_each_status() {
    let d = device_with_attempts(1);
    let outbox = d.engine.outbox();
    for i in 0..4 {
        d.repo.create(&scope(), Service::new("S", i)).unwrap();
    }
    let batch = outbox.next_batch(at(0), 10).unwrap();
    outbox.mark_in_flight(&batch[0]).unwrap();
    outbox.record_failure(&batch[1], "boom", at(0)).unwrap();
    outbox.settle_done(&batch[2], 1).unwrap();

    assert_eq!(
        outbox.stats().unwrap(),
        OutboxStats {
            pending: 1,
            in_flight: 1,
            failed: 1,
            done: 1,
        }
    );
}

// ── Backoff ──────────────────────────────────────────────────────

#[test]
fn backoff_ceiling_doubles_up_to_the_cap() {
    let backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(5));
    assert_eq!(backoff.ceiling(1), Duration::from_millis(500));
    assert_eq!(backoff.ceiling(2), Duration::from_millis(1_000));
    assert_eq!(backoff.ceiling(4), Duration::from_millis(4_000));
    assert_eq!(backoff.ceiling(5), Duration::from_secs(5));
    assert_eq!(backoff.ceiling(200), Duration::from_secs(5));
}

#[test]
fn jittered_delay_stays_within_ceiling() {
    let backoff = Backoff::default();
    for attempts in 1..12 {
        let ceiling = backoff.ceiling(attempts);
        for _ in 0..20 {
            assert!(backoff.delay(attempts) <= ceiling);
        }
    }
    let exact = backoff.without_jitter();
    assert_eq!(exact.delay(3), Duration::from_millis(2_000));
}
