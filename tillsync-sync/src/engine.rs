//! Background push/pull coordinator.
//!
//! The engine never touches records on the caller's thread: every store
//! access runs on the blocking pool, and only remote calls suspend. Each
//! settled push and each pulled page is one store transaction, so a cycle
//! can be dropped at any await point and resumes cleanly from the outbox.

use crate::gc::{GcReport, TombstoneCollector};
use crate::notifier::{SyncNotifier, SyncSignal};
use crate::outbox::{Backoff, Outbox, settle_done_in};
use crate::remote::{PushResponse, RemoteApi};
use crate::resolver::{ConflictResolver, Resolution};
use crate::{SyncConfig, SyncError, SyncResult};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tillsync_model::{Actor, OperationStatus, StoredRecord, SyncOperation};
use tillsync_storage::{LocalStore, StorageError};
use tillsync_types::{EntityId, OperationId, StoreId, SystemTimeSource, TimeSource};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 256;

/// Something the UI may want to surface.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// The server stored an operation.
    OperationAccepted {
        entity_id: EntityId,
        version: u64,
        /// False when a newer local version is still queued.
        synced: bool,
    },
    /// An operation ran out of attempts or was rejected.
    OperationFailed {
        operation_id: OperationId,
        entity_id: EntityId,
        reason: String,
    },
    /// A concurrent edit needs explicit resolution.
    ConflictDetected {
        entity_id: EntityId,
        entity_type: String,
    },
    /// The realtime channel flagged a conflict.
    ConflictReported { entity_id: EntityId },
    PushCompleted(PushReport),
    PullCompleted(PullReport),
    PullFailed { store_id: StoreId, error: String },
    GcCompleted(GcReport),
}

/// Counts for one push pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushReport {
    pub recovered: usize,
    pub compacted: usize,
    pub accepted: usize,
    pub rejected: usize,
    /// Operations whose state the server already superseded.
    pub superseded: usize,
    pub conflicts: usize,
    /// Transient failures scheduled for another attempt.
    pub retried: usize,
    /// Operations that ran out of attempts.
    pub failed: usize,
}

/// Counts for one store's pull.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullReport {
    pub store_id: StoreId,
    pub pages: usize,
    pub applied: usize,
    pub unchanged: usize,
    pub kept_local: usize,
    pub conflicts: usize,
}

impl PullReport {
    fn new(store_id: StoreId) -> Self {
        Self {
            store_id,
            pages: 0,
            applied: 0,
            unchanged: 0,
            kept_local: 0,
            conflicts: 0,
        }
    }
}

/// Result of a full pull + push cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub pulls: Vec<PullReport>,
    pub failed_pulls: Vec<StoreId>,
    pub push: PushReport,
}

enum EngineCommand {
    SyncNow(oneshot::Sender<SyncResult<CycleReport>>),
    Shutdown,
}

/// Coordinates the outbox, the remote API and the resolver.
pub struct SyncEngine<S, R> {
    store: Arc<S>,
    remote: Arc<R>,
    outbox: Outbox<S>,
    resolver: Arc<ConflictResolver>,
    collector: TombstoneCollector<S>,
    config: SyncConfig,
    clock: Arc<dyn TimeSource>,
    events: broadcast::Sender<SyncEvent>,
}

impl<S: LocalStore, R: RemoteApi + 'static> SyncEngine<S, R> {
    pub fn new(store: Arc<S>, remote: Arc<R>, config: SyncConfig) -> SyncResult<Self> {
        Self::with_clock(store, remote, config, Arc::new(SystemTimeSource))
    }

    pub fn with_clock(
        store: Arc<S>,
        remote: Arc<R>,
        config: SyncConfig,
        clock: Arc<dyn TimeSource>,
    ) -> SyncResult<Self> {
        config.validate()?;
        let backoff = Backoff::new(
            Duration::from_millis(config.backoff_base_ms),
            Duration::from_millis(config.backoff_max_ms),
        );
        let resolver = ConflictResolver::new(
            config.class_policies()?,
            Actor::new(config.user_id.clone(), config.device_id),
            config.max_attempts,
        );
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            outbox: Outbox::new(Arc::clone(&store), backoff),
            collector: TombstoneCollector::new(Arc::clone(&store)),
            resolver: Arc::new(resolver),
            store,
            remote,
            config,
            clock,
            events,
        })
    }

    /// Replaces the retry schedule.
    #[must_use]
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.outbox = Outbox::new(Arc::clone(&self.store), backoff);
        self
    }

    pub fn outbox(&self) -> &Outbox<S> {
        &self.outbox
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SyncEvent) {
        // Having no subscribers is normal.
        let _ = self.events.send(event);
    }

    async fn blocking<T, F>(&self, f: F) -> SyncResult<T>
    where
        F: FnOnce() -> SyncResult<T> + Send + 'static,
        T: Send + 'static,
    {
        tokio::task::spawn_blocking(f).await?
    }

    // ── Push ─────────────────────────────────────────────────────

    /// Drains the outbox once.
    ///
    /// Each operation is attempted at most once per pass; a transient
    /// failure only delays that operation's entity.
    pub async fn push_once(&self) -> SyncResult<PushReport> {
        let mut report = PushReport::default();

        let outbox = self.outbox.clone();
        let (recovered, compacted) =
            self.blocking(move || Ok((outbox.recover()?, outbox.compact()?))).await?;
        report.recovered = recovered;
        report.compacted = compacted;

        let mut attempted: HashSet<OperationId> = HashSet::new();
        loop {
            let outbox = self.outbox.clone();
            let now = self.clock.now();
            let limit = self.config.batch_size;
            let skip = attempted.clone();
            let batch = self
                .blocking(move || outbox.next_batch_excluding(now, limit, &skip))
                .await?;
            if batch.is_empty() {
                break;
            }
            for op in batch {
                attempted.insert(op.id);
                self.push_operation(op, &mut report).await?;
            }
        }

        if attempted.is_empty() {
            debug!("push: outbox empty");
        } else {
            info!(
                "push: {} accepted, {} superseded, {} conflicts, {} retried, {} failed, {} rejected",
                report.accepted,
                report.superseded,
                report.conflicts,
                report.retried,
                report.failed,
                report.rejected
            );
        }
        self.emit(SyncEvent::PushCompleted(report.clone()));
        Ok(report)
    }

    async fn push_operation(&self, op: SyncOperation, report: &mut PushReport) -> SyncResult<()> {
        let outbox = self.outbox.clone();
        let op = self.blocking(move || outbox.mark_in_flight(&op)).await?;
        debug!("pushing {} {} v{}", op.action, op.entity_id, op.version);

        match self.remote.push(&op).await {
            Ok(PushResponse::Accepted { version }) => {
                let outbox = self.outbox.clone();
                let settled = op.clone();
                let synced = self
                    .blocking(move || outbox.settle_done(&settled, version))
                    .await?;
                report.accepted += 1;
                self.emit(SyncEvent::OperationAccepted {
                    entity_id: op.entity_id,
                    version,
                    synced,
                });
            }
            Ok(PushResponse::Rejected { reason }) => {
                let outbox = self.outbox.clone();
                let rejected = op.clone();
                let why = reason.clone();
                self.blocking(move || outbox.reject(&rejected, &why)).await?;
                report.rejected += 1;
                self.emit(SyncEvent::OperationFailed {
                    operation_id: op.id,
                    entity_id: op.entity_id,
                    reason,
                });
            }
            Ok(PushResponse::ConflictDetected { remote }) => {
                self.settle_conflict(op, remote, report).await?;
            }
            Err(err) => {
                let outbox = self.outbox.clone();
                let now = self.clock.now();
                let reason = err.to_string();
                let failed = op.clone();
                let op = self
                    .blocking(move || outbox.record_failure(&failed, &reason, now))
                    .await?;
                self.note_failure(&op, report);
            }
        }
        Ok(())
    }

    /// Runs the server's state through the resolver and settles the
    /// in-flight operation in the same transaction.
    async fn settle_conflict(
        &self,
        op: SyncOperation,
        remote: StoredRecord,
        report: &mut PushReport,
    ) -> SyncResult<()> {
        let store = Arc::clone(&self.store);
        let resolver = Arc::clone(&self.resolver);
        let outbox = self.outbox.clone();
        let now = self.clock.now();
        let pushed = op.clone();

        let (resolution, settled) = self
            .blocking(move || {
                let outcome = store.transaction(|tx| {
                    let resolution = resolver.apply(tx, &remote, now)?;
                    let settled = match resolution {
                        Resolution::Conflict | Resolution::ConflictUnchanged => {
                            let mut held = pushed.clone();
                            held.status = OperationStatus::Pending;
                            tx.update_operation(&held)?;
                            Some(held)
                        }
                        // The server refused a write its own state is behind.
                        // Retried with backoff; exhaustion surfaces it as
                        // `OperationFailed` with this reason.
                        Resolution::KeepLocal => Some(outbox.fail_in(
                            tx,
                            &pushed,
                            "server reported a conflict with an older state",
                            now,
                        )?),
                        Resolution::Unchanged => {
                            settle_done_in(tx, &pushed, pushed.version)?;
                            None
                        }
                        _ => {
                            tx.remove_operation(&pushed.id)?;
                            None
                        }
                    };
                    Ok::<_, StorageError>((resolution, settled))
                })?;
                Ok(outcome)
            })
            .await?;

        match (resolution, settled) {
            (Resolution::Conflict, _) => {
                report.conflicts += 1;
                self.emit(SyncEvent::ConflictDetected {
                    entity_id: op.entity_id,
                    entity_type: op.entity_type.clone(),
                });
            }
            (Resolution::ConflictUnchanged, _) => report.conflicts += 1,
            (Resolution::KeepLocal, Some(failed)) => self.note_failure(&failed, report),
            (Resolution::Unchanged, _) => {
                report.accepted += 1;
                self.emit(SyncEvent::OperationAccepted {
                    entity_id: op.entity_id,
                    version: op.version,
                    synced: true,
                });
            }
            _ => report.superseded += 1,
        }
        Ok(())
    }

    fn note_failure(&self, op: &SyncOperation, report: &mut PushReport) {
        if op.status == OperationStatus::Failed {
            report.failed += 1;
            self.emit(SyncEvent::OperationFailed {
                operation_id: op.id,
                entity_id: op.entity_id,
                reason: op.last_error.clone().unwrap_or_default(),
            });
        } else {
            report.retried += 1;
        }
    }

    // ── Pull ─────────────────────────────────────────────────────

    /// Fetches and applies every change for a store since its cursor.
    pub async fn pull_once(&self, store_id: &StoreId) -> SyncResult<PullReport> {
        let mut report = PullReport::new(store_id.clone());

        loop {
            let store = Arc::clone(&self.store);
            let sid = store_id.clone();
            let cursor = self.blocking(move || Ok(store.cursor(&sid)?)).await?;

            let page = self.remote.pull(store_id, cursor.as_ref()).await?;
            let has_more = page.has_more && page.next_cursor.is_some();

            let store = Arc::clone(&self.store);
            let resolver = Arc::clone(&self.resolver);
            let sid = store_id.clone();
            let now = self.clock.now();
            let outcomes = self
                .blocking(move || {
                    let outcomes = store.transaction(|tx| {
                        let mut outcomes = Vec::with_capacity(page.records.len());
                        for remote in &page.records {
                            let resolution = resolver.apply(tx, remote, now)?;
                            outcomes.push((remote.id(), remote.entity_type.clone(), resolution));
                        }
                        if let Some(next) = &page.next_cursor {
                            tx.set_cursor(&sid, next, now)?;
                        }
                        Ok::<_, StorageError>(outcomes)
                    })?;
                    Ok(outcomes)
                })
                .await?;

            report.pages += 1;
            for (entity_id, entity_type, resolution) in outcomes {
                match resolution {
                    Resolution::Conflict => {
                        report.conflicts += 1;
                        self.emit(SyncEvent::ConflictDetected {
                            entity_id,
                            entity_type,
                        });
                    }
                    Resolution::Unchanged | Resolution::ConflictUnchanged => {
                        report.unchanged += 1;
                    }
                    r if r.remote_applied() => report.applied += 1,
                    _ => report.kept_local += 1,
                }
            }

            if !has_more {
                break;
            }
        }

        info!(
            "pull {}: {} pages, {} applied, {} unchanged, {} kept local, {} conflicts",
            store_id,
            report.pages,
            report.applied,
            report.unchanged,
            report.kept_local,
            report.conflicts
        );
        self.emit(SyncEvent::PullCompleted(report.clone()));
        Ok(report)
    }

    /// Pulls every configured store, logging and reporting failures.
    async fn pull_all(&self) -> (Vec<PullReport>, Vec<StoreId>) {
        let mut pulls = Vec::new();
        let mut failed = Vec::new();
        for store_id in &self.config.store_ids {
            match self.pull_once(store_id).await {
                Ok(report) => pulls.push(report),
                Err(e) => {
                    warn!("pull for store {} failed: {}", store_id, e);
                    self.emit(SyncEvent::PullFailed {
                        store_id: store_id.clone(),
                        error: e.to_string(),
                    });
                    failed.push(store_id.clone());
                }
            }
        }
        (pulls, failed)
    }

    /// Pulls every configured store, then drains the outbox.
    ///
    /// Pulling first lets the resolver see concurrent edits before the
    /// server has to report them on push.
    pub async fn sync_cycle(&self) -> SyncResult<CycleReport> {
        let (pulls, failed_pulls) = self.pull_all().await;
        let push = self.push_once().await?;
        Ok(CycleReport {
            pulls,
            failed_pulls,
            push,
        })
    }

    /// Runs one tombstone sweep.
    pub async fn collect_garbage(&self) -> SyncResult<GcReport> {
        let collector = self.collector.clone();
        let now = self.clock.now();
        let report = self.blocking(move || collector.sweep(now)).await?;
        self.emit(SyncEvent::GcCompleted(report.clone()));
        Ok(report)
    }

    // ── Background loop ──────────────────────────────────────────

    /// Moves the engine onto a background task.
    pub fn spawn(self) -> SyncHandle {
        let engine = Arc::new(self);
        let (commands, command_rx) = mpsc::channel(16);
        let (notifier, signal_rx) = SyncNotifier::channel();
        let events = engine.events.clone();
        let task = tokio::spawn(engine.run(command_rx, signal_rx));
        SyncHandle {
            commands,
            notifier,
            events,
            task,
        }
    }

    async fn run(
        self: Arc<Self>,
        mut commands: mpsc::Receiver<EngineCommand>,
        mut signals: mpsc::UnboundedReceiver<SyncSignal>,
    ) {
        let mut sync_tick = tokio::time::interval(self.config.sync_interval());
        sync_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut gc_tick = tokio::time::interval(self.config.gc_interval());
        gc_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("sync engine started for device {}", self.config.device_id);
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(EngineCommand::SyncNow(reply)) => {
                        let result = self.sync_cycle().await;
                        if reply.send(result).is_err() {
                            debug!("sync_now caller went away");
                        }
                    }
                    Some(EngineCommand::Shutdown) | None => break,
                },
                Some(signal) = signals.recv() => self.handle_signal(signal).await,
                _ = sync_tick.tick() => {
                    if let Err(e) = self.sync_cycle().await {
                        warn!("sync cycle failed: {}", e);
                    }
                }
                _ = gc_tick.tick() => {
                    if let Err(e) = self.collect_garbage().await {
                        warn!("tombstone sweep failed: {}", e);
                    }
                }
            }
        }
        info!("sync engine stopped");
    }

    async fn handle_signal(&self, signal: SyncSignal) {
        match signal {
            SyncSignal::SyncRequired => {
                debug!("realtime: sync required");
            }
            SyncSignal::ConflictReported { entity_id } => {
                info!("realtime: conflict reported on {}", entity_id);
                self.emit(SyncEvent::ConflictReported { entity_id });
            }
        }
        self.pull_all().await;
    }
}

/// Control handle for a spawned engine.
pub struct SyncHandle {
    commands: mpsc::Sender<EngineCommand>,
    notifier: SyncNotifier,
    events: broadcast::Sender<SyncEvent>,
    task: JoinHandle<()>,
}

impl SyncHandle {
    /// Runs a full cycle now and waits for its report.
    pub async fn sync_now(&self) -> SyncResult<CycleReport> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(EngineCommand::SyncNow(reply))
            .await
            .map_err(|_| SyncError::ChannelClosed)?;
        rx.await.map_err(|_| SyncError::ChannelClosed)?
    }

    /// Handle for the realtime channel.
    pub fn notifier(&self) -> SyncNotifier {
        self.notifier.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Stops the loop after the current step and waits for it.
    pub async fn shutdown(self) -> SyncResult<()> {
        if self.commands.send(EngineCommand::Shutdown).await.is_err() {
            debug!("sync engine already stopped");
        }
        self.task.await?;
        Ok(())
    }
}
