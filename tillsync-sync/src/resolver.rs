//! Reconciles a remote record state with the local one.
//!
//! The decision is a pure function of the two envelopes and the class
//! policy ([`ConflictResolver::classify`]); [`ConflictResolver::apply`]
//! carries it out inside the caller's store transaction.

use crate::outbox::{drop_superseded, enqueue_snapshot};
use tillsync_clock::CausalOrder;
use tillsync_model::{
    Actor, AuditAction, AuditEntry, ConflictRecord, StoredRecord, SyncAction, SyncStatus,
};
use tillsync_storage::{Expected, StorageResult, StoreTxn};
use tillsync_types::{ClassPolicies, ConflictPolicy, Timestamp};
use tracing::{debug, info, warn};

/// What happened to a remote state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Nothing local; the remote record was stored as synced.
    Insert,
    /// The local clock dominates; the remote state is stale and ignored.
    KeepLocal,
    /// The remote clock dominates; local state was replaced.
    FastForward,
    /// Identical clocks and content.
    Unchanged,
    /// Identical clocks, different content: the later write was kept.
    TieBreak { remote_won: bool },
    /// Concurrent edit settled by the class's last-writer-wins policy.
    LastWriterWins { remote_won: bool },
    /// Concurrent edit retained for explicit resolution.
    Conflict,
    /// The same concurrent remote state is already retained. Only returned
    /// by [`ConflictResolver::apply`].
    ConflictUnchanged,
}

impl Resolution {
    /// Whether the remote state replaced the local one.
    pub fn remote_applied(&self) -> bool {
        matches!(
            self,
            Self::Insert
                | Self::FastForward
                | Self::TieBreak { remote_won: true }
                | Self::LastWriterWins { remote_won: true }
        )
    }
}

pub struct ConflictResolver {
    policies: ClassPolicies,
    actor: Actor,
    max_attempts: u32,
}

impl ConflictResolver {
    /// `actor` signs the re-asserted state when a local write wins a tie.
    pub fn new(policies: ClassPolicies, actor: Actor, max_attempts: u32) -> Self {
        Self {
            policies,
            actor,
            max_attempts,
        }
    }

    pub fn policies(&self) -> &ClassPolicies {
        &self.policies
    }

    /// Decides how `remote` relates to `local`.
    pub fn classify(&self, local: Option<&StoredRecord>, remote: &StoredRecord) -> Resolution {
        let Some(local) = local else {
            return Resolution::Insert;
        };

        match local.meta.vector_clock.compare(&remote.meta.vector_clock) {
            CausalOrder::After => Resolution::KeepLocal,
            CausalOrder::Before => Resolution::FastForward,
            CausalOrder::Equal if local.same_content(remote) => Resolution::Unchanged,
            CausalOrder::Equal => Resolution::TieBreak {
                remote_won: remote_is_later(local, remote),
            },
            CausalOrder::Concurrent => {
                let policy = self.policies.get(remote.class).conflict_policy;
                if policy == ConflictPolicy::LastWriterWins
                    && !remote.class.requires_manual_resolution()
                {
                    Resolution::LastWriterWins {
                        remote_won: remote_is_later(local, remote),
                    }
                } else {
                    Resolution::Conflict
                }
            }
        }
    }

    /// Applies `remote` against the local store.
    pub fn apply(
        &self,
        tx: &mut dyn StoreTxn,
        remote: &StoredRecord,
        now: Timestamp,
    ) -> StorageResult<Resolution> {
        let id = remote.id();
        let local = tx.get(&id)?;
        let resolution = self.classify(local.as_ref(), remote);
        debug!("{} {} v{}: {:?}", remote.entity_type, id, remote.meta.version, resolution);

        let Some(local) = local else {
            adopt(tx, None, remote.clone())?;
            return Ok(resolution);
        };

        match resolution {
            Resolution::Insert | Resolution::KeepLocal | Resolution::ConflictUnchanged => {}
            Resolution::Unchanged => {
                if !local.meta.is_fully_synced() || local.meta.sync_status == SyncStatus::Conflict
                {
                    adopt(tx, Some(&local), local.clone())?;
                }
            }
            Resolution::FastForward => {
                adopt(tx, Some(&local), fast_forwarded(&local, remote))?;
            }
            Resolution::TieBreak { remote_won } => {
                warn!(
                    "{} {} has identical clocks with different content; keeping {} write",
                    remote.entity_type,
                    id,
                    if remote_won { "remote" } else { "local" }
                );
                self.settle_winner(tx, &local, remote, remote_won, now)?;
                tx.append_audit(&AuditEntry::new(
                    remote,
                    AuditAction::DegenerateTie,
                    format!(
                        "v{} tie, kept {} (local updated {}, remote updated {})",
                        remote.meta.version,
                        if remote_won { "remote" } else { "local" },
                        local.meta.updated_at,
                        remote.meta.updated_at
                    ),
                    now,
                ))?;
            }
            Resolution::LastWriterWins { remote_won } => {
                self.settle_winner(tx, &local, remote, remote_won, now)?;
                tx.append_audit(&AuditEntry::new(
                    remote,
                    AuditAction::LastWriterWins,
                    format!(
                        "local v{} vs remote v{}, kept {}",
                        local.meta.version,
                        remote.meta.version,
                        if remote_won { "remote" } else { "local" }
                    ),
                    now,
                ))?;
            }
            Resolution::Conflict => {
                if let Some(mut retained) = tx.conflict(&id)? {
                    if retained.remote.meta.vector_clock == remote.meta.vector_clock
                        && retained.remote.same_content(remote)
                    {
                        if retained.local.meta.version != local.meta.version {
                            retained.local = local.clone();
                            tx.save_conflict(&retained)?;
                        }
                        debug!("conflict on {} {} already retained", remote.entity_type, id);
                        return Ok(Resolution::ConflictUnchanged);
                    }
                }

                let mut marked = local.clone();
                if marked.meta.sync_status != SyncStatus::Conflict {
                    marked.meta.sync_status = SyncStatus::Conflict;
                    tx.put(&marked, Expected::Version(local.meta.version))?;
                }
                tx.save_conflict(&ConflictRecord {
                    entity_type: remote.entity_type.clone(),
                    entity_id: id,
                    local: marked,
                    remote: remote.clone(),
                    detected_at: now,
                })?;
                tx.append_audit(&AuditEntry::new(
                    remote,
                    AuditAction::ConflictDetected,
                    format!(
                        "local v{} and remote v{} are concurrent",
                        local.meta.version, remote.meta.version
                    ),
                    now,
                ))?;
                info!("conflict on {} {}", remote.entity_type, id);
            }
        }
        Ok(resolution)
    }

    fn settle_winner(
        &self,
        tx: &mut dyn StoreTxn,
        local: &StoredRecord,
        remote: &StoredRecord,
        remote_won: bool,
        now: Timestamp,
    ) -> StorageResult<()> {
        if remote_won {
            return adopt(tx, Some(local), fast_forwarded(local, remote));
        }

        // Re-assert the local state with a clock that dominates both sides so
        // every device converges on it.
        let mut winner = local.clone();
        winner.meta.vector_clock = local.meta.vector_clock.merged(&remote.meta.vector_clock);
        winner.meta.version = local.meta.version.max(remote.meta.version);
        winner.meta.bump(&self.actor, now);
        tx.put(&winner, Expected::Version(local.meta.version))?;
        tx.clear_conflict(&winner.id())?;
        drop_superseded(tx, &winner.id())?;

        let action = if winner.meta.is_deleted {
            SyncAction::Delete
        } else {
            SyncAction::Update
        };
        enqueue_snapshot(tx, action, &winner, &self.policies, self.max_attempts, now)
    }
}

/// Later `updated_at` wins; the device id breaks exact ties so both sides
/// pick the same winner.
fn remote_is_later(local: &StoredRecord, remote: &StoredRecord) -> bool {
    (remote.meta.updated_at, remote.meta.last_modified_by_device)
        > (local.meta.updated_at, local.meta.last_modified_by_device)
}

fn fast_forwarded(local: &StoredRecord, remote: &StoredRecord) -> StoredRecord {
    let mut next = remote.clone();
    next.meta.vector_clock = local.meta.vector_clock.merged(&remote.meta.vector_clock);
    next.meta.version = local.meta.version.max(remote.meta.version);
    next
}

/// Stores `winner` as the acknowledged server state.
fn adopt(
    tx: &mut dyn StoreTxn,
    local: Option<&StoredRecord>,
    mut winner: StoredRecord,
) -> StorageResult<()> {
    winner.meta.sync_status = SyncStatus::Synced;
    winner.meta.last_synced_version = winner.meta.version;

    let expected = local.map_or(Expected::Absent, |l| Expected::Version(l.meta.version));
    tx.put(&winner, expected)?;
    if local.is_some() {
        tx.clear_conflict(&winner.id())?;
        drop_superseded(tx, &winner.id())?;
    }
    Ok(())
}
