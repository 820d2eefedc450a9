//! Remote API seam.
//!
//! The engine talks to the server only through [`RemoteApi`]. Pushes carry
//! the full record snapshot at the operation's version, so the server can
//! deduplicate by `(entity_id, version)` and a retransmitted operation is
//! harmless.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tillsync_model::{StoredRecord, SyncOperation};
use tillsync_types::{Cursor, StoreId};

/// Transient failures talking to the server. Always retryable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,
}

/// Server verdict on a pushed operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushResponse {
    /// Stored at `version`.
    Accepted { version: u64 },
    /// Permanently refused (schema mismatch, authorization). Never retried.
    Rejected { reason: String },
    /// The server holds a state that the pushed snapshot does not dominate.
    ConflictDetected { remote: StoredRecord },
}

/// One page of changes since a cursor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullPage {
    pub records: Vec<StoredRecord>,
    /// Position after this page; `None` when nothing changed.
    pub next_cursor: Option<Cursor>,
    pub has_more: bool,
}

/// Server operations consumed by the sync engine.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Sends one operation.
    async fn push(&self, op: &SyncOperation) -> Result<PushResponse, RemoteError>;

    /// Fetches records of a store changed after `cursor`.
    async fn pull(
        &self,
        store_id: &StoreId,
        cursor: Option<&Cursor>,
    ) -> Result<PullPage, RemoteError>;
}

/// In-memory server used by tests.
pub mod mock {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tillsync_clock::VectorClock;
    use tillsync_types::EntityId;

    #[derive(Debug, Default)]
    struct ServerState {
        records: HashMap<EntityId, StoredRecord>,
        /// `(seq, entity)` change log; cursors are positions in it.
        changes: Vec<(u64, EntityId)>,
        next_seq: u64,
        /// Clock of every snapshot accepted per `(entity, version)` key.
        applied: HashMap<(EntityId, u64), VectorClock>,
        pushes: Vec<(EntityId, u64)>,
        push_faults: Vec<RemoteError>,
        pull_faults: Vec<RemoteError>,
        stale_answers: Vec<StoredRecord>,
        rejections: HashMap<EntityId, String>,
    }

    impl ServerState {
        fn store(&mut self, record: StoredRecord) {
            let id = record.id();
            self.next_seq += 1;
            self.changes.push((self.next_seq, id));
            self.records.insert(id, record);
        }
    }

    /// A server that accepts any snapshot whose clock dominates what it
    /// holds and reports a conflict otherwise.
    #[derive(Debug)]
    pub struct InMemoryRemote {
        state: Mutex<ServerState>,
        page_size: usize,
    }

    impl Default for InMemoryRemote {
        fn default() -> Self {
            Self::new()
        }
    }

    impl InMemoryRemote {
        pub fn new() -> Self {
            Self::with_page_size(500)
        }

        /// A server that returns at most `page_size` records per pull.
        pub fn with_page_size(page_size: usize) -> Self {
            Self {
                state: Mutex::new(ServerState::default()),
                page_size: page_size.max(1),
            }
        }

        fn state(&self) -> std::sync::MutexGuard<'_, ServerState> {
            self.state.lock().unwrap_or_else(|e| e.into_inner())
        }

        /// Fails the next `n` pushes with `error`.
        pub fn fail_next_pushes(&self, n: usize, error: RemoteError) {
            let mut state = self.state();
            state.push_faults.extend(std::iter::repeat_n(error, n));
        }

        /// Fails the next `n` pulls with `error`.
        pub fn fail_next_pulls(&self, n: usize, error: RemoteError) {
            let mut state = self.state();
            state.pull_faults.extend(std::iter::repeat_n(error, n));
        }

        /// Answers the next `n` pushes with a conflict carrying `record`, as
        /// a server reading from a lagging replica would.
        pub fn answer_next_pushes_with(&self, n: usize, record: StoredRecord) {
            let mut state = self.state();
            state.stale_answers.extend(std::iter::repeat_n(record, n));
        }

        /// Permanently rejects every push for `entity_id`.
        pub fn reject_entity(&self, entity_id: EntityId, reason: impl Into<String>) {
            self.state().rejections.insert(entity_id, reason.into());
        }

        /// Stores a record as if another device had pushed it.
        pub fn seed(&self, record: StoredRecord) {
            let mut state = self.state();
            state
                .applied
                .insert((record.id(), record.meta.version), record.meta.vector_clock.clone());
            state.store(record);
        }

        /// The server's copy of a record.
        pub fn record(&self, id: &EntityId) -> Option<StoredRecord> {
            self.state().records.get(id).cloned()
        }

        /// Every push that reached the server (including duplicates), in order.
        pub fn pushes(&self) -> Vec<(EntityId, u64)> {
            self.state().pushes.clone()
        }

        /// Number of pushes received for one entity.
        pub fn push_count(&self, id: &EntityId) -> usize {
            self.state().pushes.iter().filter(|(e, _)| e == id).count()
        }
    }

    #[async_trait]
    impl RemoteApi for InMemoryRemote {
        async fn push(&self, op: &SyncOperation) -> Result<PushResponse, RemoteError> {
            let mut state = self.state();
            if !state.push_faults.is_empty() {
                return Err(state.push_faults.remove(0));
            }
            state.pushes.push(op.key());
            if !state.stale_answers.is_empty() {
                let remote = state.stale_answers.remove(0);
                return Ok(PushResponse::ConflictDetected { remote });
            }

            if let Some(reason) = state.rejections.get(&op.entity_id) {
                return Ok(PushResponse::Rejected {
                    reason: reason.clone(),
                });
            }
            // A retransmission of an accepted snapshot. Another device's
            // write at the same version number is not.
            if state.applied.get(&op.key()) == Some(&op.payload.meta.vector_clock) {
                return Ok(PushResponse::Accepted {
                    version: op.version,
                });
            }
            if let Some(current) = state.records.get(&op.entity_id) {
                if !op
                    .payload
                    .meta
                    .vector_clock
                    .dominates(&current.meta.vector_clock)
                {
                    return Ok(PushResponse::ConflictDetected {
                        remote: current.clone(),
                    });
                }
            }

            state
                .applied
                .insert(op.key(), op.payload.meta.vector_clock.clone());
            state.store(op.payload.clone());
            Ok(PushResponse::Accepted {
                version: op.version,
            })
        }

        async fn pull(
            &self,
            store_id: &StoreId,
            cursor: Option<&Cursor>,
        ) -> Result<PullPage, RemoteError> {
            let mut state = self.state();
            if !state.pull_faults.is_empty() {
                return Err(state.pull_faults.remove(0));
            }

            let after = cursor
                .and_then(|c| c.as_str().parse::<u64>().ok())
                .unwrap_or(0);

            // Latest change per entity, in change order.
            let mut latest: HashMap<EntityId, u64> = HashMap::new();
            for (seq, id) in state.changes.iter().filter(|(seq, _)| *seq > after) {
                latest.insert(*id, *seq);
            }
            let mut changed: Vec<(u64, EntityId)> = latest
                .into_iter()
                .map(|(id, seq)| (seq, id))
                .filter(|(_, id)| {
                    state
                        .records
                        .get(id)
                        .is_some_and(|r| &r.meta.store_id == store_id)
                })
                .collect();
            changed.sort();

            let has_more = changed.len() > self.page_size;
            changed.truncate(self.page_size);

            let next_cursor = changed.last().map(|(seq, _)| Cursor::new(seq.to_string()));
            let records = changed
                .iter()
                .filter_map(|(_, id)| state.records.get(id).cloned())
                .collect();

            Ok(PullPage {
                records,
                next_cursor,
                has_more,
            })
        }
    }
}
