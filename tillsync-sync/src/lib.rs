//! Offline-first sync core for tillsync.
//!
//! Every screen works against the local store; the network is a background
//! concern.
//!
//! # Architecture
//!
//! - **Repository**: the local write path. Bumps version and vector clock,
//!   writes the record and enqueues its outbox operation in one transaction
//! - **Outbox**: durable, priority-ordered queue with per-entity ordering and
//!   bounded exponential retry
//! - **Resolver**: compares vector clocks and fast-forwards, ignores, or
//!   retains a conflict according to the entity class policy
//! - **Engine**: pulls changes, pushes the outbox, and runs tombstone GC on
//!   a background task
//! - **Remote / Notifier**: the seams to the server API and the realtime
//!   channel
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use tillsync_storage::SqliteStore;
//! use tillsync_sync::{SyncConfig, SyncRepository};
//!
//! let store = Arc::new(SqliteStore::open_in_memory().unwrap());
//! let config = SyncConfig::default();
//! let repo = SyncRepository::from_config(store, &config).unwrap();
//! assert_eq!(repo.actor().device, config.device_id);
//! ```

mod config;
mod engine;
mod error;
mod gc;
mod notifier;
mod outbox;
pub mod remote;
mod repository;
mod resolver;

pub use config::SyncConfig;
pub use engine::{CycleReport, PullReport, PushReport, SyncEngine, SyncEvent, SyncHandle};
pub use error::{SyncError, SyncResult};
pub use gc::{GcReport, TombstoneCollector};
pub use notifier::{SyncNotifier, SyncSignal};
pub use outbox::{Backoff, Outbox, OutboxStats};
pub use remote::{PullPage, PushResponse, RemoteApi, RemoteError};
pub use repository::{ConflictChoice, SyncRepository};
pub use resolver::{ConflictResolver, Resolution};
