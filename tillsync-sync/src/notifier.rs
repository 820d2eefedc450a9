//! Realtime notifier seam.
//!
//! Whatever transport delivers server pushes (websocket, platform push) hands
//! its signals to a [`SyncNotifier`]; the engine loop consumes them.

use crate::{SyncError, SyncResult};
use tillsync_types::EntityId;
use tokio::sync::mpsc;

/// A signal from the realtime channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncSignal {
    /// Something changed on the server; pull now.
    SyncRequired,
    /// The server flagged a conflict on a record.
    ConflictReported { entity_id: EntityId },
}

/// Cloneable callback handle into a running engine.
#[derive(Debug, Clone)]
pub struct SyncNotifier {
    tx: mpsc::UnboundedSender<SyncSignal>,
}

impl SyncNotifier {
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<SyncSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Delivers a signal. Fails once the engine has shut down.
    pub fn notify(&self, signal: SyncSignal) -> SyncResult<()> {
        self.tx.send(signal).map_err(|_| SyncError::ChannelClosed)
    }

    pub fn sync_required(&self) -> SyncResult<()> {
        self.notify(SyncSignal::SyncRequired)
    }

    pub fn conflict_reported(&self, entity_id: EntityId) -> SyncResult<()> {
        self.notify(SyncSignal::ConflictReported { entity_id })
    }
}
