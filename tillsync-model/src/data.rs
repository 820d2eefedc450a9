use serde::Serialize;
use serde::de::DeserializeOwned;
use tillsync_types::EntityClass;

/// Implemented by every domain type that is stored through the sync core.
///
/// The generic repository handles versioning, outbox enqueueing and
/// tombstones; a domain type only declares its name and class and,
/// optionally, how to recompute derived fields and validate itself.
pub trait SyncableData: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Stable type name, used as the storage partition and on the wire.
    const ENTITY_TYPE: &'static str;

    /// Class used to look up outbox priority, tombstone retention and
    /// conflict policy.
    const CLASS: EntityClass;

    /// Recomputes derived values (totals, tax, balances) from source fields.
    ///
    /// Runs on every local write, so a stale derived value supplied by the
    /// caller is always overwritten.
    fn recompute_derived(&mut self) {}

    /// Validates the record before it is persisted.
    /// Return `Err(message)` to reject the write; nothing reaches the outbox.
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}
