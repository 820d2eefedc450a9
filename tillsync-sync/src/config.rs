//! Sync configuration.

use crate::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tillsync_types::{ClassPolicies, ClassPolicyOverride, DeviceId, EntityClass, StoreId, UserId};

/// Configuration for the repository and the sync engine.
///
/// Every field has a default, so a JSON document only needs the values it
/// changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// This install's identity; the vector clock key for local writes.
    pub device_id: DeviceId,
    /// The signed-in staff member stamped on local writes.
    pub user_id: UserId,
    /// Maximum operations taken from the outbox per push batch.
    pub batch_size: usize,
    /// Push attempts before an operation is marked failed.
    pub max_attempts: u32,
    /// First retry delay (ms).
    pub backoff_base_ms: u64,
    /// Upper bound on any retry delay (ms).
    pub backoff_max_ms: u64,
    /// Interval between background push/pull cycles (ms).
    pub sync_interval_ms: u64,
    /// Interval between tombstone sweeps (ms).
    pub gc_interval_ms: u64,
    /// Per-class priority, retention and conflict policy overrides.
    pub class_overrides: BTreeMap<EntityClass, ClassPolicyOverride>,
    /// Stores this device pulls changes for.
    pub store_ids: Vec<StoreId>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            device_id: DeviceId::new(),
            user_id: UserId::new("local"),
            batch_size: 100,
            max_attempts: 5,
            backoff_base_ms: 500,
            backoff_max_ms: 300_000,
            sync_interval_ms: 30_000,
            gc_interval_ms: 3_600_000,
            class_overrides: BTreeMap::new(),
            store_ids: Vec::new(),
        }
    }
}

impl SyncConfig {
    /// Parses and validates a JSON configuration document.
    pub fn from_json_str(json: &str) -> SyncResult<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| SyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> SyncResult<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Checks limits and class overrides.
    pub fn validate(&self) -> SyncResult<()> {
        if self.batch_size == 0 {
            return Err(SyncError::Config("batch_size must be positive".into()));
        }
        if self.max_attempts == 0 {
            return Err(SyncError::Config("max_attempts must be positive".into()));
        }
        if self.backoff_base_ms == 0 || self.backoff_max_ms < self.backoff_base_ms {
            return Err(SyncError::Config(format!(
                "backoff range {}..{}ms is empty",
                self.backoff_base_ms, self.backoff_max_ms
            )));
        }
        if self.sync_interval_ms == 0 || self.gc_interval_ms == 0 {
            return Err(SyncError::Config("intervals must be positive".into()));
        }
        self.class_policies().map(|_| ())
    }

    /// Default class policies with the configured overrides applied.
    pub fn class_policies(&self) -> SyncResult<ClassPolicies> {
        let mut policies = ClassPolicies::default();
        for (class, ov) in &self.class_overrides {
            policies
                .apply_override(*class, ov)
                .map_err(|e| SyncError::Config(e.to_string()))?;
        }
        Ok(policies)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_millis(self.gc_interval_ms)
    }
}
