//! The sync envelope carried by every record.

use crate::ModelError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tillsync_clock::VectorClock;
use tillsync_types::{DeviceId, EntityId, StoreId, TenantId, Timestamp, UserId};

/// Where a record lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    pub tenant_id: TenantId,
    pub store_id: StoreId,
}

impl Scope {
    pub fn new(tenant_id: impl Into<TenantId>, store_id: impl Into<StoreId>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            store_id: store_id.into(),
        }
    }
}

/// Who is writing: the signed-in user on a specific device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Actor {
    pub user: UserId,
    pub device: DeviceId,
}

impl Actor {
    pub fn new(user: impl Into<UserId>, device: DeviceId) -> Self {
        Self {
            user: user.into(),
            device,
        }
    }
}

/// Replication state of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Created on this device and never acknowledged by the server.
    Local,
    /// Has local changes waiting in the outbox.
    Pending,
    /// Matches what the server has acknowledged.
    Synced,
    /// Diverged from a concurrent remote edit; awaiting explicit resolution.
    Conflict,
}

impl SyncStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Pending => "pending",
            Self::Synced => "synced",
            Self::Conflict => "conflict",
        }
    }

    /// Whether the record still has work in the outbox.
    #[must_use]
    pub const fn has_unsent_changes(&self) -> bool {
        matches!(self, Self::Local | Self::Pending)
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(Self::Local),
            "pending" => Ok(Self::Pending),
            "synced" => Ok(Self::Synced),
            "conflict" => Ok(Self::Conflict),
            other => Err(ModelError::UnknownVariant {
                kind: "sync status",
                value: other.to_string(),
            }),
        }
    }
}

/// Versioning and lifecycle metadata shared by every syncable record.
///
/// The local write path is the only code that moves `version` and
/// `vector_clock` forward for local edits; the resolver only ever replaces
/// them with a remote state that dominates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: EntityId,
    pub tenant_id: TenantId,
    pub store_id: StoreId,
    pub version: u64,
    pub vector_clock: VectorClock,
    pub last_synced_version: u64,
    pub sync_status: SyncStatus,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub created_by: UserId,
    pub created_by_device: DeviceId,
    pub last_modified_by: UserId,
    pub last_modified_by_device: DeviceId,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default)]
    pub deleted_at: Option<Timestamp>,
    #[serde(default)]
    pub deleted_by: Option<UserId>,
    #[serde(default)]
    pub deleted_by_device: Option<DeviceId>,
    #[serde(default)]
    pub tombstone_expires_at: Option<Timestamp>,
}

impl Envelope {
    /// Stamps the envelope of a freshly created record at version 1.
    #[must_use]
    pub fn new(id: EntityId, scope: &Scope, actor: &Actor, now: Timestamp) -> Self {
        Self {
            id,
            tenant_id: scope.tenant_id.clone(),
            store_id: scope.store_id.clone(),
            version: 1,
            vector_clock: VectorClock::with_entry(actor.device, 1),
            last_synced_version: 0,
            sync_status: SyncStatus::Local,
            created_at: now,
            updated_at: now,
            created_by: actor.user.clone(),
            created_by_device: actor.device,
            last_modified_by: actor.user.clone(),
            last_modified_by_device: actor.device,
            is_deleted: false,
            deleted_at: None,
            deleted_by: None,
            deleted_by_device: None,
            tombstone_expires_at: None,
        }
    }

    /// Advances the envelope for a local mutation and returns the new version.
    pub fn bump(&mut self, actor: &Actor, now: Timestamp) -> u64 {
        self.version += 1;
        self.vector_clock.observe(actor.device, self.version);
        self.updated_at = now;
        self.last_modified_by = actor.user.clone();
        self.last_modified_by_device = actor.device;
        self.sync_status = SyncStatus::Pending;
        self.version
    }

    /// Bumps the version and turns the record into a tombstone.
    pub fn mark_deleted(&mut self, actor: &Actor, now: Timestamp, retention: Duration) -> u64 {
        let version = self.bump(actor, now);
        self.is_deleted = true;
        self.deleted_at = Some(now);
        self.deleted_by = Some(actor.user.clone());
        self.deleted_by_device = Some(actor.device);
        self.tombstone_expires_at = Some(now.plus(retention));
        version
    }

    /// Records a server acknowledgment of `acked_version`.
    ///
    /// The record only becomes `Synced` when nothing was written after the
    /// acknowledged version.
    pub fn acknowledge(&mut self, acked_version: u64) {
        let acked = acked_version.min(self.version);
        if acked > self.last_synced_version {
            self.last_synced_version = acked;
        }
        if acked == self.version && self.sync_status != SyncStatus::Conflict {
            self.sync_status = SyncStatus::Synced;
        }
    }

    /// Whether the server has acknowledged the current version.
    #[must_use]
    pub fn is_fully_synced(&self) -> bool {
        self.last_synced_version == self.version
    }

    /// Whether this is a tombstone whose retention window has passed.
    #[must_use]
    pub fn is_tombstone_expired(&self, now: Timestamp) -> bool {
        self.is_deleted
            && self
                .tombstone_expires_at
                .is_some_and(|expires| expires.is_before(&now))
    }

    /// Whether tombstone GC may physically remove this record.
    #[must_use]
    pub fn is_purgeable(&self, now: Timestamp) -> bool {
        self.is_tombstone_expired(now) && self.is_fully_synced()
    }

    /// Whether the record shows up in default reads.
    #[must_use]
    pub fn is_visible(&self) -> bool {
        !self.is_deleted
    }
}
