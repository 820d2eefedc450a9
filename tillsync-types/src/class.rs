//! Entity classes and per-class sync policy.
//!
//! Outbox priority, tombstone retention and the conflict policy are
//! properties of an entity's class, not global constants.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Broad category of a syncable entity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityClass {
    /// Payments, tickets, gift cards, balances.
    Financial,
    /// Records that pass through an approval workflow (refunds, time off).
    Approval,
    /// Appointments and bookings.
    Scheduling,
    /// Staff profiles and schedules.
    Staff,
    /// Services, products and prices.
    Catalog,
    /// Everything else (settings, notes, device state).
    Operational,
}

impl EntityClass {
    /// All classes, most urgent first.
    pub const ALL: [Self; 6] = [
        Self::Financial,
        Self::Approval,
        Self::Scheduling,
        Self::Staff,
        Self::Catalog,
        Self::Operational,
    ];

    /// Whether concurrent edits must always go to a human.
    #[must_use]
    pub const fn requires_manual_resolution(&self) -> bool {
        matches!(self, Self::Financial | Self::Approval)
    }

    /// Returns the built-in policy for this class.
    #[must_use]
    pub const fn default_policy(&self) -> ClassPolicy {
        let (priority, retention_days) = match self {
            Self::Financial => (0, 365),
            Self::Approval => (1, 365),
            Self::Scheduling => (2, 30),
            Self::Staff => (3, 30),
            Self::Catalog => (4, 30),
            Self::Operational => (5, 30),
        };
        ClassPolicy {
            priority,
            retention_days,
            conflict_policy: ConflictPolicy::Manual,
        }
    }
}

impl fmt::Display for EntityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Financial => "financial",
            Self::Approval => "approval",
            Self::Scheduling => "scheduling",
            Self::Staff => "staff",
            Self::Catalog => "catalog",
            Self::Operational => "operational",
        };
        f.write_str(name)
    }
}

/// What to do when two devices edit the same record concurrently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Keep both snapshots and hand the record to a resolution workflow.
    #[default]
    Manual,
    /// Keep the snapshot with the later `updated_at`. Audited.
    LastWriterWins,
}

/// Sync policy for one entity class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassPolicy {
    /// Outbox priority; lower is sent first.
    pub priority: u8,
    /// How long a tombstone is retained before it may be purged.
    pub retention_days: u32,
    /// Concurrent-edit policy.
    pub conflict_policy: ConflictPolicy,
}

impl ClassPolicy {
    /// Tombstone retention as a duration.
    #[must_use]
    pub fn retention(&self) -> Duration {
        DAY * self.retention_days
    }
}

/// A partial override of a class policy, as read from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClassPolicyOverride {
    #[serde(default)]
    pub priority: Option<u8>,
    #[serde(default)]
    pub retention_days: Option<u32>,
    #[serde(default)]
    pub conflict_policy: Option<ConflictPolicy>,
}

/// Policy table covering every entity class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassPolicies {
    policies: BTreeMap<EntityClass, ClassPolicy>,
}

impl ClassPolicies {
    /// Returns the policy for a class.
    #[must_use]
    pub fn get(&self, class: EntityClass) -> ClassPolicy {
        self.policies
            .get(&class)
            .copied()
            .unwrap_or_else(|| class.default_policy())
    }

    /// Applies an override to one class.
    ///
    /// Financial and approval classes cannot be switched to last-writer-wins.
    pub fn apply_override(&mut self, class: EntityClass, ov: &ClassPolicyOverride) -> Result<()> {
        let mut policy = self.get(class);
        if let Some(priority) = ov.priority {
            policy.priority = priority;
        }
        if let Some(days) = ov.retention_days {
            if days == 0 {
                return Err(Error::InvalidPolicy(format!(
                    "{class}: tombstone retention must be at least one day"
                )));
            }
            policy.retention_days = days;
        }
        if let Some(conflict_policy) = ov.conflict_policy {
            if conflict_policy == ConflictPolicy::LastWriterWins
                && class.requires_manual_resolution()
            {
                return Err(Error::InvalidPolicy(format!(
                    "{class}: last-writer-wins is not allowed for this class"
                )));
            }
            policy.conflict_policy = conflict_policy;
        }
        self.policies.insert(class, policy);
        Ok(())
    }

    /// Builder-style variant of [`ClassPolicies::apply_override`].
    pub fn with_override(mut self, class: EntityClass, ov: ClassPolicyOverride) -> Result<Self> {
        self.apply_override(class, &ov)?;
        Ok(self)
    }
}

impl Default for ClassPolicies {
    fn default() -> Self {
        Self {
            policies: EntityClass::ALL
                .iter()
                .map(|class| (*class, class.default_policy()))
                .collect(),
        }
    }
}
