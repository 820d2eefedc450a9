//! Per-record vector clock.
//!
//! Unlike an event-counting clock, the entry for a device is the record
//! *version* that device last wrote, so after a local write on device `D`
//! at version `v` the clock satisfies `clock[D] == v`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tillsync_types::DeviceId;

/// Causality relationship between two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CausalOrder {
    /// First clock happened before second.
    Before,
    /// First clock happened after second.
    After,
    /// Neither clock happened before the other.
    Concurrent,
    /// Clocks are identical.
    Equal,
}

/// Map from device to the record version that device last wrote.
///
/// Missing entries read as zero. Stored ordered so serialized snapshots are
/// byte-stable across devices.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock {
    clocks: BTreeMap<DeviceId, u64>,
}

impl VectorClock {
    /// Creates a new empty vector clock.
    #[must_use]
    pub fn new() -> Self {
        Self {
            clocks: BTreeMap::new(),
        }
    }

    /// Creates a clock with a single device entry.
    #[must_use]
    pub fn with_entry(device: DeviceId, version: u64) -> Self {
        let mut clocks = BTreeMap::new();
        clocks.insert(device, version);
        Self { clocks }
    }

    /// Returns the version recorded for a device (0 if not present).
    #[must_use]
    pub fn get(&self, device: &DeviceId) -> u64 {
        self.clocks.get(device).copied().unwrap_or(0)
    }

    /// Returns all devices and their versions, ordered by device id.
    pub fn entries(&self) -> impl Iterator<Item = (&DeviceId, &u64)> {
        self.clocks.iter()
    }

    /// Returns the number of devices in the clock.
    #[must_use]
    pub fn len(&self) -> usize {
        self.clocks.len()
    }

    /// Returns true if the clock has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clocks.is_empty()
    }

    /// Returns the largest version any device has written.
    #[must_use]
    pub fn max_version(&self) -> u64 {
        self.clocks.values().copied().max().unwrap_or(0)
    }

    /// Records that `device` wrote `version`.
    ///
    /// Only raises the entry; an older version never lowers it.
    pub fn observe(&mut self, device: DeviceId, version: u64) {
        let entry = self.clocks.entry(device).or_insert(0);
        if version > *entry {
            *entry = version;
        }
    }

    /// Merges another vector clock into this one, taking the max per device.
    pub fn merge(&mut self, other: &Self) {
        for (device, &version) in &other.clocks {
            self.observe(*device, version);
        }
    }

    /// Creates a new clock that is the union of this and another.
    #[must_use]
    pub fn merged(&self, other: &Self) -> Self {
        let mut result = self.clone();
        result.merge(other);
        result
    }

    /// Compares this clock with another to determine causal ordering.
    #[must_use]
    pub fn compare(&self, other: &Self) -> CausalOrder {
        let mut self_ge = true;
        let mut other_ge = true;

        for device in self.clocks.keys().chain(other.clocks.keys()) {
            let mine = self.get(device);
            let theirs = other.get(device);
            if mine < theirs {
                self_ge = false;
            }
            if theirs < mine {
                other_ge = false;
            }
            if !self_ge && !other_ge {
                return CausalOrder::Concurrent;
            }
        }

        match (self_ge, other_ge) {
            (true, true) => CausalOrder::Equal,
            (true, false) => CausalOrder::After,
            (false, true) => CausalOrder::Before,
            (false, false) => CausalOrder::Concurrent,
        }
    }

    /// Returns true if this clock is causally before the other.
    #[must_use]
    pub fn is_before(&self, other: &Self) -> bool {
        self.compare(other) == CausalOrder::Before
    }

    /// Returns true if this clock is causally after the other.
    #[must_use]
    pub fn is_after(&self, other: &Self) -> bool {
        self.compare(other) == CausalOrder::After
    }

    /// Returns true if this clock is concurrent with the other.
    #[must_use]
    pub fn is_concurrent(&self, other: &Self) -> bool {
        self.compare(other) == CausalOrder::Concurrent
    }

    /// Returns true if this clock is `>=` the other on every device.
    #[must_use]
    pub fn dominates(&self, other: &Self) -> bool {
        matches!(self.compare(other), CausalOrder::After | CausalOrder::Equal)
    }

    /// Returns true if this clock is `>=` on every device and `>` on one.
    #[must_use]
    pub fn strictly_dominates(&self, other: &Self) -> bool {
        self.compare(other) == CausalOrder::After
    }
}

impl PartialEq for VectorClock {
    fn eq(&self, other: &Self) -> bool {
        self.compare(other) == CausalOrder::Equal
    }
}

impl Eq for VectorClock {}

impl FromIterator<(DeviceId, u64)> for VectorClock {
    fn from_iter<I: IntoIterator<Item = (DeviceId, u64)>>(iter: I) -> Self {
        let mut clock = Self::new();
        for (device, version) in iter {
            clock.observe(device, version);
        }
        clock
    }
}
