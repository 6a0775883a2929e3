//! Ordinal bookkeeping for replica sets with delete slots.
//!
//! A replica set addresses its replicas by ordinal. Without delete slots the active ordinals are
//! simply `0..replicas`. A delete slot is an ordinal which is skipped, which allows an arbitrary
//! replica to be removed instead of only the highest one. The active ordinal set is therefore the
//! first `replicas` non-negative integers which are not delete slots.

use std::collections::BTreeSet;
use std::fmt;

use anyhow::{Context, Result};

/// The replica count & delete slots of a replica set.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReplicaSlots {
    replicas: i32,
    delete_slots: BTreeSet<i32>,
}

impl ReplicaSlots {
    /// Create a new instance, discarding negative values.
    pub fn new(replicas: i32, delete_slots: impl IntoIterator<Item = i32>) -> Self {
        Self {
            replicas: replicas.max(0),
            delete_slots: delete_slots.into_iter().filter(|slot| *slot >= 0).collect(),
        }
    }

    /// Create a new instance without any delete slots.
    pub fn with_replicas(replicas: i32) -> Self {
        Self::new(replicas, None)
    }

    /// Build the canonical slots describing exactly the given ordinal set.
    ///
    /// Every gap below the highest ordinal becomes a delete slot. Slots from `reserved` which lie
    /// above the highest ordinal are preserved, as they do not alter the ordinal set.
    pub fn from_ordinals(ordinals: &BTreeSet<i32>, reserved: &BTreeSet<i32>) -> Self {
        let max = match ordinals.iter().next_back() {
            Some(max) => *max,
            None => return Self::new(0, reserved.iter().copied()),
        };
        let holes = (0..max).filter(|ordinal| !ordinals.contains(ordinal));
        let beyond = reserved.iter().copied().filter(|slot| *slot > max);
        Self::new(ordinals.len() as i32, holes.chain(beyond))
    }

    /// The number of active replicas.
    pub fn replicas(&self) -> i32 {
        self.replicas
    }

    /// The set of delete slots.
    pub fn delete_slots(&self) -> &BTreeSet<i32> {
        &self.delete_slots
    }

    /// The set of active ordinals.
    pub fn ordinals(&self) -> BTreeSet<i32> {
        let mut ordinals = BTreeSet::new();
        let mut next = 0;
        while ordinals.len() < self.replicas as usize {
            if !self.delete_slots.contains(&next) {
                ordinals.insert(next);
            }
            next += 1;
        }
        ordinals
    }

    /// Check if the given ordinal is active.
    pub fn contains(&self, ordinal: i32) -> bool {
        ordinal >= 0 && !self.delete_slots.contains(&ordinal) && self.ordinals().contains(&ordinal)
    }

    /// Encode the delete slots for storage in an annotation, `None` when there are none.
    pub fn encode_delete_slots(&self) -> Option<String> {
        if self.delete_slots.is_empty() {
            return None;
        }
        serde_json::to_string(&self.delete_slots).ok()
    }

    /// Decode delete slots as stored in an annotation.
    pub fn decode_delete_slots(value: &str) -> Result<BTreeSet<i32>> {
        if value.trim().is_empty() {
            return Ok(BTreeSet::new());
        }
        serde_json::from_str(value).with_context(|| format!("invalid delete slots value `{}`", value))
    }
}

impl fmt::Display for ReplicaSlots {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "replicas={} delete_slots={:?}", self.replicas, self.delete_slots)
    }
}
