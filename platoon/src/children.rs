//! Capacity-bounded child set.
//!
//! Children are keyed by address in a `BTreeMap`, so iteration (heartbeat
//! scans, group fan-out, sibling lists) is always in address order and the
//! same inputs produce the same outputs on every node.

use std::collections::BTreeMap;

use crate::time::{Duration, Timestamp};
use crate::types::{Address, NeighborRecord, Position};

/// Store for direct children with a hard capacity.
#[derive(Clone, Debug)]
pub struct ChildrenStore {
    entries: BTreeMap<Address, NeighborRecord>,
    capacity: usize,
}

impl ChildrenStore {
    /// Create an empty store holding at most `capacity` children.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// No further child can be admitted, not even through reattachment.
    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.entries.contains_key(address)
    }

    pub fn get(&self, address: &Address) -> Option<&NeighborRecord> {
        self.entries.get(address)
    }

    /// Insert or update a child.
    ///
    /// Updating an existing child always succeeds. A new child is refused
    /// (returns `false`) once the store is full.
    pub fn try_insert(&mut self, record: NeighborRecord) -> bool {
        if !self.entries.contains_key(&record.address) && self.is_full() {
            return false;
        }
        self.entries.insert(record.address, record);
        true
    }

    /// Record a heartbeat from a child. Returns `false` for unknown addresses.
    pub fn refresh(&mut self, address: &Address, at: Timestamp, position: Position) -> bool {
        match self.entries.get_mut(address) {
            Some(record) => {
                record.last_heartbeat = at;
                record.position = position;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, address: &Address) -> Option<NeighborRecord> {
        self.entries.remove(address)
    }

    pub fn iter(&self) -> impl Iterator<Item = &NeighborRecord> {
        self.entries.values()
    }

    pub fn addresses(&self) -> impl Iterator<Item = Address> + '_ {
        self.entries.keys().copied()
    }

    /// First child (in address order) silent for strictly longer than `threshold`.
    pub fn first_stale(&self, now: Timestamp, threshold: Duration) -> Option<Address> {
        self.entries
            .values()
            .find(|c| now - c.last_heartbeat > threshold)
            .map(|c| c.address)
    }
}
