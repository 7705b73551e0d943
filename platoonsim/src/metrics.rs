//! Metrics collection for simulation analysis.

use std::collections::BTreeSet;

use hashbrown::HashMap;
use platoon::{Address, Event, Role, Timestamp};

/// Group membership of every vehicle at one instant.
#[derive(Debug, Clone)]
pub struct GroupSnapshot {
    pub time: Timestamp,
    pub roles: HashMap<Address, Role>,
    pub levels: HashMap<Address, u8>,
    /// Leader each vehicle believes in, if any.
    pub leaders: HashMap<Address, Option<Address>>,
}

impl GroupSnapshot {
    pub fn new(time: Timestamp) -> Self {
        Self {
            time,
            roles: HashMap::new(),
            levels: HashMap::new(),
            leaders: HashMap::new(),
        }
    }

    pub fn record_node(&mut self, node: Address, role: Role, level: u8, leader: Option<Address>) {
        self.roles.insert(node, role);
        self.levels.insert(node, level);
        self.leaders.insert(node, leader);
    }

    /// Vehicles currently acting as leader, in address order.
    pub fn leader_list(&self) -> Vec<Address> {
        let mut leaders: Vec<Address> = self
            .roles
            .iter()
            .filter(|(_, role)| **role == Role::Leader)
            .map(|(addr, _)| *addr)
            .collect();
        leaders.sort();
        leaders
    }

    /// Distinct groups among vehicles that are in a tree.
    pub fn group_count(&self) -> usize {
        self.roles
            .iter()
            .filter(|(_, role)| role.in_tree())
            .filter_map(|(addr, _)| self.leaders.get(addr).copied().flatten())
            .collect::<BTreeSet<_>>()
            .len()
    }

    /// Vehicles not (yet) in any tree.
    pub fn unattached(&self) -> usize {
        self.roles.values().filter(|role| !role.in_tree()).count()
    }

    /// Every vehicle is in a tree and all trees are one.
    pub fn single_group(&self) -> bool {
        !self.roles.is_empty() && self.unattached() == 0 && self.group_count() == 1
    }

    pub fn max_level(&self) -> u8 {
        self.levels.values().copied().max().unwrap_or(0)
    }
}

/// A protocol event raised by one vehicle.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeEvent {
    pub time: Timestamp,
    pub node: Address,
    pub event: Event,
}

/// Simulation metrics collected over time.
#[derive(Debug, Clone, Default)]
pub struct SimMetrics {
    /// Frames put on the medium.
    pub messages_sent: u64,
    /// Copies lost to link loss.
    pub messages_dropped: u64,
    /// Unicast frames whose next hop was out of range.
    pub messages_unreachable: u64,
    pub messages_delivered: u64,
    /// Frames or commands a node rejected.
    pub protocol_errors: u64,
    pub snapshots: Vec<GroupSnapshot>,
    pub events: Vec<NodeEvent>,
}

impl SimMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_snapshot(&mut self, snapshot: GroupSnapshot) {
        self.snapshots.push(snapshot);
    }

    /// First snapshot time at which the fleet formed a single group.
    pub fn convergence_time(&self) -> Option<Timestamp> {
        self.snapshots
            .iter()
            .find(|s| s.single_group())
            .map(|s| s.time)
    }

    pub fn latest_snapshot(&self) -> Option<&GroupSnapshot> {
        self.snapshots.last()
    }

    /// Events raised by one vehicle, oldest first.
    pub fn events_of(&self, node: Address) -> impl Iterator<Item = &Event> + '_ {
        self.events
            .iter()
            .filter(move |e| e.node == node)
            .map(|e| &e.event)
    }
}

/// Result of running a simulation.
#[derive(Debug, Clone)]
pub struct SimulationResult {
    pub end_time: Timestamp,
    pub metrics: SimMetrics,
    /// Whether simulation ended due to event queue exhaustion (vs time limit).
    pub queue_exhausted: bool,
}

impl SimulationResult {
    /// The fleet ended as a single group.
    pub fn converged(&self) -> bool {
        self.metrics
            .latest_snapshot()
            .is_some_and(|s| s.single_group())
    }

    pub fn final_group_count(&self) -> usize {
        self.metrics
            .latest_snapshot()
            .map(|s| s.group_count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn a(id: u32) -> Address {
        Address::from_id(id)
    }

    #[test]
    fn test_snapshot_counts_groups() {
        let mut snapshot = GroupSnapshot::new(Timestamp::ZERO);
        snapshot.record_node(a(1), Role::Leader, 1, Some(a(1)));
        snapshot.record_node(a(2), Role::Member, 2, Some(a(1)));
        snapshot.record_node(a(3), Role::Leader, 1, Some(a(3)));
        snapshot.record_node(a(4), Role::AwaitingConstruction, 0, None);

        assert_eq!(snapshot.group_count(), 2);
        assert_eq!(snapshot.leader_list(), vec![a(1), a(3)]);
        assert_eq!(snapshot.unattached(), 1);
        assert!(!snapshot.single_group());
    }

    #[test]
    fn test_convergence_time() {
        let mut metrics = SimMetrics::new();

        let mut s1 = GroupSnapshot::new(Timestamp::from_secs(1));
        s1.record_node(a(1), Role::Leader, 1, Some(a(1)));
        s1.record_node(a(2), Role::AwaitingConfirmation, 0, None);
        metrics.add_snapshot(s1);

        let mut s2 = GroupSnapshot::new(Timestamp::from_secs(2));
        s2.record_node(a(1), Role::Leader, 1, Some(a(1)));
        s2.record_node(a(2), Role::Member, 2, Some(a(1)));
        metrics.add_snapshot(s2);

        assert_eq!(metrics.convergence_time(), Some(Timestamp::from_secs(2)));
        assert_eq!(metrics.latest_snapshot().map(|s| s.max_level()), Some(2));
    }
}
