//! Event types and priority queue for discrete event simulation.

use std::cmp::Ordering;

use platoon::{Address, Command, Timestamp};

/// Unique sequence number for deterministic event ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SequenceNumber(u64);

impl SequenceNumber {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

/// Scenario actions that can be scheduled during simulation.
#[derive(Debug, Clone)]
pub enum ScenarioAction {
    /// Partition the network into isolated groups.
    Partition { groups: Vec<Vec<Address>> },
    /// Heal all partitions (restore full connectivity).
    HealPartition,
    /// Disable a specific link.
    DisableLink { from: Address, to: Address },
    /// Enable a specific link.
    EnableLink { from: Address, to: Address },
    /// Set loss rate on a link.
    SetLossRate { from: Address, to: Address, rate: f64 },
    /// Take a group snapshot for metrics.
    TakeSnapshot,
}

/// Events in the discrete event simulation.
#[derive(Debug, Clone)]
pub enum Event {
    /// Deliver a frame to a node.
    MessageDelivery {
        to: Address,
        data: Vec<u8>,
        from: Address,
    },
    /// Wake a node for its timers. Stale wake-ups are skipped.
    TimerFire { node: Address },
    /// Hand an application command to a node.
    Control { node: Address, command: Command },
    /// Execute a scenario action.
    ScenarioAction(ScenarioAction),
}

/// A scheduled event with timestamp and sequence number for ordering.
#[derive(Debug, Clone)]
pub struct ScheduledEvent {
    pub time: Timestamp,
    /// Breaks ties between events at the same time, in scheduling order.
    pub seq: SequenceNumber,
    pub event: Event,
}

impl ScheduledEvent {
    pub fn new(time: Timestamp, seq: SequenceNumber, event: Event) -> Self {
        Self { time, seq, event }
    }
}

// BinaryHeap is a max-heap; reverse the ordering to pop the earliest event.
impl PartialEq for ScheduledEvent {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.seq == other.seq
    }
}

impl Eq for ScheduledEvent {}

impl PartialOrd for ScheduledEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .time
            .cmp(&self.time)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}
