//! Discrete event simulator for vehicle groups.

use std::collections::BinaryHeap;

use hashbrown::HashMap;
use platoon::{
    Address, ClusterConfig, Command, ConfigError, Duration, Frame, Position, TaskId, Timestamp,
};
use tracing::{debug, warn};

use crate::event::{Event, ScenarioAction, ScheduledEvent, SequenceNumber};
use crate::initializer::{GroupPlan, PlanError};
use crate::metrics::{GroupSnapshot, NodeEvent, SimMetrics, SimulationResult};
use crate::node::SimNode;
use crate::topology::Topology;

/// Discrete event simulator driving many nodes on one thread.
pub struct Simulator {
    nodes: HashMap<Address, SimNode>,
    topology: Topology,
    current_time: Timestamp,
    event_queue: BinaryHeap<ScheduledEvent>,
    metrics: SimMetrics,
    next_seq: u64,
    /// RNG state for link loss.
    rng_state: u64,
    /// Wake-up currently queued per node. Any other TimerFire is stale.
    scheduled_wake: HashMap<Address, Timestamp>,
    config: ClusterConfig,
    snapshot_interval: Option<Duration>,
    next_snapshot: Option<Timestamp>,
}

impl Simulator {
    pub fn new(seed: u64) -> Self {
        Self {
            nodes: HashMap::new(),
            topology: Topology::new(),
            current_time: Timestamp::ZERO,
            event_queue: BinaryHeap::new(),
            metrics: SimMetrics::new(),
            next_seq: 0,
            rng_state: seed,
            scheduled_wake: HashMap::new(),
            config: ClusterConfig::default(),
            snapshot_interval: None,
            next_snapshot: None,
        }
    }

    pub fn with_topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }

    /// Configuration used by `add_node`.
    pub fn with_config(mut self, config: ClusterConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_snapshot_interval(mut self, interval: Duration) -> Self {
        self.snapshot_interval = Some(interval);
        self.next_snapshot = Some(self.current_time + interval);
        self
    }

    pub fn add_node(&mut self, address: Address, position: Position) -> Result<Address, ConfigError> {
        let config = self.config.clone();
        self.add_node_with_config(address, position, config)
    }

    pub fn add_node_with_config(
        &mut self,
        address: Address,
        position: Position,
        config: ClusterConfig,
    ) -> Result<Address, ConfigError> {
        let seed = address
            .0
            .iter()
            .fold(self.rng_state, |s, b| s.wrapping_mul(31).wrapping_add(u64::from(*b)));
        let node = SimNode::new(address, seed, config, position, self.current_time)?;
        self.nodes.insert(address, node);
        Ok(address)
    }

    /// Install a static plan on the nodes it names, bypassing construction.
    ///
    /// Trees are numbered from `first_task` in root address order, so two
    /// planned groups never share a task.
    pub fn install_plan(&mut self, plan: &GroupPlan, first_task: TaskId) -> Result<(), PlanError> {
        if let Some(missing) = plan.nodes().find(|id| !self.nodes.contains_key(id)) {
            return Err(PlanError::UnknownNode(missing));
        }
        let now = self.current_time;
        for (id, placement) in plan.placements(first_task) {
            if let Some(node) = self.nodes.get_mut(&id) {
                node.inner_mut()
                    .install(placement, now)
                    .map_err(|source| PlanError::Install { node: id, source })?;
            }
        }
        for id in plan.nodes() {
            self.after_activity(id);
        }
        debug!(nodes = plan.len(), "plan installed");
        Ok(())
    }

    pub fn node(&self, id: &Address) -> Option<&SimNode> {
        self.nodes.get(id)
    }

    pub fn node_mut(&mut self, id: &Address) -> Option<&mut SimNode> {
        self.nodes.get_mut(id)
    }

    /// All node addresses, sorted.
    pub fn node_ids(&self) -> Vec<Address> {
        let mut ids: Vec<Address> = self.nodes.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn current_time(&self) -> Timestamp {
        self.current_time
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn topology_mut(&mut self) -> &mut Topology {
        &mut self.topology
    }

    pub fn metrics(&self) -> &SimMetrics {
        &self.metrics
    }

    pub fn schedule(&mut self, time: Timestamp, event: Event) {
        let seq = SequenceNumber::new(self.next_seq);
        self.next_seq += 1;
        self.event_queue.push(ScheduledEvent::new(time, seq, event));
    }

    pub fn schedule_action(&mut self, time: Timestamp, action: ScenarioAction) {
        self.schedule(time, Event::ScenarioAction(action));
    }

    pub fn schedule_command(&mut self, time: Timestamp, node: Address, command: Command) {
        self.schedule(time, Event::Control { node, command });
    }

    pub fn run_until(&mut self, end_time: Timestamp) -> SimulationResult {
        while self.event_queue.peek().is_some_and(|e| e.time <= end_time) {
            let Some(event) = self.event_queue.pop() else {
                break;
            };
            self.advance_time(event.time);
            self.process_event(event.event);
            self.maybe_take_snapshot();
        }

        self.advance_time(end_time);
        self.take_snapshot();

        SimulationResult {
            end_time: self.current_time,
            metrics: self.metrics.clone(),
            queue_exhausted: self.event_queue.peek().is_none(),
        }
    }

    pub fn run_for(&mut self, duration: Duration) -> SimulationResult {
        self.run_until(self.current_time + duration)
    }

    fn advance_time(&mut self, time: Timestamp) {
        if time > self.current_time {
            self.current_time = time;
        }
    }

    fn process_event(&mut self, event: Event) {
        match event {
            Event::MessageDelivery { to, data, from: _ } => self.deliver_message(to, data),
            Event::TimerFire { node } => self.fire_timer(node),
            Event::Control { node, command } => self.control(node, command),
            Event::ScenarioAction(action) => self.execute_action(action),
        }
    }

    fn deliver_message(&mut self, to: Address, data: Vec<u8>) {
        let now = self.current_time;
        let Some(node) = self.nodes.get_mut(&to) else {
            return;
        };
        self.metrics.messages_delivered += 1;
        if node.handle_transport_rx(&data, now).is_err() {
            self.metrics.protocol_errors += 1;
        }
        self.after_activity(to);
    }

    fn fire_timer(&mut self, node_id: Address) {
        let now = self.current_time;
        if self.scheduled_wake.get(&node_id) != Some(&now) {
            return;
        }
        self.scheduled_wake.remove(&node_id);
        if let Some(node) = self.nodes.get_mut(&node_id) {
            node.handle_timer(now);
        }
        self.after_activity(node_id);
    }

    fn control(&mut self, node_id: Address, command: Command) {
        let now = self.current_time;
        let Some(node) = self.nodes.get_mut(&node_id) else {
            warn!(node = %node_id, "command for unknown node");
            return;
        };
        if node.handle_command(command, now).is_err() {
            self.metrics.protocol_errors += 1;
        }
        self.after_activity(node_id);
    }

    /// Route what a node emitted, log its events and queue its next wake-up.
    fn after_activity(&mut self, node_id: Address) {
        let Some(node) = self.nodes.get(&node_id) else {
            return;
        };
        let frames = node.take_outgoing();
        let events = node.take_events();
        let wake = node.next_wake();

        let now = self.current_time;
        self.metrics
            .events
            .extend(events.into_iter().map(|event| NodeEvent {
                time: now,
                node: node_id,
                event,
            }));
        for frame in frames {
            self.route_frame(node_id, frame);
        }

        if let Some(wake) = wake {
            let wake = wake.max(now);
            if self.scheduled_wake.get(&node_id) != Some(&wake) {
                self.scheduled_wake.insert(node_id, wake);
                self.schedule(wake, Event::TimerFire { node: node_id });
            }
        } else {
            self.scheduled_wake.remove(&node_id);
        }
    }

    /// Broadcasts reach every active neighbor, unicasts only their next hop.
    fn route_frame(&mut self, sender: Address, frame: Frame) {
        self.metrics.messages_sent += 1;

        let receivers = if frame.next_hop.is_broadcast() {
            self.topology.neighbors(sender)
        } else if self.topology.is_connected(sender, frame.next_hop) {
            vec![frame.next_hop]
        } else {
            self.metrics.messages_unreachable += 1;
            return;
        };

        let now = self.current_time;
        for receiver in receivers {
            let Some((loss_rate, delay)) = self
                .topology
                .get_link(sender, receiver)
                .map(|link| (link.loss_rate, link.delay))
            else {
                continue;
            };
            if loss_rate > 0.0 && self.random_f64() < loss_rate {
                self.metrics.messages_dropped += 1;
                continue;
            }
            self.schedule(
                now + delay,
                Event::MessageDelivery {
                    to: receiver,
                    data: frame.data.clone(),
                    from: sender,
                },
            );
        }
    }

    fn execute_action(&mut self, action: ScenarioAction) {
        match action {
            ScenarioAction::Partition { groups } => self.topology.partition(&groups),
            ScenarioAction::HealPartition => self.topology.heal(),
            ScenarioAction::DisableLink { from, to } => {
                if let Some(link) = self.topology.get_link_mut(from, to) {
                    link.active = false;
                }
            }
            ScenarioAction::EnableLink { from, to } => {
                if let Some(link) = self.topology.get_link_mut(from, to) {
                    link.active = true;
                }
            }
            ScenarioAction::SetLossRate { from, to, rate } => {
                if let Some(link) = self.topology.get_link_mut(from, to) {
                    link.loss_rate = rate.clamp(0.0, 1.0);
                }
            }
            ScenarioAction::TakeSnapshot => self.take_snapshot(),
        }
    }

    fn maybe_take_snapshot(&mut self) {
        if let Some(next) = self.next_snapshot {
            if self.current_time >= next {
                self.take_snapshot();
                if let Some(interval) = self.snapshot_interval {
                    self.next_snapshot = Some(next + interval);
                }
            }
        }
    }

    pub fn take_snapshot(&mut self) {
        let mut snapshot = GroupSnapshot::new(self.current_time);
        for (id, node) in &self.nodes {
            snapshot.record_node(*id, node.role(), node.level(), node.leader());
        }
        self.metrics.add_snapshot(snapshot);
    }

    /// Uniform in [0, 1).
    fn random_f64(&mut self) -> f64 {
        self.rng_state = self
            .rng_state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1);
        (self.rng_state >> 11) as f64 / (1u64 << 53) as f64
    }
}
