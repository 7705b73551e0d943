//! Node implementation - the per-vehicle protocol state machine.
//!
//! The Node struct holds all protocol state and provides an async `run()` method
//! that drives it. It is fully event-driven:
//! - Incoming transport frames are decoded and dispatched by message kind
//! - Application commands assign tasks, simulate blackouts, report obstacles
//! - Internal timers drive solicitation, heartbeats and failure checks
//!
//! The synchronous handlers (`handle_transport_rx`, `handle_timer`,
//! `handle_command`) are public so a simulator can drive many nodes on one
//! thread without an executor.
//!
//! # Usage
//!
//! ```ignore
//! let mut node = Node::new(address, transport, random, clock, locator, config)?;
//!
//! spawn(async move {
//!     node.run().await;
//! });
//!
//! node.commands().send(Command::AssignTask(7)).await;
//! let event = node.events().receive().await;
//! ```

use std::collections::{BTreeMap, BTreeSet};

use embassy_sync::channel::Channel;
use hashbrown::HashMap;
use tracing::{debug, error, info, trace};

use crate::children::ChildrenStore;
use crate::config::{ClusterConfig, ConfigError};
use crate::failover::{FailoverStrategy, InitiatorWins};
use crate::routing::RoutingTable;
use crate::time::{Duration, Timestamp};
use crate::traits::{Clock, Command, CommandChannel, EventChannel, Locator, Random, Transport};
use crate::types::{
    Address, Error, Event, NeighborRecord, NodeMetrics, Position, Presence, Role, TaskId,
};
use crate::wire::{Body, Decode, Header, Message};

/// Missing address -> deadline until which a RETURN from it is honored.
pub type SearchRegistry = HashMap<Address, Timestamp>;

/// Sibling address -> whether it answered the current leader check.
pub type FailoverAcks = BTreeMap<Address, bool>;

/// Everything one vehicle knows about its tree.
#[derive(Debug, Clone)]
pub struct ClusterState {
    pub role: Role,
    /// Tree depth, root = 1. Zero while outside any tree.
    pub level: u8,
    pub task: Option<TaskId>,
    pub parent: Option<NeighborRecord>,
    /// A leader's own record points at itself.
    pub leader: Option<NeighborRecord>,
    pub children: ChildrenStore,
    pub routing: RoutingTable,
    /// Second-level peers under the same root.
    pub siblings: BTreeSet<Address>,
    /// Roots of neighboring trees (leader only).
    pub neighbor_roots: BTreeSet<Address>,
    pub search_registry: SearchRegistry,
    pub failover_acks: FailoverAcks,
    pub presence: Presence,
}

impl ClusterState {
    fn new(max_children: usize) -> Self {
        Self {
            role: Role::Unassigned,
            level: 0,
            task: None,
            parent: None,
            leader: None,
            children: ChildrenStore::new(max_children),
            routing: RoutingTable::new(),
            siblings: BTreeSet::new(),
            neighbor_roots: BTreeSet::new(),
            search_registry: HashMap::new(),
            failover_acks: BTreeMap::new(),
            presence: Presence::Present,
        }
    }

    pub fn leader_address(&self) -> Option<Address> {
        self.leader.map(|l| l.address)
    }

    pub fn parent_address(&self) -> Option<Address> {
        self.parent.map(|p| p.address)
    }
}

/// Pre-computed position of a node in a tree, installed without running the
/// construction handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub task: TaskId,
    pub level: u8,
    pub parent: Option<Address>,
    pub leader: Address,
    pub children: Vec<Address>,
    /// (destination, next hop) pairs.
    pub routes: Vec<(Address, Address)>,
    pub siblings: Vec<Address>,
    pub neighbor_roots: Vec<Address>,
}

impl Placement {
    /// A childless root.
    pub fn root(address: Address, task: TaskId) -> Self {
        Self {
            task,
            level: 1,
            parent: None,
            leader: address,
            children: Vec::new(),
            routes: Vec::new(),
            siblings: Vec::new(),
            neighbor_roots: Vec::new(),
        }
    }
}

/// Armed deadlines, one per periodic activity.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Timers {
    pub promotion: Option<Timestamp>,
    pub solicit: Option<Timestamp>,
    pub hello: Option<Timestamp>,
    pub missing_check: Option<Timestamp>,
    pub failover_check: Option<Timestamp>,
    pub obstacle_check: Option<Timestamp>,
    pub return_beacon: Option<Timestamp>,
}

impl Timers {
    fn earliest(&self) -> Option<Timestamp> {
        [
            self.promotion,
            self.solicit,
            self.hello,
            self.missing_check,
            self.failover_check,
            self.obstacle_check,
        ]
        .into_iter()
        .flatten()
        .min()
    }
}

/// Disarm `slot` and report whether it had expired.
fn due(slot: &mut Option<Timestamp>, now: Timestamp) -> bool {
    match *slot {
        Some(at) if at <= now => {
            *slot = None;
            true
        }
        _ => false,
    }
}

/// The per-vehicle protocol node.
///
/// Generic over:
/// - `T`: Transport implementation
/// - `R`: Random number generator
/// - `Clk`: Clock/timer implementation
/// - `L`: Position source
pub struct Node<T, R, Clk, L> {
    // Dependencies (injected)
    transport: T,
    random: R,
    clock: Clk,
    locator: L,

    commands: CommandChannel,
    events: EventChannel,

    address: Address,
    config: ClusterConfig,
    state: ClusterState,
    /// Parent candidate we answered while awaiting confirmation.
    pending_parent: Option<NeighborRecord>,
    timers: Timers,
    strategy: Box<dyn FailoverStrategy>,

    metrics: NodeMetrics,
}

impl<T, R, Clk, L> Node<T, R, Clk, L>
where
    T: Transport,
    R: Random,
    Clk: Clock,
    L: Locator,
{
    /// Create an unassigned node.
    pub fn new(
        address: Address,
        transport: T,
        random: R,
        clock: Clk,
        locator: L,
        config: ClusterConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            transport,
            random,
            clock,
            locator,
            commands: Channel::new(),
            events: Channel::new(),
            address,
            state: ClusterState::new(config.max_children),
            config,
            pending_parent: None,
            timers: Timers::default(),
            strategy: Box::new(InitiatorWins),
            metrics: NodeMetrics::default(),
        })
    }

    /// Replace the failover strategy.
    pub fn with_strategy(mut self, strategy: impl FailoverStrategy + 'static) -> Self {
        self.strategy = Box::new(strategy);
        self
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn state(&self) -> &ClusterState {
        &self.state
    }

    pub fn role(&self) -> Role {
        self.state.role
    }

    pub fn level(&self) -> u8 {
        self.state.level
    }

    pub fn is_leader(&self) -> bool {
        self.state.role == Role::Leader
    }

    pub fn presence(&self) -> Presence {
        self.state.presence
    }

    pub fn position(&self) -> Position {
        self.locator.position()
    }

    pub fn metrics(&self) -> &NodeMetrics {
        &self.metrics
    }

    /// Channel for application commands.
    pub fn commands(&self) -> &CommandChannel {
        &self.commands
    }

    /// Channel for protocol events.
    pub fn events(&self) -> &EventChannel {
        &self.events
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn locator(&self) -> &L {
        &self.locator
    }

    pub fn clock(&self) -> &Clk {
        &self.clock
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Earliest instant at which `handle_timer` has work to do.
    pub fn next_wake(&self) -> Option<Timestamp> {
        match self.state.presence {
            Presence::Blackout { until } => Some(until),
            Presence::Returning => self.timers.return_beacon,
            Presence::Present => self.timers.earliest(),
        }
    }

    /// Run the node's main loop.
    ///
    /// Fully event-driven; runs forever. Call this from an async task/executor.
    pub async fn run(&mut self) -> ! {
        use embassy_futures::select::{select3, Either3};

        loop {
            let wake = self
                .next_wake()
                .unwrap_or_else(|| self.clock.now() + Duration::from_secs(60));

            let result = select3(
                self.transport.incoming().receive(),
                self.commands.receive(),
                self.clock.sleep_until(wake),
            )
            .await;

            let now = self.clock.now();
            match result {
                Either3::First(frame) => {
                    // Errors are logged and counted where they arise
                    let _ = self.handle_transport_rx(&frame.data, now);
                }
                Either3::Second(command) => {
                    let _ = self.handle_command(command, now);
                }
                Either3::Third(()) => self.handle_timer(now),
            }
        }
    }

    /// Apply an application command.
    pub fn handle_command(&mut self, command: Command, now: Timestamp) -> Result<(), Error> {
        debug!(node = %self.address, ?command, "command");
        match command {
            Command::AssignTask(task) => {
                self.assign_task(task, now);
                Ok(())
            }
            Command::MarkMissing(duration) => {
                self.mark_missing(duration, now);
                Ok(())
            }
            Command::Avoid(obstacle) => self.report_obstacle(obstacle, now),
        }
    }

    /// Handle one frame from the medium.
    pub fn handle_transport_rx(&mut self, data: &[u8], now: Timestamp) -> Result<(), Error> {
        if self.is_blacked_out() {
            trace!(node = %self.address, "blackout, frame ignored");
            return Ok(());
        }

        let msg = match Message::decode_from_slice(data) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(node = %self.address, error = %e, "undecodable frame");
                self.metrics.decode_errors += 1;
                return Err(e.into());
            }
        };
        let Message { header, body } = msg;
        let Header {
            group, dest, src, ..
        } = header;

        if src == self.address {
            return Ok(());
        }
        if dest != self.address && !dest.is_broadcast() {
            if self.state.presence == Presence::Present && self.state.role.in_tree() {
                self.relay(data, dest);
            }
            return Ok(());
        }

        self.metrics.received += 1;
        if self.state.presence == Presence::Returning && !matches!(body, Body::Receive { .. }) {
            trace!(node = %self.address, kind = body.name(), "returning, only RECEIVE accepted");
            return Ok(());
        }
        trace!(node = %self.address, %src, kind = body.name(), group, "received");

        // A leader acts on a flagged copy without fanning it out again
        let fan_out = (group && dest == self.address && !self.is_leader()).then(|| body.clone());
        let result = self.dispatch(header, body, now);
        if let Err(e) = &result {
            self.record_violation();
            error!(node = %self.address, %src, error = %e, "rejected frame");
        }
        result?;

        if let Some(body) = fan_out {
            self.forward_group(body, now);
        }
        Ok(())
    }

    fn dispatch(&mut self, header: Header, body: Body, now: Timestamp) -> Result<(), Error> {
        let from = header.src;
        let sent_at = header.timestamp;
        match body {
            Body::Hello { position, routes } => {
                self.handle_hello(from, sent_at, position, routes, now)
            }
            Body::HelloReply => self.handle_hello_reply(from, sent_at),
            Body::Construct { position, task } => {
                self.handle_construct(from, sent_at, position, task, now);
                Ok(())
            }
            Body::ConstructReply {
                position,
                task,
                routes,
            } => {
                self.handle_construct_reply(from, sent_at, position, task, routes, now);
                Ok(())
            }
            Body::ConstructConfirm {
                accept,
                task,
                level,
                leader,
                siblings,
            } => {
                self.handle_construct_confirm(from, sent_at, accept, task, level, leader, siblings, now);
                Ok(())
            }
            Body::Obstacle { position } => {
                self.handle_obstacle(from, header.group, position, now)
            }
            Body::Search { missing, deadline } => {
                self.handle_search(from, missing, deadline);
                Ok(())
            }
            Body::Return => {
                self.handle_return(from, now);
                Ok(())
            }
            Body::Receive {
                task,
                leader,
                level,
                siblings,
            } => {
                self.handle_receive(from, sent_at, task, leader, level, siblings, now);
                Ok(())
            }
            Body::ReceiveReply { routes } => self.handle_receive_reply(from, sent_at, routes, now),
            Body::Missing { missing, deadline } => {
                self.handle_missing(from, missing, deadline, now);
                Ok(())
            }
            Body::CheckLeader => {
                self.handle_check_leader(from, now);
                Ok(())
            }
            Body::CheckLeaderReply => {
                self.handle_check_leader_reply(from, now);
                Ok(())
            }
            Body::NewLeader { leader } => {
                self.handle_new_leader(from, sent_at, leader, now);
                Ok(())
            }
            Body::NewLeaderReply => {
                self.handle_new_leader_reply(from, sent_at);
                Ok(())
            }
            Body::Found { found, parent } => {
                self.handle_found(from, found, parent);
                Ok(())
            }
        }
    }

    /// Run every timer that has expired by `now`.
    pub fn handle_timer(&mut self, now: Timestamp) {
        if let Presence::Blackout { until } = self.state.presence {
            if now < until {
                return;
            }
            info!(node = %self.address, "blackout over, returning");
            self.state.presence = Presence::Returning;
            self.timers.return_beacon = Some(now);
        }

        if self.state.presence == Presence::Returning {
            if due(&mut self.timers.return_beacon, now) {
                self.send_return_beacon(now);
            }
            return;
        }

        if due(&mut self.timers.promotion, now) {
            self.on_promotion_timer(now);
        }
        if due(&mut self.timers.solicit, now) {
            self.solicit(now);
        }
        if due(&mut self.timers.hello, now) {
            self.send_hello(now);
        }
        if due(&mut self.timers.missing_check, now) {
            self.check_missing(now);
        }
        if due(&mut self.timers.failover_check, now) {
            self.check_leader(now);
        }
        if due(&mut self.timers.obstacle_check, now) {
            if let Err(e) = self.check_obstacle(now) {
                error!(node = %self.address, error = %e, "obstacle check failed");
            }
        }
    }

    /// Install a pre-computed tree position, bypassing the handshake.
    ///
    /// Rejects placements that break the tree invariants: a root must be at
    /// level 1 and lead itself, a member needs a parent, children must fit, and
    /// no route may target ourselves, our parent or our leader.
    pub fn install(&mut self, placement: Placement, now: Timestamp) -> Result<(), Error> {
        let Placement {
            task,
            level,
            parent,
            leader,
            children,
            routes,
            siblings,
            neighbor_roots,
        } = placement;

        if level == 0 {
            return Err(Error::InvalidPlacement("level must be at least 1"));
        }
        let role = match parent {
            None if level == 1 && leader == self.address => Role::Leader,
            None => return Err(Error::InvalidPlacement("root must be level 1 and lead itself")),
            Some(_) if level == 1 => {
                return Err(Error::InvalidPlacement("level 1 is reserved for the root"))
            }
            Some(p) if p == self.address || leader == self.address => {
                return Err(Error::InvalidPlacement("member cannot parent or lead itself"))
            }
            Some(_) => Role::Member,
        };
        if children.len() > self.config.max_children {
            return Err(Error::InvalidPlacement("more children than max_children"));
        }
        let reserved = |a: &Address| *a == self.address || Some(*a) == parent || *a == leader;
        if routes.iter().any(|(dest, _)| reserved(dest)) {
            return Err(Error::InvalidPlacement("route to self, parent or leader"));
        }

        let record = |address| NeighborRecord::new(address, now, Position::default());
        let mut store = ChildrenStore::new(self.config.max_children);
        for child in children {
            store.try_insert(record(child));
        }
        let mut routing = RoutingTable::new();
        for (dest, hop) in routes {
            routing.insert(dest, hop);
        }

        self.state.task = Some(task);
        self.state.level = level;
        self.state.parent = parent.map(record);
        self.state.leader = Some(record(leader));
        self.state.children = store;
        self.state.routing = routing;
        self.state.siblings = siblings.into_iter().collect();
        self.state.neighbor_roots = neighbor_roots.into_iter().collect();
        self.state.search_registry.clear();
        self.state.failover_acks.clear();
        self.state.presence = Presence::Present;
        self.pending_parent = None;

        debug!(node = %self.address, ?role, level, "placement installed");
        self.state.role = role;
        self.arm_role_timers(now);
        Ok(())
    }

    /// Switch role, announce it, and arm the timers the new role runs.
    pub(crate) fn set_role(&mut self, role: Role, level: u8, now: Timestamp) {
        info!(node = %self.address, from = ?self.state.role, to = ?role, level, "role change");
        self.state.role = role;
        self.state.level = level;
        self.push_event(Event::RoleChanged { role, level });
        self.arm_role_timers(now);
    }

    fn arm_role_timers(&mut self, now: Timestamp) {
        let c = &self.config;
        let t = &mut self.timers;
        t.obstacle_check = c.obstacle.map(|_| now + c.obstacle_check_interval);
        match self.state.role {
            Role::Leader => {
                t.promotion = None;
                t.hello = None;
                t.failover_check = None;
                t.solicit = Some(now);
                t.missing_check = Some(now + c.check_missing_interval);
            }
            Role::Member => {
                t.promotion = None;
                t.hello = Some(now + c.hello_interval);
                t.failover_check = c
                    .failover_candidate
                    .then(|| now + c.failover_check_interval);
                t.solicit = Some(now);
                t.missing_check = Some(now + c.check_missing_interval);
            }
            Role::Unassigned | Role::AwaitingConstruction | Role::AwaitingConfirmation => {
                t.solicit = None;
                t.hello = None;
                t.missing_check = None;
                t.failover_check = None;
                t.obstacle_check = None;
            }
        }
    }

    pub(crate) fn is_blacked_out(&self) -> bool {
        matches!(self.state.presence, Presence::Blackout { .. })
    }

    /// Push an event to the events channel.
    pub(crate) fn push_event(&mut self, event: Event) {
        let _ = self.events.try_send(event);
    }

    // --- Internal accessors for other modules ---

    pub(crate) fn state_mut(&mut self) -> &mut ClusterState {
        &mut self.state
    }

    pub(crate) fn timers_mut(&mut self) -> &mut Timers {
        &mut self.timers
    }

    pub(crate) fn pending_parent(&self) -> Option<NeighborRecord> {
        self.pending_parent
    }

    pub(crate) fn set_pending_parent(&mut self, pending: Option<NeighborRecord>) {
        self.pending_parent = pending;
    }

    pub(crate) fn strategy_mut(&mut self) -> &mut dyn FailoverStrategy {
        self.strategy.as_mut()
    }

    pub(crate) fn random_mut(&mut self) -> &mut R {
        &mut self.random
    }

    /// Whether `address` may appear as a routing-table key.
    pub(crate) fn routable(&self, address: &Address) -> bool {
        *address != self.address
            && !address.is_broadcast()
            && Some(*address) != self.state.parent_address()
            && Some(*address) != self.state.leader_address()
    }

    /// The record for ourselves as leader.
    pub(crate) fn self_record(&self, now: Timestamp) -> NeighborRecord {
        NeighborRecord::new(self.address, now, self.position())
    }

    // Metrics tracking methods

    pub(crate) fn record_sent(&mut self) {
        self.metrics.sent += 1;
    }

    pub(crate) fn record_dropped(&mut self) {
        self.metrics.dropped += 1;
    }

    pub(crate) fn record_relayed(&mut self) {
        self.metrics.relayed += 1;
    }

    pub(crate) fn record_route_miss(&mut self) {
        self.metrics.route_misses += 1;
    }

    pub(crate) fn record_violation(&mut self) {
        self.metrics.violations += 1;
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::types::Violation;

    fn a(id: u32) -> Address {
        Address::from_id(id)
    }

    #[test]
    fn test_new_node_is_unassigned() {
        let node = make_node(1);
        assert_eq!(node.role(), Role::Unassigned);
        assert_eq!(node.level(), 0);
        assert_eq!(node.next_wake(), None);
        assert!(node.state().leader.is_none());
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        use crate::traits::test_impls::{MockClock, MockLocator, MockRandom, MockTransport};
        let config = ClusterConfig {
            max_level: 0,
            ..Default::default()
        };
        let result = Node::new(
            a(1),
            MockTransport::new(),
            MockRandom::new(),
            MockClock::new(),
            MockLocator::default(),
            config,
        );
        assert!(matches!(result, Err(ConfigError::NoLevels)));
    }

    #[test]
    fn test_install_rejects_broken_placements() {
        let mut node = make_node(2);
        let member = Placement {
            task: 1,
            level: 2,
            parent: Some(a(1)),
            leader: a(1),
            children: vec![],
            routes: vec![],
            siblings: vec![],
            neighbor_roots: vec![],
        };

        let bad_root = Placement {
            parent: None,
            ..member.clone()
        };
        assert!(matches!(
            node.install(bad_root, Timestamp::ZERO),
            Err(Error::InvalidPlacement(_))
        ));

        let route_to_parent = Placement {
            routes: vec![(a(1), a(3))],
            ..member.clone()
        };
        assert!(node.install(route_to_parent, Timestamp::ZERO).is_err());

        let too_many = Placement {
            children: (10..30).map(a).collect(),
            ..member.clone()
        };
        assert!(node.install(too_many, Timestamp::ZERO).is_err());

        node.install(member, Timestamp::ZERO).unwrap();
        assert_eq!(node.role(), Role::Member);
        assert_eq!(node.state().parent_address(), Some(a(1)));
    }

    #[test]
    fn test_next_wake_follows_armed_timers() {
        let mut node = make_node(1);
        node.install(Placement::root(a(1), 1), Timestamp::from_secs(5))
            .unwrap();
        // Leaders solicit right away
        assert_eq!(node.next_wake(), Some(Timestamp::from_secs(5)));

        node.handle_timer(Timestamp::from_secs(5));
        let wake = node.next_wake().unwrap();
        assert!(wake > Timestamp::from_secs(5));
        assert!(wake <= Timestamp::from_secs(5) + node.config().check_missing_interval);
    }

    #[test]
    fn test_own_and_undecodable_frames() {
        let mut node = make_node(1);
        node.install(Placement::root(a(1), 1), Timestamp::ZERO).unwrap();

        let own = frame(a(1), Address::BROADCAST, false, Body::Return, Timestamp::ZERO);
        node.handle_transport_rx(&own, Timestamp::ZERO).unwrap();
        assert_eq!(node.metrics().received, 0);

        let err = node.handle_transport_rx(&[0, 0, 0], Timestamp::ZERO);
        assert!(matches!(err, Err(Error::Decode(_))));
        assert_eq!(node.metrics().decode_errors, 1);
    }

    #[test]
    fn test_violation_is_counted_and_returned() {
        let mut node = make_node(1);
        node.install(Placement::root(a(1), 1), Timestamp::ZERO).unwrap();

        let err = deliver(
            &mut node,
            a(9),
            Body::Hello {
                position: Position::default(),
                routes: vec![],
            },
            Timestamp::from_millis(10),
        )
        .unwrap_err();
        assert_eq!(err, Error::violation(a(9), Violation::HelloFromStranger));
        assert_eq!(node.metrics().violations, 1);
    }
}
