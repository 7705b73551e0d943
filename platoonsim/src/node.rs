//! SimNode wrapper for simulated vehicles.

use std::cell::Cell;
use std::future::{ready, Ready};

use embassy_sync::channel::Channel;
use platoon::traits::{TransportInChannel, TransportOutChannel};
use platoon::{
    Address, Clock, ClusterConfig, Command, ConfigError, Duration, Event, Frame, Locator, Node,
    Position, Random, Role, Timestamp, Transport,
};

/// In-memory transport drained by the simulator.
pub struct SimTransport {
    outgoing: TransportOutChannel,
    incoming: TransportInChannel,
}

impl SimTransport {
    pub fn new() -> Self {
        Self {
            outgoing: Channel::new(),
            incoming: Channel::new(),
        }
    }

    /// Take every frame queued for the medium.
    pub fn take_sent(&self) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.outgoing.try_receive() {
            frames.push(frame);
        }
        frames
    }
}

impl Default for SimTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for SimTransport {
    fn outgoing(&self) -> &TransportOutChannel {
        &self.outgoing
    }

    fn incoming(&self) -> &TransportInChannel {
        &self.incoming
    }
}

/// Clock driven by the simulator.
pub struct SimClock {
    current: Cell<Timestamp>,
}

impl SimClock {
    pub fn at(time: Timestamp) -> Self {
        Self {
            current: Cell::new(time),
        }
    }

    pub fn set(&self, time: Timestamp) {
        self.current.set(time);
    }

    pub fn advance(&self, duration: Duration) {
        self.current.set(self.current.get() + duration);
    }
}

impl Clock for SimClock {
    type SleepFuture<'a> = Ready<()>;

    fn now(&self) -> Timestamp {
        self.current.get()
    }

    fn sleep_until(&self, _time: Timestamp) -> Self::SleepFuture<'_> {
        ready(())
    }
}

/// Deterministic LCG.
pub struct SimRandom {
    state: u64,
}

impl SimRandom {
    pub fn with_seed(seed: u64) -> Self {
        Self { state: seed }
    }
}

impl Random for SimRandom {
    fn gen_range(&mut self, min: u64, max: u64) -> u64 {
        self.state = self.state.wrapping_mul(6364136223846793005).wrapping_add(1);
        let range = max.saturating_sub(min);
        if range == 0 {
            return min;
        }
        min + ((self.state >> 33) % range)
    }
}

/// Position set by the scenario.
pub struct SimLocator {
    position: Cell<Position>,
}

impl SimLocator {
    pub fn at(position: Position) -> Self {
        Self {
            position: Cell::new(position),
        }
    }

    pub fn set(&self, position: Position) {
        self.position.set(position);
    }
}

impl Locator for SimLocator {
    fn position(&self) -> Position {
        self.position.get()
    }
}

pub type SimNodeInner = Node<SimTransport, SimRandom, SimClock, SimLocator>;

/// A simulated vehicle.
pub struct SimNode {
    inner: SimNodeInner,
    pub created_at: Timestamp,
}

impl SimNode {
    pub fn new(
        address: Address,
        seed: u64,
        config: ClusterConfig,
        position: Position,
        created_at: Timestamp,
    ) -> Result<Self, ConfigError> {
        let inner = Node::new(
            address,
            SimTransport::new(),
            SimRandom::with_seed(seed),
            SimClock::at(created_at),
            SimLocator::at(position),
            config,
        )?;
        Ok(Self { inner, created_at })
    }

    pub fn address(&self) -> Address {
        self.inner.address()
    }

    pub fn inner(&self) -> &SimNodeInner {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut SimNodeInner {
        &mut self.inner
    }

    pub fn role(&self) -> Role {
        self.inner.role()
    }

    pub fn level(&self) -> u8 {
        self.inner.level()
    }

    pub fn is_leader(&self) -> bool {
        self.inner.is_leader()
    }

    pub fn leader(&self) -> Option<Address> {
        self.inner.state().leader_address()
    }

    pub fn parent(&self) -> Option<Address> {
        self.inner.state().parent_address()
    }

    pub fn position(&self) -> Position {
        self.inner.position()
    }

    pub fn set_position(&self, position: Position) {
        self.inner.locator().set(position);
    }

    pub fn next_wake(&self) -> Option<Timestamp> {
        self.inner.next_wake()
    }

    /// Handle a frame heard on the medium.
    pub fn handle_transport_rx(&mut self, data: &[u8], now: Timestamp) -> Result<(), platoon::Error> {
        self.inner.clock().set(now);
        self.inner.handle_transport_rx(data, now)
    }

    pub fn handle_timer(&mut self, now: Timestamp) {
        self.inner.clock().set(now);
        self.inner.handle_timer(now);
    }

    pub fn handle_command(&mut self, command: Command, now: Timestamp) -> Result<(), platoon::Error> {
        self.inner.clock().set(now);
        self.inner.handle_command(command, now)
    }

    pub fn take_outgoing(&self) -> Vec<Frame> {
        self.inner.transport().take_sent()
    }

    /// Drain the node's protocol events.
    pub fn take_events(&self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = self.inner.events().try_receive() {
            events.push(event);
        }
        events
    }
}
