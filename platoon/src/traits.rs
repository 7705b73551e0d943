//! Core traits for transport, time, randomness and positioning.
//!
//! These traits allow the protocol to be used with different:
//! - Transport layers (802.11p broadcast medium, simulation)
//! - Time sources (vehicle clock, simulated time)
//! - Random number generators
//! - Positioning sources (GNSS, simulated kinematics)

use core::future::Future;

use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::channel::Channel;

use crate::time::{Duration, Timestamp};
use crate::types::{Address, Event, Position, TaskId, MAX_ADDRESS_LIST};

/// Queue size for outgoing frames.
///
/// A group command fans out one copy per routing key in a single pass, so the
/// queue holds the largest subtree a valid configuration allows plus headroom.
pub(crate) const TRANSPORT_OUT_QUEUE_SIZE: usize = MAX_ADDRESS_LIST + 64;

/// Queue size for received frames.
pub(crate) const TRANSPORT_IN_QUEUE_SIZE: usize = 64;

/// Queue size for the application command channel.
pub(crate) const COMMAND_QUEUE_SIZE: usize = 8;

/// Queue size for event channel.
pub(crate) const EVENT_QUEUE_SIZE: usize = 32;

/// Mutex type used for channels.
///
/// A node and its transport live on one executor, so no locking is needed.
pub(crate) type ChannelMutex = NoopRawMutex;

/// A frame handed to the medium, addressed to a single next hop or broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub next_hop: Address,
    pub data: Vec<u8>,
}

/// A frame picked up from the medium.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    pub data: Vec<u8>,
}

impl Received {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }
}

/// Orders from the embedding application.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    /// Start construction for a task.
    AssignTask(TaskId),
    /// Go silent for the given time, then try to rejoin.
    MarkMissing(Duration),
    /// Report an obstacle. Members forward it to their leader, a leader
    /// disseminates it through the tree.
    Avoid(Position),
}

/// Outgoing transport channel type.
pub type TransportOutChannel = Channel<ChannelMutex, Frame, TRANSPORT_OUT_QUEUE_SIZE>;

/// Incoming transport channel type.
pub type TransportInChannel = Channel<ChannelMutex, Received, TRANSPORT_IN_QUEUE_SIZE>;

/// Application command channel.
pub type CommandChannel = Channel<ChannelMutex, Command, COMMAND_QUEUE_SIZE>;

/// Protocol event channel.
pub type EventChannel = Channel<ChannelMutex, Event, EVENT_QUEUE_SIZE>;

/// Transport trait for radio/network backends.
///
/// - `outgoing()`: frames the node wants on the medium, each with its next hop
/// - `incoming()`: raw frames received from the medium
///
/// ```
/// use platoon::traits::test_impls::MockTransport;
/// use platoon::traits::{Frame, Transport};
/// use platoon::Address;
///
/// let transport = MockTransport::new();
/// transport.outgoing().try_send(Frame {
///     next_hop: Address::BROADCAST,
///     data: vec![1, 2, 3],
/// }).unwrap();
///
/// let sent = transport.take_sent();
/// assert_eq!(sent.len(), 1);
/// assert!(sent[0].next_hop.is_broadcast());
/// ```
pub trait Transport {
    fn outgoing(&self) -> &TransportOutChannel;

    /// - Radio driver calls `incoming().try_send(frame)` when data arrives
    /// - Node calls `incoming().receive().await` to receive
    fn incoming(&self) -> &TransportInChannel;
}

/// Time source trait for real or simulated time.
///
/// ```
/// use platoon::traits::test_impls::MockClock;
/// use platoon::{Clock, Duration, Timestamp};
///
/// let clock = MockClock::new();
/// assert_eq!(clock.now(), Timestamp::ZERO);
///
/// clock.advance(Duration::from_millis(500));
/// assert_eq!(clock.now(), Timestamp::from_millis(500));
/// ```
pub trait Clock {
    /// Future type returned by sleep_until.
    type SleepFuture<'a>: Future<Output = ()>
    where
        Self: 'a;

    fn now(&self) -> Timestamp;

    /// Sleep until the given timestamp.
    fn sleep_until(&self, time: Timestamp) -> Self::SleepFuture<'_>;
}

/// Random number generator trait, used for solicitation jitter.
pub trait Random {
    /// Generate a random u64 in the range [min, max).
    fn gen_range(&mut self, min: u64, max: u64) -> u64;
}

/// Source of the vehicle's own position.
pub trait Locator {
    fn position(&self) -> Position;
}

#[cfg(any(test, feature = "test-support"))]
pub mod test_impls {
    //! Mock implementations of traits for unit testing and doc tests.
    //!
    //! Available when running tests or with the `test-support` feature enabled.

    use core::cell::Cell;
    use core::future::{ready, Ready};

    use super::*;

    /// Mock transport backed by plain channels.
    pub struct MockTransport {
        outgoing: TransportOutChannel,
        incoming: TransportInChannel,
    }

    impl Default for MockTransport {
        fn default() -> Self {
            Self {
                outgoing: Channel::new(),
                incoming: Channel::new(),
            }
        }
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self::default()
        }

        /// Inject a frame as if it was received (for testing).
        pub fn inject_rx(&self, data: Vec<u8>) {
            let _ = self.incoming.try_send(Received::new(data));
        }

        /// Take all queued outgoing frames in send order (for testing).
        pub fn take_sent(&self) -> Vec<Frame> {
            let mut frames = Vec::new();
            while let Ok(frame) = self.outgoing.try_receive() {
                frames.push(frame);
            }
            frames
        }
    }

    impl Transport for MockTransport {
        fn outgoing(&self) -> &TransportOutChannel {
            &self.outgoing
        }

        fn incoming(&self) -> &TransportInChannel {
            &self.incoming
        }
    }

    /// Mock clock for testing (synchronous, time advances manually).
    #[derive(Default)]
    pub struct MockClock {
        current: Cell<Timestamp>,
    }

    impl MockClock {
        pub fn new() -> Self {
            Self::default()
        }

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

    impl Clock for MockClock {
        type SleepFuture<'a> = Ready<()>;

        fn now(&self) -> Timestamp {
            self.current.get()
        }

        fn sleep_until(&self, _time: Timestamp) -> Self::SleepFuture<'_> {
            // Tests drive time by hand
            ready(())
        }
    }

    /// Mock random for testing (deterministic LCG).
    pub struct MockRandom {
        pub state: u64,
    }

    impl Default for MockRandom {
        fn default() -> Self {
            Self { state: 12345 }
        }
    }

    impl MockRandom {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_seed(seed: u64) -> Self {
            Self { state: seed }
        }
    }

    impl Random for MockRandom {
        fn gen_range(&mut self, min: u64, max: u64) -> u64 {
            self.state = self.state.wrapping_mul(6364136223846793005).wrapping_add(1);
            let range = max.saturating_sub(min);
            if range == 0 {
                return min;
            }
            min + (self.state % range)
        }
    }

    /// Fixed or hand-moved position.
    #[derive(Default)]
    pub struct MockLocator {
        position: Cell<Position>,
    }

    impl MockLocator {
        pub fn at(position: Position) -> Self {
            Self {
                position: Cell::new(position),
            }
        }

        pub fn set(&self, position: Position) {
            self.position.set(position);
        }
    }

    impl Locator for MockLocator {
        fn position(&self) -> Position {
            self.position.get()
        }
    }
}
