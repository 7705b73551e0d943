#![forbid(unsafe_code)]
//! platoon - self-organizing group protocol for vehicles on a lossy radio
//!
//! Vehicles sharing a task organize into multi-level trees ("groups"). Each
//! tree has one leader at level 1; every other member hangs under a parent one
//! level up. The engine keeps that tree alive on a medium that drops and
//! delays frames:
//!
//! - **Membership**: nodes that see no group promote themselves to leader and
//!   solicit children with a CONSTRUCT handshake.
//! - **Liveness & routing**: members heartbeat their parent, which derives a
//!   routing table covering its whole subtree.
//! - **Fault detection & reattachment**: silent children are declared missing,
//!   searched for, and re-adopted by whoever hears them return.
//! - **Leader failover**: second-level candidates replace a silent leader
//!   once every sibling has answered.
//! - **Group dissemination**: a leader floods commands (obstacle avoidance)
//!   through its tree, each node receiving exactly one copy.
//!
//! # Example
//!
//! ```
//! use platoon::traits::test_impls::{MockClock, MockLocator, MockRandom, MockTransport};
//! use platoon::{Address, ClusterConfig, Node, Role, Timestamp};
//!
//! let mut node = Node::new(
//!     Address::from_id(1),
//!     MockTransport::new(),
//!     MockRandom::new(),
//!     MockClock::new(),
//!     MockLocator::default(),
//!     ClusterConfig::default(),
//! )
//! .unwrap();
//! assert_eq!(node.role(), Role::Unassigned);
//!
//! // Nobody answers within wait_construct_time, so the node founds its own group
//! node.assign_task(7, Timestamp::ZERO);
//! node.handle_timer(Timestamp::from_secs(2));
//! assert!(node.is_leader());
//! assert_eq!(node.level(), 1);
//! ```
//!
//! # Module Structure
//!
//! - [`types`] - Addresses, roles, events and errors
//! - [`wire`] - Message envelope and payload encoding
//! - [`traits`] - Transport, Clock, Random and Locator traits
//! - [`node`] - Main Node struct and public API
//! - [`children`] - Bounded children store
//! - [`routing`] - Routing table and send primitives
//! - [`time`] - Timestamp and Duration types
//! - [`config`] - Protocol tunables

pub mod children;
pub mod config;
pub mod node;
pub mod routing;
pub mod time;
pub mod traits;
pub mod types;
pub mod wire;

mod dissemination;
mod failover;
mod liveness;
mod membership;
mod recovery;

pub use children::ChildrenStore;
pub use config::{ClusterConfig, ConfigError, ObstacleConfig};
pub use failover::{FailoverStrategy, InitiatorWins};
pub use node::{ClusterState, FailoverAcks, Node, Placement, SearchRegistry};
pub use routing::RoutingTable;
pub use time::{Duration, Timestamp};
pub use traits::{Clock, Command, Frame, Locator, Random, Received, Transport};
pub use types::{
    Address, Error, Event, NeighborRecord, NodeMetrics, Position, Presence, Role, TaskId,
    Violation,
};
pub use wire::{Body, Decode, DecodeError, Encode, Header, Message};

/// Install a `tracing` subscriber honoring `RUST_LOG`, once per process.
#[cfg(test)]
pub(crate) fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
