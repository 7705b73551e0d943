//! Core protocol types: addresses, positions, roles, events and errors.

use core::fmt;

use crate::time::Timestamp;
use crate::wire::DecodeError;

// Message type codes (low 7 bits of the envelope type byte).
pub const MSG_HELLO: u8 = 0;
pub const MSG_HELLO_R: u8 = 1;
pub const MSG_CONSTRUCT: u8 = 2;
pub const MSG_CONSTRUCT_REPLY: u8 = 3;
pub const MSG_CONSTRUCT_CONFIRM: u8 = 4;
pub const MSG_RETURN: u8 = 6;
pub const MSG_RECEIVE: u8 = 7;
pub const MSG_MISSING: u8 = 8;
pub const MSG_SEARCH: u8 = 9;
pub const MSG_OBSTACLE: u8 = 11;
pub const MSG_RECEIVE_REPLY: u8 = 14;
pub const MSG_CHECK_LEADER: u8 = 15;
pub const MSG_CHECK_LEADER_REPLY: u8 = 16;
pub const MSG_NEW_LEADER: u8 = 17;
pub const MSG_NEW_LEADER_REPLY: u8 = 18;
pub const MSG_FOUND: u8 = 19;

/// High bit of the type byte: fan the message out through the subtree.
pub const GROUP_FLAG: u8 = 0x80;

/// Maximum number of addresses carried in one list field.
///
/// Route announcements list a node's whole subtree, so this also bounds the
/// subtree a configuration may allow (see `ClusterConfig::validate`).
pub const MAX_ADDRESS_LIST: usize = 1536;

/// Identifier of a construction round; nodes only join trees of their own task.
pub type TaskId = u32;

/// Six-byte link-layer address identifying one vehicle on the medium.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Address(pub [u8; 6]);

impl Address {
    pub const BROADCAST: Address = Address([0xff; 6]);

    /// Deterministic address for the `id`-th vehicle of a fleet.
    pub const fn from_id(id: u32) -> Self {
        let b = id.to_be_bytes();
        Address([0, 0, b[0], b[1], b[2], b[3]])
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let a = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            a[0], a[1], a[2], a[3], a[4], a[5]
        )
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self)
    }
}

/// Vehicle position in metres.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Position {
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Manhattan distance over truncated integer coordinates in the road
    /// plane. Altitude is ignored.
    pub fn manhattan(&self, other: &Position) -> u64 {
        let d = |a: f64, b: f64| ((a as i64) - (b as i64)).unsigned_abs();
        d(self.x, other.x) + d(self.y, other.y)
    }
}

/// Tracked peer: parent, leader, child, sibling or neighboring root.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NeighborRecord {
    pub address: Address,
    pub last_heartbeat: Timestamp,
    pub position: Position,
}

impl NeighborRecord {
    pub fn new(address: Address, last_heartbeat: Timestamp, position: Position) -> Self {
        Self {
            address,
            last_heartbeat,
            position,
        }
    }
}

/// Membership role of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Role {
    /// No task assigned yet.
    #[default]
    Unassigned,
    /// Task assigned, waiting for a CONSTRUCT solicitation.
    AwaitingConstruction,
    /// Replied to a solicitation, waiting for CONSTRUCT_CONFIRM.
    AwaitingConfirmation,
    Member,
    Leader,
}

impl Role {
    /// Leaders and members are part of a tree and keep it alive.
    pub fn in_tree(&self) -> bool {
        matches!(self, Role::Member | Role::Leader)
    }
}

/// Reachability of this node as driven by the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Presence {
    #[default]
    Present,
    /// Communication blackout: everything in and out is suppressed.
    Blackout { until: Timestamp },
    /// Reachable again but not yet reattached; beacons RETURN.
    Returning,
}

/// Events emitted by the node for the embedding application.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Our role changed.
    RoleChanged { role: Role, level: u8 },
    /// A new child was admitted.
    ChildAdmitted { child: Address },
    /// A child stopped sending heartbeats and was removed.
    ChildMissing { child: Address },
    /// We were reattached under a new parent after going missing.
    Rejoined { parent: Address },
    /// A missing node was reattached somewhere in our tree.
    Reattached { node: Address, parent: Address },
    /// The tree root was replaced.
    LeaderReplaced {
        former: Option<Address>,
        leader: Address,
    },
    /// Avoidance order for an obstacle.
    AvoidObstacle { obstacle: Position, from: Address },
}

/// Per-node transmission and handling counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeMetrics {
    pub sent: u64,
    pub received: u64,
    /// Outgoing frames lost to a full transport queue.
    pub dropped: u64,
    /// Frames forwarded on behalf of other nodes.
    pub relayed: u64,
    pub route_misses: u64,
    pub violations: u64,
    pub decode_errors: u64,
}

/// Relationship rules broken by a peer or by the local caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Violation {
    #[error("HELLO from a node that is not our child")]
    HelloFromStranger,
    #[error("HELLO_R from a node that is not our parent")]
    ReplyFromStranger,
    #[error("group command requested by a node that is not a leader")]
    NotLeader,
    #[error("leader tried to address itself as its own leader")]
    SelfAddressed,
}

/// Error type for node operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("protocol violation involving {peer}: {violation}")]
    ProtocolViolation { peer: Address, violation: Violation },
    #[error("placement rejected: {0}")]
    InvalidPlacement(&'static str),
    #[error("malformed frame: {0}")]
    Decode(#[from] DecodeError),
}

impl Error {
    pub fn violation(peer: Address, violation: Violation) -> Self {
        Error::ProtocolViolation { peer, violation }
    }
}
