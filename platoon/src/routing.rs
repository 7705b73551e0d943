//! Next-hop routing table and the node's send primitives.
//!
//! Every address reachable through a child subtree maps to that child. Parent
//! and leader are never stored here; they are resolved directly. Entries are
//! learned when a child is admitted (its announced keys remapped to the child)
//! and refreshed on every HELLO the child sends.

use std::collections::BTreeMap;

use tracing::{error, trace, warn};

use crate::node::Node;
use crate::time::Timestamp;
use crate::traits::{Clock, Frame, Locator, Random, Transport};
use crate::types::{Address, Error, Role, Violation, MAX_ADDRESS_LIST};
use crate::wire::{Body, Encode, Header, Message};

/// Map from destination address to next-hop child.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RoutingTable {
    routes: BTreeMap<Address, Address>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn next_hop(&self, dest: &Address) -> Option<Address> {
        self.routes.get(dest).copied()
    }

    pub fn contains(&self, dest: &Address) -> bool {
        self.routes.contains_key(dest)
    }

    pub fn insert(&mut self, dest: Address, next_hop: Address) {
        self.routes.insert(dest, next_hop);
    }

    pub fn remove(&mut self, dest: &Address) -> Option<Address> {
        self.routes.remove(dest)
    }

    /// Drop every entry routed through `next_hop`. Returns how many went.
    pub fn remove_via(&mut self, next_hop: &Address) -> usize {
        let before = self.routes.len();
        self.routes.retain(|_, hop| hop != next_hop);
        before - self.routes.len()
    }

    /// Replace everything routed through `next_hop` with `dests`.
    pub fn replace_via(&mut self, next_hop: Address, dests: impl IntoIterator<Item = Address>) {
        self.remove_via(&next_hop);
        for dest in dests {
            self.routes.insert(dest, next_hop);
        }
    }

    /// Destination keys in address order.
    pub fn keys(&self) -> impl Iterator<Item = Address> + '_ {
        self.routes.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Address, Address)> + '_ {
        self.routes.iter().map(|(d, h)| (*d, *h))
    }
}

impl<T, R, Clk, L> Node<T, R, Clk, L>
where
    T: Transport,
    R: Random,
    Clk: Clock,
    L: Locator,
{
    /// Encode and queue one frame.
    pub(crate) fn emit(
        &mut self,
        next_hop: Address,
        dest: Address,
        group: bool,
        body: Body,
        now: Timestamp,
    ) {
        if self.is_blacked_out() {
            trace!(node = %self.address(), kind = body.name(), "suppressed during blackout");
            return;
        }
        let listed = body.longest_list();
        if listed > MAX_ADDRESS_LIST {
            error!(
                node = %self.address(),
                kind = body.name(),
                listed,
                max = MAX_ADDRESS_LIST,
                "address list over the wire cap, frame not sent"
            );
            self.record_dropped();
            return;
        }
        let header = Header {
            group,
            timestamp: now,
            dest,
            src: self.address(),
        };
        let kind = body.name();
        let data = Message::new(header, body).encode_to_vec();
        self.enqueue(Frame { next_hop, data }, kind);
    }

    fn enqueue(&mut self, frame: Frame, kind: &'static str) {
        let next_hop = frame.next_hop;
        match self.transport().outgoing().try_send(frame) {
            Ok(()) => {
                trace!(node = %self.address(), %next_hop, kind, "queued");
                self.record_sent();
            }
            Err(_) => {
                warn!(node = %self.address(), %next_hop, kind, "transport queue full, frame dropped");
                self.record_dropped();
            }
        }
    }

    /// One radio hop to a known neighbor.
    pub(crate) fn send_direct(&mut self, to: Address, body: Body, now: Timestamp) {
        self.emit(to, to, false, body, now);
    }

    pub(crate) fn broadcast(&mut self, body: Body, now: Timestamp) {
        self.emit(Address::BROADCAST, Address::BROADCAST, false, body, now);
    }

    /// Resolve the neighbor a frame for `dest` should be handed to.
    ///
    /// Parent and leader bypass the table.
    pub(crate) fn next_hop_for(&self, dest: &Address) -> Option<Address> {
        let state = self.state();
        let direct = state
            .parent
            .iter()
            .chain(state.leader.iter())
            .any(|r| r.address == *dest);
        if direct && *dest != self.address() {
            return Some(*dest);
        }
        state.routing.next_hop(dest)
    }

    /// Send toward `dest`, dropping with a warning when no route is known.
    ///
    /// Returns whether the frame was handed to the transport.
    pub(crate) fn send_routed(&mut self, dest: Address, body: Body, now: Timestamp) -> bool {
        match self.next_hop_for(&dest) {
            Some(next_hop) => {
                self.emit(next_hop, dest, false, body, now);
                true
            }
            None => {
                warn!(node = %self.address(), %dest, kind = body.name(), "no route, dropping");
                self.record_route_miss();
                false
            }
        }
    }

    /// Send to our tree's leader.
    ///
    /// A leader never addresses itself; its leader-side behavior runs inline
    /// instead.
    pub(crate) fn send_to_leader(&mut self, body: Body, now: Timestamp) -> Result<(), Error> {
        if self.state().role == Role::Leader {
            return Err(Error::violation(self.address(), Violation::SelfAddressed));
        }
        let Some(leader) = self.state().leader.map(|l| l.address) else {
            warn!(node = %self.address(), kind = body.name(), "no leader known, dropping");
            self.record_route_miss();
            return Ok(());
        };
        self.send_routed(leader, body, now);
        Ok(())
    }

    /// Forward a frame addressed to someone else one hop further.
    pub(crate) fn relay(&mut self, data: &[u8], dest: Address) {
        match self.state().routing.next_hop(&dest) {
            Some(next_hop) => {
                trace!(node = %self.address(), %dest, %next_hop, "relaying");
                self.record_relayed();
                self.enqueue(
                    Frame {
                        next_hop,
                        data: data.to_vec(),
                    },
                    "transit",
                );
            }
            None => {
                warn!(node = %self.address(), %dest, "no route for transit frame, dropping");
                self.record_route_miss();
            }
        }
    }

    /// Re-forward a group command to every address in our routing table.
    ///
    /// Copies travel unflagged: each table key receives its own addressed
    /// copy, so nobody below needs to fan out again.
    pub(crate) fn forward_group(&mut self, body: Body, now: Timestamp) {
        let dests: Vec<Address> = self.state().routing.keys().collect();
        for dest in dests {
            self.send_routed(dest, body.clone(), now);
        }
    }
}
