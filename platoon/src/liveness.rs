//! Member-to-parent heartbeats.
//!
//! Every member sends HELLO to its parent each `hello_interval`, announcing
//! its routing keys. The parent refreshes the child's record with the
//! envelope timestamp, re-derives every route through that child, and answers
//! HELLO_R. A HELLO from anyone but a child, or a HELLO_R from anyone but the
//! parent, is a protocol violation.

use tracing::trace;

use crate::node::Node;
use crate::time::Timestamp;
use crate::traits::{Clock, Locator, Random, Transport};
use crate::types::{Address, Error, Position, Role, Violation};
use crate::wire::Body;

impl<T, R, Clk, L> Node<T, R, Clk, L>
where
    T: Transport,
    R: Random,
    Clk: Clock,
    L: Locator,
{
    pub(crate) fn send_hello(&mut self, now: Timestamp) {
        if self.role() != Role::Member {
            return;
        }
        if let Some(parent) = self.state().parent_address() {
            let hello = Body::Hello {
                position: self.position(),
                routes: self.state().routing.keys().collect(),
            };
            self.send_direct(parent, hello, now);
        }
        let interval = self.config().hello_interval;
        self.timers_mut().hello = Some(now + interval);
    }

    pub(crate) fn handle_hello(
        &mut self,
        from: Address,
        sent_at: Timestamp,
        position: Position,
        routes: Vec<Address>,
        now: Timestamp,
    ) -> Result<(), Error> {
        if !self.state_mut().children.refresh(&from, sent_at, position) {
            return Err(Error::violation(from, Violation::HelloFromStranger));
        }
        let keys: Vec<Address> = routes
            .into_iter()
            .filter(|k| *k != from && self.routable(k))
            .collect();
        trace!(node = %self.address(), child = %from, routes = keys.len(), "heartbeat");
        let routing = &mut self.state_mut().routing;
        routing.replace_via(from, keys);
        routing.insert(from, from);

        self.send_direct(from, Body::HelloReply, now);
        Ok(())
    }

    pub(crate) fn handle_hello_reply(&mut self, from: Address, sent_at: Timestamp) -> Result<(), Error> {
        let state = self.state_mut();
        match state.parent.as_mut() {
            Some(parent) if parent.address == from => parent.last_heartbeat = sent_at,
            _ => return Err(Error::violation(from, Violation::ReplyFromStranger)),
        }
        if let Some(leader) = state.leader.as_mut().filter(|l| l.address == from) {
            leader.last_heartbeat = sent_at;
        }
        Ok(())
    }
}
