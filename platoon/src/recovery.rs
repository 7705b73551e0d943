//! Missing-child detection and reattachment.
//!
//! # Detection
//!
//! Every `check_missing_interval` the node scans its children. The first one
//! (in address order) whose last heartbeat is more than `max_hello_interval`
//! old is removed with every route through it, and a search is opened:
//!
//! - A member registers the address and broadcasts one SEARCH to its children.
//! - A leader does the same and also sends MISSING to each neighboring root.
//!   It never routes anything to itself.
//!
//! Only one child is handled per scan; the next scan catches the rest.
//!
//! # Reattachment
//!
//! ```text
//! missing node             any node holding a search entry        leader
//!   RETURN (broadcast) --->
//!                      <--- RECEIVE{task, leader, level, siblings}
//!   RECEIVE_REPLY{routes} ->
//!                           admits child, FOUND{found, parent} --->
//! ```
//!
//! A node in blackout hears and sends nothing. Once the blackout ends it
//! beacons RETURN every `return_interval` and accepts only RECEIVE.

use tracing::{debug, info, trace};

use crate::node::Node;
use crate::time::{Duration, Timestamp};
use crate::traits::{Clock, Locator, Random, Transport};
use crate::types::{
    Address, Error, Event, NeighborRecord, Position, Presence, Role, TaskId,
};
use crate::wire::Body;

impl<T, R, Clk, L> Node<T, R, Clk, L>
where
    T: Transport,
    R: Random,
    Clk: Clock,
    L: Locator,
{
    /// Go silent for `duration`, then try to rejoin.
    pub fn mark_missing(&mut self, duration: Duration, now: Timestamp) {
        let until = now + duration;
        info!(node = %self.address(), %until, "entering blackout");
        self.state_mut().presence = Presence::Blackout { until };
    }

    pub(crate) fn send_return_beacon(&mut self, now: Timestamp) {
        trace!(node = %self.address(), "beaconing RETURN");
        self.broadcast(Body::Return, now);
        let interval = self.config().return_interval;
        self.timers_mut().return_beacon = Some(now + interval);
    }

    /// Scan for one child that stopped sending heartbeats.
    pub(crate) fn check_missing(&mut self, now: Timestamp) {
        if !self.role().in_tree() {
            return;
        }
        let interval = self.config().check_missing_interval;
        self.timers_mut().missing_check = Some(now + interval);

        let threshold = self.config().max_hello_interval;
        let Some(child) = self.state().children.first_stale(now, threshold) else {
            return;
        };

        let state = self.state_mut();
        state.children.remove(&child);
        state.routing.remove(&child);
        let dropped = state.routing.remove_via(&child);
        info!(node = %self.address(), %child, dropped, "child missing");
        self.push_event(Event::ChildMissing { child });

        let deadline = now + self.config().search_time;
        self.state_mut().search_registry.insert(child, deadline);
        self.broadcast(
            Body::Search {
                missing: child,
                deadline,
            },
            now,
        );

        if self.is_leader() {
            let roots: Vec<Address> = self.state().neighbor_roots.iter().copied().collect();
            for root in roots {
                self.send_direct(
                    root,
                    Body::Missing {
                        missing: child,
                        deadline,
                    },
                    now,
                );
            }
        }
    }

    pub(crate) fn handle_search(&mut self, from: Address, missing: Address, deadline: Timestamp) {
        if self.state().parent_address() != Some(from) || missing == self.address() {
            return;
        }
        debug!(node = %self.address(), %missing, %deadline, "search registered");
        self.state_mut().search_registry.insert(missing, deadline);
    }

    /// Root-to-root missing notice. Registered and searched locally, never re-notified.
    pub(crate) fn handle_missing(
        &mut self,
        from: Address,
        missing: Address,
        deadline: Timestamp,
        now: Timestamp,
    ) {
        if !self.is_leader() || !self.state().neighbor_roots.contains(&from) {
            return;
        }
        debug!(node = %self.address(), root = %from, %missing, "missing notice from neighbor root");
        self.state_mut().search_registry.insert(missing, deadline);
        self.broadcast(Body::Search { missing, deadline }, now);
    }

    pub(crate) fn handle_return(&mut self, from: Address, now: Timestamp) {
        self.state_mut()
            .search_registry
            .retain(|_, deadline| *deadline > now);

        if !self.state().search_registry.contains_key(&from)
            || !self.role().in_tree()
            || self.state().children.is_full()
        {
            return;
        }
        let Some(task) = self.state().task else {
            return;
        };
        let leader = self.state().leader_address().unwrap_or(self.address());
        let siblings = if self.is_leader() {
            self.state().children.addresses().collect()
        } else {
            Vec::new()
        };
        debug!(node = %self.address(), returning = %from, "offering reattachment");
        self.send_direct(
            from,
            Body::Receive {
                task,
                leader,
                level: self.level().saturating_add(1),
                siblings,
            },
            now,
        );
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn handle_receive(
        &mut self,
        from: Address,
        sent_at: Timestamp,
        task: TaskId,
        leader: Address,
        level: u8,
        siblings: Vec<Address>,
        now: Timestamp,
    ) {
        if self.presence() != Presence::Returning {
            return;
        }
        let parent = NeighborRecord::new(from, sent_at, Position::default());
        let me = self.address();
        let state = self.state_mut();
        state.presence = Presence::Present;
        state.task = Some(task);
        state.parent = Some(parent);
        state.leader = Some(if leader == from {
            parent
        } else {
            NeighborRecord::new(leader, sent_at, Position::default())
        });
        state.siblings = siblings.into_iter().filter(|s| *s != me).collect();
        state.failover_acks.clear();
        state.routing.remove(&from);
        state.routing.remove(&leader);
        self.timers_mut().return_beacon = None;
        self.set_pending_parent(None);

        info!(node = %self.address(), parent = %from, level, "rejoined");
        self.set_role(Role::Member, level, now);
        let routes = self.state().routing.keys().collect();
        self.send_direct(from, Body::ReceiveReply { routes }, now);
        self.push_event(Event::Rejoined { parent: from });
    }

    pub(crate) fn handle_receive_reply(
        &mut self,
        from: Address,
        sent_at: Timestamp,
        routes: Vec<Address>,
        now: Timestamp,
    ) -> Result<(), Error> {
        if !self.state().search_registry.contains_key(&from) {
            return Ok(());
        }
        // Reattachment uses the slack above the construction guard
        if !self.admit_child(NeighborRecord::new(from, sent_at, Position::default()), routes) {
            debug!(node = %self.address(), child = %from, "full, cannot reattach");
            return Ok(());
        }
        self.state_mut().search_registry.remove(&from);

        let me = self.address();
        if self.is_leader() {
            info!(node = %me, node_found = %from, "reattached");
            self.push_event(Event::Reattached {
                node: from,
                parent: me,
            });
            Ok(())
        } else {
            self.send_to_leader(
                Body::Found {
                    found: from,
                    parent: me,
                },
                now,
            )
        }
    }

    pub(crate) fn handle_found(&mut self, from: Address, found: Address, parent: Address) {
        if !self.is_leader() {
            return;
        }
        self.state_mut().search_registry.remove(&found);
        info!(node = %self.address(), reporter = %from, node_found = %found, %parent, "reattached");
        self.push_event(Event::Reattached {
            node: found,
            parent,
        });
    }
}
