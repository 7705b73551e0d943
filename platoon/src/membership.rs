//! Tree construction: solicit, reply, confirm.
//!
//! A node with a task waits `wait_construct_time` for someone in its tree to
//! solicit it. If a CONSTRUCT with the same task arrives first it answers and
//! waits for confirmation; otherwise it promotes itself to leader. Leaders and
//! members keep soliciting on a jittered interval while they have room.
//!
//! Admission through the handshake closes at two thirds of `max_children`;
//! the remaining third is reserved for reattaching missing nodes.

use tracing::{debug, info, trace};

use crate::node::Node;
use crate::time::{Duration, Timestamp};
use crate::traits::{Clock, Locator, Random, Transport};
use crate::types::{Address, Event, NeighborRecord, Position, Role, TaskId};
use crate::wire::Body;

impl<T, R, Clk, L> Node<T, R, Clk, L>
where
    T: Transport,
    R: Random,
    Clk: Clock,
    L: Locator,
{
    /// Start construction for `task`.
    ///
    /// Only an unassigned node takes a task; later assignments are ignored.
    pub fn assign_task(&mut self, task: TaskId, now: Timestamp) {
        if self.role() != Role::Unassigned {
            debug!(node = %self.address(), task, role = ?self.role(), "already assigned, ignoring task");
            return;
        }
        self.state_mut().task = Some(task);
        self.set_role(Role::AwaitingConstruction, 0, now);
        self.arm_promotion(now);
    }

    fn arm_promotion(&mut self, now: Timestamp) {
        let wait = self.config().wait_construct_time;
        self.timers_mut().promotion = Some(now + wait);
    }

    pub(crate) fn on_promotion_timer(&mut self, now: Timestamp) {
        match self.role() {
            Role::AwaitingConstruction => self.become_leader(now),
            Role::AwaitingConfirmation => {
                // The parent may already count us as a child, so keep waiting
                // on it and ask again in case the confirmation was lost
                self.arm_promotion(now);
                if let Some(parent) = self.pending_parent().map(|p| p.address) {
                    debug!(node = %self.address(), %parent, "no confirmation yet, replying again");
                    self.send_construct_reply(parent, now);
                }
            }
            _ => {}
        }
    }

    /// Become the root of a new tree.
    pub(crate) fn become_leader(&mut self, now: Timestamp) {
        let me = self.self_record(now);
        let state = self.state_mut();
        state.parent = None;
        state.leader = Some(me);
        self.set_pending_parent(None);
        self.set_role(Role::Leader, 1, now);
    }

    /// Broadcast CONSTRUCT if we can take more children, and re-arm.
    pub(crate) fn solicit(&mut self, now: Timestamp) {
        if !self.role().in_tree() {
            return;
        }
        let (interval, max_level) = (self.config().construct_interval, self.config().max_level);
        let open = self.config().admission_open(self.state().children.len());
        match self.state().task {
            Some(task) if open && self.level() < max_level => {
                let position = self.position();
                trace!(node = %self.address(), task, "soliciting");
                self.broadcast(Body::Construct { position, task }, now);
            }
            _ => {}
        }

        let quarter = interval.fraction(4).as_millis();
        let jitter = self.random_mut().gen_range(0, quarter + 1);
        self.timers_mut().solicit = Some(now + interval + Duration::from_millis(jitter));
    }

    pub(crate) fn handle_construct(
        &mut self,
        from: Address,
        sent_at: Timestamp,
        position: Position,
        task: TaskId,
        now: Timestamp,
    ) {
        if self.role() != Role::AwaitingConstruction || self.state().task != Some(task) {
            return;
        }
        debug!(node = %self.address(), parent = %from, task, "answering solicitation");
        self.set_pending_parent(Some(NeighborRecord::new(from, sent_at, position)));
        self.set_role(Role::AwaitingConfirmation, 0, now);
        self.send_construct_reply(from, now);
    }

    fn send_construct_reply(&mut self, parent: Address, now: Timestamp) {
        let Some(task) = self.state().task else {
            return;
        };
        let reply = Body::ConstructReply {
            position: self.position(),
            task,
            routes: self.state().routing.keys().collect(),
        };
        self.send_direct(parent, reply, now);
    }

    pub(crate) fn handle_construct_reply(
        &mut self,
        from: Address,
        sent_at: Timestamp,
        position: Position,
        task: TaskId,
        routes: Vec<Address>,
        now: Timestamp,
    ) {
        if !self.role().in_tree() || self.state().task != Some(task) {
            return;
        }
        let record = NeighborRecord::new(from, sent_at, position);

        let accept = if self.state().children.contains(&from) {
            // Our earlier confirmation was lost; confirm again
            self.state_mut().children.try_insert(record);
            true
        } else if self.config().admission_open(self.state().children.len()) {
            self.admit_child(record, routes)
        } else {
            false
        };

        let confirm = if accept {
            let siblings = if self.is_leader() {
                self.state().children.addresses().filter(|c| *c != from).collect()
            } else {
                Vec::new()
            };
            Body::ConstructConfirm {
                accept: true,
                task,
                level: self.level().saturating_add(1),
                leader: self.state().leader_address().unwrap_or(self.address()),
                siblings,
            }
        } else {
            debug!(node = %self.address(), child = %from, "at capacity, rejecting");
            Body::ConstructConfirm {
                accept: false,
                task,
                level: 0,
                leader: self.state().leader_address().unwrap_or(self.address()),
                siblings: Vec::new(),
            }
        };
        self.send_direct(from, confirm, now);
    }

    /// Add a child and its announced routes. Fails only at hard capacity.
    pub(crate) fn admit_child(&mut self, record: NeighborRecord, routes: Vec<Address>) -> bool {
        let child = record.address;
        if !self.state_mut().children.try_insert(record) {
            return false;
        }
        let keys: Vec<Address> = routes
            .into_iter()
            .filter(|k| *k != child && self.routable(k))
            .collect();
        let routing = &mut self.state_mut().routing;
        routing.replace_via(child, keys);
        routing.insert(child, child);

        info!(node = %self.address(), %child, children = self.state().children.len(), "child admitted");
        self.push_event(Event::ChildAdmitted { child });
        true
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn handle_construct_confirm(
        &mut self,
        from: Address,
        sent_at: Timestamp,
        accept: bool,
        task: TaskId,
        level: u8,
        leader: Address,
        siblings: Vec<Address>,
        now: Timestamp,
    ) {
        if self.role() != Role::AwaitingConfirmation || self.state().task != Some(task) {
            return;
        }
        let Some(parent) = self.pending_parent().filter(|p| p.address == from) else {
            return;
        };
        self.set_pending_parent(None);

        if !accept {
            debug!(node = %self.address(), parent = %from, "rejected, waiting again");
            self.set_role(Role::AwaitingConstruction, 0, now);
            self.arm_promotion(now);
            return;
        }

        let parent = NeighborRecord {
            last_heartbeat: sent_at,
            ..parent
        };
        let leader_record = if leader == from {
            parent
        } else {
            NeighborRecord::new(leader, sent_at, Position::default())
        };
        let me = self.address();
        let state = self.state_mut();
        state.parent = Some(parent);
        state.leader = Some(leader_record);
        state.siblings = siblings.into_iter().filter(|s| *s != me).collect();
        state.routing.remove(&from);
        state.routing.remove(&leader);
        self.set_role(Role::Member, level, now);
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::config::ClusterConfig;
    use crate::node::testing::*;
    use crate::traits::Command;

    fn a(id: u32) -> Address {
        Address::from_id(id)
    }

    fn ms(v: u64) -> Timestamp {
        Timestamp::from_millis(v)
    }

    fn reply(task: TaskId, routes: Vec<Address>) -> Body {
        Body::ConstructReply {
            position: Position::default(),
            task,
            routes,
        }
    }

    #[test]
    fn test_promotes_exactly_at_wait_construct_time() {
        let mut node = make_node(1);
        node.handle_command(Command::AssignTask(7), ms(100)).unwrap();
        assert_eq!(node.role(), Role::AwaitingConstruction);

        let deadline = ms(100) + node.config().wait_construct_time;
        assert_eq!(node.next_wake(), Some(deadline));

        node.handle_timer(ms(2099));
        assert_eq!(node.role(), Role::AwaitingConstruction);

        node.handle_timer(deadline);
        assert_eq!(node.role(), Role::Leader);
        assert_eq!(node.level(), 1);
        assert_eq!(node.state().leader_address(), Some(node.address()));
        assert!(events(&node).contains(&Event::RoleChanged {
            role: Role::Leader,
            level: 1
        }));
    }

    #[test]
    fn test_mismatched_task_is_ignored() {
        let mut node = make_node(2);
        node.assign_task(7, ms(0));
        deliver_broadcast(
            &mut node,
            a(1),
            Body::Construct {
                position: Position::default(),
                task: 8,
            },
            ms(10),
        )
        .unwrap();
        assert_eq!(node.role(), Role::AwaitingConstruction);
        assert!(sent(&node).is_empty());
    }

    #[test]
    fn test_handshake_builds_member() {
        let mut leader = make_node(1);
        let mut joiner = make_node(2);
        leader.assign_task(7, ms(0));
        joiner.assign_task(7, ms(500));
        // Promotion and the first solicitation happen in the same pass
        leader.handle_timer(ms(2000));
        assert!(leader.is_leader());
        let solicit = leader.transport().take_sent();
        assert_eq!(solicit.len(), 1);
        joiner.handle_transport_rx(&solicit[0].data, ms(2001)).unwrap();
        assert_eq!(joiner.role(), Role::AwaitingConfirmation);

        let answer = joiner.transport().take_sent();
        assert_eq!(answer.len(), 1);
        assert_eq!(answer[0].next_hop, a(1));
        leader.handle_transport_rx(&answer[0].data, ms(2002)).unwrap();
        assert!(leader.state().children.contains(&a(2)));
        assert_eq!(leader.state().routing.next_hop(&a(2)), Some(a(2)));

        let confirm = leader.transport().take_sent();
        joiner.handle_transport_rx(&confirm[0].data, ms(2003)).unwrap();
        assert_eq!(joiner.role(), Role::Member);
        assert_eq!(joiner.level(), 2);
        assert_eq!(joiner.state().parent_address(), Some(a(1)));
        assert_eq!(joiner.state().leader_address(), Some(a(1)));
        // Members start soliciting their own subtree at once
        assert_eq!(joiner.next_wake(), Some(ms(2003)));
    }

    #[test]
    fn test_leader_confirm_lists_siblings() {
        let mut leader = make_node(1);
        leader.assign_task(7, ms(0));
        leader.handle_timer(ms(2000));
        sent(&leader);

        deliver(&mut leader, a(2), reply(7, vec![]), ms(2100)).unwrap();
        deliver(&mut leader, a(3), reply(7, vec![]), ms(2200)).unwrap();
        let frames = sent(&leader);
        match &frames[1].1.body {
            Body::ConstructConfirm {
                accept, siblings, level, ..
            } => {
                assert!(accept);
                assert_eq!(*level, 2);
                assert_eq!(siblings, &vec![a(2)]);
            }
            other => panic!("expected confirm, got {:?}", other),
        }
    }

    #[test]
    fn test_rejection_rearms_promotion() {
        let mut node = make_node(2);
        node.assign_task(7, ms(0));
        deliver_broadcast(
            &mut node,
            a(1),
            Body::Construct {
                position: Position::default(),
                task: 7,
            },
            ms(1500),
        )
        .unwrap();
        deliver(
            &mut node,
            a(1),
            Body::ConstructConfirm {
                accept: false,
                task: 7,
                level: 0,
                leader: a(1),
                siblings: vec![],
            },
            ms(1600),
        )
        .unwrap();
        assert_eq!(node.role(), Role::AwaitingConstruction);
        // A full new window, not the original deadline
        assert_eq!(node.next_wake(), Some(ms(1600) + node.config().wait_construct_time));
    }

    #[test]
    fn test_late_confirm_after_promotion_deadline() {
        let mut leader = make_node(1);
        leader.install(crate::node::Placement::root(a(1), 7), ms(0)).unwrap();
        let mut joiner = make_node(2);
        joiner.assign_task(7, ms(0));

        // Answered just before the 2000ms deadline
        deliver_broadcast(
            &mut joiner,
            a(1),
            Body::Construct {
                position: Position::default(),
                task: 7,
            },
            ms(1990),
        )
        .unwrap();
        let answer = joiner.transport().take_sent();
        leader.handle_transport_rx(&answer[0].data, ms(1995)).unwrap();
        let confirm = leader.transport().take_sent();
        assert!(leader.state().children.contains(&a(2)));

        joiner.handle_timer(ms(2000));
        assert_eq!(joiner.role(), Role::AwaitingConfirmation);
        assert_eq!(joiner.next_wake(), Some(ms(4000)));
        let again = joiner.transport().take_sent();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].next_hop, a(1));

        joiner.handle_transport_rx(&confirm[0].data, ms(2001)).unwrap();
        assert_eq!(joiner.role(), Role::Member);
        assert_eq!(joiner.level(), 2);
        assert_eq!(joiner.state().parent_address(), Some(a(1)));

        // The repeated reply is confirmed again, not admitted twice
        leader.handle_transport_rx(&again[0].data, ms(2002)).unwrap();
        assert_eq!(leader.state().children.len(), 1);
        let reconfirm = leader.transport().take_sent();
        joiner.handle_transport_rx(&reconfirm[0].data, ms(2003)).unwrap();
        assert_eq!(joiner.role(), Role::Member);
    }

    #[test]
    fn test_lost_confirm_is_asked_for_again() {
        let mut joiner = make_node(2);
        joiner.assign_task(7, ms(0));
        deliver_broadcast(
            &mut joiner,
            a(1),
            Body::Construct {
                position: Position::default(),
                task: 7,
            },
            ms(100),
        )
        .unwrap();
        sent(&joiner);

        for deadline in [ms(2000), ms(4000)] {
            joiner.handle_timer(deadline);
            assert_eq!(joiner.role(), Role::AwaitingConfirmation);
            let out = sent(&joiner);
            assert_eq!(out.len(), 1);
            assert_eq!(out[0].0, a(1));
            assert!(matches!(out[0].1.body, Body::ConstructReply { task: 7, .. }));
        }
    }

    #[test]
    fn test_confirm_level_saturates() {
        let config = ClusterConfig {
            max_children: 1,
            max_level: u8::MAX,
            ..Default::default()
        };
        let mut node = make_node_with(2, config);
        node.install(
            crate::node::Placement {
                task: 7,
                level: u8::MAX,
                parent: Some(a(1)),
                leader: a(1),
                children: vec![],
                routes: vec![],
                siblings: vec![],
                neighbor_roots: vec![],
            },
            ms(0),
        )
        .unwrap();
        deliver(&mut node, a(3), reply(7, vec![]), ms(10)).unwrap();
        match &sent(&node)[0].1.body {
            Body::ConstructConfirm { accept, level, .. } => {
                assert!(accept);
                assert_eq!(*level, u8::MAX);
            }
            other => panic!("expected confirm, got {:?}", other),
        }
    }

    #[test]
    fn test_confirm_from_other_node_is_ignored() {
        let mut node = make_node(2);
        node.assign_task(7, ms(0));
        deliver_broadcast(
            &mut node,
            a(1),
            Body::Construct {
                position: Position::default(),
                task: 7,
            },
            ms(100),
        )
        .unwrap();
        deliver(
            &mut node,
            a(5),
            Body::ConstructConfirm {
                accept: true,
                task: 7,
                level: 2,
                leader: a(5),
                siblings: vec![],
            },
            ms(200),
        )
        .unwrap();
        assert_eq!(node.role(), Role::AwaitingConfirmation);
    }

    #[test]
    fn test_no_solicitation_at_max_level() {
        let config = ClusterConfig {
            max_level: 2,
            ..Default::default()
        };
        let mut node = make_node_with(2, config);
        node.install(
            crate::node::Placement {
                task: 1,
                level: 2,
                parent: Some(a(1)),
                leader: a(1),
                children: vec![],
                routes: vec![],
                siblings: vec![],
                neighbor_roots: vec![],
            },
            ms(0),
        )
        .unwrap();
        node.handle_timer(ms(0));
        assert!(sent(&node).is_empty());
        // Still re-armed for later
        assert!(node.next_wake().is_some());
    }

    #[test]
    fn test_duplicate_reply_reconfirms_without_readmitting() {
        let mut leader = make_node(1);
        leader.install(crate::node::Placement::root(a(1), 7), ms(0)).unwrap();
        deliver(&mut leader, a(2), reply(7, vec![]), ms(10)).unwrap();
        deliver(&mut leader, a(2), reply(7, vec![]), ms(20)).unwrap();
        assert_eq!(leader.state().children.len(), 1);
        let admitted = events(&leader)
            .into_iter()
            .filter(|e| matches!(e, Event::ChildAdmitted { .. }))
            .count();
        assert_eq!(admitted, 1);
        assert_eq!(sent(&leader).len(), 2);
    }

    proptest! {
        #[test]
        fn prop_admission_bound(max_children in 1usize..12, replies in 0u32..40) {
            let config = ClusterConfig { max_children, ..Default::default() };
            let mut leader = make_node_with(1, config.clone());
            leader.install(crate::node::Placement::root(a(1), 7), ms(0)).unwrap();

            for i in 0..replies {
                let before = leader.state().children.len();
                deliver(&mut leader, a(100 + i), reply(7, vec![]), ms(i as u64)).unwrap();
                let frames = sent(&leader);
                let accepted = matches!(
                    frames.last().map(|(_, m)| &m.body),
                    Some(Body::ConstructConfirm { accept: true, .. })
                );
                prop_assert_eq!(accepted, config.admission_open(before));
                prop_assert!(leader.state().children.len() <= max_children);
                prop_assert!(3 * before < 2 * max_children || !accepted);
            }
        }
    }
}
