//! Leader failover among second-level nodes.
//!
//! A second-level member flagged as `failover_candidate` checks its leader's
//! heartbeat every `failover_check_interval`. When the leader has been silent
//! for `max_hello_interval` it asks every sibling with CHECK_LEADER and waits
//! for CHECK_LEADER_REPLY from all of them (a full quorum, not a majority).
//! With the quorum complete and the strategy agreeing, it becomes leader and
//! announces itself with NEW_LEADER. Siblings adopt it as parent and leader
//! and answer NEW_LEADER_REPLY, which the new leader admits as children.

use tracing::{debug, info};

use crate::node::{FailoverAcks, Node};
use crate::time::Timestamp;
use crate::traits::{Clock, Locator, Random, Transport};
use crate::types::{Address, Event, NeighborRecord, Position, Role};
use crate::wire::Body;

/// Decides who takes over a silent tree and what happens after.
pub trait FailoverStrategy {
    /// Whether `candidate`, having heard from every sibling, takes over.
    fn claims(&mut self, candidate: Address, acks: &FailoverAcks) -> bool;

    /// Called on every node that sees the root change, after the local state
    /// has been updated. Deeper re-rooting of subtrees hooks in here.
    fn on_reroot(&mut self, leader: Address, former: Option<Address>) {
        let _ = (leader, former);
    }
}

/// The candidate that noticed the silence first always takes over.
#[derive(Debug, Clone, Copy, Default)]
pub struct InitiatorWins;

impl FailoverStrategy for InitiatorWins {
    fn claims(&mut self, _candidate: Address, _acks: &FailoverAcks) -> bool {
        true
    }
}

impl<T, R, Clk, L> Node<T, R, Clk, L>
where
    T: Transport,
    R: Random,
    Clk: Clock,
    L: Locator,
{
    fn is_failover_candidate(&self) -> bool {
        self.config().failover_candidate && self.role() == Role::Member && self.level() == 2
    }

    /// Periodic leader liveness check.
    pub(crate) fn check_leader(&mut self, now: Timestamp) {
        if !self.config().failover_candidate || self.role() != Role::Member {
            return;
        }
        let interval = self.config().failover_check_interval;
        self.timers_mut().failover_check = Some(now + interval);
        if self.level() != 2 {
            return;
        }

        let threshold = self.config().max_hello_interval;
        let fresh = self
            .state()
            .leader
            .is_some_and(|l| now - l.last_heartbeat < threshold);
        if fresh {
            self.state_mut().failover_acks.clear();
            return;
        }

        let acks: FailoverAcks = self.state().siblings.iter().map(|s| (*s, false)).collect();
        debug!(node = %self.address(), siblings = acks.len(), "leader silent, checking with siblings");
        let vacuous = acks.is_empty();
        self.state_mut().failover_acks = acks;
        if vacuous {
            self.try_claim(now);
        } else {
            self.broadcast(Body::CheckLeader, now);
        }
    }

    pub(crate) fn handle_check_leader(&mut self, from: Address, now: Timestamp) {
        self.send_direct(from, Body::CheckLeaderReply, now);
    }

    pub(crate) fn handle_check_leader_reply(&mut self, from: Address, now: Timestamp) {
        if !self.is_failover_candidate() {
            return;
        }
        let acks = &mut self.state_mut().failover_acks;
        match acks.get_mut(&from) {
            Some(ack) => *ack = true,
            None => return,
        }
        if acks.values().all(|a| *a) {
            self.try_claim(now);
        }
    }

    fn try_claim(&mut self, now: Timestamp) {
        let me = self.address();
        let acks = self.state().failover_acks.clone();
        if !self.strategy_mut().claims(me, &acks) {
            debug!(node = %me, "strategy declined the claim");
            return;
        }

        let former = self.state().leader_address();
        info!(node = %me, former = ?former, "taking over as leader");
        let state = self.state_mut();
        state.siblings.clear();
        state.failover_acks.clear();
        if let Some(former) = former {
            state.routing.remove(&former);
        }
        self.become_leader(now);
        self.broadcast(Body::NewLeader { leader: me }, now);
        self.push_event(Event::LeaderReplaced {
            former,
            leader: me,
        });
        self.strategy_mut().on_reroot(me, former);
    }

    pub(crate) fn handle_new_leader(
        &mut self,
        from: Address,
        sent_at: Timestamp,
        leader: Address,
        now: Timestamp,
    ) {
        if leader != from || self.role() != Role::Member || !self.state().siblings.contains(&from) {
            return;
        }
        let former = self.state().leader_address();
        let record = NeighborRecord::new(from, sent_at, Position::default());
        let state = self.state_mut();
        state.siblings.remove(&from);
        state.routing.remove(&from);
        state.parent = Some(record);
        state.leader = Some(record);
        state.failover_acks.clear();

        info!(node = %self.address(), leader = %from, former = ?former, "following new leader");
        self.send_direct(from, Body::NewLeaderReply, now);
        self.push_event(Event::LeaderReplaced {
            former,
            leader: from,
        });
        self.strategy_mut().on_reroot(from, former);
    }

    pub(crate) fn handle_new_leader_reply(&mut self, from: Address, sent_at: Timestamp) {
        if !self.is_leader() || self.state().children.contains(&from) {
            return;
        }
        self.admit_child(NeighborRecord::new(from, sent_at, Position::default()), Vec::new());
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::config::ClusterConfig;
    use crate::node::testing::*;
    use crate::node::Placement;

    fn a(id: u32) -> Address {
        Address::from_id(id)
    }

    fn ms(v: u64) -> Timestamp {
        Timestamp::from_millis(v)
    }

    fn second_level(id: u32, siblings: &[u32], candidate: bool) -> TestNode {
        let config = ClusterConfig {
            failover_candidate: candidate,
            ..Default::default()
        };
        let mut node = make_node_with(id, config);
        node.install(
            Placement {
                task: 1,
                level: 2,
                parent: Some(a(1)),
                leader: a(1),
                children: vec![],
                routes: vec![],
                siblings: siblings.iter().map(|s| a(*s)).collect(),
                neighbor_roots: vec![],
            },
            ms(0),
        )
        .unwrap();
        node
    }

    fn new_leader_count(node: &TestNode) -> usize {
        sent(node)
            .iter()
            .filter(|(_, m)| matches!(m.body, Body::NewLeader { .. }))
            .count()
    }

    #[test]
    fn test_quorum_needs_every_sibling() {
        let mut candidate = second_level(2, &[3, 4, 5], true);
        candidate.check_leader(ms(1500));
        let out = sent(&candidate);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].1.body, Body::CheckLeader);
        assert_eq!(candidate.state().failover_acks.len(), 3);

        deliver(&mut candidate, a(3), Body::CheckLeaderReply, ms(1510)).unwrap();
        deliver(&mut candidate, a(4), Body::CheckLeaderReply, ms(1520)).unwrap();
        // Unknown repliers do not count
        deliver(&mut candidate, a(9), Body::CheckLeaderReply, ms(1525)).unwrap();
        assert_eq!(new_leader_count(&candidate), 0);
        assert_eq!(candidate.role(), Role::Member);

        deliver(&mut candidate, a(5), Body::CheckLeaderReply, ms(1530)).unwrap();
        assert_eq!(candidate.role(), Role::Leader);
        assert_eq!(candidate.level(), 1);
        assert!(candidate.state().parent.is_none());
        assert!(candidate.state().siblings.is_empty());
        assert_eq!(new_leader_count(&candidate), 1);
        assert!(events(&candidate).contains(&Event::LeaderReplaced {
            former: Some(a(1)),
            leader: a(2),
        }));
    }

    #[test]
    fn test_fresh_leader_means_no_check() {
        let mut candidate = second_level(2, &[3], true);
        candidate.check_leader(ms(900));
        assert!(sent(&candidate).is_empty());
        assert!(candidate.state().failover_acks.is_empty());
    }

    #[test]
    fn test_non_candidate_never_checks() {
        let mut node = second_level(2, &[3], false);
        node.check_leader(ms(5000));
        assert!(sent(&node).is_empty());
        assert!(node.state().failover_acks.is_empty());
    }

    #[test]
    fn test_lone_candidate_claims_immediately() {
        let mut candidate = second_level(2, &[], true);
        candidate.check_leader(ms(2000));
        assert!(candidate.is_leader());
        assert_eq!(new_leader_count(&candidate), 1);
    }

    #[test]
    fn test_sibling_follows_new_leader() {
        let mut sibling = second_level(3, &[2, 4], false);
        deliver_broadcast(&mut sibling, a(2), Body::CheckLeader, ms(100)).unwrap();
        let out = sent(&sibling);
        assert_eq!(out[0].0, a(2));
        assert_eq!(out[0].1.body, Body::CheckLeaderReply);

        // Self-nomination by a non-sibling is ignored
        deliver_broadcast(&mut sibling, a(7), Body::NewLeader { leader: a(7) }, ms(150)).unwrap();
        assert_eq!(sibling.state().leader_address(), Some(a(1)));

        deliver_broadcast(&mut sibling, a(2), Body::NewLeader { leader: a(2) }, ms(200)).unwrap();
        assert_eq!(sibling.state().leader_address(), Some(a(2)));
        assert_eq!(sibling.state().parent_address(), Some(a(2)));
        assert_eq!(sibling.level(), 2);
        assert!(!sibling.state().siblings.contains(&a(2)));
        assert!(sibling.state().siblings.contains(&a(4)));
        let out = sent(&sibling);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].1.body, Body::NewLeaderReply);
    }

    #[test]
    fn test_new_leader_admits_repliers() {
        let mut candidate = second_level(2, &[], true);
        candidate.check_leader(ms(2000));
        deliver(&mut candidate, a(3), Body::NewLeaderReply, ms(2010)).unwrap();
        assert!(candidate.state().children.contains(&a(3)));
        assert_eq!(candidate.state().routing.next_hop(&a(3)), Some(a(3)));
    }

    struct Recording {
        claim: bool,
        reroots: Rc<RefCell<Vec<(Address, Option<Address>)>>>,
    }

    impl FailoverStrategy for Recording {
        fn claims(&mut self, _candidate: Address, acks: &FailoverAcks) -> bool {
            assert!(acks.values().all(|a| *a));
            self.claim
        }

        fn on_reroot(&mut self, leader: Address, former: Option<Address>) {
            self.reroots.borrow_mut().push((leader, former));
        }
    }

    #[test]
    fn test_strategy_can_decline_and_observe() {
        let reroots = Rc::new(RefCell::new(Vec::new()));
        let mut declining = second_level(2, &[3], true).with_strategy(Recording {
            claim: false,
            reroots: reroots.clone(),
        });
        declining.check_leader(ms(2000));
        deliver(&mut declining, a(3), Body::CheckLeaderReply, ms(2010)).unwrap();
        assert_eq!(declining.role(), Role::Member);
        assert!(reroots.borrow().is_empty());

        let mut follower = second_level(3, &[2], false).with_strategy(Recording {
            claim: true,
            reroots: reroots.clone(),
        });
        deliver_broadcast(&mut follower, a(2), Body::NewLeader { leader: a(2) }, ms(50)).unwrap();
        assert_eq!(*reroots.borrow(), vec![(a(2), Some(a(1)))]);
    }
}
