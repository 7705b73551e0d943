//! Group-wide commands and obstacle avoidance.
//!
//! Only a leader originates a group command. It sends one group-flagged copy
//! to each direct child; every node receiving a flagged copy addressed to
//! itself acts on it, then sends one unflagged copy to each of its own routing
//! keys. Since every key maps to exactly one next hop in a tree, each node gets
//! exactly one copy and nothing loops.

use tracing::{debug, error, info, warn};

use crate::node::Node;
use crate::time::Timestamp;
use crate::traits::{Clock, Locator, Random, Transport};
use crate::types::{Address, Error, Event, Position, Role, Violation};
use crate::wire::Body;

impl<T, R, Clk, L> Node<T, R, Clk, L>
where
    T: Transport,
    R: Random,
    Clk: Clock,
    L: Locator,
{
    /// Send `body` to the whole tree. Leader only.
    pub fn disseminate(&mut self, body: Body, now: Timestamp) -> Result<(), Error> {
        if !self.is_leader() {
            self.record_violation();
            let err = Error::violation(self.address(), Violation::NotLeader);
            error!(node = %self.address(), kind = body.name(), error = %err, "group send refused");
            return Err(err);
        }
        let children: Vec<Address> = self.state().children.addresses().collect();
        debug!(node = %self.address(), kind = body.name(), children = children.len(), "disseminating");
        for child in children {
            self.emit(child, child, true, body.clone(), now);
        }
        Ok(())
    }

    /// Raise the avoidance order for an obstacle seen locally.
    pub fn report_obstacle(&mut self, obstacle: Position, now: Timestamp) -> Result<(), Error> {
        match self.role() {
            Role::Leader => {
                info!(node = %self.address(), ?obstacle, "obstacle, ordering avoidance");
                let me = self.address();
                self.push_event(Event::AvoidObstacle { obstacle, from: me });
                self.disseminate(Body::Obstacle { position: obstacle }, now)?;
                self.notify_neighbor_roots(obstacle, now);
                Ok(())
            }
            Role::Member => self.send_to_leader(Body::Obstacle { position: obstacle }, now),
            _ => {
                warn!(node = %self.address(), "not in a tree, obstacle report dropped");
                Ok(())
            }
        }
    }

    pub(crate) fn check_obstacle(&mut self, now: Timestamp) -> Result<(), Error> {
        let Some(obstacle) = self.config().obstacle else {
            return Ok(());
        };
        let interval = self.config().obstacle_check_interval;
        self.timers_mut().obstacle_check = Some(now + interval);
        if !self.role().in_tree() {
            return Ok(());
        }
        if self.position().manhattan(&obstacle.position) < obstacle.safe_distance {
            return self.report_obstacle(obstacle.position, now);
        }
        Ok(())
    }

    pub(crate) fn handle_obstacle(
        &mut self,
        from: Address,
        group: bool,
        position: Position,
        now: Timestamp,
    ) -> Result<(), Error> {
        self.push_event(Event::AvoidObstacle {
            obstacle: position,
            from,
        });
        if !self.is_leader() || group {
            return Ok(());
        }

        self.disseminate(Body::Obstacle { position }, now)?;
        if !self.state().neighbor_roots.contains(&from) {
            self.notify_neighbor_roots(position, now);
        }
        Ok(())
    }

    fn notify_neighbor_roots(&mut self, obstacle: Position, now: Timestamp) {
        let roots: Vec<Address> = self.state().neighbor_roots.iter().copied().collect();
        for root in roots {
            self.send_direct(root, Body::Obstacle { position: obstacle }, now);
        }
    }
}
