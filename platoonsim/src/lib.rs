//! platoonsim - Discrete event simulator for platoon vehicle groups.
//!
//! Runs many [`platoon::Node`]s in one process on a shared simulated medium,
//! deterministically and without real-time delays.
//!
//! # Features
//!
//! - **Discrete event simulation**: deterministic ordering by (time, sequence)
//! - **Topologies**: fully connected, chain, star, radio range, or custom
//! - **Link properties**: packet loss, delay, active/inactive per link
//! - **Scenario builder**: scheduled tasks, blackouts, obstacles, partitions
//! - **Group plans**: install a known tree shape and skip construction
//! - **Metrics**: group snapshots, message counts, protocol events
//!
//! # Example
//!
//! ```
//! use platoonsim::{convoy_scenario, Duration};
//!
//! // Five vehicles, one task: they end up as a single group
//! let result = convoy_scenario(5, 1)
//!     .with_seed(42)
//!     .run_for(Duration::from_secs(5))
//!     .unwrap();
//!
//! assert!(result.converged());
//! ```
//!
//! # Architecture
//!
//! The simulator pops the earliest event, advances time, and calls the node
//! handlers (`handle_transport_rx`, `handle_timer`, `handle_command`)
//! directly instead of driving the async `run()` loop. Whatever a node
//! emitted is then routed through the topology and its next wake-up queued.

pub mod event;
pub mod initializer;
pub mod metrics;
pub mod node;
pub mod scenario;
pub mod sim;
pub mod topology;

pub use event::{Event, ScenarioAction, ScheduledEvent};
pub use initializer::{GroupPlan, PlanError};
pub use metrics::{GroupSnapshot, NodeEvent, SimMetrics, SimulationResult};
pub use node::SimNode;
pub use platoon::{Address, ConfigError, Duration, Timestamp};
pub use scenario::{address_of, convoy_scenario, ScenarioBuilder};
pub use sim::Simulator;
pub use topology::{Link, Topology};

/// Install a `tracing` subscriber filtered by `RUST_LOG`.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use platoon::{ClusterConfig, Command, Event as NodeEventKind, Position, Role};

    fn ms(v: u64) -> Timestamp {
        Timestamp::from_millis(v)
    }

    #[test]
    fn test_single_node_founds_group() {
        init_tracing();
        let result = convoy_scenario(1, 1)
            .run_for(Duration::from_secs(3))
            .unwrap();

        let snapshot = result.metrics.latest_snapshot().unwrap();
        assert_eq!(snapshot.leader_list(), vec![address_of(0)]);
        assert!(result.converged());
    }

    #[test]
    fn test_convoy_converges_to_one_group() {
        init_tracing();
        let (mut sim, nodes) = convoy_scenario(5, 1)
            .with_snapshot_interval(Duration::from_millis(500))
            .build()
            .unwrap();
        let result = sim.run_for(Duration::from_secs(5));

        assert!(result.converged(), "convoy should form a single group");
        assert_eq!(result.final_group_count(), 1);
        // Nobody could be admitted before the leader existed
        let converged_at = result.metrics.convergence_time().unwrap();
        assert!(converged_at >= ms(2000));

        let leader = sim.node(&nodes[0]).unwrap();
        assert!(leader.is_leader());
        assert_eq!(leader.inner().state().children.len(), 4);
        for id in &nodes[1..] {
            let node = sim.node(id).unwrap();
            assert_eq!(node.role(), Role::Member);
            assert_eq!(node.level(), 2);
            assert_eq!(node.leader(), Some(nodes[0]));
        }
    }

    #[test]
    fn test_chain_builds_deep_tree_with_routes() {
        let (mut sim, nodes) = convoy_scenario(4, 1)
            .chain_topology()
            .build()
            .unwrap();
        let result = sim.run_for(Duration::from_secs(5));

        assert!(result.converged());
        let levels: Vec<u8> = nodes.iter().map(|n| sim.node(n).unwrap().level()).collect();
        assert_eq!(levels, vec![1, 2, 3, 4]);
        assert_eq!(sim.node(&nodes[3]).unwrap().parent(), Some(nodes[2]));

        // Heartbeats carried the deeper keys up to the root
        let routing = &sim.node(&nodes[0]).unwrap().inner().state().routing;
        assert_eq!(routing.next_hop(&nodes[1]), Some(nodes[1]));
        assert_eq!(routing.next_hop(&nodes[2]), Some(nodes[1]));
        assert_eq!(routing.next_hop(&nodes[3]), Some(nodes[1]));
    }

    #[test]
    fn test_routing_tables_point_at_the_right_child() {
        let nodes: Vec<Address> = (0..7).map(address_of).collect();
        let mut topo = Topology::new();
        for (a, b) in [(0, 1), (0, 2), (1, 3), (1, 4), (2, 5), (2, 6)] {
            topo.add_link(nodes[a], nodes[b], Link::new());
        }
        let (mut sim, nodes) = convoy_scenario(7, 1).topology(topo).build().unwrap();
        let result = sim.run_for(Duration::from_secs(5));
        assert!(result.converged());

        let table = |i: usize| -> Vec<(Address, Address)> {
            sim.node(&nodes[i]).unwrap().inner().state().routing.iter().collect()
        };
        let n = |i: usize| nodes[i];
        assert_eq!(
            table(0),
            vec![
                (n(1), n(1)),
                (n(2), n(2)),
                (n(3), n(1)),
                (n(4), n(1)),
                (n(5), n(2)),
                (n(6), n(2)),
            ]
        );
        assert_eq!(table(1), vec![(n(3), n(3)), (n(4), n(4))]);
        assert_eq!(table(2), vec![(n(5), n(5)), (n(6), n(6))]);
        for leaf in 3..7 {
            assert!(table(leaf).is_empty());
            assert_eq!(sim.node(&n(leaf)).unwrap().level(), 3);
        }
    }

    #[test]
    fn test_star_hub_keeps_reattachment_slack() {
        let (mut sim, nodes) = convoy_scenario(11, 1)
            .star_topology()
            .build()
            .unwrap();
        let result = sim.run_for(Duration::from_secs(6));

        let hub = sim.node(&nodes[0]).unwrap();
        assert!(hub.is_leader());
        // Admission closes at two thirds of max_children
        assert_eq!(hub.inner().state().children.len(), 7);
        // The three rejected spokes hear nobody else and lead themselves
        assert_eq!(result.final_group_count(), 4);
        assert_eq!(result.metrics.latest_snapshot().unwrap().unattached(), 0);
    }

    #[test]
    fn test_different_tasks_form_separate_groups() {
        let result = ScenarioBuilder::new(2)
            .assign_task_at(Timestamp::ZERO, 0, 1)
            .assign_task_at(ms(500), 1, 2)
            .run_for(Duration::from_secs(4))
            .unwrap();
        assert_eq!(result.final_group_count(), 2);
        assert!(!result.converged());
    }

    fn planned(sim: &mut Simulator, plan: &GroupPlan) {
        for id in plan.nodes() {
            if sim.node(&id).is_none() {
                sim.add_node(id, Position::default()).unwrap();
            }
        }
        sim.install_plan(plan, 1).unwrap();
    }

    #[test]
    fn test_obstacle_reaches_every_member_once() {
        let nodes: Vec<Address> = (0..7).map(address_of).collect();
        let mut plan = GroupPlan::default();
        plan.add_leader(nodes[0]).unwrap();
        plan.add_children(nodes[0], &[nodes[1], nodes[2]]).unwrap();
        plan.add_children(nodes[1], &[nodes[3], nodes[4]]).unwrap();
        plan.add_children(nodes[3], &[nodes[5], nodes[6]]).unwrap();

        let mut sim =
            Simulator::new(7).with_topology(Topology::fully_connected(&nodes));
        planned(&mut sim, &plan);
        let obstacle = Position::new(40.0, 3.0, 0.0);
        // Reported by a deep member: it goes up to the leader first
        sim.schedule_command(ms(100), nodes[5], Command::Avoid(obstacle));
        let result = sim.run_for(Duration::from_secs(1));

        for id in &nodes {
            let orders = result
                .metrics
                .events_of(*id)
                .filter(|e| matches!(e, NodeEventKind::AvoidObstacle { obstacle: o, .. } if *o == obstacle))
                .count();
            assert_eq!(orders, 1, "{id} should get exactly one avoidance order");
        }
    }

    #[test]
    fn test_missing_member_is_reattached() {
        let nodes: Vec<Address> = (0..4).map(address_of).collect();
        let (leader, a, b, x) = (nodes[0], nodes[1], nodes[2], nodes[3]);
        let mut plan = GroupPlan::default();
        plan.add_leader(leader).unwrap();
        plan.add_children(leader, &[a, b]).unwrap();
        plan.add_children(a, &[x]).unwrap();

        let mut sim =
            Simulator::new(3).with_topology(Topology::fully_connected(&nodes));
        planned(&mut sim, &plan);
        sim.schedule_command(ms(100), x, Command::MarkMissing(Duration::from_secs(3)));

        let result = sim.run_for(Duration::from_millis(2500));
        assert!(result
            .metrics
            .events_of(a)
            .any(|e| *e == NodeEventKind::ChildMissing { child: x }));
        assert!(!sim.node(&a).unwrap().inner().state().children.contains(&x));

        // Blackout ends at 3.1s; the first RETURN beacon finds the searcher
        let result = sim.run_until(Timestamp::from_secs(5));
        assert!(result
            .metrics
            .events_of(x)
            .any(|e| *e == NodeEventKind::Rejoined { parent: a }));
        assert!(result
            .metrics
            .events_of(leader)
            .any(|e| *e == NodeEventKind::Reattached { node: x, parent: a }));

        let x_node = sim.node(&x).unwrap();
        assert_eq!(x_node.role(), Role::Member);
        assert_eq!(x_node.level(), 3);
        assert_eq!(x_node.leader(), Some(leader));
        assert!(sim.node(&a).unwrap().inner().state().children.contains(&x));
    }

    #[test]
    fn test_candidate_takes_over_silent_leader() {
        let nodes: Vec<Address> = (0..4).map(address_of).collect();
        let (old, candidate) = (nodes[0], nodes[1]);
        let mut plan = GroupPlan::default();
        plan.add_leader(old).unwrap();
        plan.add_children(old, &nodes[1..]).unwrap();

        let mut sim =
            Simulator::new(5).with_topology(Topology::fully_connected(&nodes));
        let candidate_config = ClusterConfig {
            failover_candidate: true,
            ..Default::default()
        };
        sim.add_node_with_config(candidate, Position::default(), candidate_config)
            .unwrap();
        planned(&mut sim, &plan);
        sim.schedule_command(ms(100), old, Command::MarkMissing(Duration::from_secs(60)));

        let result = sim.run_for(Duration::from_secs(3));

        let new_leader = sim.node(&candidate).unwrap();
        assert!(new_leader.is_leader());
        assert_eq!(new_leader.level(), 1);
        assert_eq!(new_leader.inner().state().children.len(), 2);
        for id in &nodes[2..] {
            let node = sim.node(id).unwrap();
            assert_eq!(node.parent(), Some(candidate));
            assert_eq!(node.leader(), Some(candidate));
        }
        assert!(result.metrics.events_of(candidate).any(|e| *e
            == NodeEventKind::LeaderReplaced {
                former: Some(old),
                leader: candidate
            }));
    }
}
