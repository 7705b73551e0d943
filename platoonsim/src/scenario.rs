//! Scenario builder for setting up and running simulations.

use platoon::{Address, ClusterConfig, Command, Duration, Position, TaskId, Timestamp};
use tracing::warn;

use crate::event::ScenarioAction;
use crate::metrics::SimulationResult;
use crate::sim::Simulator;
use crate::topology::Topology;

#[derive(Debug, Clone)]
enum TopologyType {
    FullyConnected,
    Chain,
    Star,
    /// Vehicles within this range of each other hear each other.
    RadioRange(f64),
    Custom(Topology),
}

/// Builder for simulation scenarios.
///
/// Vehicle `i` gets address `Address::from_id(i + 1)` and sits at
/// `x = i * spacing` on a straight road.
pub struct ScenarioBuilder {
    num_nodes: usize,
    seed: u64,
    topology_type: TopologyType,
    loss_rate: f64,
    delay: Duration,
    spacing: f64,
    config: ClusterConfig,
    commands: Vec<(Timestamp, usize, Command)>,
    actions: Vec<(Timestamp, ScenarioAction)>,
    snapshot_interval: Option<Duration>,
}

impl Default for ScenarioBuilder {
    fn default() -> Self {
        Self::new(0)
    }
}

impl ScenarioBuilder {
    /// A fully connected fleet of `num_nodes` vehicles with default settings.
    pub fn new(num_nodes: usize) -> Self {
        Self {
            num_nodes,
            seed: 42,
            topology_type: TopologyType::FullyConnected,
            loss_rate: 0.0,
            delay: Duration::from_millis(1),
            spacing: 10.0,
            config: ClusterConfig::default(),
            commands: Vec::new(),
            actions: Vec::new(),
            snapshot_interval: None,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn topology(mut self, topo: Topology) -> Self {
        self.topology_type = TopologyType::Custom(topo);
        self
    }

    pub fn fully_connected(mut self) -> Self {
        self.topology_type = TopologyType::FullyConnected;
        self
    }

    pub fn chain_topology(mut self) -> Self {
        self.topology_type = TopologyType::Chain;
        self
    }

    pub fn star_topology(mut self) -> Self {
        self.topology_type = TopologyType::Star;
        self
    }

    /// Link vehicles by distance along the road.
    pub fn radio_range(mut self, range: f64) -> Self {
        self.topology_type = TopologyType::RadioRange(range);
        self
    }

    pub fn with_spacing(mut self, spacing: f64) -> Self {
        self.spacing = spacing;
        self
    }

    pub fn with_loss_rate(mut self, rate: f64) -> Self {
        self.loss_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_config(mut self, config: ClusterConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_snapshot_interval(mut self, interval: Duration) -> Self {
        self.snapshot_interval = Some(interval);
        self
    }

    /// Assign `task` to vehicle `index` at `time`.
    pub fn assign_task_at(mut self, time: Timestamp, index: usize, task: TaskId) -> Self {
        self.commands.push((time, index, Command::AssignTask(task)));
        self
    }

    /// Assign `task` to every vehicle, the first at `start` and each next one
    /// `stagger` later.
    pub fn assign_all(mut self, start: Timestamp, stagger: Duration, task: TaskId) -> Self {
        let mut time = start;
        for index in 0..self.num_nodes {
            self.commands.push((time, index, Command::AssignTask(task)));
            time += stagger;
        }
        self
    }

    /// Black out vehicle `index` at `time` for `duration`.
    pub fn missing_at(mut self, time: Timestamp, index: usize, duration: Duration) -> Self {
        self.commands
            .push((time, index, Command::MarkMissing(duration)));
        self
    }

    /// Have vehicle `index` report an obstacle at `time`.
    pub fn obstacle_at(mut self, time: Timestamp, index: usize, obstacle: Position) -> Self {
        self.commands.push((time, index, Command::Avoid(obstacle)));
        self
    }

    /// Partition by vehicle index at `time`.
    pub fn partition_at(mut self, time: Timestamp, groups: Vec<Vec<usize>>) -> Self {
        let groups = groups
            .into_iter()
            .map(|g| g.into_iter().map(address_of).collect())
            .collect();
        self.actions
            .push((time, ScenarioAction::Partition { groups }));
        self
    }

    pub fn heal_at(mut self, time: Timestamp) -> Self {
        self.actions.push((time, ScenarioAction::HealPartition));
        self
    }

    pub fn snapshot_at(mut self, time: Timestamp) -> Self {
        self.actions.push((time, ScenarioAction::TakeSnapshot));
        self
    }

    /// Build the simulator with all nodes and topology.
    ///
    /// Fails if the configuration is rejected by the nodes.
    pub fn build(self) -> Result<(Simulator, Vec<Address>), platoon::ConfigError> {
        let placed: Vec<(Address, Position)> = (0..self.num_nodes)
            .map(|i| (address_of(i), Position::new(i as f64 * self.spacing, 0.0, 0.0)))
            .collect();
        let addresses: Vec<Address> = placed.iter().map(|(a, _)| *a).collect();

        let mut topo = match self.topology_type {
            TopologyType::FullyConnected => Topology::fully_connected(&addresses),
            TopologyType::Chain => Topology::chain(&addresses),
            TopologyType::Star => Topology::star(&addresses),
            TopologyType::RadioRange(range) => Topology::from_positions(&placed, range),
            TopologyType::Custom(t) => t,
        };
        if self.loss_rate > 0.0 {
            topo.set_global_loss_rate(self.loss_rate);
        }
        topo.set_global_delay(self.delay);

        let mut sim = Simulator::new(self.seed)
            .with_topology(topo)
            .with_config(self.config);
        if let Some(interval) = self.snapshot_interval {
            sim = sim.with_snapshot_interval(interval);
        }
        for (address, position) in placed {
            sim.add_node(address, position)?;
        }

        for (time, index, command) in self.commands {
            if index >= addresses.len() {
                warn!(index, "command for a vehicle outside the fleet");
                continue;
            }
            sim.schedule_command(time, addresses[index], command);
        }
        for (time, action) in self.actions {
            sim.schedule_action(time, action);
        }

        Ok((sim, addresses))
    }

    pub fn run_for(self, duration: Duration) -> Result<SimulationResult, platoon::ConfigError> {
        let (mut sim, _) = self.build()?;
        Ok(sim.run_for(duration))
    }
}

/// Address of the vehicle at `index`.
pub fn address_of(index: usize) -> Address {
    Address::from_id(index as u32 + 1)
}

/// A fully connected fleet where the first vehicle gets the task first and
/// the rest half a second later, so one group forms.
pub fn convoy_scenario(num_nodes: usize, task: TaskId) -> ScenarioBuilder {
    let builder = ScenarioBuilder::new(num_nodes).assign_task_at(Timestamp::ZERO, 0, task);
    (1..num_nodes).fold(builder, |b, i| {
        b.assign_task_at(Timestamp::from_millis(500), i, task)
    })
}
