//! Runtime configuration for a node.
//!
//! Every tunable of the protocol lives in [`ClusterConfig`], handed to
//! [`Node::new`](crate::Node::new). Defaults follow the reference deployment:
//! half-second heartbeats, one-second missing threshold and ten children per node.

use crate::time::Duration;
use crate::types::{Position, MAX_ADDRESS_LIST};

/// Static obstacle that vehicles must steer around.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ObstacleConfig {
    pub position: Position,
    /// Manhattan distance below which the obstacle counts as detected.
    pub safe_distance: u64,
}

impl ObstacleConfig {
    pub const DEFAULT_SAFE_DISTANCE: u64 = 21;

    pub fn at(position: Position) -> Self {
        Self {
            position,
            safe_distance: Self::DEFAULT_SAFE_DISTANCE,
        }
    }
}

/// Protocol tunables.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ClusterConfig {
    /// Hard limit on children per node. Construction admits only up to two thirds.
    pub max_children: usize,
    /// Deepest level a tree may grow to (root = 1).
    pub max_level: u8,
    /// Period of member-to-parent HELLO.
    pub hello_interval: Duration,
    /// Heartbeat silence after which a peer is considered gone.
    pub max_hello_interval: Duration,
    /// Period of the missing-child scan.
    pub check_missing_interval: Duration,
    /// Wait after task assignment before self-promoting to leader.
    pub wait_construct_time: Duration,
    /// Base period of CONSTRUCT solicitation (jittered by up to a quarter).
    pub construct_interval: Duration,
    /// How long a SEARCH keeps a missing address eligible for reattachment.
    pub search_time: Duration,
    /// Period of RETURN beacons while waiting to be reattached.
    pub return_interval: Duration,
    /// Period of the leader liveness check run by failover candidates.
    pub failover_check_interval: Duration,
    /// Whether this node may replace a silent leader (second level only).
    pub failover_candidate: bool,
    pub obstacle: Option<ObstacleConfig>,
    pub obstacle_check_interval: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            max_children: 10,
            max_level: 4,
            hello_interval: Duration::from_millis(500),
            max_hello_interval: Duration::from_secs(1),
            check_missing_interval: Duration::from_secs(1),
            wait_construct_time: Duration::from_secs(2),
            construct_interval: Duration::from_secs(1),
            search_time: Duration::from_secs(10),
            return_interval: Duration::from_millis(500),
            failover_check_interval: Duration::from_secs(1),
            failover_candidate: false,
            obstacle: None,
            obstacle_check_interval: Duration::from_secs(1),
        }
    }
}

/// Rejected configuration values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("max_children must be at least 1")]
    NoChildren,
    #[error("max_level must be at least 1")]
    NoLevels,
    #[error("interval `{0}` must be non-zero")]
    ZeroInterval(&'static str),
    #[error("max_hello_interval must exceed hello_interval")]
    ThresholdBelowHeartbeat,
    #[error("a tree may hold {size} nodes below its root, route lists carry at most {max}")]
    SubtreeTooLarge { size: usize, max: usize },
}

impl ClusterConfig {
    /// Check the configuration for values the protocol cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_children == 0 {
            return Err(ConfigError::NoChildren);
        }
        if self.max_level == 0 {
            return Err(ConfigError::NoLevels);
        }
        let intervals = [
            ("hello_interval", self.hello_interval),
            ("max_hello_interval", self.max_hello_interval),
            ("check_missing_interval", self.check_missing_interval),
            ("construct_interval", self.construct_interval),
            ("return_interval", self.return_interval),
            ("failover_check_interval", self.failover_check_interval),
            ("obstacle_check_interval", self.obstacle_check_interval),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, d)| d.is_zero()) {
            return Err(ConfigError::ZeroInterval(*name));
        }
        if self.max_hello_interval <= self.hello_interval {
            return Err(ConfigError::ThresholdBelowHeartbeat);
        }
        let size = self.max_subtree();
        if size > MAX_ADDRESS_LIST {
            return Err(ConfigError::SubtreeTooLarge {
                size,
                max: MAX_ADDRESS_LIST,
            });
        }
        Ok(())
    }

    /// Most nodes a full tree can hold below its root, counting the hard
    /// child limit at every level. Saturates.
    pub fn max_subtree(&self) -> usize {
        let mut total = 0usize;
        let mut width = 1usize;
        for _ in 1..self.max_level {
            width = width.saturating_mul(self.max_children);
            total = total.saturating_add(width);
        }
        total
    }

    /// Whether the construction handshake may admit another child.
    ///
    /// Admission closes once `3 * children >= 2 * max_children`.
    pub fn admission_open(&self, children: usize) -> bool {
        3 * children < 2 * self.max_children
    }
}
