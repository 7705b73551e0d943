//! Radio topology and link properties.

use platoon::{Address, Duration, Position};
use hashbrown::HashMap;

/// Properties of a radio link between two vehicles.
#[derive(Debug, Clone)]
pub struct Link {
    /// Frame loss rate (0.0 to 1.0).
    pub loss_rate: f64,
    pub delay: Duration,
    pub active: bool,
}

impl Default for Link {
    fn default() -> Self {
        Self {
            loss_rate: 0.0,
            delay: Duration::from_millis(1),
            active: true,
        }
    }
}

impl Link {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_loss_rate(mut self, rate: f64) -> Self {
        self.loss_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }
}

/// Which vehicles hear each other. Links are symmetric.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    links: HashMap<(Address, Address), Link>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every vehicle hears every other.
    pub fn fully_connected(nodes: &[Address]) -> Self {
        let mut topo = Self::new();
        for (i, &a) in nodes.iter().enumerate() {
            for &b in nodes.iter().skip(i + 1) {
                topo.add_link(a, b, Link::default());
            }
        }
        topo
    }

    /// Each vehicle hears only the one ahead and the one behind.
    pub fn chain(nodes: &[Address]) -> Self {
        let mut topo = Self::new();
        for window in nodes.windows(2) {
            topo.add_link(window[0], window[1], Link::default());
        }
        topo
    }

    /// First vehicle is the hub, all others hear only it.
    pub fn star(nodes: &[Address]) -> Self {
        let mut topo = Self::new();
        let Some((&hub, spokes)) = nodes.split_first() else {
            return topo;
        };
        for &spoke in spokes {
            topo.add_link(hub, spoke, Link::default());
        }
        topo
    }

    /// Link every pair of vehicles within `range` (Euclidean) of each other.
    pub fn from_positions(nodes: &[(Address, Position)], range: f64) -> Self {
        let mut topo = Self::new();
        for (i, (a, pa)) in nodes.iter().enumerate() {
            for (b, pb) in nodes.iter().skip(i + 1) {
                let (dx, dy, dz) = (pa.x - pb.x, pa.y - pb.y, pa.z - pb.z);
                if (dx * dx + dy * dy + dz * dz).sqrt() <= range {
                    topo.add_link(*a, *b, Link::default());
                }
            }
        }
        topo
    }

    pub fn add_link(&mut self, a: Address, b: Address, link: Link) {
        self.links.insert(Self::canonical_pair(a, b), link);
    }

    pub fn get_link(&self, a: Address, b: Address) -> Option<&Link> {
        self.links.get(&Self::canonical_pair(a, b))
    }

    pub fn get_link_mut(&mut self, a: Address, b: Address) -> Option<&mut Link> {
        self.links.get_mut(&Self::canonical_pair(a, b))
    }

    /// Link exists and is active.
    pub fn is_connected(&self, a: Address, b: Address) -> bool {
        self.get_link(a, b).is_some_and(|link| link.active)
    }

    /// Vehicles reachable from `node` over active links, in address order.
    pub fn neighbors(&self, node: Address) -> Vec<Address> {
        let mut result: Vec<Address> = self
            .links
            .iter()
            .filter(|(_, link)| link.active)
            .filter_map(|(&(a, b), _)| match node {
                n if n == a => Some(b),
                n if n == b => Some(a),
                _ => None,
            })
            .collect();
        result.sort();
        result
    }

    /// Disable all links crossing between partition groups.
    pub fn partition(&mut self, groups: &[Vec<Address>]) {
        for (&(a, b), link) in self.links.iter_mut() {
            let a_group = groups.iter().position(|g| g.contains(&a));
            let b_group = groups.iter().position(|g| g.contains(&b));
            if a_group != b_group {
                link.active = false;
            }
        }
    }

    /// Re-enable all links.
    pub fn heal(&mut self) {
        for link in self.links.values_mut() {
            link.active = true;
        }
    }

    pub fn set_global_loss_rate(&mut self, rate: f64) {
        let rate = rate.clamp(0.0, 1.0);
        for link in self.links.values_mut() {
            link.loss_rate = rate;
        }
    }

    pub fn set_global_delay(&mut self, delay: Duration) {
        for link in self.links.values_mut() {
            link.delay = delay;
        }
    }

    fn canonical_pair(a: Address, b: Address) -> (Address, Address) {
        if a < b {
            (a, b)
        } else {
            (b, a)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_nodes(count: u32) -> Vec<Address> {
        (1..=count).map(Address::from_id).collect()
    }

    #[test]
    fn test_chain() {
        let nodes = make_nodes(4);
        let topo = Topology::chain(&nodes);

        assert!(topo.is_connected(nodes[0], nodes[1]));
        assert!(topo.is_connected(nodes[2], nodes[1]));
        assert!(!topo.is_connected(nodes[0], nodes[2]));
        assert_eq!(topo.neighbors(nodes[1]), vec![nodes[0], nodes[2]]);
    }

    #[test]
    fn test_star() {
        let nodes = make_nodes(4);
        let topo = Topology::star(&nodes);

        assert_eq!(topo.neighbors(nodes[0]).len(), 3);
        assert_eq!(topo.neighbors(nodes[1]), vec![nodes[0]]);
        assert!(!topo.is_connected(nodes[1], nodes[2]));
    }

    #[test]
    fn test_partition_and_heal() {
        let nodes = make_nodes(4);
        let mut topo = Topology::fully_connected(&nodes);

        topo.partition(&[vec![nodes[0], nodes[1]], vec![nodes[2], nodes[3]]]);
        assert!(topo.is_connected(nodes[0], nodes[1]));
        assert!(topo.is_connected(nodes[2], nodes[3]));
        assert!(!topo.is_connected(nodes[1], nodes[2]));

        topo.heal();
        assert!(topo.is_connected(nodes[0], nodes[3]));
    }

    #[test]
    fn test_radio_range_from_positions() {
        let placed: Vec<(Address, Position)> = make_nodes(4)
            .into_iter()
            .zip([0.0, 10.0, 20.0, 45.0])
            .map(|(a, x)| (a, Position::new(x, 0.0, 0.0)))
            .collect();
        let topo = Topology::from_positions(&placed, 15.0);

        assert!(topo.is_connected(placed[0].0, placed[1].0));
        assert!(topo.is_connected(placed[1].0, placed[2].0));
        assert!(!topo.is_connected(placed[0].0, placed[2].0));
        assert!(topo.neighbors(placed[3].0).is_empty());
    }
}
