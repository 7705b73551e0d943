//! Static group plans for test scenarios.
//!
//! A [`GroupPlan`] declares tree shapes and root-to-root links up front.
//! [`Simulator::install_plan`](crate::Simulator::install_plan) turns it into a
//! [`Placement`] per vehicle, skipping the construction handshake.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use platoon::{Address, ClusterConfig, Placement, TaskId};

/// Rejected plan edits.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    #[error("{0} is already placed")]
    Duplicate(Address),
    #[error("unknown node {0}")]
    UnknownNode(Address),
    #[error("{parent} would have {count} children, limit is {max}")]
    TooManyChildren {
        parent: Address,
        count: usize,
        max: usize,
    },
    #[error("children of {0} would exceed the deepest level")]
    TooDeep(Address),
    #[error("{0} is not a leader")]
    NotALeader(Address),
    #[error("{node} rejected its placement: {source}")]
    Install {
        node: Address,
        #[source]
        source: platoon::Error,
    },
}

#[derive(Debug, Clone)]
struct PlanNode {
    parent: Option<Address>,
    leader: Address,
    level: u8,
    children: Vec<Address>,
}

/// Declared tree shapes plus links between their roots.
#[derive(Debug, Clone)]
pub struct GroupPlan {
    max_children: usize,
    max_level: u8,
    nodes: BTreeMap<Address, PlanNode>,
    links: BTreeSet<(Address, Address)>,
}

impl Default for GroupPlan {
    fn default() -> Self {
        Self::new(&ClusterConfig::default())
    }
}

impl GroupPlan {
    /// Plan bounded by the same limits the nodes will run with.
    pub fn new(config: &ClusterConfig) -> Self {
        Self {
            max_children: config.max_children,
            max_level: config.max_level,
            nodes: BTreeMap::new(),
            links: BTreeSet::new(),
        }
    }

    pub fn add_leader(&mut self, id: Address) -> Result<(), PlanError> {
        if self.nodes.contains_key(&id) {
            return Err(PlanError::Duplicate(id));
        }
        self.nodes.insert(
            id,
            PlanNode {
                parent: None,
                leader: id,
                level: 1,
                children: Vec::new(),
            },
        );
        Ok(())
    }

    pub fn add_children(&mut self, parent: Address, ids: &[Address]) -> Result<(), PlanError> {
        let node = self
            .nodes
            .get(&parent)
            .ok_or(PlanError::UnknownNode(parent))?;
        let count = node.children.len() + ids.len();
        if count > self.max_children {
            return Err(PlanError::TooManyChildren {
                parent,
                count,
                max: self.max_children,
            });
        }
        if node.level >= self.max_level {
            return Err(PlanError::TooDeep(parent));
        }
        let mut seen = BTreeSet::new();
        if let Some(dup) = ids
            .iter()
            .find(|id| self.nodes.contains_key(*id) || !seen.insert(**id))
        {
            return Err(PlanError::Duplicate(*dup));
        }

        let (leader, level) = (node.leader, node.level + 1);
        for &id in ids {
            self.nodes.insert(
                id,
                PlanNode {
                    parent: Some(parent),
                    leader,
                    level,
                    children: Vec::new(),
                },
            );
        }
        if let Some(node) = self.nodes.get_mut(&parent) {
            node.children.extend_from_slice(ids);
        }
        Ok(())
    }

    /// Make two roots neighbors of each other.
    pub fn add_link(&mut self, a: Address, b: Address) -> Result<(), PlanError> {
        for id in [a, b] {
            match self.nodes.get(&id) {
                None => return Err(PlanError::UnknownNode(id)),
                Some(node) if node.parent.is_some() => return Err(PlanError::NotALeader(id)),
                Some(_) => {}
            }
        }
        self.links.insert(if a < b { (a, b) } else { (b, a) });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &Address) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = Address> + '_ {
        self.nodes.keys().copied()
    }

    pub fn leaders(&self) -> impl Iterator<Item = Address> + '_ {
        self.nodes
            .iter()
            .filter(|(_, n)| n.parent.is_none())
            .map(|(id, _)| *id)
    }

    /// Every node below `id`, depth first.
    pub fn descendants(&self, id: Address) -> Vec<Address> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.nodes.get(&current) {
                for child in node.children.iter().rev() {
                    out.push(*child);
                    stack.push(*child);
                }
            }
        }
        out
    }

    fn neighbor_roots(&self, id: Address) -> Vec<Address> {
        self.links
            .iter()
            .filter_map(|&(a, b)| match id {
                x if x == a => Some(b),
                x if x == b => Some(a),
                _ => None,
            })
            .collect()
    }

    /// Task of each tree: `first_task` for the lowest root address, counting
    /// up from there.
    pub fn tasks(&self, first_task: TaskId) -> BTreeMap<Address, TaskId> {
        self.leaders()
            .zip(0..)
            .map(|(root, i)| (root, first_task.wrapping_add(i)))
            .collect()
    }

    /// The placement every node of the plan should install. Each tree gets
    /// its own task, see [`GroupPlan::tasks`].
    pub fn placements(&self, first_task: TaskId) -> Vec<(Address, Placement)> {
        let tasks = self.tasks(first_task);
        self.nodes
            .iter()
            .map(|(&id, node)| {
                let task = tasks.get(&node.leader).copied().unwrap_or(first_task);
                let mut routes = Vec::new();
                for &child in &node.children {
                    routes.push((child, child));
                    routes.extend(self.descendants(child).into_iter().map(|d| (d, child)));
                }
                let neighbor_roots = if node.parent.is_none() {
                    self.neighbor_roots(id)
                } else {
                    Vec::new()
                };
                routes.extend(neighbor_roots.iter().map(|r| (*r, *r)));

                let siblings = match (node.level, node.parent) {
                    (2, Some(root)) => self
                        .nodes
                        .get(&root)
                        .map(|r| r.children.iter().copied().filter(|c| *c != id).collect())
                        .unwrap_or_default(),
                    _ => Vec::new(),
                };

                let placement = Placement {
                    task,
                    level: node.level,
                    parent: node.parent,
                    leader: node.leader,
                    children: node.children.clone(),
                    routes,
                    siblings,
                    neighbor_roots,
                };
                (id, placement)
            })
            .collect()
    }

    fn fmt_subtree(&self, f: &mut fmt::Formatter<'_>, id: Address, depth: usize) -> fmt::Result {
        let Some(node) = self.nodes.get(&id) else {
            return Ok(());
        };
        let mark = if node.parent.is_none() { " *" } else { "" };
        writeln!(f, "{:indent$}{} (L{}){}", "", id, node.level, mark, indent = depth * 2)?;
        for child in &node.children {
            self.fmt_subtree(f, *child, depth + 1)?;
        }
        Ok(())
    }
}

impl fmt::Display for GroupPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for root in self.leaders() {
            self.fmt_subtree(f, root, 0)?;
        }
        for (a, b) in &self.links {
            writeln!(f, "{a} <-> {b}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn a(id: u32) -> Address {
        Address::from_id(id)
    }

    fn two_level() -> GroupPlan {
        let mut plan = GroupPlan::default();
        plan.add_leader(a(1)).unwrap();
        plan.add_children(a(1), &[a(2), a(3)]).unwrap();
        plan.add_children(a(2), &[a(4)]).unwrap();
        plan.add_children(a(4), &[a(5)]).unwrap();
        plan
    }

    #[test]
    fn test_placements_route_whole_subtree() {
        let plan = two_level();
        let placements: BTreeMap<_, _> = plan.placements(9).into_iter().collect();

        let root = &placements[&a(1)];
        assert_eq!(root.level, 1);
        assert_eq!(root.parent, None);
        let mut routes = root.routes.clone();
        routes.sort();
        assert_eq!(
            routes,
            vec![(a(2), a(2)), (a(3), a(3)), (a(4), a(2)), (a(5), a(2))]
        );

        let mid = &placements[&a(2)];
        assert_eq!(mid.siblings, vec![a(3)]);
        assert_eq!(mid.leader, a(1));

        let deep = &placements[&a(5)];
        assert_eq!(deep.level, 4);
        assert_eq!(deep.parent, Some(a(4)));
        assert!(deep.siblings.is_empty());
        assert!(deep.routes.is_empty());
    }

    #[test]
    fn test_plan_errors() {
        let config = ClusterConfig {
            max_children: 2,
            max_level: 2,
            ..Default::default()
        };
        let mut plan = GroupPlan::new(&config);
        plan.add_leader(a(1)).unwrap();
        assert_eq!(plan.add_leader(a(1)), Err(PlanError::Duplicate(a(1))));
        assert_eq!(
            plan.add_children(a(9), &[a(2)]),
            Err(PlanError::UnknownNode(a(9)))
        );
        assert_eq!(
            plan.add_children(a(1), &[a(2), a(3), a(4)]),
            Err(PlanError::TooManyChildren {
                parent: a(1),
                count: 3,
                max: 2
            })
        );
        assert_eq!(
            plan.add_children(a(1), &[a(2), a(2)]),
            Err(PlanError::Duplicate(a(2)))
        );
        plan.add_children(a(1), &[a(2)]).unwrap();
        assert_eq!(plan.add_children(a(2), &[a(3)]), Err(PlanError::TooDeep(a(2))));
        assert_eq!(plan.add_link(a(1), a(2)), Err(PlanError::NotALeader(a(2))));
        assert_eq!(plan.len(), 2);
    }

    #[test]
    fn test_links_become_neighbor_roots() {
        let mut plan = GroupPlan::default();
        plan.add_leader(a(1)).unwrap();
        plan.add_leader(a(10)).unwrap();
        plan.add_link(a(10), a(1)).unwrap();
        let placements: BTreeMap<_, _> = plan.placements(1).into_iter().collect();
        assert_eq!(placements[&a(1)].neighbor_roots, vec![a(10)]);
        assert_eq!(placements[&a(10)].routes, vec![(a(1), a(1))]);
    }

    #[test]
    fn test_each_tree_gets_its_own_task() {
        let mut plan = two_level();
        plan.add_leader(a(20)).unwrap();
        plan.add_children(a(20), &[a(21), a(22)]).unwrap();
        plan.add_leader(a(30)).unwrap();

        assert_eq!(
            plan.tasks(7),
            BTreeMap::from([(a(1), 7), (a(20), 8), (a(30), 9)])
        );
        let placements: BTreeMap<_, _> = plan.placements(7).into_iter().collect();
        for id in [1, 2, 3, 4, 5] {
            assert_eq!(placements[&a(id)].task, 7, "node {id}");
        }
        for id in [20, 21, 22] {
            assert_eq!(placements[&a(id)].task, 8, "node {id}");
        }
        assert_eq!(placements[&a(30)].task, 9);
    }

    #[test]
    fn test_display_tree() {
        let rendered = two_level().to_string();
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines.len(), 5);
        assert!(lines[0].ends_with("(L1) *"));
        // Depth first: 2, 4, 5 before 3
        assert!(lines[3].starts_with("      "));
        assert!(lines[4].starts_with("  ") && !lines[4].starts_with("   "));
    }
}
