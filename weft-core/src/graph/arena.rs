//! Node Arena
//!
//! The arena owns every node of an engine and the edges between them. Edges
//! are stored on both ends: a node's connections list what it reads, and the
//! `downstream` / `reconnect_downstream` sets of the upstream node list who
//! reads it.
//!
//! # Propagation
//!
//! When inputs change, [`Graph::propagate`] runs one round:
//!
//! 1. Walk downstream from every changed node, marking derived nodes stale
//!    and flagging nodes reached through a reconnect edge for re-resolution
//! 2. Every node is visited at most once per round: the round number acts as
//!    the initiator token, which also stops the walk on cycles
//! 3. Sort the visited nodes topologically so upstream nodes come first
//!
//! Nodes on a cycle cannot be ordered; they are appended in the order the
//! walk discovered them.

use std::collections::{HashMap, HashSet, VecDeque};

use indexmap::IndexSet;

use super::node::{Link, LinkRole, Node, NodeId, NodeKind};

/// Owns all nodes of one engine.
#[derive(Debug, Default)]
pub struct Graph {
    nodes: HashMap<NodeId, Node>,
    round: u64,
}

impl Graph {
    /// Create a new empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node to the graph.
    pub fn add_node(&mut self, node: Node) -> NodeId {
        let id = node.id();
        self.nodes.insert(id, node);
        id
    }

    /// Remove a node from the graph, together with every edge involving it.
    ///
    /// Nodes that were reading the removed node keep their connections minus
    /// the dead links; the caller decides how they recover.
    pub fn remove_node(&mut self, node_id: NodeId) -> Option<Node> {
        let node = self.nodes.remove(&node_id)?;

        for up in node.upstream().collect::<Vec<_>>() {
            if let Some(up) = self.nodes.get_mut(&up) {
                up.downstream.shift_remove(&node_id);
                up.reconnect_downstream.shift_remove(&node_id);
            }
        }

        for down in node.downstream.iter().chain(&node.reconnect_downstream) {
            if let Some(down) = self.nodes.get_mut(down) {
                for conn in &mut down.connections {
                    conn.links.retain(|l| l.node != node_id);
                }
            }
        }

        Some(node)
    }

    /// Get a reference to a node.
    pub fn get(&self, node_id: NodeId) -> Option<&Node> {
        self.nodes.get(&node_id)
    }

    /// Get a mutable reference to a node.
    pub fn get_mut(&mut self, node_id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(&node_id)
    }

    pub fn contains(&self, node_id: NodeId) -> bool {
        self.nodes.contains_key(&node_id)
    }

    /// Subscribe `dependent` to the node named by `link`.
    ///
    /// Returns whether a new edge was created; subscribing twice is a no-op.
    pub fn subscribe(&mut self, link: Link, dependent: NodeId) -> bool {
        match self.nodes.get_mut(&link.node) {
            Some(up) => match link.role {
                LinkRole::Source => up.downstream.insert(dependent),
                LinkRole::Reconnect => up.reconnect_downstream.insert(dependent),
            },
            None => false,
        }
    }

    /// Remove the edge named by `link`. Returns whether an edge was removed.
    pub fn unsubscribe(&mut self, link: Link, dependent: NodeId) -> bool {
        match self.nodes.get_mut(&link.node) {
            Some(up) => match link.role {
                LinkRole::Source => up.downstream.shift_remove(&dependent),
                LinkRole::Reconnect => up.reconnect_downstream.shift_remove(&dependent),
            },
            None => false,
        }
    }

    /// Run one propagation round.
    ///
    /// `changed` are nodes whose value changed; their dependents are marked.
    /// `relink` are nodes that must themselves be re-resolved. Returns every
    /// affected node in evaluation order.
    pub fn propagate(&mut self, changed: &[NodeId], relink: &[NodeId]) -> Vec<NodeId> {
        self.round += 1;
        let round = self.round;
        let mut affected = Vec::new();
        let mut queue = VecDeque::new();

        for &id in relink {
            if let Some(node) = self.nodes.get_mut(&id) {
                node.needs_reconnect = true;
                if node.mark != round {
                    node.mark = round;
                    node.mark_stale();
                    affected.push(id);
                    queue.push_back(id);
                }
            }
        }
        queue.extend(changed.iter().copied());

        while let Some(id) = queue.pop_front() {
            let Some(node) = self.nodes.get(&id) else {
                continue;
            };
            if node.kind() == NodeKind::Reaction {
                continue;
            }
            let readers: Vec<NodeId> = node.downstream.iter().copied().collect();
            let hops: Vec<NodeId> = node.reconnect_downstream.iter().copied().collect();

            for down in readers {
                let Some(node) = self.nodes.get_mut(&down) else {
                    continue;
                };
                // Reactions get events, not staleness.
                if node.is_reaction() || node.mark == round {
                    continue;
                }
                node.mark = round;
                node.mark_stale();
                affected.push(down);
                queue.push_back(down);
            }

            for down in hops {
                let Some(node) = self.nodes.get_mut(&down) else {
                    continue;
                };
                node.needs_reconnect = true;
                if node.mark == round {
                    continue;
                }
                node.mark = round;
                node.mark_stale();
                affected.push(down);
                queue.push_back(down);
            }
        }

        self.topological_sort(affected)
    }

    /// Perform a topological sort of the given nodes.
    ///
    /// Returns nodes in order such that upstream comes before downstream.
    /// Nodes caught in a cycle keep their input order at the end.
    pub fn topological_sort(&self, nodes: Vec<NodeId>) -> Vec<NodeId> {
        let node_set: HashSet<_> = nodes.iter().copied().collect();
        let mut in_degree: HashMap<NodeId, usize> = HashMap::new();
        let mut result = Vec::with_capacity(nodes.len());
        let mut queue = VecDeque::new();

        // Calculate in-degrees (only counting edges within the node set)
        for &node_id in &nodes {
            if let Some(node) = self.nodes.get(&node_id) {
                let upstream: HashSet<NodeId> = node.upstream().collect();
                let degree = upstream.iter().filter(|d| node_set.contains(d)).count();
                in_degree.insert(node_id, degree);
                if degree == 0 {
                    queue.push_back(node_id);
                }
            }
        }

        // Kahn's algorithm
        while let Some(node_id) = queue.pop_front() {
            result.push(node_id);

            if let Some(node) = self.nodes.get(&node_id) {
                let dependents: IndexSet<NodeId> = node
                    .downstream
                    .iter()
                    .chain(&node.reconnect_downstream)
                    .copied()
                    .collect();
                for dependent_id in dependents {
                    if let Some(degree) = in_degree.get_mut(&dependent_id) {
                        if *degree == 0 {
                            continue;
                        }
                        *degree -= 1;
                        if *degree == 0 {
                            queue.push_back(dependent_id);
                        }
                    }
                }
            }
        }

        if result.len() < in_degree.len() {
            let placed: HashSet<NodeId> = result.iter().copied().collect();
            result.extend(
                nodes
                    .into_iter()
                    .filter(|id| in_degree.contains_key(id) && !placed.contains(id)),
            );
        }

        result
    }

    /// Iterate over all nodes, in no particular order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Get the total number of nodes in the graph.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}
