//! Graph Nodes
//!
//! This module defines the node types that live in the dependency graph.
//! A node wraps one [`Container`] together with the connections that feed it
//! and the edges of the nodes that read it.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use super::container::{Container, Readable, Status};
use crate::connect::ConnectionSpec;
use crate::error::{BoxError, ComputationError};
use crate::reactive::{Engine, Reactor, Validator};
use crate::value::{EntityId, Value};

/// Computes a derived value from the upstream values, in connection order.
pub type UpdateFn = Arc<dyn Fn(&Engine, &[Value]) -> Result<Value, BoxError> + Send + Sync>;

/// Unique identifier for a node in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(u64);

impl NodeId {
    /// Generate a new unique node ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node{}", self.0)
    }
}

/// The evaluation policy of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    /// Holds a value set through mutations. No upstream.
    Input,
    /// Recomputes during propagation as soon as an upstream changed.
    Eager,
    /// Marks itself stale on upstream change, recomputes when read.
    Lazy,
    /// A leaf that receives events instead of values.
    Reaction,
}

impl NodeKind {
    /// Whether the node computes its value from upstream.
    pub fn is_derived(&self) -> bool {
        matches!(self, NodeKind::Eager | NodeKind::Lazy)
    }
}

/// Why a node is subscribed to another one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkRole {
    /// The node's value is read by the update function / delivers events.
    Source,
    /// The node is an intermediate hop of a path; a change means re-resolve.
    Reconnect,
}

/// One resolved edge of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Link {
    pub node: NodeId,
    pub role: LinkRole,
}

impl Link {
    pub fn source(node: NodeId) -> Self {
        Self {
            node,
            role: LinkRole::Source,
        }
    }

    pub fn reconnect(node: NodeId) -> Self {
        Self {
            node,
            role: LinkRole::Reconnect,
        }
    }
}

/// A connection spec with the links it currently resolves to.
#[derive(Debug, Clone)]
pub struct Connection {
    pub spec: ConnectionSpec,
    pub links: SmallVec<[Link; 4]>,
}

impl Connection {
    pub fn new(spec: ConnectionSpec) -> Self {
        Self {
            spec,
            links: SmallVec::new(),
        }
    }

    /// Upstream nodes whose values are read, in resolution order.
    pub fn sources(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.links
            .iter()
            .filter(|l| l.role == LinkRole::Source)
            .map(|l| l.node)
    }
}

/// A node in the dependency graph.
pub struct Node {
    id: NodeId,
    kind: NodeKind,
    name: String,
    fullname: String,
    owner: Option<EntityId>,

    pub(crate) container: Container,
    pub(crate) func: Option<UpdateFn>,
    pub(crate) validator: Option<Validator>,
    pub(crate) reactor: Option<Reactor>,

    /// Resolved connections, one per spec string.
    pub(crate) connections: Vec<Connection>,
    /// Nodes reading this node's value (derived nodes and reactions).
    pub(crate) downstream: IndexSet<NodeId>,
    /// Nodes whose connection paths pass through this node.
    pub(crate) reconnect_downstream: IndexSet<NodeId>,

    /// Reason the node's connection is unresolved, if it is.
    pub(crate) not_connected: Option<String>,
    /// Error of the last computation, if it failed.
    pub(crate) error: Option<ComputationError>,
    pub(crate) computing: bool,
    pub(crate) needs_reconnect: bool,
    /// Propagation round in which this node was last visited.
    pub(crate) mark: u64,
}

impl Node {
    fn new(kind: NodeKind, name: &str, fullname: String, owner: Option<EntityId>) -> Self {
        Self {
            id: NodeId::new(),
            kind,
            name: name.to_string(),
            fullname,
            owner,
            container: Container::new(Value::Null),
            func: None,
            validator: None,
            reactor: None,
            connections: Vec::new(),
            downstream: IndexSet::new(),
            reconnect_downstream: IndexSet::new(),
            not_connected: None,
            error: None,
            computing: false,
            needs_reconnect: false,
            mark: 0,
        }
    }

    /// Create an input node holding `value`.
    pub(crate) fn input(
        name: &str,
        fullname: String,
        owner: Option<EntityId>,
        value: Value,
        validator: Validator,
    ) -> Self {
        let mut node = Self::new(NodeKind::Input, name, fullname, owner);
        node.container = Container::new(value);
        node.validator = Some(validator);
        node
    }

    /// Create an eager or lazy node. It starts unconnected.
    pub(crate) fn derived(
        kind: NodeKind,
        name: &str,
        fullname: String,
        owner: Option<EntityId>,
        specs: Vec<ConnectionSpec>,
        func: UpdateFn,
    ) -> Self {
        debug_assert!(kind.is_derived());
        let mut node = Self::new(kind, name, fullname, owner);
        node.container = Container::uninitialized();
        node.func = Some(func);
        node.connections = specs.into_iter().map(Connection::new).collect();
        node.not_connected = Some("not yet connected".into());
        node
    }

    /// Create a reaction node. It starts unconnected.
    pub(crate) fn reaction(
        name: &str,
        fullname: String,
        owner: Option<EntityId>,
        specs: Vec<ConnectionSpec>,
        reactor: Reactor,
    ) -> Self {
        let mut node = Self::new(NodeKind::Reaction, name, fullname, owner);
        node.reactor = Some(reactor);
        node.connections = specs.into_iter().map(Connection::new).collect();
        node.not_connected = Some("not yet connected".into());
        node
    }

    /// Get the node's ID.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Get the node's kind.
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// Property (or reaction) name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name qualified with the owning entity, e.g. `Person1.first_name`.
    pub fn fullname(&self) -> &str {
        &self.fullname
    }

    pub fn owner(&self) -> Option<EntityId> {
        self.owner
    }

    pub fn container(&self) -> &Container {
        &self.container
    }

    pub fn is_reaction(&self) -> bool {
        self.kind == NodeKind::Reaction
    }

    /// Every node this one is linked to, in connection order.
    pub fn upstream(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.connections
            .iter()
            .flat_map(|c| c.links.iter().map(|l| l.node))
    }

    /// Upstream nodes whose values feed the update function, in order.
    pub fn sources(&self) -> Vec<NodeId> {
        self.connections.iter().flat_map(|c| c.sources()).collect()
    }

    /// Mark stale if this is a derived node that has a value.
    pub(crate) fn mark_stale(&mut self) {
        if self.kind.is_derived() {
            self.container.mark_stale();
        }
    }

    /// Record a resolution failure.
    pub(crate) fn set_unconnected(&mut self, reason: String) {
        self.not_connected = Some(reason);
        if self.kind.is_derived() {
            self.container.set_status(Status::Unconnected);
        }
    }

    pub fn status(&self) -> Status {
        self.container.status()
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("fullname", &self.fullname)
            .field("status", &self.container.status())
            .field("not_connected", &self.not_connected)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::validators;

    fn lazy(specs: &[&str]) -> Node {
        let specs = specs
            .iter()
            .map(|s| ConnectionSpec::parse(s).unwrap())
            .collect();
        Node::derived(
            NodeKind::Lazy,
            "total",
            "Cart1.total".into(),
            None,
            specs,
            Arc::new(|_, _| Ok(Value::Null)),
        )
    }

    #[test]
    fn node_ids_are_unique() {
        let id1 = NodeId::new();
        let id2 = NodeId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn input_node_starts_ok() {
        let node = Node::input("x", "A1.x".into(), None, Value::Int(3), validators::any());
        assert_eq!(node.kind(), NodeKind::Input);
        assert_eq!(node.status(), Status::Ok);
        assert!(node.not_connected.is_none());
    }

    #[test]
    fn derived_node_starts_unconnected() {
        let node = lazy(&["a", "b"]);
        assert_eq!(node.status(), Status::Uninitialized);
        assert!(node.not_connected.is_some());
        assert_eq!(node.connections.len(), 2);
    }

    #[test]
    fn sources_skip_reconnect_links() {
        let mut node = lazy(&["a.b"]);
        let hop = NodeId::new();
        let leaf = NodeId::new();
        node.connections[0].links.push(Link::reconnect(hop));
        node.connections[0].links.push(Link::source(leaf));

        assert_eq!(node.sources(), vec![leaf]);
        assert_eq!(node.upstream().collect::<Vec<_>>(), vec![hop, leaf]);
    }
}
