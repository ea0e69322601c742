//! Reactions
//!
//! A reaction is a leaf of the graph. Instead of a value it receives the
//! list of [`Event`]s its upstream produced since it last ran, once per
//! drain, no matter how many of its upstream properties changed.
//!
//! # Modes
//!
//! - [`ReactionMode::Normal`]: events produced while the reaction phase of a
//!   drain is running are delivered at the next drain.
//! - [`ReactionMode::Greedy`]: such events are delivered within the same
//!   drain, so the reaction runs again until it stops causing changes. Used
//!   for bidirectional bindings that would otherwise bounce between drains.
//!
//! # Ordering
//!
//! Within one drain reactions run sorted by label, then by creation order.
//! The label is the one given explicitly, else the label of the first
//! connection string that carries one (`"value:b"`), else the reaction name.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::action::MutationKind;
use super::runtime::{Engine, WeakEngine};
use crate::connect::ConnectionSpec;
use crate::error::{BoxError, Result};
use crate::graph::{Node, NodeId, Readable};
use crate::value::{EntityId, Value};

/// Callback of a reaction. Receives the owning (or root) entity, if any, and
/// the accumulated events.
pub type ReactionFn =
    Arc<dyn Fn(&Engine, Option<EntityId>, &[Event]) -> std::result::Result<(), BoxError> + Send + Sync>;

/// A change of one property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Entity owning the property.
    pub source: Option<EntityId>,
    /// The property's node.
    pub node: NodeId,
    /// Property name.
    #[serde(rename = "type")]
    pub event_type: String,
    pub mutation: MutationKind,
    /// Position of an in-place mutation.
    pub index: Option<usize>,
    pub old_value: Value,
    pub new_value: Value,
    /// Inserted or replacing elements, or the number of removed elements.
    pub objects: Value,
}

impl Event {
    /// Event describing the latest change of `node`.
    pub(crate) fn from_node(
        node: &Node,
        mutation: MutationKind,
        index: Option<usize>,
        objects: Value,
    ) -> Self {
        Self {
            source: node.owner(),
            node: node.id(),
            event_type: node.name().to_string(),
            mutation,
            index,
            old_value: node.container().previous_value().clone(),
            new_value: node.container().value().clone(),
            objects,
        }
    }

    /// The "set" event an input emits when its entity is created.
    pub(crate) fn initial(node: &Node) -> Self {
        let value = node.container().value().clone();
        Self {
            source: node.owner(),
            node: node.id(),
            event_type: node.name().to_string(),
            mutation: MutationKind::Set,
            index: None,
            old_value: value.clone(),
            new_value: value,
            objects: Value::Null,
        }
    }
}

/// How a reaction consumes events produced during a drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ReactionMode {
    #[default]
    Normal,
    Greedy,
}

/// Per-node data of a reaction.
#[derive(Clone)]
pub struct Reactor {
    pub(crate) mode: ReactionMode,
    pub(crate) label: String,
    pub(crate) seq: u64,
    pub(crate) func: ReactionFn,
}

impl Reactor {
    pub(crate) fn new(mode: ReactionMode, label: String, seq: u64, func: ReactionFn) -> Self {
        Self {
            mode,
            label,
            seq,
            func,
        }
    }

    /// Sort key within a drain.
    pub(crate) fn order(&self) -> (&str, u64) {
        (&self.label, self.seq)
    }
}

/// Declaration of a reaction, bound to a class or attached directly.
#[derive(Clone)]
pub struct ReactionDef {
    name: String,
    specs: Vec<String>,
    mode: ReactionMode,
    label: Option<String>,
    func: ReactionFn,
}

impl ReactionDef {
    pub fn new<I, S, F>(name: impl Into<String>, specs: I, func: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&Engine, Option<EntityId>, &[Event]) -> std::result::Result<(), BoxError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            specs: specs.into_iter().map(Into::into).collect(),
            mode: ReactionMode::Normal,
            label: None,
            func: Arc::new(func),
        }
    }

    pub fn mode(mut self, mode: ReactionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn greedy(self) -> Self {
        self.mode(ReactionMode::Greedy)
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn specs(&self) -> &[String] {
        &self.specs
    }

    pub(crate) fn parse_specs(&self) -> Result<Vec<ConnectionSpec>> {
        self.specs.iter().map(|s| ConnectionSpec::parse(s)).collect()
    }

    pub(crate) fn reactor(&self, specs: &[ConnectionSpec], seq: u64) -> Reactor {
        let label = self
            .label
            .clone()
            .or_else(|| specs.iter().find_map(|s| s.label().map(str::to_string)))
            .unwrap_or_else(|| self.name.clone());
        Reactor::new(self.mode, label, seq, self.func.clone())
    }
}

impl fmt::Debug for ReactionDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReactionDef")
            .field("name", &self.name)
            .field("specs", &self.specs)
            .field("mode", &self.mode)
            .field("label", &self.label)
            .finish()
    }
}

/// Read-only description of a registered reaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionInfo {
    pub id: NodeId,
    pub name: String,
    pub label: String,
    pub mode: ReactionMode,
}

/// Handle to a reaction created with [`Engine::attach_reaction`].
///
/// Dropping the handle does *not* detach the reaction; the reaction lives
/// as long as the entities it observes, until [`ReactionHandle::dispose`].
#[derive(Debug, Clone)]
pub struct ReactionHandle {
    id: NodeId,
    engine: WeakEngine,
}

impl ReactionHandle {
    pub(crate) fn new(id: NodeId, engine: WeakEngine) -> Self {
        Self { id, engine }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Detach the reaction. Pending events for it are dropped.
    pub fn dispose(&self) {
        if let Some(engine) = self.engine.upgrade() {
            engine.dispose_node(self.id);
        }
    }

    /// `(connection string, resolved targets)` for each connection.
    pub fn connection_info(&self) -> Result<Vec<(String, Vec<String>)>> {
        match self.engine.upgrade() {
            Some(engine) => engine.get_connection_info(self.id),
            None => Ok(Vec::new()),
        }
    }
}
