//! Reactive Runtime
//!
//! The [`Engine`] is the central coordinator: it owns the node arena, the
//! entities and the pending batch, and implements evaluation (pull) and
//! connection (resolve) of nodes.
//!
//! # How It Works
//!
//! 1. Reading a property evaluates its node. Input nodes return their value;
//!    derived nodes return their cached value unless stale, in which case
//!    they read their upstream in order and run their update function.
//!
//! 2. Unconnected nodes are connected first. Connecting resolves every
//!    connection string and diffs the result against the current links, so
//!    unchanged subscriptions stay untouched.
//!
//! 3. Mutations and propagation are in `action` and `scheduler`.
//!
//! # Thread Safety
//!
//! All state sits behind one mutex. The lock is only held for bookkeeping
//! and is always released before user code (update functions, actions,
//! reactions) runs, so user code may call back into the engine freely.
//! Engines are independent of each other; a thread may drive several.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use indexmap::{IndexMap, IndexSet};
use parking_lot::{Mutex, MutexGuard};

use super::action::MutationKind;
use super::component::ClassDef;
use super::context::MutationContext;
use super::host::{Host, ManualHost};
use super::introspect::Stats;
use super::reaction::Event;
use super::scheduler::Batch;
use crate::config::EngineConfig;
use crate::connect::{self, Member, PathContext, Resolution, Scope};
use crate::error::{ComputationError, EngineError, NotConnectedError, Result};
use crate::graph::{Graph, Link, Mutable, Node, NodeId, NodeKind, Readable, Status};
use crate::logging::targets;
use crate::value::{EntityId, Value};

static ENGINE_IDS: AtomicU64 = AtomicU64::new(1);

/// Book-keeping of one entity.
pub(crate) struct EntityRecord {
    pub(crate) class: ClassDef,
    pub(crate) name: String,
    /// Properties in declaration order, then attributes.
    pub(crate) members: IndexMap<String, Member>,
    /// Reactions declared by the class, owned by this entity.
    pub(crate) reactions: Vec<NodeId>,
    pub(crate) disposed: bool,
}

/// Everything behind the engine lock.
pub(crate) struct EngineState {
    pub(crate) config: EngineConfig,
    pub(crate) graph: Graph,
    pub(crate) entities: HashMap<EntityId, EntityRecord>,
    pub(crate) roots: IndexMap<String, Value>,
    pub(crate) class_counts: HashMap<String, u64>,
    pub(crate) batch: Batch,
    pub(crate) errors: VecDeque<ComputationError>,
    pub(crate) stats: Stats,
    /// Entities without handles that property values still refer to.
    pub(crate) unowned: IndexSet<EntityId>,
    next_entity: u64,
    next_seq: u64,
    clock: u64,
}

impl EngineState {
    fn new(config: EngineConfig) -> Self {
        Self {
            config,
            graph: Graph::new(),
            entities: HashMap::new(),
            roots: IndexMap::new(),
            class_counts: HashMap::new(),
            batch: Batch::default(),
            errors: VecDeque::new(),
            stats: Stats::default(),
            unowned: IndexSet::new(),
            next_entity: 1,
            next_seq: 0,
            clock: 0,
        }
    }

    /// Advance the logical clock.
    pub(crate) fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    pub(crate) fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    pub(crate) fn next_entity_id(&mut self) -> EntityId {
        let id = EntityId::new(self.next_entity);
        self.next_entity += 1;
        id
    }

    /// Look up a live entity.
    pub(crate) fn entity(&self, id: EntityId) -> Result<&EntityRecord> {
        match self.entities.get(&id) {
            Some(record) if record.disposed => Err(EngineError::Disposed(record.name.clone())),
            Some(record) => Ok(record),
            None => Err(EngineError::UnknownEntity(id.to_string())),
        }
    }

    /// Node behind a property of a live entity.
    pub(crate) fn member_node(&self, entity: EntityId, name: &str) -> Result<NodeId> {
        let record = self.entity(entity)?;
        match record.members.get(name) {
            Some(Member::Node(id)) => Ok(*id),
            _ => Err(EngineError::unknown_member(&record.name, name)),
        }
    }

    pub(crate) fn node(&self, id: NodeId) -> Result<&Node> {
        self.graph
            .get(id)
            .ok_or_else(|| EngineError::Disposed(id.to_string()))
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        self.graph
            .get_mut(id)
            .ok_or_else(|| EngineError::Disposed(id.to_string()))
    }

    /// Whether an eager node reads, directly or through other eager nodes,
    /// an input changed in the uncommitted batch.
    pub(crate) fn is_behind(&self, id: NodeId) -> bool {
        if self.batch.committing || self.batch.changed.is_empty() {
            return false;
        }
        let mut seen = HashSet::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            let Some(node) = self.graph.get(current) else {
                continue;
            };
            if node.kind() != NodeKind::Eager {
                continue;
            }
            for source in node.sources() {
                if self.batch.changed.contains(&source) {
                    return true;
                }
                stack.push(source);
            }
        }
        false
    }

    /// Whether a property of another entity or an exposed root holds a
    /// reference to `entity`.
    pub(crate) fn is_referenced(&self, entity: EntityId) -> bool {
        self.roots.values().any(|value| value.refers_to(entity))
            || self
                .graph
                .nodes()
                .filter(|node| node.owner() != Some(entity))
                .any(|node| node.container().value().refers_to(entity))
    }

    /// Keep a caught error for later inspection.
    pub(crate) fn record_error(&mut self, error: ComputationError) {
        if self.config.error_history == 0 {
            return;
        }
        while self.errors.len() >= self.config.error_history {
            self.errors.pop_front();
        }
        self.errors.push_back(error);
    }

    /// Hand the event of a changed node to every reaction reading it.
    pub(crate) fn deliver(&mut self, node: NodeId, event: Event) {
        let Some(source) = self.graph.get(node) else {
            return;
        };
        let targets: Vec<_> = source
            .downstream
            .iter()
            .filter_map(|id| self.graph.get(*id))
            .filter_map(|n| n.reactor.as_ref().map(|r| (n.id(), r.mode)))
            .collect();
        for (reaction, mode) in targets {
            self.batch.enqueue(reaction, mode, event.clone());
        }
    }

    /// Store freshly computed links on a node and update subscriptions.
    ///
    /// Returns the resolution failure, if any.
    fn apply_resolutions(&mut self, id: NodeId, resolutions: Vec<Resolution>) -> Option<String> {
        let node = self.graph.get_mut(id)?;

        let mut plans = Vec::with_capacity(resolutions.len());
        let mut failure = None;
        for (conn, resolution) in node.connections.iter_mut().zip(resolutions) {
            plans.push(connect::plan(conn.links.as_slice(), resolution.links.as_slice()));
            conn.links = resolution.links;
            if failure.is_none() {
                failure = resolution.failure;
            }
        }

        let relinked = plans.iter().any(|p| !p.is_empty());
        match &failure {
            Some(reason) => node.set_unconnected(reason.clone()),
            None => {
                let was_unconnected = node.not_connected.take().is_some();
                if node.kind().is_derived() && (relinked || was_unconnected) {
                    match node.status() {
                        Status::Uninitialized => {}
                        _ => node.container.set_status(Status::Stale),
                    }
                }
            }
        }

        let links: Vec<Link> = node.connections.iter().flat_map(|c| c.links.iter().copied()).collect();
        for plan in plans {
            for link in plan.unsubscribe {
                if self.graph.unsubscribe(link, id) {
                    self.stats.unsubscribes += 1;
                }
            }
            for link in plan.subscribe {
                if self.graph.subscribe(link, id) {
                    self.stats.subscribes += 1;
                }
            }
        }
        // Another connection of this node may still need a dropped edge.
        for link in links {
            if self.graph.subscribe(link, id) {
                self.stats.subscribes += 1;
            }
        }
        failure
    }
}

pub(crate) struct EngineInner {
    id: u64,
    state: Mutex<EngineState>,
    pub(crate) host: Arc<dyn Host>,
    /// Entities whose last handle was dropped, disposed at the next drain.
    pub(crate) graveyard: Mutex<Vec<EntityId>>,
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        self.host.detach();
    }
}

/// Handle to a reactive engine.
///
/// Cloning is cheap; all clones share the same graph.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

/// Non-owning handle to an engine.
#[derive(Clone)]
pub struct WeakEngine(Weak<EngineInner>);

impl WeakEngine {
    pub fn upgrade(&self) -> Option<Engine> {
        self.0.upgrade().map(|inner| Engine { inner })
    }
}

impl fmt::Debug for WeakEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("WeakEngine").finish()
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine").field("id", &self.inner.id).finish()
    }
}

impl Engine {
    /// Create an engine whose drains are driven by the caller.
    pub fn new(config: EngineConfig) -> Self {
        Self::with_host(config, Arc::new(ManualHost::new()))
    }

    /// Create an engine that asks `host` to drain whenever work is pending.
    pub fn with_host(config: EngineConfig, host: Arc<dyn Host>) -> Self {
        let id = ENGINE_IDS.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(target: targets::CORE, engine = id, ?config, "engine created");
        Self {
            inner: Arc::new(EngineInner {
                id,
                state: Mutex::new(EngineState::new(config)),
                host,
                graveyard: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Process-unique id of this engine.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn downgrade(&self) -> WeakEngine {
        WeakEngine(Arc::downgrade(&self.inner))
    }

    pub fn config(&self) -> EngineConfig {
        self.lock().config.clone()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.inner.state.lock()
    }

    pub(crate) fn inner_host(&self) -> &Arc<dyn Host> {
        &self.inner.host
    }

    pub(crate) fn graveyard_is_empty(&self) -> bool {
        self.inner.graveyard.lock().is_empty()
    }

    pub(crate) fn take_graveyard(&self) -> Vec<EntityId> {
        std::mem::take(&mut *self.inner.graveyard.lock())
    }

    /// Queue disposal of an entity whose last handle was dropped.
    ///
    /// Only touches the graveyard, so it is safe to call while the engine
    /// lock is held further up the stack.
    pub(crate) fn bury(&self, entity: EntityId) {
        let first = {
            let mut graveyard = self.inner.graveyard.lock();
            graveyard.push(entity);
            graveyard.len() == 1
        };
        if first {
            self.inner.host.schedule_drain();
        }
    }

    /// Register a named root for connection strings of reactions attached
    /// without an entity.
    pub fn expose(&self, name: impl Into<String>, value: impl Into<Value>) {
        self.lock().roots.insert(name.into(), value.into());
    }

    /// Read a property or attribute, computing it if needed.
    pub fn get(&self, entity: impl Into<EntityId>, name: &str) -> Result<Value> {
        let entity = entity.into();
        let member = {
            let st = self.lock();
            let record = st.entity(entity)?;
            record
                .members
                .get(name)
                .cloned()
                .ok_or_else(|| EngineError::unknown_member(&record.name, name))?
        };
        match member {
            Member::Attribute(value) => Ok(value),
            Member::Node(node) => self.evaluate(node),
        }
    }

    /// The node behind a property.
    pub fn node_of(&self, entity: impl Into<EntityId>, name: &str) -> Result<NodeId> {
        self.lock().member_node(entity.into(), name)
    }

    /// Read a node, computing it if needed.
    pub fn read(&self, node: NodeId) -> Result<Value> {
        self.evaluate(node)
    }

    /// Status of a node without computing it.
    pub fn status(&self, node: NodeId) -> Result<Status> {
        Ok(self.lock().node(node)?.status())
    }

    /// Pull the value of a node.
    pub(crate) fn evaluate(&self, id: NodeId) -> Result<Value> {
        let connect_first = {
            let st = self.lock();
            let node = st.node(id)?;
            node.kind() != NodeKind::Input
                && (node.needs_reconnect || node.not_connected.is_some())
        };
        if connect_first {
            self.connect_node(id, false)?;
        }

        let in_action = MutationContext::is_active(self.id());
        let (sources, func, preview) = {
            let mut st = self.lock();
            let preview = in_action && st.is_behind(id);
            let node = st.node_mut(id)?;
            if let Some(reason) = &node.not_connected {
                return Err(NotConnectedError {
                    node: node.fullname().to_string(),
                    reason: reason.clone(),
                }
                .into());
            }
            match node.kind() {
                NodeKind::Input => return Ok(node.container.value().clone()),
                NodeKind::Reaction => return Ok(Value::Null),
                NodeKind::Eager | NodeKind::Lazy => {}
            }
            // Re-entered through a cycle: the current value is the answer.
            if node.computing {
                return Ok(node.container.value().clone());
            }
            if node.container.is_fresh() && !preview {
                return match (&node.error, node.kind()) {
                    (Some(error), NodeKind::Lazy) => Err(error.clone().into()),
                    _ => Ok(node.container.value().clone()),
                };
            }
            node.computing = true;
            (node.sources(), node.func.clone(), preview)
        };

        let mut values = Vec::with_capacity(sources.len());
        for source in sources {
            match self.evaluate(source) {
                Ok(value) => values.push(value),
                Err(error) => {
                    if let Some(node) = self.lock().graph.get_mut(id) {
                        node.computing = false;
                    }
                    return Err(error);
                }
            }
        }

        let result = match &func {
            Some(func) => func(self, &values),
            None => Ok(Value::Null),
        };

        let mut st = self.lock();
        st.stats.recomputes += 1;
        let stamp = st.tick();
        let committing = st.batch.committing;
        let node = st.node_mut(id)?;
        node.computing = false;

        // Seen by the running action only; the commit stores the real value.
        if preview {
            return result
                .map_err(|error| ComputationError::new(node.fullname(), error.to_string()).into());
        }

        match result {
            Ok(value) => {
                node.error = None;
                let initialized = node.status() != Status::Uninitialized;
                if node.container.store(value.clone(), stamp) && initialized {
                    let event = Event::from_node(node, MutationKind::Set, None, Value::Null);
                    let hops: Vec<NodeId> = node.reconnect_downstream.iter().copied().collect();
                    st.deliver(id, event);
                    // During a commit the staleness walk already covered these.
                    if !committing {
                        st.batch.relink.extend(hops);
                    }
                }
                Ok(value)
            }
            Err(error) => {
                let error = ComputationError::new(node.fullname(), error.to_string());
                node.error = Some(error.clone());
                node.container.set_status(Status::Ok);
                Err(error.into())
            }
        }
    }

    /// (Re)resolve every connection of a node.
    ///
    /// With `raise` unset a resolution failure is recorded on the node and
    /// logged, and `Ok` is returned.
    pub(crate) fn connect_node(&self, id: NodeId, raise: bool) -> Result<()> {
        let (scope, specs, fullname) = {
            let mut st = self.lock();
            let node = st.node_mut(id)?;
            node.needs_reconnect = false;
            let scope = node.owner().map_or(Scope::Root, Scope::Entity);
            let specs: Vec<_> = node.connections.iter().map(|c| c.spec.clone()).collect();
            (scope, specs, node.fullname().to_string())
        };

        let resolutions: Vec<Resolution> = specs
            .iter()
            .map(|spec| connect::resolve(self, scope, spec))
            .collect();

        let failure = self.lock().apply_resolutions(id, resolutions);
        if let Some(reason) = failure {
            tracing::debug!(target: targets::CONNECT, node = %fullname, %reason, "connection unresolved");
            if raise {
                return Err(NotConnectedError {
                    node: fullname,
                    reason,
                }
                .into());
            }
        }
        Ok(())
    }
}

impl PathContext for Engine {
    fn member(&self, scope: Scope, name: &str) -> Option<Member> {
        let st = self.lock();
        match scope {
            Scope::Root => st.roots.get(name).cloned().map(Member::Attribute),
            Scope::Entity(id) => st.entity(id).ok()?.members.get(name).cloned(),
        }
    }

    fn read(&self, node: NodeId) -> Result<Value> {
        self.evaluate(node)
    }
}
