//! Entity Lifecycle
//!
//! Creation builds an entity's nodes in sorted property order, connects
//! them, computes the eager ones and runs the class initializer. Disposal
//! removes every node the entity owns from the graph. Nodes of other
//! entities that were reading them lose their connection and re-resolve at
//! the next commit; pending events that involve the removed nodes are
//! dropped.
//!
//! Reactions attached with [`Engine::attach_reaction`] belong to whoever
//! attached them. They are not disposed with the entity they observe.

use std::collections::{HashMap, HashSet};

use indexmap::{IndexMap, IndexSet};

use super::action::ActionScope;
use super::component::{ClassDef, Entity};
use super::context::FrameKind;
use super::reaction::{Event, ReactionDef, ReactionHandle};
use super::runtime::{Engine, EngineState, EntityRecord};
use crate::connect::{ConnectionSpec, Member, Segment};
use crate::error::{EngineError, IllegalMutationError, Result};
use crate::graph::{Node, NodeId, NodeKind};
use crate::logging::targets;
use crate::value::{EntityId, Value};

impl EngineState {
    /// Remove nodes from the graph and forget pending work involving them.
    ///
    /// Returns the removed nodes so the caller can drop them (and the user
    /// closures they hold) after releasing the lock.
    pub(crate) fn remove_nodes(&mut self, ids: &[NodeId], owner_name: &str) -> Vec<Node> {
        let doomed: HashSet<NodeId> = ids.iter().copied().collect();

        let mut orphans = IndexSet::new();
        for id in ids {
            if let Some(node) = self.graph.get(*id) {
                orphans.extend(
                    node.downstream
                        .iter()
                        .chain(&node.reconnect_downstream)
                        .copied()
                        .filter(|d| !doomed.contains(d)),
                );
            }
        }

        let removed: Vec<Node> = ids.iter().filter_map(|id| self.graph.remove_node(*id)).collect();

        for orphan in orphans {
            if let Some(node) = self.graph.get_mut(orphan) {
                node.set_unconnected(format!("{owner_name} was disposed"));
                node.needs_reconnect = true;
                self.batch.relink.insert(orphan);
            }
        }

        let batch = &mut self.batch;
        for queue in [&mut batch.queue, &mut batch.deferred] {
            queue.retain(|reaction, events| {
                events.retain(|e| !doomed.contains(&e.node));
                !doomed.contains(reaction) && !events.is_empty()
            });
        }
        batch.initial.retain(|e| !doomed.contains(&e.node));
        batch.changed.retain(|id| !doomed.contains(id));
        batch.relink.retain(|id| !doomed.contains(id));

        removed
    }
}

impl Engine {
    /// Create an entity of `class`.
    ///
    /// `init` overrides the defaults of input properties; the values are
    /// validated like any other write. Derived properties are connected right
    /// away. With `raise_on_unresolved` set, a connection that cannot be
    /// resolved fails the creation.
    pub fn create(&self, class: &ClassDef, init: &[(&str, Value)]) -> Result<Entity> {
        let mut overrides: HashMap<&str, Value> = HashMap::new();
        for (name, value) in init {
            let Some(property) = class.property(name) else {
                return Err(EngineError::unknown_member(class.name(), *name));
            };
            if property.kind() != NodeKind::Input {
                return Err(IllegalMutationError {
                    entity: class.name().to_string(),
                    property: name.to_string(),
                    reason: "derived properties cannot be initialized".to_string(),
                }
                .into());
            }
            overrides.insert(*name, property.validate(value)?);
        }

        let (id, name, pending, eager, raise) = {
            let mut st = self.lock();
            let id = st.next_entity_id();
            let count = st.class_counts.entry(class.name().to_string()).or_default();
            *count += 1;
            let name = format!("{}{}", class.name(), count);
            let capture = st.config.capture_initial_events;

            let mut members = IndexMap::new();
            let mut pending = Vec::new();
            let mut eager = Vec::new();
            for property in class.properties() {
                let fullname = format!("{name}.{}", property.name());
                let node = match property.kind() {
                    NodeKind::Input => {
                        let value = overrides
                            .remove(property.name())
                            .unwrap_or_else(|| property.default_value().clone());
                        Node::input(
                            property.name(),
                            fullname,
                            Some(id),
                            value,
                            property.validator_fn().clone(),
                        )
                    }
                    kind => {
                        let func = property.func().cloned().ok_or_else(|| {
                            EngineError::Config(format!("'{fullname}' has no update function"))
                        })?;
                        let specs = class.property_specs(property.name()).to_vec();
                        Node::derived(kind, property.name(), fullname, Some(id), specs, func)
                    }
                };
                match node.kind() {
                    NodeKind::Input if capture => st.batch.initial.push(Event::initial(&node)),
                    NodeKind::Eager => {
                        pending.push(node.id());
                        eager.push(node.id());
                    }
                    NodeKind::Lazy => pending.push(node.id()),
                    _ => {}
                }
                members.insert(property.name().to_string(), Member::Node(st.graph.add_node(node)));
            }
            for (attribute, value) in class.attributes() {
                members.insert(attribute.to_string(), Member::Attribute(value.clone()));
            }

            let mut reactions = Vec::new();
            for (def, specs) in class.reactions() {
                let seq = st.next_seq();
                let node = Node::reaction(
                    def.name(),
                    format!("{name}.{}", def.name()),
                    Some(id),
                    specs.clone(),
                    def.reactor(specs, seq),
                );
                let node = st.graph.add_node(node);
                reactions.push(node);
                pending.push(node);
            }

            st.entities.insert(
                id,
                EntityRecord {
                    class: class.clone(),
                    name: name.clone(),
                    members,
                    reactions,
                    disposed: false,
                },
            );
            (id, name, pending, eager, st.config.raise_on_unresolved)
        };

        for node in pending {
            if let Err(error) = self.connect_node(node, raise) {
                self.dispose(id)?;
                return Err(error);
            }
        }
        for node in eager {
            if let Err(error) = self.evaluate(node) {
                self.report(error);
            }
        }

        if let Some(init) = class.init() {
            let scope = ActionScope::enter(self, Some(id), FrameKind::Init);
            let result = init(self, id);
            if let Err(error) = result.and(scope.close()) {
                self.dispose(id)?;
                return Err(error);
            }
        }

        tracing::debug!(target: targets::LIFECYCLE, entity = %name, "created entity");
        self.poke();
        Ok(Entity::new(id, name, self.downgrade()))
    }

    /// Dispose an entity and every node it owns. Disposing twice is a no-op.
    pub fn dispose(&self, entity: impl Into<EntityId>) -> Result<()> {
        let entity = entity.into();
        let removed = {
            let mut st = self.lock();
            let record = st
                .entities
                .get_mut(&entity)
                .ok_or_else(|| EngineError::UnknownEntity(entity.to_string()))?;
            if record.disposed {
                return Ok(());
            }
            record.disposed = true;
            let name = record.name.clone();
            let mut nodes: Vec<NodeId> = record
                .members
                .values()
                .filter_map(|m| match m {
                    Member::Node(id) => Some(*id),
                    Member::Attribute(_) => None,
                })
                .collect();
            nodes.append(&mut record.reactions);
            record.members.clear();

            let removed = st.remove_nodes(&nodes, &name);
            tracing::debug!(target: targets::LIFECYCLE, entity = %name, nodes = removed.len(), "disposed entity");
            removed
        };
        // Closures held by the nodes may own entity handles.
        drop(removed);
        self.poke();
        Ok(())
    }

    /// Remove a single node, typically a reaction.
    pub(crate) fn dispose_node(&self, id: NodeId) {
        let removed = {
            let mut st = self.lock();
            let Some(node) = st.graph.get(id) else {
                return;
            };
            let fullname = node.fullname().to_string();
            if let Some(owner) = node.owner() {
                if let Some(record) = st.entities.get_mut(&owner) {
                    record.reactions.retain(|r| *r != id);
                }
            }
            tracing::debug!(target: targets::LIFECYCLE, node = %fullname, "disposed node");
            st.remove_nodes(&[id], &fullname)
        };
        drop(removed);
        self.poke();
    }

    /// Attach a free-standing reaction.
    ///
    /// With `root` set the connection strings resolve from that entity,
    /// otherwise from the names registered with [`Engine::expose`]. The
    /// reaction stays attached until [`ReactionHandle::dispose`] is called.
    pub fn attach_reaction(
        &self,
        root: Option<EntityId>,
        def: ReactionDef,
    ) -> Result<ReactionHandle> {
        let specs = def.parse_specs()?;
        let (id, raise) = {
            let mut st = self.lock();
            let prefix = match root {
                Some(entity) => st.entity(entity)?.name.clone(),
                None => "root".to_string(),
            };
            let seq = st.next_seq();
            let reactor = def.reactor(&specs, seq);
            let node = Node::reaction(
                def.name(),
                format!("{prefix}.{}", def.name()),
                root,
                specs,
                reactor,
            );
            (st.graph.add_node(node), st.config.raise_on_unresolved)
        };

        if let Err(error) = self.connect_node(id, raise) {
            self.dispose_node(id);
            return Err(error);
        }
        Ok(ReactionHandle::new(id, self.downgrade()))
    }

    /// Dispose the reactions reading a property.
    ///
    /// `spec` names the property, optionally with a label (`"value:ui"`); only
    /// reactions with that label are removed then. Returns how many were.
    pub fn disconnect(&self, entity: impl Into<EntityId>, spec: &str) -> Result<usize> {
        let entity = entity.into();
        let spec = ConnectionSpec::parse(spec)?;
        let matching: Vec<NodeId> = {
            let st = self.lock();
            let [Segment::Name(name)] = spec.path() else {
                return Err(EngineError::invalid_connection(
                    spec.as_str(),
                    "expected a property name",
                ));
            };
            let property = st.member_node(entity, name)?;
            st.node(property)?
                .downstream
                .iter()
                .filter_map(|id| st.graph.get(*id))
                .filter(|n| {
                    n.reactor.as_ref().is_some_and(|r| match spec.label() {
                        Some(label) => r.label == label,
                        None => true,
                    })
                })
                .map(Node::id)
                .collect()
        };
        for id in &matching {
            self.dispose_node(*id);
        }
        Ok(matching.len())
    }

    /// Drop the links of a derived node or reaction.
    ///
    /// The node reads as unconnected and its readers are marked stale at the
    /// next commit. Reading it again re-resolves its connections.
    pub fn disconnect_node(&self, id: NodeId) -> Result<()> {
        {
            let mut st = self.lock();
            let node = st.node_mut(id)?;
            if node.kind() == NodeKind::Input {
                return Err(EngineError::Config(format!(
                    "input '{}' has no connections",
                    node.fullname()
                )));
            }
            let mut links = Vec::new();
            for conn in &mut node.connections {
                links.extend(conn.links.drain(..));
            }
            node.set_unconnected("explicitly disconnected".to_string());

            for link in links {
                if st.graph.unsubscribe(link, id) {
                    st.stats.unsubscribes += 1;
                }
            }
            st.batch.changed.insert(id);
        }
        self.poke();
        Ok(())
    }

    /// Re-resolve the connections of a node, failing if they cannot be.
    pub fn reconnect(&self, id: NodeId) -> Result<()> {
        self.connect_node(id, true)?;
        let eager = self.lock().node(id)?.kind() == NodeKind::Eager;
        if eager {
            if let Err(error) = self.evaluate(id) {
                self.report(error);
            }
        }
        self.lock().batch.changed.insert(id);
        self.poke();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::config::EngineConfig;
    use crate::graph::Status;
    use crate::reactive::PropertyDef;

    fn pair() -> ClassDef {
        ClassDef::builder("Pair")
            .property(PropertyDef::input("a", 1).settable())
            .property(PropertyDef::input("b", 2).settable())
            .property(PropertyDef::eager("sum", ["a", "b"], |_, v| {
                Ok(Value::Int(v.iter().filter_map(Value::as_i64).sum()))
            }))
            .build()
            .unwrap()
    }

    fn watcher() -> ClassDef {
        ClassDef::builder("Watcher")
            .property(PropertyDef::input("other", Value::Null))
            .property(PropertyDef::lazy("seen", ["other.sum"], |_, v| Ok(v[0].clone())))
            .build()
            .unwrap()
    }

    #[test]
    fn names_count_per_class() {
        let engine = Engine::default();
        let a = engine.create(&pair(), &[]).unwrap();
        let b = engine.create(&pair(), &[("a", Value::Int(5))]).unwrap();
        assert_eq!(a.name(), "Pair1");
        assert_eq!(b.name(), "Pair2");
        assert_eq!(b.get("sum").unwrap(), Value::Int(7));
    }

    #[test]
    fn initial_values_are_checked() {
        let engine = Engine::default();
        let err = engine.create(&pair(), &[("sum", Value::Int(1))]).unwrap_err();
        assert!(matches!(err, EngineError::IllegalMutation(_)));
        let err = engine.create(&pair(), &[("c", Value::Int(1))]).unwrap_err();
        assert!(matches!(err, EngineError::UnknownMember { .. }));
    }

    #[test]
    fn disposal_unconnects_readers() {
        let engine = Engine::default();
        let p = engine.create(&pair(), &[]).unwrap();
        let w = engine
            .create(&watcher(), &[("other", Value::Entity(p.id()))])
            .unwrap();
        assert_eq!(w.get("seen").unwrap(), Value::Int(3));

        p.dispose().unwrap();
        assert!(matches!(p.get("a"), Err(EngineError::Disposed(_))));
        assert!(matches!(w.get("seen"), Err(EngineError::NotConnected(_))));
        let seen = engine.node_of(&w, "seen").unwrap();
        assert_eq!(engine.status(seen).unwrap(), Status::Unconnected);

        // A second dispose is harmless.
        p.dispose().unwrap();
    }

    #[test]
    fn raising_creation_fails_on_bad_paths() {
        let engine = Engine::new(EngineConfig::default().with_raise_on_unresolved(true));
        let err = engine.create(&watcher(), &[]).unwrap_err();
        assert!(matches!(err, EngineError::NotConnected(_)));

        let relaxed = Engine::default();
        let w = relaxed.create(&watcher(), &[]).unwrap();
        assert!(matches!(w.get("seen"), Err(EngineError::NotConnected(_))));
    }

    #[test]
    fn disconnect_by_label() {
        let engine = Engine::default();
        let p = engine.create(&pair(), &[]).unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        for label in ["ui", "ui", "log"] {
            let runs = runs.clone();
            engine
                .attach_reaction(
                    Some(p.id()),
                    ReactionDef::new("r", [format!("a:{label}")], move |_, _, _| {
                        runs.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }),
                )
                .unwrap();
        }

        assert_eq!(engine.disconnect(&p, "a:ui").unwrap(), 2);
        engine.drain_now().unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(engine.disconnect(&p, "a").unwrap(), 1);
        assert_eq!(engine.get_reactions(&p, "a").unwrap().len(), 0);
    }

    #[test]
    fn explicit_node_disconnect() {
        let engine = Engine::default();
        let p = engine.create(&pair(), &[]).unwrap();
        let sum = engine.node_of(&p, "sum").unwrap();

        engine.disconnect_node(sum).unwrap();
        assert_eq!(engine.status(sum).unwrap(), Status::Unconnected);
        assert!(engine.get_connection_info(sum).unwrap().iter().all(|(_, t)| t.is_empty()));

        engine.reconnect(sum).unwrap();
        engine.drain_now().unwrap();
        assert_eq!(p.get("sum").unwrap(), Value::Int(3));
    }
}
