//! Introspection
//!
//! Read-only views of an engine for mirroring layers and tests: the events
//! an entity can emit, the reactions listening to them, what each connection
//! resolved to, snapshots of entity state, counters and caught errors.
//! Nothing here computes values or changes subscriptions.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::reaction::ReactionInfo;
use super::runtime::Engine;
use crate::connect::Member;
use crate::error::{ComputationError, EngineError, Result};
use crate::graph::{LinkRole, NodeId, Readable, Status};
use crate::value::{EntityId, Value};

/// Counters of an engine since creation or the last [`Engine::reset_stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    /// Edges created by connecting nodes.
    pub subscribes: u64,
    /// Edges removed by reconnecting nodes.
    pub unsubscribes: u64,
    /// Runs of update functions.
    pub recomputes: u64,
    /// Reaction invocations.
    pub reactions_run: u64,
    pub drains: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertySnapshot {
    pub value: Value,
    pub status: Status,
}

/// State of one entity as last computed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub id: EntityId,
    pub name: String,
    pub class: String,
    pub properties: IndexMap<String, PropertySnapshot>,
    pub attributes: IndexMap<String, Value>,
}

impl EntitySnapshot {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| EngineError::Codec(e.to_string()))
    }

    pub fn to_msgpack(&self) -> Result<Vec<u8>> {
        rmp_serde::to_vec_named(self).map_err(|e| EngineError::Codec(e.to_string()))
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self> {
        rmp_serde::from_slice(bytes).map_err(|e| EngineError::Codec(e.to_string()))
    }
}

impl Engine {
    /// Names of the properties of an entity, i.e. the event types it emits.
    pub fn get_event_types(&self, entity: impl Into<EntityId>) -> Result<Vec<String>> {
        let st = self.lock();
        let record = st.entity(entity.into())?;
        let mut types: Vec<String> = record
            .members
            .iter()
            .filter(|(_, m)| matches!(m, Member::Node(_)))
            .map(|(name, _)| name.clone())
            .collect();
        types.sort_unstable();
        Ok(types)
    }

    /// Reactions reading a property, in the order they would run.
    pub fn get_reactions(
        &self,
        entity: impl Into<EntityId>,
        event_type: &str,
    ) -> Result<Vec<ReactionInfo>> {
        let st = self.lock();
        let property = st.member_node(entity.into(), event_type)?;
        let mut reactions: Vec<(u64, ReactionInfo)> = st
            .node(property)?
            .downstream
            .iter()
            .filter_map(|id| st.graph.get(*id))
            .filter_map(|node| {
                let reactor = node.reactor.as_ref()?;
                let info = ReactionInfo {
                    id: node.id(),
                    name: node.name().to_string(),
                    label: reactor.label.clone(),
                    mode: reactor.mode,
                };
                Some((reactor.seq, info))
            })
            .collect();
        reactions.sort_by(|(a_seq, a), (b_seq, b)| (&a.label, a_seq).cmp(&(&b.label, b_seq)));
        Ok(reactions.into_iter().map(|(_, info)| info).collect())
    }

    /// For each connection of a node, the connection string and the full
    /// names of the nodes it resolved to. Nodes only used to follow the path
    /// carry a `:reconnect` suffix.
    pub fn get_connection_info(&self, node: NodeId) -> Result<Vec<(String, Vec<String>)>> {
        let st = self.lock();
        let node = st.node(node)?;
        Ok(node
            .connections
            .iter()
            .map(|conn| {
                let targets = conn
                    .links
                    .iter()
                    .filter_map(|link| {
                        let target = st.graph.get(link.node)?.fullname();
                        Some(match link.role {
                            LinkRole::Source => target.to_string(),
                            LinkRole::Reconnect => format!("{target}:reconnect"),
                        })
                    })
                    .collect();
                (conn.spec.as_str().to_string(), targets)
            })
            .collect())
    }

    /// Current state of an entity. Stale values are reported as they are.
    pub fn snapshot(&self, entity: impl Into<EntityId>) -> Result<EntitySnapshot> {
        let entity = entity.into();
        let st = self.lock();
        let record = st.entity(entity)?;
        let mut properties = IndexMap::new();
        let mut attributes = IndexMap::new();
        for (name, member) in &record.members {
            match member {
                Member::Node(id) => {
                    let node = st.node(*id)?;
                    properties.insert(
                        name.clone(),
                        PropertySnapshot {
                            value: node.container().value().clone(),
                            status: node.status(),
                        },
                    );
                }
                Member::Attribute(value) => {
                    attributes.insert(name.clone(), value.clone());
                }
            }
        }
        Ok(EntitySnapshot {
            id: entity,
            name: record.name.clone(),
            class: record.class.name().to_string(),
            properties,
            attributes,
        })
    }

    pub fn stats(&self) -> Stats {
        self.lock().stats
    }

    pub fn reset_stats(&self) {
        self.lock().stats = Stats::default();
    }

    /// Most recent error caught during a drain.
    pub fn last_error(&self) -> Option<ComputationError> {
        self.lock().errors.back().cloned()
    }

    /// Remove and return every recorded error, oldest first.
    pub fn take_errors(&self) -> Vec<ComputationError> {
        self.lock().errors.drain(..).collect()
    }
}
