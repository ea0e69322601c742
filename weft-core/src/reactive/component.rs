//! Classes and Entities
//!
//! A [`ClassDef`] is the declaration shared by all entities of one kind:
//! properties (kept sorted by name, which is also their initialization
//! order), static attributes, actions, reactions and an optional
//! initializer. [`Engine::create`] instantiates it into an entity, and the
//! returned [`Entity`] handle keeps that entity alive.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;

use super::property::PropertyDef;
use super::reaction::ReactionDef;
use super::runtime::{Engine, WeakEngine};
use crate::connect::ConnectionSpec;
use crate::error::{EngineError, Result};
use crate::graph::NodeKind;
use crate::value::{EntityId, Value};

/// Body of an action: receives the entity it was invoked on and the
/// arguments.
pub type ActionFn = Arc<dyn Fn(&Engine, EntityId, &[Value]) -> Result<()> + Send + Sync>;

/// Runs once after an entity's properties are connected. May mutate.
pub type InitFn = Arc<dyn Fn(&Engine, EntityId) -> Result<()> + Send + Sync>;

#[derive(Clone)]
pub(crate) enum ActionDef {
    Custom(ActionFn),
    /// Generated `set_<name>` action of a settable property.
    Setter(String),
}

/// Shared declaration of a kind of entity.
#[derive(Clone)]
pub struct ClassDef(Arc<ClassInner>);

struct ClassInner {
    name: String,
    properties: IndexMap<String, (PropertyDef, Vec<ConnectionSpec>)>,
    attributes: IndexMap<String, Value>,
    actions: IndexMap<String, ActionDef>,
    reactions: Vec<(ReactionDef, Vec<ConnectionSpec>)>,
    init: Option<InitFn>,
}

impl ClassDef {
    pub fn builder(name: impl Into<String>) -> ClassBuilder {
        ClassBuilder {
            name: name.into(),
            properties: Vec::new(),
            attributes: Vec::new(),
            actions: Vec::new(),
            reactions: Vec::new(),
            init: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Properties in initialization (name) order.
    pub fn properties(&self) -> impl Iterator<Item = &PropertyDef> {
        self.0.properties.values().map(|(p, _)| p)
    }

    pub fn property(&self, name: &str) -> Option<&PropertyDef> {
        self.0.properties.get(name).map(|(p, _)| p)
    }

    pub(crate) fn property_specs(&self, name: &str) -> &[ConnectionSpec] {
        self.0
            .properties
            .get(name)
            .map(|(_, specs)| specs.as_slice())
            .unwrap_or_default()
    }

    pub fn attributes(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.attributes.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Names of all actions, generated setters included.
    pub fn action_names(&self) -> impl Iterator<Item = &str> {
        self.0.actions.keys().map(String::as_str)
    }

    pub(crate) fn action(&self, name: &str) -> Option<&ActionDef> {
        self.0.actions.get(name)
    }

    pub(crate) fn reactions(&self) -> &[(ReactionDef, Vec<ConnectionSpec>)] {
        &self.0.reactions
    }

    pub(crate) fn init(&self) -> Option<&InitFn> {
        self.0.init.as_ref()
    }
}

impl fmt::Debug for ClassDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassDef")
            .field("name", &self.0.name)
            .field("properties", &self.0.properties.keys().collect::<Vec<_>>())
            .field("attributes", &self.0.attributes.keys().collect::<Vec<_>>())
            .field("actions", &self.0.actions.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Builder for [`ClassDef`].
pub struct ClassBuilder {
    name: String,
    properties: Vec<PropertyDef>,
    attributes: Vec<(String, Value)>,
    actions: Vec<(String, ActionFn)>,
    reactions: Vec<ReactionDef>,
    init: Option<InitFn>,
}

impl ClassBuilder {
    pub fn property(mut self, property: PropertyDef) -> Self {
        self.properties.push(property);
        self
    }

    /// A static value, fixed for the lifetime of the entity.
    pub fn attribute(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.push((name.into(), value.into()));
        self
    }

    pub fn action<F>(mut self, name: impl Into<String>, action: F) -> Self
    where
        F: Fn(&Engine, EntityId, &[Value]) -> Result<()> + Send + Sync + 'static,
    {
        self.actions.push((name.into(), Arc::new(action)));
        self
    }

    /// A reaction created for, and owned by, every entity of the class.
    /// Its connection strings resolve from the entity.
    pub fn reaction(mut self, reaction: ReactionDef) -> Self {
        self.reactions.push(reaction);
        self
    }

    pub fn init<F>(mut self, init: F) -> Self
    where
        F: Fn(&Engine, EntityId) -> Result<()> + Send + Sync + 'static,
    {
        self.init = Some(Arc::new(init));
        self
    }

    /// Check the declaration and freeze it.
    pub fn build(self) -> Result<ClassDef> {
        let class = self.name;
        let mut seen = HashSet::new();
        let mut claim = |member: &str| {
            if seen.insert(member.to_string()) {
                Ok(())
            } else {
                Err(EngineError::Config(format!(
                    "duplicate member '{member}' in class {class}"
                )))
            }
        };

        let mut properties = IndexMap::new();
        let mut actions = IndexMap::new();
        for property in self.properties {
            claim(property.name())?;
            if property.kind() == NodeKind::Input {
                property.validate(property.default_value())?;
            } else if property.is_settable() {
                return Err(EngineError::Config(format!(
                    "derived property '{}' cannot be settable",
                    property.name()
                )));
            }
            if property.is_settable() {
                let setter = format!("set_{}", property.name());
                claim(&setter)?;
                actions.insert(setter, ActionDef::Setter(property.name().to_string()));
            }
            let specs = property
                .specs()
                .iter()
                .map(|s| ConnectionSpec::parse(s))
                .collect::<Result<Vec<_>>>()?;
            properties.insert(property.name().to_string(), (property, specs));
        }
        properties.sort_keys();

        let mut attributes = IndexMap::new();
        for (name, value) in self.attributes {
            claim(&name)?;
            attributes.insert(name, value);
        }

        for (name, action) in self.actions {
            claim(&name)?;
            actions.insert(name, ActionDef::Custom(action));
        }

        let reactions = self
            .reactions
            .into_iter()
            .map(|r| {
                let specs = r.parse_specs()?;
                Ok((r, specs))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(ClassDef(Arc::new(ClassInner {
            name: class,
            properties,
            attributes,
            actions,
            reactions,
            init: self.init,
        })))
    }
}

/// Handle to a live entity.
///
/// Handles are reference counted. When the last one is dropped without an
/// explicit [`Entity::dispose`], disposal is queued for the next drain.
#[derive(Clone)]
pub struct Entity {
    inner: Arc<EntityToken>,
}

struct EntityToken {
    id: EntityId,
    name: String,
    engine: WeakEngine,
}

impl Drop for EntityToken {
    fn drop(&mut self) {
        if let Some(engine) = self.engine.upgrade() {
            engine.bury(self.id);
        }
    }
}

impl Entity {
    pub(crate) fn new(id: EntityId, name: String, engine: WeakEngine) -> Self {
        Self {
            inner: Arc::new(EntityToken { id, name, engine }),
        }
    }

    pub fn id(&self) -> EntityId {
        self.inner.id
    }

    /// Display name, class name plus a per-class counter, e.g. `Person3`.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    fn engine(&self) -> Result<Engine> {
        self.inner
            .engine
            .upgrade()
            .ok_or_else(|| EngineError::Disposed(self.inner.name.clone()))
    }

    /// Read a property or attribute.
    pub fn get(&self, name: &str) -> Result<Value> {
        self.engine()?.get(self.id(), name)
    }

    /// Invoke an action.
    pub fn invoke(&self, action: &str, args: &[Value]) -> Result<()> {
        self.engine()?.invoke_action(self.id(), action, args)
    }

    pub fn dispose(&self) -> Result<()> {
        self.engine()?.dispose(self.id())
    }
}

impl From<&Entity> for EntityId {
    fn from(entity: &Entity) -> Self {
        entity.id()
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entity")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::validators;

    #[test]
    fn properties_are_sorted_and_setters_generated() {
        let class = ClassDef::builder("Person")
            .property(PropertyDef::input("last_name", "").settable())
            .property(PropertyDef::input("first_name", "").settable())
            .property(PropertyDef::lazy("full_name", ["first_name", "last_name"], |_, _| {
                Ok(Value::Null)
            }))
            .build()
            .unwrap();

        let names: Vec<_> = class.properties().map(|p| p.name()).collect();
        assert_eq!(names, ["first_name", "full_name", "last_name"]);
        let mut actions: Vec<_> = class.action_names().collect();
        actions.sort_unstable();
        assert_eq!(actions, ["set_first_name", "set_last_name"]);
        assert_eq!(class.property_specs("full_name").len(), 2);
    }

    #[test]
    fn duplicate_members_are_rejected() {
        let err = ClassDef::builder("A")
            .property(PropertyDef::input("x", 0))
            .attribute("x", 1)
            .build()
            .unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));

        let err = ClassDef::builder("A")
            .property(PropertyDef::input("x", 0).settable())
            .action("set_x", |_, _, _| Ok(()))
            .build()
            .unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn defaults_must_validate() {
        let err = ClassDef::builder("A")
            .property(PropertyDef::input("n", "many").validator(validators::int()))
            .build()
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn bad_connection_strings_are_rejected() {
        let err = ClassDef::builder("A")
            .property(PropertyDef::eager("y", ["a*.b*.c"], |_, _| Ok(Value::Null)))
            .build()
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidConnection { .. }));
    }
}
