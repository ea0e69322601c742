//! Actions and Mutations
//!
//! Input properties only change through [`Engine::mutate`], and only while
//! an action (or an entity initializer) is running on the calling thread.
//! A mutation is applied to the container right away; the change is recorded
//! in the batch and its event is queued for the reactions reading it.
//! Propagation to derived nodes happens when the outermost action returns.

use serde::{Deserialize, Serialize};

use super::component::ActionDef;
use super::context::{FrameKind, MutationContext};
use super::reaction::Event;
use super::runtime::Engine;
use crate::connect::Member;
use crate::error::{EngineError, IllegalMutationError, Result, ValidationError};
use crate::graph::{Mutable, NodeKind, Readable};
use crate::logging::targets;
use crate::value::{EntityId, Value};

/// Kind of change carried by an [`Event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
    Set,
    Insert,
    Remove,
    Replace,
}

/// A change to an input property.
///
/// The in-place variants operate on list values. Indices past the end are
/// clamped to the length of the list.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Set(Value),
    Insert { index: usize, items: Vec<Value> },
    Remove { index: usize, count: usize },
    Replace { index: usize, items: Vec<Value> },
}

/// Result of applying a mutation to the current value.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Applied {
    pub(crate) value: Value,
    pub(crate) index: Option<usize>,
    pub(crate) objects: Value,
}

impl Mutation {
    pub fn kind(&self) -> MutationKind {
        match self {
            Self::Set(_) => MutationKind::Set,
            Self::Insert { .. } => MutationKind::Insert,
            Self::Remove { .. } => MutationKind::Remove,
            Self::Replace { .. } => MutationKind::Replace,
        }
    }

    pub(crate) fn apply(&self, current: &Value) -> std::result::Result<Applied, String> {
        let (list, index, objects) = match self {
            Self::Set(value) => {
                return Ok(Applied {
                    value: value.clone(),
                    index: None,
                    objects: Value::Null,
                })
            }
            Self::Insert { index, items } => {
                let mut list = self.list_of(current)?;
                let index = (*index).min(list.len());
                list.splice(index..index, items.iter().cloned());
                (list, index, Value::List(items.clone()))
            }
            Self::Remove { index, count } => {
                let mut list = self.list_of(current)?;
                let index = (*index).min(list.len());
                let end = index.saturating_add(*count).min(list.len());
                let removed = list.drain(index..end).count();
                (list, index, Value::Int(removed as i64))
            }
            Self::Replace { index, items } => {
                let mut list = self.list_of(current)?;
                let index = (*index).min(list.len());
                let end = (index + items.len()).min(list.len());
                list.splice(index..end, items.iter().cloned());
                (list, index, Value::List(items.clone()))
            }
        };
        Ok(Applied {
            value: Value::List(list),
            index: Some(index),
            objects,
        })
    }

    fn list_of(&self, current: &Value) -> std::result::Result<Vec<Value>, String> {
        current.as_list().map(<[Value]>::to_vec).ok_or_else(|| {
            format!("cannot apply {:?} to a {}", self.kind(), current.type_name())
        })
    }
}

impl From<Value> for Mutation {
    fn from(value: Value) -> Self {
        Self::Set(value)
    }
}

/// An active action frame. Leaving the outermost frame of an engine commits
/// its batch.
pub(crate) struct ActionScope<'a> {
    engine: &'a Engine,
    context: Option<MutationContext>,
}

impl<'a> ActionScope<'a> {
    pub(crate) fn enter(engine: &'a Engine, entity: Option<EntityId>, kind: FrameKind) -> Self {
        Self {
            engine,
            context: Some(MutationContext::enter(engine.id(), entity, kind)),
        }
    }

    pub(crate) fn close(mut self) -> Result<()> {
        self.finish()
    }

    fn finish(&mut self) -> Result<()> {
        let Some(context) = self.context.take() else {
            return Ok(());
        };
        drop(context);
        if MutationContext::is_active(self.engine.id()) {
            return Ok(());
        }
        let result = self.engine.commit();
        self.engine.poke();
        result
    }
}

impl Drop for ActionScope<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.context.take();
            return;
        }
        if let Err(error) = self.finish() {
            tracing::error!(target: targets::SCHEDULER, %error, "commit after action failed");
        }
    }
}

impl Engine {
    /// Change an input property. Only allowed while an action of this engine
    /// runs on the current thread.
    ///
    /// The new value is validated before it is stored; a rejected value
    /// leaves the property untouched. Storing an equal value is not a change.
    pub fn mutate(
        &self,
        entity: impl Into<EntityId>,
        name: &str,
        mutation: impl Into<Mutation>,
    ) -> Result<()> {
        let entity = entity.into();
        let mutation = mutation.into();

        let mut st = self.lock();
        let (id, entity_name) = {
            let record = st.entity(entity)?;
            let illegal = |reason: &str| -> EngineError {
                IllegalMutationError {
                    entity: record.name.clone(),
                    property: name.to_string(),
                    reason: reason.to_string(),
                }
                .into()
            };
            if !MutationContext::is_active(self.id()) {
                return Err(illegal("mutations are only allowed inside actions"));
            }
            match record.members.get(name) {
                Some(Member::Node(id)) => (*id, record.name.clone()),
                Some(Member::Attribute(_)) => return Err(illegal("attributes are immutable")),
                None => return Err(EngineError::unknown_member(&record.name, name)),
            }
        };

        let stamp = st.tick();
        let node = st.node_mut(id)?;
        if node.kind() != NodeKind::Input {
            return Err(IllegalMutationError {
                entity: entity_name,
                property: name.to_string(),
                reason: "derived properties are computed, not set".to_string(),
            }
            .into());
        }

        let applied = mutation
            .apply(node.container.value())
            .map_err(|message| ValidationError::new(node.name(), message))?;
        let value = match &node.validator {
            Some(validate) => validate(&applied.value)
                .map_err(|message| ValidationError::new(node.name(), message))?,
            None => applied.value,
        };

        if node.container.store(value, stamp) {
            if let Some((by, frame)) = MutationContext::current(self.id()) {
                tracing::trace!(target: targets::GRAPH, node = %node.fullname(), ?by, ?frame, "input changed");
            }
            let event = Event::from_node(node, mutation.kind(), applied.index, applied.objects);
            st.batch.changed.insert(id);
            st.deliver(id, event);
        }
        Ok(())
    }

    /// Run an action of an entity.
    ///
    /// The batch is committed when the outermost action returns, also if the
    /// body failed; mutations made before the failure stay.
    pub fn invoke_action(
        &self,
        entity: impl Into<EntityId>,
        name: &str,
        args: &[Value],
    ) -> Result<()> {
        let entity = entity.into();
        let action = {
            let st = self.lock();
            let record = st.entity(entity)?;
            record
                .class
                .action(name)
                .cloned()
                .ok_or_else(|| EngineError::unknown_member(&record.name, name))?
        };

        let scope = ActionScope::enter(self, Some(entity), FrameKind::Action);
        let result = match action {
            ActionDef::Custom(body) => body(self, entity, args),
            ActionDef::Setter(property) => match args {
                [value] => self.mutate(entity, &property, value.clone()),
                _ => Err(ValidationError::new(
                    property,
                    format!("setter takes exactly one argument, got {}", args.len()),
                )
                .into()),
            },
        };
        let committed = scope.close();
        result.and(committed)
    }

    /// Run `f` as an anonymous action of this engine.
    ///
    /// Lets host code group mutations of several entities into one commit.
    pub fn batch<T>(&self, f: impl FnOnce(&Engine) -> Result<T>) -> Result<T> {
        let scope = ActionScope::enter(self, None, FrameKind::Action);
        let result = f(self);
        let committed = scope.close();
        let value = result?;
        committed.map(|()| value)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::reactive::{validators, ClassDef, PropertyDef, ReactionDef};

    fn ints(values: &[i64]) -> Value {
        Value::List(values.iter().copied().map(Value::Int).collect())
    }

    #[test]
    fn list_mutations_clamp_indices() {
        let current = ints(&[1, 2, 3]);

        let applied = Mutation::Insert { index: 9, items: vec![Value::Int(4)] }
            .apply(&current)
            .unwrap();
        assert_eq!(applied.value, ints(&[1, 2, 3, 4]));
        assert_eq!(applied.index, Some(3));

        let applied = Mutation::Remove { index: 1, count: 5 }.apply(&current).unwrap();
        assert_eq!(applied.value, ints(&[1]));
        assert_eq!(applied.objects, Value::Int(2));

        let applied = Mutation::Replace { index: 2, items: vec![Value::Int(7), Value::Int(8)] }
            .apply(&current)
            .unwrap();
        assert_eq!(applied.value, ints(&[1, 2, 7, 8]));
    }

    #[test]
    fn list_mutations_need_a_list() {
        let err = Mutation::Remove { index: 0, count: 1 }
            .apply(&Value::Int(3))
            .unwrap_err();
        assert!(err.contains("int"));
    }

    fn todo_class() -> ClassDef {
        ClassDef::builder("Todo")
            .property(PropertyDef::input("items", Value::List(Vec::new())).validator(validators::list()))
            .property(PropertyDef::input("done", false).settable().validator(validators::boolean()))
            .property(PropertyDef::lazy("count", ["items"], |_, v| {
                Ok(Value::Int(v[0].as_list().map_or(0, |l| l.len() as i64)))
            }))
            .attribute("kind", "todo")
            .action("add", |engine, this, args| {
                engine.mutate(this, "items", Mutation::Insert { index: usize::MAX, items: args.to_vec() })
            })
            .build()
            .unwrap()
    }

    #[test]
    fn mutations_outside_actions_are_refused() {
        let engine = Engine::default();
        let todo = engine.create(&todo_class(), &[]).unwrap();

        let err = engine.mutate(&todo, "done", Value::Bool(true)).unwrap_err();
        assert!(matches!(err, EngineError::IllegalMutation(_)));
        assert_eq!(todo.get("done").unwrap(), Value::Bool(false));
    }

    #[test]
    fn only_inputs_can_be_mutated() {
        let engine = Engine::default();
        let todo = engine.create(&todo_class(), &[]).unwrap();

        let result = engine.batch(|engine| engine.mutate(&todo, "count", Value::Int(3)));
        assert!(matches!(result, Err(EngineError::IllegalMutation(_))));
        let result = engine.batch(|engine| engine.mutate(&todo, "kind", Value::from("x")));
        assert!(matches!(result, Err(EngineError::IllegalMutation(_))));
        let result = engine.batch(|engine| engine.mutate(&todo, "nope", Value::Null));
        assert!(matches!(result, Err(EngineError::UnknownMember { .. })));
    }

    #[test]
    fn setters_validate_their_argument() {
        let engine = Engine::default();
        let todo = engine.create(&todo_class(), &[]).unwrap();

        todo.invoke("set_done", &[Value::Int(1)]).unwrap();
        assert_eq!(todo.get("done").unwrap(), Value::Bool(true));

        let err = todo.invoke("set_done", &[]).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn insert_events_carry_the_inserted_items() {
        let engine = Engine::default();
        let todo = engine.create(&todo_class(), &[]).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        engine
            .attach_reaction(
                Some(todo.id()),
                ReactionDef::new("watch", ["items"], move |_, _, events| {
                    sink.lock().unwrap().extend(events.iter().cloned());
                    Ok(())
                }),
            )
            .unwrap();
        engine.drain_now().unwrap();
        seen.lock().unwrap().clear();

        todo.invoke("add", &[Value::from("milk")]).unwrap();
        assert_eq!(todo.get("count").unwrap(), Value::Int(1));
        engine.drain_now().unwrap();

        let events = seen.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].mutation, MutationKind::Insert);
        assert_eq!(events[0].index, Some(0));
        assert_eq!(events[0].objects, Value::List(vec![Value::from("milk")]));
        assert_eq!(events[0].old_value, Value::List(Vec::new()));
    }

    #[test]
    fn lazy_reads_inside_an_action_see_the_committed_state() {
        let engine = Engine::default();
        let todo = engine.create(&todo_class(), &[]).unwrap();
        assert_eq!(todo.get("count").unwrap(), Value::Int(0));

        let inside = engine
            .batch(|engine| {
                engine.mutate(&todo, "items", ints(&[1, 2]))?;
                engine.get(&todo, "count")
            })
            .unwrap();
        assert_eq!(inside, Value::Int(0));
        assert_eq!(todo.get("count").unwrap(), Value::Int(2));
    }

    #[test]
    fn eager_reads_inside_an_action_see_the_new_inputs() {
        let engine = Engine::default();
        let int = |v: &Value| v.as_i64().unwrap_or_default();
        let class = ClassDef::builder("Counter")
            .property(PropertyDef::input("count", 1).settable())
            .property(PropertyDef::eager("doubled", ["count"], move |_, v| Ok(Value::Int(int(&v[0]) * 2))))
            .property(PropertyDef::eager("quadrupled", ["doubled"], move |_, v| {
                Ok(Value::Int(int(&v[0]) * 2))
            }))
            .property(PropertyDef::lazy("tripled", ["count"], move |_, v| Ok(Value::Int(int(&v[0]) * 3))))
            .build()
            .unwrap();
        let c = engine.create(&class, &[]).unwrap();
        assert_eq!(c.get("tripled").unwrap(), Value::Int(3));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        engine
            .attach_reaction(
                Some(c.id()),
                ReactionDef::new("watch", ["doubled"], move |_, _, events| {
                    sink.lock().unwrap().extend(events.iter().map(|e| e.new_value.clone()));
                    Ok(())
                }),
            )
            .unwrap();

        let inside = engine
            .batch(|engine| {
                engine.mutate(&c, "count", Value::Int(5))?;
                Ok((
                    engine.get(&c, "doubled")?,
                    engine.get(&c, "quadrupled")?,
                    engine.get(&c, "tripled")?,
                ))
            })
            .unwrap();
        assert_eq!(inside, (Value::Int(10), Value::Int(20), Value::Int(3)));
        assert_eq!(c.get("quadrupled").unwrap(), Value::Int(20));
        assert_eq!(c.get("tripled").unwrap(), Value::Int(15));

        // Reading early does not swallow or duplicate the change event.
        engine.drain_now().unwrap();
        assert_eq!(*seen.lock().unwrap(), [Value::Int(10)]);
    }
}
