//! Reactive Engine
//!
//! This module ties the graph and the connection resolver together into an
//! engine of entities, actions and reactions.
//!
//! # Concepts
//!
//! ## Entities
//!
//! An entity is an instance of a [`ClassDef`]: a named bag of properties,
//! static attributes, actions and reactions. Properties are either inputs,
//! changed only by actions, or derived from other properties through
//! connection strings such as `"children*.name"`.
//!
//! ## Actions
//!
//! Actions are the only way to change an input. Mutations inside an action
//! are applied immediately and propagated when the outermost action returns.
//!
//! ## Reactions
//!
//! Reactions are leaves of the graph. They are not called per change;
//! instead the engine collects the [`Event`]s of a batch and invokes every
//! affected reaction once, during a drain.
//!
//! # Implementation Notes
//!
//! The engine keeps all state behind a single lock and never holds it while
//! user code runs. Which actions are running is tracked per thread, so the
//! engine can refuse mutations outside actions and drains inside them.

mod action;
mod component;
mod context;
mod host;
mod introspect;
mod lifecycle;
mod property;
mod reaction;
mod runtime;
mod scheduler;

pub use action::{Mutation, MutationKind};
pub use component::{ActionFn, ClassBuilder, ClassDef, Entity, InitFn};
pub use host::{Host, ManualHost, TokioHost};
pub use introspect::{EntitySnapshot, PropertySnapshot, Stats};
pub use property::{validators, PropertyDef, Validator};
pub use reaction::{
    Event, ReactionDef, ReactionFn, ReactionHandle, ReactionInfo, ReactionMode, Reactor,
};
pub use runtime::{Engine, WeakEngine};
