//! Weft Core
//!
//! This crate provides the reactive core of the Weft UI toolkit. It
//! implements:
//!
//! - Input and derived properties with validation
//! - Connections by path strings, re-resolved as the object graph changes
//! - A batching scheduler that runs each reaction once per batch
//! - Deterministic disposal of entities and their subscriptions
//!
//! Rendering, transport and code generation live elsewhere and talk to the
//! engine through its public contract: read, invoke actions, attach
//! reactions, dispose.
//!
//! # Architecture
//!
//! - `graph`: node arena, value containers, staleness marking and ordering
//! - `connect`: connection string parsing, path resolution and the
//!   subscription diff used when paths re-resolve
//! - `reactive`: the engine, entities, actions, reactions and the drain loop
//!
//! # Example
//!
//! ```rust
//! use weft_core::{ClassDef, Engine, PropertyDef, ReactionDef, Value};
//!
//! let engine = Engine::default();
//! let counter = ClassDef::builder("Counter")
//!     .property(PropertyDef::input("count", 0).settable())
//!     .property(PropertyDef::eager("doubled", ["count"], |_, v| {
//!         Ok(Value::Int(v[0].as_i64().unwrap_or_default() * 2))
//!     }))
//!     .build()?;
//!
//! let c = engine.create(&counter, &[])?;
//! engine.attach_reaction(
//!     Some(c.id()),
//!     ReactionDef::new("print", ["doubled"], |_, _, events| {
//!         for event in events {
//!             println!("doubled: {}", event.new_value);
//!         }
//!         Ok(())
//!     }),
//! )?;
//!
//! c.invoke("set_count", &[Value::Int(5)])?;
//! assert_eq!(c.get("doubled")?, Value::Int(10));
//! engine.drain_now()?; // prints "doubled: 10"
//! # Ok::<(), weft_core::EngineError>(())
//! ```

pub mod config;
pub mod connect;
pub mod error;
pub mod graph;
pub mod logging;
pub mod reactive;
pub mod value;

pub use config::EngineConfig;
pub use error::{
    BoxError, ComputationError, EngineError, IllegalMutationError, IllegalReentrancyError,
    NotConnectedError, Result, ValidationError,
};
pub use graph::{NodeId, Status};
pub use reactive::{
    validators, ClassDef, Engine, Entity, EntitySnapshot, Event, Host, ManualHost, Mutation,
    MutationKind, PropertyDef, ReactionDef, ReactionHandle, ReactionMode, Stats, TokioHost,
};
pub use value::{EntityId, Value};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
