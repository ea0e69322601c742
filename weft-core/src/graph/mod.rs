//! Dependency Graph
//!
//! This module implements the dependency graph that tracks relationships
//! between properties, derived values and reactions.
//!
//! # Overview
//!
//! - Nodes represent input properties, derived values (eager or lazy) or
//!   reactions, each holding a [`Container`]
//! - Edges are stored as id sets on both ends, so cyclic graphs need no
//!   reference counting
//!
//! When an input changes, the arena walks downstream once per round, marks
//! derived nodes stale, and hands the scheduler an evaluation order.
//!
//! # Design Decisions
//!
//! 1. A centralized arena rather than linked nodes: edges are plain ids, so
//!    disposal is a matter of removing entries.
//!
//! 2. Two kinds of downstream edges. `downstream` holds readers of the value;
//!    `reconnect_downstream` holds nodes whose path goes *through* the value
//!    and must be re-resolved when it changes.

mod arena;
mod container;
mod node;

pub use arena::Graph;
pub use container::{Container, Mutable, Readable, Status};
pub use node::{Connection, Link, LinkRole, Node, NodeId, NodeKind, UpdateFn};
