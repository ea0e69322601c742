//! Connections
//!
//! Parsing connection strings, resolving them against the entity graph and
//! keeping subscriptions stable when they re-resolve.

mod optimize;
mod resolve;
mod spec;

pub use optimize::{plan, Plan};
pub use resolve::{resolve, Member, PathContext, Resolution, Scope};
pub use spec::{ConnectionSpec, Segment};
