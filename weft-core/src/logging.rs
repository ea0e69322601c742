//! Logging targets.
//!
//! Weft reports through the `tracing` crate and never installs a subscriber
//! itself. Hosts that want to see engine diagnostics install one and filter
//! by the targets below, e.g. `RUST_LOG=weft_core::scheduler=trace`.
//!
//! | target                  | what is logged                                   |
//! |-------------------------|--------------------------------------------------|
//! | `weft_core::scheduler`  | drains (trace), caught reaction errors (error)   |
//! | `weft_core::graph`      | recompute failures of eager nodes (error)        |
//! | `weft_core::connect`    | unresolved connections (debug)                   |
//! | `weft_core::lifecycle`  | entity creation and disposal (debug)             |
//! | `weft_core`             | engine construction (debug)                      |

/// Target names for log filtering.
pub mod targets {
    /// Core crate target.
    pub const CORE: &str = "weft_core";
    /// Batch loop and reaction invocation.
    pub const SCHEDULER: &str = "weft_core::scheduler";
    /// Node evaluation and staleness propagation.
    pub const GRAPH: &str = "weft_core::graph";
    /// Path resolution and reconnection.
    pub const CONNECT: &str = "weft_core::connect";
    /// Entity creation and disposal.
    pub const LIFECYCLE: &str = "weft_core::lifecycle";
}
