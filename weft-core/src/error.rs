//! Error types for the Weft engine.
//!
//! The engine distinguishes errors that a caller provoked directly (a bad
//! write, a read of something unresolved, misuse of the mutation or drain
//! contract) from errors raised by user code while a batch drains. The former
//! propagate to the caller; the latter are caught by the scheduler, logged and
//! kept in the engine's error history as [`ComputationError`]s.

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Error type returned by user callbacks (update functions, reactions).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A value was rejected by a property's validator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid value for property '{property}': {message}")]
pub struct ValidationError {
    pub property: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(property: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            message: message.into(),
        }
    }
}

/// A node was read while its connection could not be resolved.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{node} is not connected: {reason}")]
pub struct NotConnectedError {
    pub node: String,
    pub reason: String,
}

/// A property was mutated outside of an action or entity initialization.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot mutate '{property}' of {entity}: {reason}")]
pub struct IllegalMutationError {
    pub entity: String,
    pub property: String,
    pub reason: String,
}

/// The scheduler was re-entered in a way that would corrupt its state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("illegal re-entrant call to {operation}")]
pub struct IllegalReentrancyError {
    pub operation: String,
}

/// An update function or reaction body failed.
///
/// Cloneable so the same error can be stored on the failing node, returned to
/// every reader and kept in the engine's error history.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("error in {node}: {message}")]
pub struct ComputationError {
    pub node: String,
    pub message: String,
}

impl ComputationError {
    pub fn new(node: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            message: message.into(),
        }
    }
}

/// The main error type for engine operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    NotConnected(#[from] NotConnectedError),

    #[error(transparent)]
    IllegalMutation(#[from] IllegalMutationError),

    #[error(transparent)]
    IllegalReentrancy(#[from] IllegalReentrancyError),

    #[error(transparent)]
    Computation(#[from] ComputationError),

    /// No entity with this id was ever created in this engine.
    #[error("unknown entity {0}")]
    UnknownEntity(String),

    /// The entity exists but has no property, attribute or action of that name.
    #[error("{entity} has no member '{member}'")]
    UnknownMember { entity: String, member: String },

    /// The entity, node or reaction has been disposed.
    #[error("{0} has been disposed")]
    Disposed(String),

    /// A connection string could not be parsed.
    #[error("invalid connection '{spec}': {reason}")]
    InvalidConnection { spec: String, reason: String },

    /// Propagation did not settle within the configured number of rounds.
    #[error("propagation did not settle after {limit} iterations")]
    IterationLimit { limit: usize },

    /// Bad configuration input.
    #[error("configuration error: {0}")]
    Config(String),

    /// A snapshot could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),
}

impl EngineError {
    pub(crate) fn unknown_member(entity: impl Into<String>, member: impl Into<String>) -> Self {
        Self::UnknownMember {
            entity: entity.into(),
            member: member.into(),
        }
    }

    pub(crate) fn invalid_connection(spec: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConnection {
            spec: spec.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn reentrancy(operation: impl Into<String>) -> Self {
        IllegalReentrancyError {
            operation: operation.into(),
        }
        .into()
    }

    /// Whether this error was raised by user code rather than by the engine.
    pub fn is_computation(&self) -> bool {
        matches!(self, Self::Computation(_))
    }
}
