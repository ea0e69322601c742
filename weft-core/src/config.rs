//! Engine configuration.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Tunables of an [`Engine`](crate::Engine).
///
/// Deserializes from a partial JSON object; missing fields take their
/// defaults.
///
/// ```
/// use weft_core::EngineConfig;
///
/// let config = EngineConfig::from_json(r#"{ "max_iterations": 10 }"#).unwrap();
/// assert_eq!(config.max_iterations, 10);
/// assert!(config.capture_initial_events);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Bound on propagation rounds per commit, and on how often a single
    /// reaction may run within one drain.
    pub max_iterations: usize,
    /// How many caught errors the engine keeps for inspection.
    pub error_history: usize,
    /// Raise instead of recording an unresolved status when connecting nodes
    /// at entity construction or reaction attach time.
    pub raise_on_unresolved: bool,
    /// Deliver an initial "set" event for every input property of a freshly
    /// created entity at the next drain.
    pub capture_initial_events: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            error_history: 32,
            raise_on_unresolved: false,
            capture_initial_events: true,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| EngineError::Config(e.to_string()))
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_error_history(mut self, error_history: usize) -> Self {
        self.error_history = error_history;
        self
    }

    pub fn with_raise_on_unresolved(mut self, raise: bool) -> Self {
        self.raise_on_unresolved = raise;
        self
    }

    pub fn with_capture_initial_events(mut self, capture: bool) -> Self {
        self.capture_initial_events = capture;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(EngineError::Config(
                "max_iterations must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
