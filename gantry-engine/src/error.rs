// Engine Errors
// Error taxonomy shared by the loader, resolver and execution layers

use std::io;
use thiserror::Error;

/// Result alias used throughout the engine
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors surfaced by the engine.
///
/// Only `Config`, `Yaml` and `Io` escape before a run is admitted. The other
/// variants are recorded on the job or step they belong to and never abort a
/// whole run.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed or missing workflow fields
    #[error("configuration error: {0}")]
    Config(String),

    /// An action references itself along the current resolution path
    #[error("cyclic action reference: {}", .chain.join(" -> "))]
    CyclicAction { chain: Vec<String> },

    /// A referenced action could not be located
    #[error("action not found: {0}")]
    ActionNotFound(String),

    /// A step exited non-zero or its action reported a failure
    #[error("step '{step}' failed: {reason}")]
    StepFailure { step: String, reason: String },

    /// Expression could not be parsed or evaluated
    #[error("expression error: {0}")]
    Expression(String),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl EngineError {
    pub fn config(message: impl Into<String>) -> Self {
        EngineError::Config(message.into())
    }

    /// Whether this error must stop the run before it is admitted
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::Config(_) | EngineError::Yaml(_) | EngineError::Io(_)
        )
    }
}
