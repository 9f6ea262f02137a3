//! Error types for the rule engine

use cellrules_cell_model::ModelError;
use cellrules_core::DefinitionError;
use thiserror::Error;

/// Rule engine errors
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid rule {name}: {reason}")]
    InvalidRule { name: String, reason: String },

    #[error("invalid device definition: {0}")]
    InvalidDevice(#[from] DefinitionError),

    #[error("device {0} is registered as an external device")]
    DeviceConflict(String),

    #[error(transparent)]
    Model(ModelError),

    #[error("rule not found: {0}")]
    RuleNotFound(String),

    #[error("action of rule {rule} failed: {source}")]
    Action {
        rule: String,
        #[source]
        source: ActionError,
    },

    #[error("script {script} failed: {message}")]
    Script { script: String, message: String },

    #[error("engine is stopped")]
    NotRunning,

    #[error("engine is busy with another call made before start")]
    Busy,

    #[error("engine executor is gone")]
    ExecutorGone,
}

impl EngineError {
    pub(crate) fn invalid_rule(name: &str, reason: impl Into<String>) -> Self {
        Self::InvalidRule {
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    /// Error raised by a script body
    pub fn script(script: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Script {
            script: script.into(),
            message: message.into(),
        }
    }
}

impl From<ModelError> for EngineError {
    fn from(err: ModelError) -> Self {
        match err {
            ModelError::Definition(e) => EngineError::InvalidDevice(e),
            ModelError::DeviceConflict(name) => EngineError::DeviceConflict(name),
            other => EngineError::Model(other),
        }
    }
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Failure reported by a rule action
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ActionError {
    message: String,
}

impl ActionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for ActionError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for ActionError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}
