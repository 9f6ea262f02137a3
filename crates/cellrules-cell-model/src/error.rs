//! Error types for the cell model

use cellrules_core::DefinitionError;
use thiserror::Error;

/// Errors raised while changing local devices
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ModelError {
    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error("device {0} is registered as an external device")]
    DeviceConflict(String),

    #[error("device {0} not found")]
    DeviceNotFound(String),

    #[error("device {0} is not a local device")]
    NotLocal(String),

    #[error("invalid cell name {0}")]
    InvalidCellName(String),

    #[error("cell {0} not found")]
    CellNotFound(String),

    #[error("invalid {field} for {cell}: {reason}")]
    InvalidMeta {
        cell: String,
        field: &'static str,
        reason: String,
    },
}

/// Result type for model operations
pub type ModelResult<T> = Result<T, ModelError>;
