//! Error types for the Shoal state store.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),
}

/// Malformed definition or policy input, rejected before it reaches
/// reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{field} must not be empty")]
    Empty { field: &'static str },

    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("probe timeout ({timeout_ms}ms) must be shorter than the interval ({interval_ms}ms)")]
    TimeoutNotBelowInterval { timeout_ms: u64, interval_ms: u64 },

    #[error("{field} is {value}, expected {expected}")]
    OutOfRange {
        field: &'static str,
        value: u64,
        expected: &'static str,
    },

    #[error("scaling bounds are inverted: min {min} > max {max}")]
    InvertedBounds { min: u32, max: u32 },

    #[error("invalid duration {0:?}")]
    Duration(String),

    #[error("invalid service name {0:?}: use lowercase letters, digits and '-'")]
    ServiceName(String),
}

/// Errors returned by the task definition store.
#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("invalid task definition: {0}")]
    Validation(#[from] ValidationError),

    #[error("task definition version {0} not found")]
    NotFound(u64),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}
