//! Controller error types.

use thiserror::Error;

use shoal_state::{DefinitionError, StateError, ValidationError};

/// Errors surfaced to fleet callers.
///
/// Transient faults inside reconciliation (launch, probe, registration,
/// metric) never show up here; they become deployment events.
#[derive(Debug, Error)]
pub enum FleetError {
    #[error("service not found: {0}")]
    ServiceNotFound(String),

    #[error("service already exists: {0}")]
    ServiceExists(String),

    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("task definition error: {0}")]
    Definition(#[from] DefinitionError),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

pub type FleetResult<T> = Result<T, FleetError>;
