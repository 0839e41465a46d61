//! Error types for the relay.
//!

use thiserror::Error;

use crate::collaborators::CollaboratorError;
use crate::config::ConfigurationError;
use crate::pipeline::StepError;
use crate::state_machine::errors::StateMachineError;
use crate::store::StoreError;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RelayError {
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("State transition error: {0}")]
    StateTransitionError(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
    #[error("Collaborator error: {0}")]
    CollaboratorError(String),
    #[error("Pipeline error: {0}")]
    PipelineError(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for RelayError {
    fn from(error: serde_json::Error) -> Self {
        RelayError::ValidationError(format!("JSON serialization error: {error}"))
    }
}

impl From<sqlx::Error> for RelayError {
    fn from(err: sqlx::Error) -> Self {
        RelayError::DatabaseError(err.to_string())
    }
}

impl From<StoreError> for RelayError {
    fn from(err: StoreError) -> Self {
        RelayError::DatabaseError(err.to_string())
    }
}

impl From<StateMachineError> for RelayError {
    fn from(err: StateMachineError) -> Self {
        RelayError::StateTransitionError(err.to_string())
    }
}

impl From<CollaboratorError> for RelayError {
    fn from(err: CollaboratorError) -> Self {
        RelayError::CollaboratorError(err.to_string())
    }
}

impl From<StepError> for RelayError {
    fn from(err: StepError) -> Self {
        RelayError::PipelineError(err.to_string())
    }
}

impl From<ConfigurationError> for RelayError {
    fn from(err: ConfigurationError) -> Self {
        RelayError::ConfigurationError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RelayError::ValidationError("mpc cannot be overridden".to_string());
        assert_eq!(err.to_string(), "Validation error: mpc cannot be overridden");
    }

    #[test]
    fn test_store_error_conversion() {
        let err: RelayError = StoreError::NotFound {
            table: "out_messages",
            id: 7,
        }
        .into();
        assert!(matches!(err, RelayError::DatabaseError(msg) if msg.contains("out_messages")));
    }
}
