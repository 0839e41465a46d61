use thiserror::Error;

use crate::collaborators::CollaboratorError;
use crate::state_machine::{GuardError, StateMachineError};
use crate::store::StoreError;

/// Typed failure raised by a pipeline step
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StepError {
    #[error("Pipeline cancelled")]
    Cancelled,

    #[error("Business rule violation: {0}")]
    Validation(String),

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    StateMachine(#[from] StateMachineError),

    #[error("Message {ebms_message_id} dead-lettered: {reason}")]
    DeadLettered {
        ebms_message_id: String,
        reason: String,
    },

    #[error("Messaging context is missing {0}")]
    MissingContext(&'static str),
}

impl StepError {
    /// Infrastructure hiccup: charged to the retry budget instead of failing outright
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Store(e) => e.is_transient(),
            _ => false,
        }
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation(reason.into())
    }
}

impl From<GuardError> for StepError {
    fn from(err: GuardError) -> Self {
        match err {
            GuardError::BusinessRuleViolation { rule } => Self::Validation(rule),
            other => Self::StateMachine(other.into()),
        }
    }
}

impl From<serde_json::Error> for StepError {
    fn from(err: serde_json::Error) -> Self {
        Self::Store(StoreError::from(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(StepError::Store(StoreError::Transient("timeout".into())).is_transient());
        assert!(!StepError::Store(StoreError::Database("boom".into())).is_transient());
        assert!(!StepError::Cancelled.is_transient());
        assert!(StepError::Cancelled.is_cancellation());
    }

    #[test]
    fn test_business_rule_becomes_validation() {
        let err: StepError = crate::state_machine::errors::business_rule_violation(
            "mpc cannot be overridden",
        )
        .into();
        assert_eq!(err, StepError::Validation("mpc cannot be overridden".into()));
    }
}
