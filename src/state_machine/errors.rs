use thiserror::Error;

/// Error types for Operation transitions
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StateMachineError {
    #[error("Invalid operation transition from {from} on {event}")]
    InvalidTransition { from: String, event: String },

    #[error("Precondition violated for {entity} {id}: expected {expected}, found {actual}")]
    PreconditionViolated {
        entity: String,
        id: i64,
        expected: String,
        actual: String,
    },

    #[error("Guard condition failed: {reason}")]
    GuardFailed { reason: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Specific error type for guard condition failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GuardError {
    #[error("Precondition violated for {entity} {id}: expected {expected}, found {actual}")]
    PreconditionViolated {
        entity: String,
        id: i64,
        expected: String,
        actual: String,
    },

    #[error("Business rule violation: {rule}")]
    BusinessRuleViolation { rule: String },
}

impl From<GuardError> for StateMachineError {
    fn from(err: GuardError) -> Self {
        match err {
            GuardError::PreconditionViolated {
                entity,
                id,
                expected,
                actual,
            } => Self::PreconditionViolated {
                entity,
                id,
                expected,
                actual,
            },
            other => Self::GuardFailed {
                reason: other.to_string(),
            },
        }
    }
}

/// Result type alias for state machine operations
pub type StateMachineResult<T> = Result<T, StateMachineError>;
pub type GuardResult<T> = Result<T, GuardError>;

/// Helper function to create business rule violations
pub fn business_rule_violation(rule: impl Into<String>) -> GuardError {
    GuardError::BusinessRuleViolation { rule: rule.into() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_chain() {
        let guard_err = business_rule_violation("submit may not override the mpc");
        let sm_err: StateMachineError = guard_err.into();

        match sm_err {
            StateMachineError::GuardFailed { reason } => {
                assert!(reason.contains("Business rule violation"));
            }
            _ => panic!("Expected GuardFailed error"),
        }
    }

    #[test]
    fn test_precondition_keeps_its_shape() {
        let guard_err = GuardError::PreconditionViolated {
            entity: "out_message".to_string(),
            id: 3,
            expected: "to_be_sent".to_string(),
            actual: "sent".to_string(),
        };
        let sm_err: StateMachineError = guard_err.into();
        assert!(matches!(
            sm_err,
            StateMachineError::PreconditionViolated { id: 3, .. }
        ));
    }
}
