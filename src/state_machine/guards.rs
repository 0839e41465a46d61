use super::errors::{GuardError, GuardResult};
use super::states::{Operation, Stage};
use crate::models::HasOperation;

/// Trait for implementing pre-condition checks before a stage acts on an entity
pub trait StateGuard<T> {
    /// Check if the guard condition is satisfied
    fn check(&self, entity: &T) -> GuardResult<()>;

    /// Get a description of this guard for logging
    fn description(&self) -> &'static str;
}

/// The entity's Operation must equal the one the stage expects
///
/// A mismatch means a stage was handed an entity it never claimed, which is a
/// programming error: debug builds abort on it, release builds surface
/// `PreconditionViolated`.
#[derive(Debug, Clone, Copy)]
pub struct ExpectedOperationGuard {
    expected: Operation,
}

impl ExpectedOperationGuard {
    pub fn new(expected: Operation) -> Self {
        Self { expected }
    }

    /// Guard for an entity a stage has just claimed
    pub fn claimed_by(stage: Stage) -> Self {
        Self::new(stage.in_progress())
    }

    pub fn expected(&self) -> Operation {
        self.expected
    }
}

impl<T: HasOperation> StateGuard<T> for ExpectedOperationGuard {
    fn check(&self, entity: &T) -> GuardResult<()> {
        let actual = entity.operation();
        if actual == self.expected {
            return Ok(());
        }

        debug_assert!(
            cfg!(test) || actual == self.expected,
            "{} {} is in operation {actual}, stage expected {}",
            entity.entity_kind(),
            entity.entity_id(),
            self.expected
        );

        Err(GuardError::PreconditionViolated {
            entity: entity.entity_kind().to_string(),
            id: entity.entity_id(),
            expected: self.expected.to_string(),
            actual: actual.to_string(),
        })
    }

    fn description(&self) -> &'static str {
        "Entity operation must match the stage pre-condition"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OutMessage;

    #[test]
    fn test_guard_accepts_matching_operation() {
        let mut message = OutMessage::new("m-1@test");
        message.operation = Operation::Sending;

        let guard = ExpectedOperationGuard::claimed_by(Stage::Send);
        assert!(guard.check(&message).is_ok());
    }

    #[test]
    fn test_guard_rejects_mismatch() {
        let mut message = OutMessage::new("m-2@test");
        message.operation = Operation::Sent;

        let guard = ExpectedOperationGuard::new(Operation::ToBeSent);
        let err = guard.check(&message).unwrap_err();
        assert!(matches!(err, GuardError::PreconditionViolated { .. }));
        assert!(err.to_string().contains("found sent"));
    }
}
