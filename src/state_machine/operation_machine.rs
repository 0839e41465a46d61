use tracing::debug;

use super::errors::{StateMachineError, StateMachineResult};
use super::events::OperationEvent;
use super::states::Operation;

/// Decide the Operation an event leads to
///
/// This is the only place transitions are defined. The stores apply it inside
/// their check-and-set updates, so an illegal move never reaches persistence.
pub fn determine_target_operation(
    current: Operation,
    event: OperationEvent,
) -> StateMachineResult<Operation> {
    use Operation::*;

    let target = match (current, event) {
        // Claims
        (ToBeProcessed, OperationEvent::Claim) => Processing,
        (ToBeSent, OperationEvent::Claim) => Sending,
        (ToBePiggyBacked, OperationEvent::Claim) => Sending,
        (ToBeDelivered, OperationEvent::Claim) => Delivering,
        (ToBeNotified, OperationEvent::Claim) => Notifying,
        (ToBeForwarded, OperationEvent::Claim) => Forwarding,

        // Successful completion of a stage
        (Processing, OperationEvent::Complete) => ToBeSent,
        (Sending, OperationEvent::Complete) => Sent,
        (Delivering, OperationEvent::Complete) => Delivered,
        (Notifying, OperationEvent::Complete) => Notified,
        (Forwarding, OperationEvent::Complete) => Forwarded,

        // Retry scheduling and re-arming
        (Sending | Delivering | Notifying, OperationEvent::ScheduleRetry) => ToBeRetried,
        (ToBeRetried, OperationEvent::Rearm(kind)) => kind.pending_operation(),

        // Reception awareness resend
        (Sent, OperationEvent::Resend) => ToBeSent,

        // Release goes back exactly to the pending value the claim came from
        (from, OperationEvent::Release(to))
            if from.is_in_progress()
                && to.is_pending()
                && determine_target_operation(to, OperationEvent::Claim).ok() == Some(from) =>
        {
            to
        }

        // Dead-lettering is allowed from anywhere except itself and is final
        (from, OperationEvent::DeadLetter) if from != DeadLettered => DeadLettered,

        (from, event) => {
            return Err(StateMachineError::InvalidTransition {
                from: from.to_string(),
                event: event.to_string(),
            })
        }
    };

    Ok(target)
}

/// Tracks one entity's Operation through a sequence of events
#[derive(Debug, Clone)]
pub struct OperationStateMachine {
    entity: &'static str,
    id: i64,
    current: Operation,
}

impl OperationStateMachine {
    pub fn new(entity: &'static str, id: i64, current: Operation) -> Self {
        Self {
            entity,
            id,
            current,
        }
    }

    pub fn current(&self) -> Operation {
        self.current
    }

    /// Attempt to transition the entity's Operation
    pub fn transition(&mut self, event: OperationEvent) -> StateMachineResult<Operation> {
        let target = determine_target_operation(self.current, event)?;

        debug!(
            entity = self.entity,
            entity_id = self.id,
            from = %self.current,
            to = %target,
            event = event.event_type(),
            "Operation transition"
        );

        self.current = target;
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::RetryType;
    use crate::state_machine::states::Stage;

    #[test]
    fn test_stage_chains_follow_table() {
        for stage in [
            Stage::Processing,
            Stage::Send,
            Stage::Deliver,
            Stage::Notify,
            Stage::Forward,
        ] {
            let claimed = determine_target_operation(stage.pending(), OperationEvent::Claim).unwrap();
            assert_eq!(claimed, stage.in_progress());
            let done = determine_target_operation(claimed, OperationEvent::Complete).unwrap();
            assert_eq!(done, stage.done());
        }
    }

    #[test]
    fn test_piggyback_claim_and_release() {
        let sending =
            determine_target_operation(Operation::ToBePiggyBacked, OperationEvent::Claim).unwrap();
        assert_eq!(sending, Operation::Sending);

        let back = determine_target_operation(
            sending,
            OperationEvent::Release(Operation::ToBePiggyBacked),
        )
        .unwrap();
        assert_eq!(back, Operation::ToBePiggyBacked);
    }

    #[test]
    fn test_release_must_match_claim_origin() {
        let result = determine_target_operation(
            Operation::Delivering,
            OperationEvent::Release(Operation::ToBeSent),
        );
        assert!(matches!(
            result,
            Err(StateMachineError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_retry_round_trip() {
        let retried =
            determine_target_operation(Operation::Notifying, OperationEvent::ScheduleRetry)
                .unwrap();
        assert_eq!(retried, Operation::ToBeRetried);

        let rearmed = determine_target_operation(
            retried,
            OperationEvent::Rearm(RetryType::Notification),
        )
        .unwrap();
        assert_eq!(rearmed, Operation::ToBeNotified);
    }

    #[test]
    fn test_dead_letter_is_final() {
        let mut machine = OperationStateMachine::new("out_message", 1, Operation::Sending);
        assert_eq!(
            machine.transition(OperationEvent::DeadLetter).unwrap(),
            Operation::DeadLettered
        );
        assert!(machine.transition(OperationEvent::DeadLetter).is_err());
        assert!(machine.transition(OperationEvent::Claim).is_err());
        assert_eq!(machine.current(), Operation::DeadLettered);
    }

    #[test]
    fn test_no_backward_moves_without_event() {
        assert!(determine_target_operation(Operation::Sent, OperationEvent::Claim).is_err());
        assert!(
            determine_target_operation(Operation::Delivered, OperationEvent::Resend).is_err()
        );
        assert!(
            determine_target_operation(Operation::ToBeSent, OperationEvent::Complete).is_err()
        );
    }
}
