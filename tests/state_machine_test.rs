//! Property tests over the Operation transition table.

use proptest::prelude::*;

use as4_relay::constants::RetryType;
use as4_relay::state_machine::{determine_target_operation, Operation, OperationEvent};

const ALL_OPERATIONS: [Operation; 18] = [
    Operation::NotApplicable,
    Operation::ToBeProcessed,
    Operation::Processing,
    Operation::ToBeSent,
    Operation::Sending,
    Operation::Sent,
    Operation::DeadLettered,
    Operation::ToBeForwarded,
    Operation::Forwarding,
    Operation::Forwarded,
    Operation::ToBeRetried,
    Operation::ToBeNotified,
    Operation::Notifying,
    Operation::Notified,
    Operation::ToBeDelivered,
    Operation::Delivering,
    Operation::Delivered,
    Operation::ToBePiggyBacked,
];

fn operation() -> impl Strategy<Value = Operation> {
    prop::sample::select(ALL_OPERATIONS.to_vec())
}

fn retry_type() -> impl Strategy<Value = RetryType> {
    prop::sample::select(vec![
        RetryType::Send,
        RetryType::Delivery,
        RetryType::Notification,
    ])
}

fn event() -> impl Strategy<Value = OperationEvent> {
    prop_oneof![
        Just(OperationEvent::Claim),
        Just(OperationEvent::Complete),
        Just(OperationEvent::ScheduleRetry),
        retry_type().prop_map(OperationEvent::Rearm),
        Just(OperationEvent::DeadLetter),
        operation().prop_map(OperationEvent::Release),
        Just(OperationEvent::Resend),
    ]
}

proptest! {
    /// Property: dead-lettered records never move again
    #[test]
    fn dead_lettered_is_final(event in event()) {
        prop_assert!(determine_target_operation(Operation::DeadLettered, event).is_err());
    }

    /// Property: only pending Operations can be claimed, and a claim starts work
    #[test]
    fn claims_start_from_pending(from in operation()) {
        match determine_target_operation(from, OperationEvent::Claim) {
            Ok(claimed) => {
                prop_assert!(from.is_pending());
                prop_assert!(claimed.is_in_progress());
            }
            Err(_) => prop_assert!(!from.is_pending()),
        }
    }

    /// Property: a released claim lands exactly where it was claimed from
    #[test]
    fn release_undoes_claim(from in operation()) {
        if let Ok(claimed) = determine_target_operation(from, OperationEvent::Claim) {
            prop_assert_eq!(
                determine_target_operation(claimed, OperationEvent::Release(from)).unwrap(),
                from
            );
        }
    }

    /// Property: release never lands anywhere but the pending value of the claim
    #[test]
    fn release_target_is_checked(from in operation(), to in operation()) {
        if let Ok(released) = determine_target_operation(from, OperationEvent::Release(to)) {
            prop_assert_eq!(released, to);
            prop_assert_eq!(
                determine_target_operation(to, OperationEvent::Claim).unwrap(),
                from
            );
        }
    }

    /// Property: a scheduled retry re-arms into its kind's pending Operation
    #[test]
    fn retry_rearms_to_pending(kind in retry_type()) {
        let in_progress = determine_target_operation(kind.pending_operation(), OperationEvent::Claim).unwrap();
        let waiting = determine_target_operation(in_progress, OperationEvent::ScheduleRetry).unwrap();
        prop_assert_eq!(waiting, Operation::ToBeRetried);
        let rearmed = determine_target_operation(waiting, OperationEvent::Rearm(kind)).unwrap();
        prop_assert_eq!(rearmed, kind.pending_operation());
        prop_assert!(rearmed.is_pending());
    }

    /// Property: any walk over legal events stays inside the table and
    /// stops for good once dead-lettered
    #[test]
    fn random_walks_stay_legal(start in operation(), events in prop::collection::vec(event(), 1..40)) {
        let mut current = start;
        let mut dead = current == Operation::DeadLettered;
        for event in events {
            if let Ok(next) = determine_target_operation(current, event) {
                prop_assert!(!dead);
                prop_assert!(ALL_OPERATIONS.contains(&next));
                // Work only ever starts with a claim
                if next.is_in_progress() {
                    prop_assert!(current.is_pending());
                }
                current = next;
                dead = current == Operation::DeadLettered;
            }
        }
    }
}

#[test]
fn test_outbound_happy_path() {
    let mut current = Operation::ToBeProcessed;
    for event in [
        OperationEvent::Claim,
        OperationEvent::Complete,
        OperationEvent::Claim,
        OperationEvent::Complete,
    ] {
        current = determine_target_operation(current, event).unwrap();
    }
    assert_eq!(current, Operation::Sent);

    // Reception awareness can put a sent message back
    assert_eq!(
        determine_target_operation(current, OperationEvent::Resend).unwrap(),
        Operation::ToBeSent
    );
}

#[test]
fn test_completion_requires_a_claim() {
    for pending in ALL_OPERATIONS.iter().filter(|op| op.is_pending()) {
        assert!(determine_target_operation(*pending, OperationEvent::Complete).is_err());
    }
}
