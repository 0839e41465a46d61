//! Receive → deliver / forward / notify, receipts and inbound exceptions.

mod common;

use as4_relay::agents::EntitySource;
use as4_relay::collaborators::SendResult;
use as4_relay::constants::MessageType;
use as4_relay::models::{As4Message, MessageUnit};
use as4_relay::pipeline::{Direction, PipelineKind, StepError};
use as4_relay::pmode::{Method, ReceivingPMode};
use as4_relay::state_machine::{InStatus, Operation, OutStatus};
use as4_relay::store::{EntityStore, FaultRule};
use common::*;

const RECEIVING: &str = "recv";

fn harness_with(pmode: impl FnOnce(&Harness) -> ReceivingPMode) -> Harness {
    let h = Harness::new().with_default_receiving_pmode(RECEIVING);
    let receiving = pmode(&h);
    h.policies.insert_receiving(receiving);
    h
}

fn notifying_consumer(mut pmode: ReceivingPMode, method: Method) -> ReceivingPMode {
    pmode.exception_handling.notify_message_consumer = true;
    pmode.exception_handling.notify_method = Some(method);
    pmode
}

#[tokio::test]
async fn test_received_message_is_delivered() {
    let h = harness_with(|h| delivering_pmode(RECEIVING, h.deliver.method(), 2));

    let received = h.receive(received_user_message("in-1@test")).await;
    assert!(received.succeeded, "{:?}", received.error);
    let stored = &received.context.stored_in_messages[0];
    assert_eq!(stored.operation, Operation::ToBeDelivered);
    assert_eq!(stored.status, InStatus::Received);
    assert_eq!(stored.pmode_id.as_deref(), Some(RECEIVING));

    let delivered = h.poll_deliver().await;
    assert_eq!((delivered.claimed, delivered.succeeded), (1, 1));
    assert_eq!(h.deliver.sent_count(), 1);
    assert_eq!(h.deliver.sent()[0].ebms_message_id, "in-1@test");

    let message = h.store.get_in_message(stored.id).await.unwrap();
    assert_eq!(message.operation, Operation::Delivered);
    assert_eq!(message.status, InStatus::Delivered);
    assert_eq!(h.poll_deliver().await.claimed, 0);
}

#[tokio::test]
async fn test_fatal_delivery_records_exception_for_consumer() {
    let h = harness_with(|h| {
        notifying_consumer(
            delivering_pmode(RECEIVING, h.deliver.method(), 3),
            h.notify.method(),
        )
    });
    h.receive(received_user_message("in-2@test")).await;

    h.deliver.push(SendResult::fatal());
    let cycle = h.poll_deliver().await;
    assert_eq!((cycle.claimed, cycle.failed), (1, 1));

    let message = h
        .store
        .find_in_message_by_ebms_id("in-2@test")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.operation, Operation::DeadLettered);
    assert_eq!(message.status, InStatus::Exception);

    let exceptions = h.store.find_in_exceptions_by_ref("in-2@test").await.unwrap();
    assert_eq!(exceptions.len(), 1);
    assert_eq!(exceptions[0].operation, Operation::ToBeNotified);
    assert_eq!(exceptions[0].pmode_id.as_deref(), Some(RECEIVING));
    assert!(exceptions[0].exception.contains("in-2@test"));

    let notify = PipelineKind::Notify(Direction::Inbound);
    let notified = h
        .poll(notify, EntitySource::InExceptions, Operation::ToBeNotified)
        .await;
    assert_eq!((notified.claimed, notified.succeeded), (1, 1));
    assert_eq!(h.notify.sent_count(), 1);
    assert_eq!(
        h.store
            .get_in_exception(exceptions[0].id)
            .await
            .unwrap()
            .operation,
        Operation::Notified
    );
    assert_eq!(
        h.poll(notify, EntitySource::InExceptions, Operation::ToBeNotified)
            .await
            .claimed,
        0
    );
}

#[tokio::test]
async fn test_failed_exception_notification_writes_no_further_exception() {
    let h = harness_with(|h| {
        notifying_consumer(
            delivering_pmode(RECEIVING, h.deliver.method(), 0),
            h.notify.method(),
        )
    });
    h.receive(received_user_message("in-3@test")).await;
    h.deliver.push(SendResult::fatal());
    h.poll_deliver().await;

    h.notify.push(SendResult::fatal());
    let notified = h
        .poll(
            PipelineKind::Notify(Direction::Inbound),
            EntitySource::InExceptions,
            Operation::ToBeNotified,
        )
        .await;
    assert_eq!(notified.failed, 1);

    let exceptions = h.store.find_in_exceptions_by_ref("in-3@test").await.unwrap();
    assert_eq!(exceptions.len(), 1);
    assert_eq!(exceptions[0].operation, Operation::DeadLettered);
}

#[tokio::test]
async fn test_retryable_delivery_is_retried_after_sweep() {
    let h = harness_with(|h| delivering_pmode(RECEIVING, h.deliver.method(), 1));
    h.receive(received_user_message("in-4@test")).await;

    h.deliver.push(SendResult::retryable());
    h.poll_deliver().await;
    let id = h
        .store
        .find_in_message_by_ebms_id("in-4@test")
        .await
        .unwrap()
        .unwrap()
        .id;
    assert_eq!(
        h.store.get_in_message(id).await.unwrap().operation,
        Operation::ToBeRetried
    );

    assert_eq!(h.sweep_retries().await.claimed, 1);
    let second = h.poll_deliver().await;
    assert_eq!((second.claimed, second.succeeded), (1, 1));
    assert_eq!(h.deliver.sent_count(), 2);
    assert_eq!(
        h.store.get_in_message(id).await.unwrap().operation,
        Operation::Delivered
    );
}

#[tokio::test]
async fn test_duplicate_is_stored_but_not_delivered_again() {
    let h = harness_with(|h| delivering_pmode(RECEIVING, h.deliver.method(), 0));

    h.receive(received_user_message("in-5@test")).await;
    let again = h.receive(received_user_message("in-5@test")).await;
    assert!(again.succeeded, "{:?}", again.error);

    let duplicate = &again.context.stored_in_messages[0];
    assert!(duplicate.is_duplicate);
    assert_eq!(duplicate.operation, Operation::NotApplicable);

    assert_eq!(h.poll_deliver().await.claimed, 1);
    assert_eq!(h.deliver.sent_count(), 1);
}

#[tokio::test]
async fn test_user_message_without_policy_is_rejected() {
    let h = Harness::new();

    let result = h.receive(received_user_message("in-6@test")).await;
    assert!(!result.succeeded);
    assert!(matches!(result.error, Some(StepError::Validation(_))));
    assert!(h
        .store
        .find_in_message_by_ebms_id("in-6@test")
        .await
        .unwrap()
        .is_none());
    assert!(h
        .store
        .find_in_exceptions_by_ref("in-6@test")
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_receipt_is_created_and_sent_to_reply_url() {
    let h = harness_with(|h| {
        let mut pmode = ReceivingPMode::new(RECEIVING);
        pmode.reply_handling.send_receipt = true;
        pmode.reply_handling.reply_url = Some("scripted://partner/receipts".to_string());
        pmode.reply_handling.reply_method = Some(h.send.method());
        pmode
    });

    let received = h.receive(received_user_message("in-7@test")).await;
    assert!(received.succeeded, "{:?}", received.error);
    assert_eq!(
        received.context.stored_in_messages[0].operation,
        Operation::NotApplicable
    );

    let sent = h.poll_send().await;
    assert_eq!((sent.claimed, sent.succeeded), (1, 1));
    let envelopes = h.send.sent();
    let body: As4Message = serde_json::from_slice(&envelopes[0].body).unwrap();
    let MessageUnit::Receipt(receipt) = &body.units[0] else {
        panic!("expected a receipt, got {:?}", body.units[0]);
    };
    assert_eq!(receipt.ref_to_message_id, "in-7@test");

    let stored = h
        .store
        .find_out_message_by_ebms_id(&receipt.message_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.ebms_message_type, MessageType::Receipt);
    assert_eq!(stored.operation, Operation::Sent);
    assert_eq!(stored.url.as_deref(), Some("scripted://partner/receipts"));
}

#[tokio::test]
async fn test_receipt_without_reply_url_fails_the_message() {
    let h = harness_with(|_| {
        let mut pmode = ReceivingPMode::new(RECEIVING);
        pmode.reply_handling.send_receipt = true;
        pmode
    });

    let result = h.receive(received_user_message("in-8@test")).await;
    assert!(!result.succeeded);

    let message = h
        .store
        .find_in_message_by_ebms_id("in-8@test")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.status, InStatus::Exception);
    assert_eq!(
        h.store
            .find_in_exceptions_by_ref("in-8@test")
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn test_forwarded_message_keeps_its_id() {
    let h = harness_with(|_| {
        let mut pmode = ReceivingPMode::new(RECEIVING);
        pmode.message_handling.forward.sending_pmode_id = Some("onward".to_string());
        pmode
    });
    h.policies
        .insert_sending(push_sending_pmode("onward", h.send.method()));

    let received = h.receive(received_user_message("in-9@test")).await;
    assert_eq!(
        received.context.stored_in_messages[0].operation,
        Operation::ToBeForwarded
    );

    let forwarded = h
        .poll(
            PipelineKind::Forward,
            EntitySource::InMessages,
            Operation::ToBeForwarded,
        )
        .await;
    assert_eq!((forwarded.claimed, forwarded.succeeded), (1, 1));

    let inbound = h
        .store
        .find_in_message_by_ebms_id("in-9@test")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(inbound.operation, Operation::Forwarded);

    let outbound = h
        .store
        .find_out_message_by_ebms_id("in-9@test")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outbound.operation, Operation::ToBeProcessed);
    assert_eq!(outbound.pmode_id.as_deref(), Some("onward"));
    assert_eq!(outbound.url.as_deref(), Some(PARTNER_URL));
}

#[tokio::test]
async fn test_error_signal_nacks_and_notifies_producer() {
    let h = Harness::new();
    let mut pmode = push_sending_pmode("push", h.send.method());
    pmode.error_handling.notify_message_producer = true;
    pmode.error_handling.notify_method = Some(h.notify.method());
    h.policies.insert_sending(pmode);

    h.submit(submit_message("push", "out-1@test")).await;
    h.poll_processing().await;
    h.poll_send().await;

    let error = As4Message::single(MessageUnit::Error(error_signal("out-1@test")));
    let outcome = h.receive(received(&error)).await;
    assert!(outcome.succeeded, "{:?}", outcome.error);
    let signal = &outcome.context.stored_in_messages[0];
    assert_eq!(signal.ebms_message_type, MessageType::Error);
    assert_eq!(signal.operation, Operation::ToBeNotified);

    let original = h
        .store
        .find_out_message_by_ebms_id("out-1@test")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(original.status, OutStatus::Nack);

    let notified = h
        .poll(
            PipelineKind::Notify(Direction::Inbound),
            EntitySource::InMessages,
            Operation::ToBeNotified,
        )
        .await;
    assert_eq!((notified.claimed, notified.succeeded), (1, 1));
    assert_eq!(h.notify.sent_count(), 1);

    let signal = h.store.get_in_message(signal.id).await.unwrap();
    assert_eq!(signal.operation, Operation::Notified);
    assert_eq!(signal.status, InStatus::Notified);
}

#[tokio::test]
async fn test_unknown_signal_reference_is_stored_without_notification() {
    let h = Harness::new();

    let received = h.receive(received_receipt("never-sent@test")).await;
    assert!(received.succeeded, "{:?}", received.error);
    let signal = &received.context.stored_in_messages[0];
    assert_eq!(signal.operation, Operation::NotApplicable);
    assert_eq!(signal.ebms_ref_to_message_id.as_deref(), Some("never-sent@test"));
}

#[tokio::test]
async fn test_bundle_failure_records_every_unit_it_can() {
    let h = harness_with(|_| ReceivingPMode::new(RECEIVING));
    h.store
        .inject_fault(FaultRule::permanent("in_messages", Some("bundle-b@test")));
    h.store
        .inject_fault(FaultRule::permanent("in_exceptions", Some("bundle-a@test")));
    let bundle = As4Message {
        units: vec![
            MessageUnit::UserMessage(user_message("bundle-a@test")),
            MessageUnit::UserMessage(user_message("bundle-b@test")),
        ],
        ..Default::default()
    };

    let result = h.receive(received(&bundle)).await;

    assert!(!result.succeeded);
    assert!(matches!(result.error, Some(StepError::Store(_))));
    assert_eq!(result.context.stored_in_messages.len(), 1);

    // The second unit's exception is written although the first one's failed to insert
    let exceptions = h
        .store
        .find_in_exceptions_by_ref("bundle-b@test")
        .await
        .unwrap();
    assert_eq!(exceptions.len(), 1);
    assert!(h
        .store
        .find_in_exceptions_by_ref("bundle-a@test")
        .await
        .unwrap()
        .is_empty());

    let first = h
        .store
        .find_in_message_by_ebms_id("bundle-a@test")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.status, InStatus::Exception);
    assert!(h
        .store
        .find_in_message_by_ebms_id("bundle-b@test")
        .await
        .unwrap()
        .is_none());
}
