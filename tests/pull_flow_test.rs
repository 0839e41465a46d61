//! Pull requests with piggybacked signals.

mod common;

use chrono::Utc;
use std::time::Duration;

use as4_relay::agents::{PollingAgent, PullRequestAgent};
use as4_relay::collaborators::{outbound_key, MessageBodyStore, SendResult};
use as4_relay::constants::{system, MessageExchangePattern, MessageType};
use as4_relay::models::{
    As4Message, ErrorDetail, ErrorSignal, MessageUnit, OutMessage, Receipt,
};
use as4_relay::pmode::{ReceivingPMode, SendingPMode};
use as4_relay::state_machine::Operation;
use as4_relay::store::EntityStore;
use common::*;

const PULL: &str = "pull";

fn pull_pmode(h: &Harness, id: &str, mpc: &str) -> SendingPMode {
    let mut pmode = push_sending_pmode(id, h.send.method());
    pmode.mep = MessageExchangePattern::Pull;
    pmode.message_packaging.mpc = Some(mpc.to_string());
    pmode
}

fn pulling_harness() -> Harness {
    let h = Harness::new().with_default_receiving_pmode("recv");
    let mut receiving = ReceivingPMode::new("recv");
    receiving.reply_handling.send_receipt = true;
    h.policies.insert_receiving(receiving);
    h.policies.insert_sending(pull_pmode(&h, PULL, PARTNER_MPC));
    h
}

fn pull_agent(h: &Harness, pmode_id: &str) -> PullRequestAgent {
    PullRequestAgent::new(h.services.clone(), pmode_id, Duration::from_millis(10))
}

/// Units of the `index`-th envelope the partner received
fn sent_units(h: &Harness, index: usize) -> Vec<MessageUnit> {
    let envelopes = h.send.sent();
    let message: As4Message = serde_json::from_slice(&envelopes[index].body).unwrap();
    message.units
}

/// A stored receipt waiting for a pull on the partner MPC
async fn waiting_signal(h: &Harness, ref_to: &str, signed: bool) -> OutMessage {
    let receipt = Receipt::for_message(ref_to);
    let id = receipt.message_id.clone();
    let body = serde_json::to_vec(&As4Message::single(MessageUnit::Receipt(receipt))).unwrap();
    let location = h.services.body_store.save(&outbound_key(&id), &body).await.unwrap();

    let mut signal = OutMessage::new(id)
        .with_ref_to_message_id(ref_to)
        .with_message_type(MessageType::Receipt)
        .with_operation(Operation::ToBePiggyBacked)
        .with_mpc(PARTNER_MPC)
        .with_url(PARTNER_URL)
        .with_mep(MessageExchangePattern::Pull)
        .with_location(location);
    signal.is_signed = signed;
    h.store.insert_out_message(signal).await.unwrap()
}

#[tokio::test]
async fn test_receipt_for_pulled_message_rides_on_next_pull() {
    let h = pulling_harness();
    let pulled = As4Message::single(MessageUnit::UserMessage(user_message("pulled-1@test")));
    h.send
        .push(SendResult::with_response(pulled.to_envelope().unwrap()));

    let agent = pull_agent(&h, PULL);
    let first = agent.poll_once(&h.cancel).await.unwrap();
    assert_eq!(first.succeeded, 1);
    let units = sent_units(&h, 0);
    assert!(matches!(units.as_slice(), [MessageUnit::PullRequest(_)]));

    let stored = h
        .store
        .find_in_message_by_ebms_id("pulled-1@test")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.mep, MessageExchangePattern::Pull);

    agent.poll_once(&h.cancel).await.unwrap();
    let units = sent_units(&h, 1);
    assert_eq!(units.len(), 2);
    assert!(matches!(units[0], MessageUnit::PullRequest(_)));
    let MessageUnit::Receipt(receipt) = &units[1] else {
        panic!("expected a piggybacked receipt, got {:?}", units[1]);
    };
    assert_eq!(receipt.ref_to_message_id, "pulled-1@test");

    let signal = h
        .store
        .find_out_message_by_ebms_id(&receipt.message_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(signal.operation, Operation::Sent);

    // Sent once, never again
    agent.poll_once(&h.cancel).await.unwrap();
    assert_eq!(sent_units(&h, 2).len(), 1);
}

#[tokio::test]
async fn test_signal_for_another_mpc_stays_behind() {
    let h = pulling_harness();
    h.policies
        .insert_sending(pull_pmode(&h, "elsewhere", "urn:mpc:elsewhere"));
    let signal = waiting_signal(&h, "m-1@test", false).await;

    pull_agent(&h, "elsewhere").poll_once(&h.cancel).await.unwrap();
    assert_eq!(sent_units(&h, 0).len(), 1);
    assert_eq!(
        h.store.get_out_message(signal.id).await.unwrap().operation,
        Operation::ToBePiggyBacked
    );

    pull_agent(&h, PULL).poll_once(&h.cancel).await.unwrap();
    assert_eq!(sent_units(&h, 1).len(), 2);
}

#[tokio::test]
async fn test_signal_for_another_url_stays_behind() {
    let h = pulling_harness();
    let mut other = pull_pmode(&h, "other-url", PARTNER_MPC);
    other.push_configuration.url = Some("scripted://other/msh".to_string());
    h.policies.insert_sending(other);
    waiting_signal(&h, "m-2@test", false).await;

    pull_agent(&h, "other-url").poll_once(&h.cancel).await.unwrap();
    assert_eq!(sent_units(&h, 0).len(), 1);
}

#[tokio::test]
async fn test_signed_signal_needs_signing_pull() {
    let h = pulling_harness();
    let mut signing = pull_pmode(&h, "signing", PARTNER_MPC);
    signing.security.signing.is_enabled = true;
    signing.security.signing.certificate_ref = Some("relay-cert".to_string());
    h.policies.insert_sending(signing);
    let signal = waiting_signal(&h, "m-3@test", true).await;

    pull_agent(&h, PULL).poll_once(&h.cancel).await.unwrap();
    assert_eq!(sent_units(&h, 0).len(), 1);

    pull_agent(&h, "signing").poll_once(&h.cancel).await.unwrap();
    assert_eq!(sent_units(&h, 1).len(), 2);
    assert_eq!(
        h.store.get_out_message(signal.id).await.unwrap().operation,
        Operation::Sent
    );
}

#[tokio::test]
async fn test_signal_not_yet_waiting_is_ignored() {
    let h = pulling_harness();
    let signal = waiting_signal(&h, "m-4@test", false).await;
    h.store
        .transition(
            as4_relay::models::RetryTarget::OutMessage(signal.id),
            Operation::ToBePiggyBacked,
            as4_relay::state_machine::OperationEvent::Claim,
        )
        .await
        .unwrap();

    pull_agent(&h, PULL).poll_once(&h.cancel).await.unwrap();
    assert_eq!(sent_units(&h, 0).len(), 1);
}

#[tokio::test]
async fn test_oldest_signal_goes_first() {
    let h = pulling_harness();
    let older = waiting_signal(&h, "m-5@test", false).await;
    let newer = waiting_signal(&h, "m-6@test", false).await;

    let agent = pull_agent(&h, PULL);
    agent.poll_once(&h.cancel).await.unwrap();
    assert_eq!(
        h.store.get_out_message(older.id).await.unwrap().operation,
        Operation::Sent
    );
    assert_eq!(
        h.store.get_out_message(newer.id).await.unwrap().operation,
        Operation::ToBePiggyBacked
    );
}

#[tokio::test]
async fn test_failed_pull_hands_signal_back() {
    let h = pulling_harness();
    let signal = waiting_signal(&h, "m-7@test", false).await;

    h.send.push(SendResult::retryable());
    let agent = pull_agent(&h, PULL);
    agent.poll_once(&h.cancel).await.unwrap();
    assert_eq!(sent_units(&h, 0).len(), 2);
    assert_eq!(
        h.store.get_out_message(signal.id).await.unwrap().operation,
        Operation::ToBePiggyBacked
    );

    agent.poll_once(&h.cancel).await.unwrap();
    assert_eq!(
        h.store.get_out_message(signal.id).await.unwrap().operation,
        Operation::Sent
    );
}

#[tokio::test]
async fn test_empty_mpc_response_stores_nothing() {
    let h = pulling_harness();
    let empty = As4Message::single(MessageUnit::Error(ErrorSignal {
        message_id: "empty@test".to_string(),
        ref_to_message_id: None,
        timestamp: Utc::now(),
        errors: vec![ErrorDetail {
            code: system::EMPTY_MPC_ERROR_CODE.to_string(),
            severity: "warning".to_string(),
            short_description: "EmptyMessagePartitionChannel".to_string(),
            detail: None,
        }],
    }));
    h.send
        .push(SendResult::with_response(empty.to_envelope().unwrap()));

    let cycle = pull_agent(&h, PULL).poll_once(&h.cancel).await.unwrap();
    assert_eq!(cycle.succeeded, 1);
    assert!(h
        .store
        .find_in_message_by_ebms_id("empty@test")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_unknown_pull_policy_is_an_agent_error() {
    let h = pulling_harness();
    assert!(pull_agent(&h, "missing").poll_once(&h.cancel).await.is_err());
    assert_eq!(h.send.sent_count(), 0);
}
