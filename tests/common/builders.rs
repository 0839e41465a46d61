use chrono::Utc;

use as4_relay::constants::MessageExchangePattern;
use as4_relay::models::{
    As4Message, ErrorDetail, ErrorSignal, MessageUnit, Payload, Receipt, ReceivedMessage,
    SubmitMessage, UserMessage,
};
use as4_relay::pmode::{Method, ReceivingPMode, RetryConfig, SendingPMode};

pub const PARTNER_URL: &str = "scripted://partner/msh";
pub const PARTNER_MPC: &str = "urn:mpc:partner";

/// Push policy sending through `method` with two immediate send retries
pub fn push_sending_pmode(id: &str, method: Method) -> SendingPMode {
    let mut pmode = SendingPMode::new(id);
    pmode.mep = MessageExchangePattern::Push;
    pmode.push_configuration.url = Some(PARTNER_URL.to_string());
    pmode.push_configuration.method = Some(method);
    pmode.message_packaging.mpc = Some(PARTNER_MPC.to_string());
    pmode.message_packaging.from_party = Some("org:relay".to_string());
    pmode.message_packaging.to_party = Some("org:partner".to_string());
    pmode.send_reliability = RetryConfig::enabled(2, 0);
    pmode
}

/// Receiving policy delivering through `method` with the given budget
pub fn delivering_pmode(id: &str, method: Method, retries: u32) -> ReceivingPMode {
    let mut pmode = ReceivingPMode::new(id);
    pmode.message_handling.deliver.is_enabled = true;
    pmode.message_handling.deliver.delivery_method = Some(method);
    pmode.message_handling.deliver.reliability = RetryConfig::enabled(retries, 0);
    pmode
}

pub fn submit_message(pmode_id: &str, message_id: &str) -> SubmitMessage {
    SubmitMessage {
        pmode_id: pmode_id.to_string(),
        message_id: Some(message_id.to_string()),
        payloads: vec![Payload {
            id: "invoice".to_string(),
            mime_type: "application/xml".to_string(),
            content: b"<invoice/>".to_vec(),
        }],
        ..Default::default()
    }
}

pub fn user_message(message_id: &str) -> UserMessage {
    UserMessage {
        message_id: message_id.to_string(),
        ref_to_message_id: None,
        timestamp: Utc::now(),
        mpc: PARTNER_MPC.to_string(),
        from_party: Some("org:partner".to_string()),
        to_party: Some("org:relay".to_string()),
        conversation_id: Some("conv-1".to_string()),
        payloads: vec![Payload {
            id: "order".to_string(),
            mime_type: "application/json".to_string(),
            content: br#"{"order":1}"#.to_vec(),
        }],
    }
}

pub fn error_signal(ref_to: &str) -> ErrorSignal {
    ErrorSignal {
        message_id: format!("error-for-{ref_to}"),
        ref_to_message_id: Some(ref_to.to_string()),
        timestamp: Utc::now(),
        errors: vec![ErrorDetail {
            code: "EBMS:0004".to_string(),
            severity: "failure".to_string(),
            short_description: "Other".to_string(),
            detail: Some("rejected by partner".to_string()),
        }],
    }
}

pub fn received(message: &As4Message) -> ReceivedMessage {
    let envelope = message.to_envelope().expect("envelope");
    ReceivedMessage {
        content_type: envelope.content_type,
        body: envelope.body,
        ..Default::default()
    }
}

pub fn received_user_message(message_id: &str) -> ReceivedMessage {
    received(&As4Message::single(MessageUnit::UserMessage(user_message(
        message_id,
    ))))
}

pub fn received_receipt(ref_to: &str) -> ReceivedMessage {
    received(&As4Message::single(MessageUnit::Receipt(Receipt::for_message(
        ref_to,
    ))))
}
