use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::{generate_ebms_message_id, system, MessageType};

/// Business payload carried by a user message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub id: String,
    pub mime_type: String,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserMessage {
    pub message_id: String,
    pub ref_to_message_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub mpc: String,
    pub from_party: Option<String>,
    pub to_party: Option<String>,
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub payloads: Vec<Payload>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub message_id: String,
    pub ref_to_message_id: String,
    pub timestamp: DateTime<Utc>,
}

impl Receipt {
    /// Receipt acknowledging `ref_to_message_id`
    pub fn for_message(ref_to_message_id: impl Into<String>) -> Self {
        Self {
            message_id: generate_ebms_message_id(),
            ref_to_message_id: ref_to_message_id.into(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub severity: String,
    pub short_description: String,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorSignal {
    pub message_id: String,
    pub ref_to_message_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub errors: Vec<ErrorDetail>,
}

impl ErrorSignal {
    /// "Nothing to pull on this MPC" warning
    pub fn is_empty_mpc(&self) -> bool {
        self.errors
            .iter()
            .any(|e| e.code == system::EMPTY_MPC_ERROR_CODE)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRequest {
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
    pub mpc: String,
}

impl PullRequest {
    pub fn new(mpc: impl Into<String>) -> Self {
        Self {
            message_id: generate_ebms_message_id(),
            timestamp: Utc::now(),
            mpc: mpc.into(),
        }
    }
}

/// A message unit inside an AS4 message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageUnit {
    UserMessage(UserMessage),
    Receipt(Receipt),
    Error(ErrorSignal),
    PullRequest(PullRequest),
}

impl MessageUnit {
    pub fn message_id(&self) -> &str {
        match self {
            Self::UserMessage(m) => &m.message_id,
            Self::Receipt(r) => &r.message_id,
            Self::Error(e) => &e.message_id,
            Self::PullRequest(p) => &p.message_id,
        }
    }

    pub fn ref_to_message_id(&self) -> Option<&str> {
        match self {
            Self::UserMessage(m) => m.ref_to_message_id.as_deref(),
            Self::Receipt(r) => Some(&r.ref_to_message_id),
            Self::Error(e) => e.ref_to_message_id.as_deref(),
            Self::PullRequest(_) => None,
        }
    }

    /// Stored message type; pull requests are never stored
    pub fn message_type(&self) -> Option<MessageType> {
        match self {
            Self::UserMessage(_) => Some(MessageType::UserMessage),
            Self::Receipt(_) => Some(MessageType::Receipt),
            Self::Error(_) => Some(MessageType::Error),
            Self::PullRequest(_) => None,
        }
    }
}

/// In-flight AS4 message: an ordered bundle of message units
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct As4Message {
    pub units: Vec<MessageUnit>,
    #[serde(default)]
    pub is_signed: bool,
    #[serde(default)]
    pub is_encrypted: bool,
    /// Secured wire form produced by the security strategy
    #[serde(default)]
    pub envelope: Option<Vec<u8>>,
}

impl As4Message {
    pub fn single(unit: MessageUnit) -> Self {
        Self {
            units: vec![unit],
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Ids of every unit in bundle order
    pub fn message_ids(&self) -> Vec<String> {
        self.units.iter().map(|u| u.message_id().to_string()).collect()
    }

    pub fn user_messages(&self) -> impl Iterator<Item = &UserMessage> {
        self.units.iter().filter_map(|u| match u {
            MessageUnit::UserMessage(m) => Some(m),
            _ => None,
        })
    }

    pub fn primary_user_message(&self) -> Option<&UserMessage> {
        self.user_messages().next()
    }

    pub fn pull_request(&self) -> Option<&PullRequest> {
        self.units.iter().find_map(|u| match u {
            MessageUnit::PullRequest(p) => Some(p),
            _ => None,
        })
    }

    /// A pull response that carries nothing but an empty-MPC warning
    pub fn is_empty_pull_response(&self) -> bool {
        self.units.is_empty()
            || self.units.iter().all(|u| match u {
                MessageUnit::Error(e) => e.is_empty_mpc(),
                _ => false,
            })
    }

    /// Serialize into the transport envelope, preferring the secured form
    pub fn to_envelope(&self) -> Result<Envelope, serde_json::Error> {
        let body = match &self.envelope {
            Some(secured) => secured.clone(),
            None => serde_json::to_vec(self)?,
        };
        Ok(Envelope {
            ebms_message_id: self
                .units
                .first()
                .map(|u| u.message_id().to_string())
                .unwrap_or_default(),
            content_type: system::ENVELOPE_CONTENT_TYPE.to_string(),
            body,
        })
    }
}

/// Business-application submission that becomes an OutMessage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubmitMessage {
    pub pmode_id: String,
    pub message_id: Option<String>,
    pub ref_to_message_id: Option<String>,
    pub mpc: Option<String>,
    pub from_party: Option<String>,
    pub to_party: Option<String>,
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub payloads: Vec<Payload>,
}

/// Raw inbound content before transformation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReceivedMessage {
    pub content_type: String,
    pub body: Vec<u8>,
    /// Receiving policy mode suggested by the transport, if known
    pub pmode_id_hint: Option<String>,
    /// The message was obtained as the response to our own pull request
    #[serde(default)]
    pub via_pull: bool,
}

/// Wire-agnostic envelope handed to a sender
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub ebms_message_id: String,
    pub content_type: String,
    pub body: Vec<u8>,
}

/// What gets handed to the consuming business application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryEnvelope {
    pub ebms_message_id: String,
    pub ref_to_message_id: Option<String>,
    pub payloads: Vec<Payload>,
}

impl DeliveryEnvelope {
    pub fn to_envelope(&self) -> Result<Envelope, serde_json::Error> {
        Ok(Envelope {
            ebms_message_id: self.ebms_message_id.clone(),
            content_type: "application/json".to_string(),
            body: serde_json::to_vec(self)?,
        })
    }
}

/// Notification about a receipt, error or exception
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifyEnvelope {
    pub ebms_message_id: String,
    pub ref_to_message_id: Option<String>,
    /// `receipt`, `error` or `exception`
    pub kind: String,
    pub description: Option<String>,
}

impl NotifyEnvelope {
    pub fn to_envelope(&self) -> Result<Envelope, serde_json::Error> {
        Ok(Envelope {
            ebms_message_id: self.ebms_message_id.clone(),
            content_type: "application/json".to_string(),
            body: serde_json::to_vec(self)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_mpc_error() -> ErrorSignal {
        ErrorSignal {
            message_id: "err@test".to_string(),
            ref_to_message_id: None,
            timestamp: Utc::now(),
            errors: vec![ErrorDetail {
                code: system::EMPTY_MPC_ERROR_CODE.to_string(),
                severity: "warning".to_string(),
                short_description: "EmptyMessagePartitionChannel".to_string(),
                detail: None,
            }],
        }
    }

    #[test]
    fn test_empty_pull_response_detection() {
        assert!(As4Message::default().is_empty_pull_response());
        assert!(As4Message::single(MessageUnit::Error(empty_mpc_error())).is_empty_pull_response());

        let receipt = MessageUnit::Receipt(Receipt::for_message("x@test"));
        assert!(!As4Message::single(receipt).is_empty_pull_response());
    }

    #[test]
    fn test_unit_accessors() {
        let receipt = Receipt::for_message("orig@test");
        let unit = MessageUnit::Receipt(receipt.clone());
        assert_eq!(unit.message_id(), receipt.message_id);
        assert_eq!(unit.ref_to_message_id(), Some("orig@test"));
        assert_eq!(unit.message_type(), Some(MessageType::Receipt));

        let pull = MessageUnit::PullRequest(PullRequest::new("mpc-a"));
        assert_eq!(pull.message_type(), None);
    }

    #[test]
    fn test_envelope_prefers_secured_form() {
        let mut message = As4Message::single(MessageUnit::PullRequest(PullRequest::new("mpc")));
        let plain = message.to_envelope().unwrap();
        assert!(!plain.body.is_empty());

        message.envelope = Some(b"secured".to_vec());
        assert_eq!(message.to_envelope().unwrap().body, b"secured".to_vec());
    }
}
