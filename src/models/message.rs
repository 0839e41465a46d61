use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt::{Debug, Display};
use std::str::FromStr;

use super::entity::{same_entity, Entity, EntityId, HasOperation, TRANSIENT_ID};
use crate::constants::{MessageExchangePattern, MessageType};
use crate::pmode::{ReceivingPMode, SendingPMode};
use crate::state_machine::{InStatus, Operation, OutStatus};

/// Monitoring status type of a message direction
///
/// Ties a status enum to the table its messages live in so the stores can be
/// written once for both directions.
pub trait MessageStatus:
    Copy
    + Debug
    + Display
    + FromStr<Err = String>
    + Default
    + PartialEq
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    /// Backing table name
    const TABLE: &'static str;
    /// Entity kind used in logs and errors
    const KIND: &'static str;

    /// Status given to messages that ended in failure
    fn exception() -> Self;

    /// Status that accompanies a new Operation, if it changes
    fn for_operation(operation: Operation) -> Option<Self>;
}

impl MessageStatus for InStatus {
    const TABLE: &'static str = "in_messages";
    const KIND: &'static str = "in_message";

    fn exception() -> Self {
        InStatus::Exception
    }

    fn for_operation(operation: Operation) -> Option<Self> {
        match operation {
            Operation::Delivered => Some(InStatus::Delivered),
            Operation::Notified => Some(InStatus::Notified),
            Operation::DeadLettered => Some(InStatus::Exception),
            _ => None,
        }
    }
}

impl MessageStatus for OutStatus {
    const TABLE: &'static str = "out_messages";
    const KIND: &'static str = "out_message";

    fn exception() -> Self {
        OutStatus::Exception
    }

    fn for_operation(operation: Operation) -> Option<Self> {
        match operation {
            Operation::Sent => Some(OutStatus::Sent),
            Operation::Notified => Some(OutStatus::Notified),
            Operation::DeadLettered => Some(OutStatus::Exception),
            _ => None,
        }
    }
}

/// One inbound or outbound ebMS message unit
/// Maps to the `in_messages` / `out_messages` tables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEntity<S> {
    pub id: EntityId,
    pub(crate) ebms_message_id: String,
    pub ebms_ref_to_message_id: Option<String>,
    /// Location key of the body in the message body store
    pub message_location: Option<String>,
    pub from_party: Option<String>,
    pub to_party: Option<String>,
    pub conversation_id: Option<String>,
    pub pmode_id: Option<String>,
    /// JSON copy of the policy mode the message was processed with
    pub pmode_data: Option<String>,
    pub mep: MessageExchangePattern,
    pub ebms_message_type: MessageType,
    pub operation: Operation,
    pub status: S,
    pub mpc: Option<String>,
    /// Destination the message is sent to, or the reply url for signals
    pub url: Option<String>,
    pub is_signed: bool,
    pub is_encrypted: bool,
    pub is_duplicate: bool,
    pub is_test: bool,
    pub insertion_time: DateTime<Utc>,
    pub modification_time: DateTime<Utc>,
}

pub type InMessage = MessageEntity<InStatus>;
pub type OutMessage = MessageEntity<OutStatus>;

impl<S: MessageStatus> MessageEntity<S> {
    /// Create a transient user message record
    pub fn new(ebms_message_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: TRANSIENT_ID,
            ebms_message_id: ebms_message_id.into(),
            ebms_ref_to_message_id: None,
            message_location: None,
            from_party: None,
            to_party: None,
            conversation_id: None,
            pmode_id: None,
            pmode_data: None,
            mep: MessageExchangePattern::Push,
            ebms_message_type: MessageType::UserMessage,
            operation: Operation::NotApplicable,
            status: S::default(),
            mpc: None,
            url: None,
            is_signed: false,
            is_encrypted: false,
            is_duplicate: false,
            is_test: false,
            insertion_time: now,
            modification_time: now,
        }
    }

    /// Business message id; fixed once the record exists
    pub fn ebms_message_id(&self) -> &str {
        &self.ebms_message_id
    }

    pub fn with_ref_to_message_id(mut self, ref_to: impl Into<String>) -> Self {
        self.ebms_ref_to_message_id = Some(ref_to.into());
        self
    }

    pub fn with_message_type(mut self, message_type: MessageType) -> Self {
        self.ebms_message_type = message_type;
        self
    }

    pub fn with_operation(mut self, operation: Operation) -> Self {
        self.operation = operation;
        self
    }

    pub fn with_status(mut self, status: S) -> Self {
        self.status = status;
        self
    }

    pub fn with_mpc(mut self, mpc: impl Into<String>) -> Self {
        self.mpc = Some(mpc.into());
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_mep(mut self, mep: MessageExchangePattern) -> Self {
        self.mep = mep;
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.message_location = Some(location.into());
        self
    }
}

impl OutMessage {
    /// Attach the sending policy mode, keeping its id and JSON copy together
    pub fn with_sending_pmode(mut self, pmode: &SendingPMode) -> Result<Self, serde_json::Error> {
        self.pmode_id = Some(pmode.id.clone());
        self.pmode_data = Some(serde_json::to_string(pmode)?);
        Ok(self)
    }

    /// Policy mode stored on the record, if any
    pub fn sending_pmode(&self) -> Result<Option<SendingPMode>, serde_json::Error> {
        self.pmode_data
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
    }
}

impl InMessage {
    pub fn with_receiving_pmode(
        mut self,
        pmode: &ReceivingPMode,
    ) -> Result<Self, serde_json::Error> {
        self.pmode_id = Some(pmode.id.clone());
        self.pmode_data = Some(serde_json::to_string(pmode)?);
        Ok(self)
    }

    pub fn receiving_pmode(&self) -> Result<Option<ReceivingPMode>, serde_json::Error> {
        self.pmode_data
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
    }
}

impl<S> Entity for MessageEntity<S> {
    fn id(&self) -> EntityId {
        self.id
    }

    fn insertion_time(&self) -> DateTime<Utc> {
        self.insertion_time
    }

    fn modification_time(&self) -> DateTime<Utc> {
        self.modification_time
    }
}

impl<S: MessageStatus> HasOperation for MessageEntity<S> {
    fn operation(&self) -> Operation {
        self.operation
    }

    fn entity_kind(&self) -> &'static str {
        S::KIND
    }

    fn entity_id(&self) -> EntityId {
        self.id
    }
}

impl<S> PartialEq for MessageEntity<S> {
    fn eq(&self, other: &Self) -> bool {
        same_entity(self, other)
    }
}
