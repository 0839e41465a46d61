use std::collections::HashMap;

use super::errors::StepError;
use crate::models::{
    As4Message, Envelope, HasOperation, InException, InMessage, OutException, OutMessage,
    ReceivedMessage, RetryTarget, SubmitMessage,
};
use crate::pmode::{ReceivingPMode, SendingPMode};
use crate::state_machine::Operation;

/// The persisted record a pipeline run works on
#[derive(Debug, Clone)]
pub enum ContextEntity {
    InMessage(InMessage),
    OutMessage(OutMessage),
    InException(InException),
    OutException(OutException),
}

impl ContextEntity {
    pub fn target(&self) -> RetryTarget {
        match self {
            Self::InMessage(m) => RetryTarget::InMessage(m.id),
            Self::OutMessage(m) => RetryTarget::OutMessage(m.id),
            Self::InException(e) => RetryTarget::InException(e.id),
            Self::OutException(e) => RetryTarget::OutException(e.id),
        }
    }

    /// Message id of a message, or the id an exception refers to
    pub fn ebms_message_id(&self) -> Option<&str> {
        match self {
            Self::InMessage(m) => Some(m.ebms_message_id()),
            Self::OutMessage(m) => Some(m.ebms_message_id()),
            Self::InException(e) => e.ebms_ref_to_message_id.as_deref(),
            Self::OutException(e) => e.ebms_ref_to_message_id.as_deref(),
        }
    }

    pub fn is_exception(&self) -> bool {
        matches!(self, Self::InException(_) | Self::OutException(_))
    }

    fn as_operation(&self) -> &dyn HasOperation {
        match self {
            Self::InMessage(m) => m,
            Self::OutMessage(m) => m,
            Self::InException(e) => e,
            Self::OutException(e) => e,
        }
    }
}

impl HasOperation for ContextEntity {
    fn operation(&self) -> Operation {
        self.as_operation().operation()
    }

    fn entity_kind(&self) -> &'static str {
        self.as_operation().entity_kind()
    }

    fn entity_id(&self) -> i64 {
        self.as_operation().entity_id()
    }
}

/// Message in flight through one pipeline run
///
/// Pipeline instances share no mutable state; each run owns its context.
#[derive(Debug, Clone, Default)]
pub struct MessagingContext {
    pub as4_message: Option<As4Message>,
    pub submit_message: Option<SubmitMessage>,
    pub received_message: Option<ReceivedMessage>,
    pub sending_pmode: Option<SendingPMode>,
    pub receiving_pmode: Option<ReceivingPMode>,
    /// Record claimed by the agent (or created by the run)
    pub entity: Option<ContextEntity>,
    /// Pending Operation the entity was claimed from
    pub claimed_from: Option<Operation>,
    /// Signal bundled behind an outgoing pull request
    pub piggybacked: Option<OutMessage>,
    /// Synchronous reply to a send
    pub response: Option<Envelope>,
    /// Inbound records written by this run
    pub stored_in_messages: Vec<InMessage>,
    pub metadata: HashMap<String, String>,
}

impl MessagingContext {
    pub fn for_submit(submit: SubmitMessage) -> Self {
        Self {
            submit_message: Some(submit),
            ..Default::default()
        }
    }

    pub fn for_received(received: ReceivedMessage) -> Self {
        Self {
            received_message: Some(received),
            ..Default::default()
        }
    }

    /// Context for an entity an agent claimed from `claimed_from`
    pub fn for_claimed(entity: ContextEntity, claimed_from: Operation) -> Self {
        Self {
            entity: Some(entity),
            claimed_from: Some(claimed_from),
            ..Default::default()
        }
    }

    /// Pull request context for a sending policy
    pub fn for_pull(pull_request: As4Message, pmode: SendingPMode) -> Self {
        Self {
            as4_message: Some(pull_request),
            sending_pmode: Some(pmode),
            ..Default::default()
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Every message id a failure of this run refers to
    pub fn message_ids(&self) -> Vec<String> {
        if let Some(message) = &self.as4_message {
            if !message.is_empty() {
                return message.message_ids();
            }
        }
        if let Some(id) = self
            .submit_message
            .as_ref()
            .and_then(|s| s.message_id.clone())
        {
            return vec![id];
        }
        self.entity
            .as_ref()
            .and_then(|e| e.ebms_message_id())
            .map(|id| vec![id.to_string()])
            .unwrap_or_default()
    }

    /// Whether the run has written anything yet
    pub fn has_persisted(&self) -> bool {
        self.entity.is_some() || !self.stored_in_messages.is_empty()
    }

    pub fn as4(&self) -> Result<&As4Message, StepError> {
        self.as4_message
            .as_ref()
            .ok_or(StepError::MissingContext("as4 message"))
    }

    pub fn sending(&self) -> Result<&SendingPMode, StepError> {
        self.sending_pmode
            .as_ref()
            .ok_or(StepError::MissingContext("sending policy mode"))
    }

    pub fn receiving(&self) -> Result<&ReceivingPMode, StepError> {
        self.receiving_pmode
            .as_ref()
            .ok_or(StepError::MissingContext("receiving policy mode"))
    }

    pub fn out_message(&self) -> Result<&OutMessage, StepError> {
        match &self.entity {
            Some(ContextEntity::OutMessage(m)) => Ok(m),
            _ => Err(StepError::MissingContext("outbound message")),
        }
    }

    pub fn in_message(&self) -> Result<&InMessage, StepError> {
        match &self.entity {
            Some(ContextEntity::InMessage(m)) => Ok(m),
            _ => Err(StepError::MissingContext("inbound message")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MessageUnit, Receipt};

    #[test]
    fn test_message_ids_prefer_the_in_flight_message() {
        let mut ctx = MessagingContext::for_claimed(
            ContextEntity::OutMessage(OutMessage::new("stored@test")),
            Operation::ToBeSent,
        );
        assert_eq!(ctx.message_ids(), vec!["stored@test".to_string()]);

        ctx.as4_message = Some(As4Message::single(MessageUnit::Receipt(Receipt::for_message(
            "user@test",
        ))));
        let ids = ctx.message_ids();
        assert_eq!(ids.len(), 1);
        assert_ne!(ids[0], "stored@test");
    }

    #[test]
    fn test_exception_entity_refers_to_its_message() {
        let exception = OutException::new(Some("failed@test".to_string()), "boom");
        let entity = ContextEntity::OutException(exception);
        assert!(entity.is_exception());
        assert_eq!(entity.ebms_message_id(), Some("failed@test"));
        assert_eq!(entity.entity_kind(), "out_exception");
    }

    #[test]
    fn test_missing_pieces_are_reported() {
        let ctx = MessagingContext::default();
        assert_eq!(
            ctx.sending().unwrap_err(),
            StepError::MissingContext("sending policy mode")
        );
        assert!(!ctx.has_persisted());
    }
}
