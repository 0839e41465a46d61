//! Receive pipeline: raw inbound content to stored InMessages and receipts.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{ensure_active, save_message};
use crate::collaborators::{inbound_key, outbound_key};
use crate::constants::{system, MessageExchangePattern, MessageType, RetryType};
use crate::logging::log_message_operation;
use crate::models::{
    As4Message, InMessage, MessageUnit, OutMessage, Receipt, ReceivedMessage, RetryTarget,
    UserMessage,
};
use crate::pipeline::context::MessagingContext;
use crate::pipeline::errors::StepError;
use crate::pipeline::services::PipelineServices;
use crate::pipeline::step::{Step, StepResult};
use crate::pmode::{ReceivingPMode, SendingPMode};
use crate::state_machine::{InStatus, Operation, OutStatus};

/// Transform raw content, refusing pull requests addressed to us
pub(crate) fn transform_inbound(
    services: &PipelineServices,
    received: &ReceivedMessage,
) -> Result<As4Message, StepError> {
    let message = services.transformer.transform(received)?;
    if message.pull_request().is_some() {
        return Err(StepError::validation(
            "inbound pull requests are not served by this relay",
        ));
    }
    Ok(message)
}

pub struct TransformReceivedMessageStep {
    services: PipelineServices,
}

impl TransformReceivedMessageStep {
    pub fn new(services: PipelineServices) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Step for TransformReceivedMessageStep {
    fn name(&self) -> &'static str {
        "transform_received_message"
    }

    async fn execute(
        &self,
        context: &mut MessagingContext,
        _cancel: &CancellationToken,
    ) -> Result<StepResult, StepError> {
        let received = context
            .received_message
            .as_ref()
            .ok_or(StepError::MissingContext("received message"))?;
        let message = transform_inbound(&self.services, received)?;
        if message.is_empty() {
            return Err(StepError::validation("received message carries no message units"));
        }
        context.as4_message = Some(message);
        Ok(StepResult::Continue)
    }
}

/// Pick the receiving policy: transport hint first, then the configured default
///
/// Only user messages require one; signals are matched to the message they
/// answer instead.
pub struct DetermineReceivingPModeStep {
    services: PipelineServices,
}

impl DetermineReceivingPModeStep {
    pub fn new(services: PipelineServices) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Step for DetermineReceivingPModeStep {
    fn name(&self) -> &'static str {
        "determine_receiving_pmode"
    }

    async fn execute(
        &self,
        context: &mut MessagingContext,
        _cancel: &CancellationToken,
    ) -> Result<StepResult, StepError> {
        let has_user_message = context.as4()?.primary_user_message().is_some();
        let pmode_id = context
            .received_message
            .as_ref()
            .and_then(|r| r.pmode_id_hint.clone())
            .or_else(|| self.services.default_receiving_pmode.clone());

        context.receiving_pmode = match (pmode_id, has_user_message) {
            (Some(id), true) => Some(self.services.policies.receiving_pmode(&id)?),
            (Some(id), false) => self.services.policies.receiving_pmode(&id).ok(),
            (None, true) => {
                return Err(StepError::validation(
                    "no receiving policy mode for inbound user message",
                ))
            }
            (None, false) => None,
        };
        Ok(StepResult::Continue)
    }
}

/// Store every received unit as an InMessage
///
/// User messages go to `ToBeForwarded`, `ToBeDelivered` or rest, duplicates
/// are kept but never processed again. Receipts and errors acknowledge the
/// OutMessage they refer to and wait for notification if its producer asked.
pub struct SaveReceivedMessageStep {
    services: PipelineServices,
}

impl SaveReceivedMessageStep {
    pub fn new(services: PipelineServices) -> Self {
        Self { services }
    }

    async fn save_user_message(
        &self,
        mut message: InMessage,
        unit: &As4Message,
        user: &UserMessage,
        pmode: &ReceivingPMode,
    ) -> Result<InMessage, StepError> {
        let store = &self.services.store;
        let duplicate = store
            .find_in_message_by_ebms_id(&user.message_id)
            .await?;

        message = message.with_receiving_pmode(pmode)?.with_mpc(user.mpc.clone());
        message.from_party = user.from_party.clone();
        message.to_party = user.to_party.clone();
        message.conversation_id = user.conversation_id.clone();

        let deliver = &pmode.message_handling.deliver;
        match duplicate {
            Some(original) => {
                message.is_duplicate = true;
                message.message_location = original.message_location;
                message.operation = Operation::NotApplicable;
            }
            None => {
                let location =
                    save_message(&self.services, &inbound_key(&user.message_id), unit).await?;
                message = message.with_location(location);
                message.operation = if pmode.forwards() {
                    Operation::ToBeForwarded
                } else if deliver.is_enabled {
                    Operation::ToBeDelivered
                } else {
                    Operation::NotApplicable
                };
            }
        }

        let stored = store.insert_in_message(message).await?;
        if stored.operation == Operation::ToBeDelivered {
            self.services
                .retry
                .schedule(
                    RetryTarget::InMessage(stored.id),
                    RetryType::Delivery,
                    &deliver.reliability,
                )
                .await?;
        }
        Ok(stored)
    }

    async fn save_signal(
        &self,
        mut message: InMessage,
        unit: &As4Message,
    ) -> Result<InMessage, StepError> {
        let store = &self.services.store;
        let location =
            save_message(&self.services, &inbound_key(message.ebms_message_id()), unit).await?;
        message = message.with_location(location);

        let referenced = match message.ebms_ref_to_message_id.as_deref() {
            Some(ref_to) => store.find_out_message_by_ebms_id(ref_to).await?,
            None => None,
        };

        let mut notify = None;
        match &referenced {
            Some(original) => {
                let (status, handling) = match message.ebms_message_type {
                    MessageType::Receipt => (OutStatus::Ack, original_handling(original, true)?),
                    _ => (OutStatus::Nack, original_handling(original, false)?),
                };
                store.set_out_message_status(original.id, status, None).await?;
                store
                    .complete_reception_awareness(original.ebms_message_id())
                    .await?;
                if let Some(handling) = handling.filter(|h| h.notify_message_producer) {
                    message.operation = Operation::ToBeNotified;
                    notify = Some(handling.reliability);
                }
            }
            None => warn!(
                ebms_message_id = message.ebms_message_id(),
                ref_to = ?message.ebms_ref_to_message_id,
                "Signal refers to no known outbound message"
            ),
        }

        let stored = store.insert_in_message(message).await?;
        if let Some(reliability) = notify {
            self.services
                .retry
                .schedule(
                    RetryTarget::InMessage(stored.id),
                    RetryType::Notification,
                    &reliability,
                )
                .await?;
        }
        Ok(stored)
    }
}

/// Receipt or error handling of the OutMessage a signal answers
fn original_handling(
    original: &OutMessage,
    receipt: bool,
) -> Result<Option<crate::pmode::NotifyHandling>, StepError> {
    Ok(original.sending_pmode()?.map(|pmode| {
        if receipt {
            pmode.receipt_handling
        } else {
            pmode.error_handling
        }
    }))
}

#[async_trait]
impl Step for SaveReceivedMessageStep {
    fn name(&self) -> &'static str {
        "save_received_message"
    }

    async fn execute(
        &self,
        context: &mut MessagingContext,
        cancel: &CancellationToken,
    ) -> Result<StepResult, StepError> {
        let as4 = context.as4()?.clone();
        let via_pull = context
            .received_message
            .as_ref()
            .is_some_and(|r| r.via_pull);
        let mep = if via_pull {
            MessageExchangePattern::Pull
        } else {
            MessageExchangePattern::Push
        };

        for unit in &as4.units {
            let Some(message_type) = unit.message_type() else {
                continue;
            };
            ensure_active(cancel)?;

            let single = As4Message {
                units: vec![unit.clone()],
                is_signed: as4.is_signed,
                is_encrypted: as4.is_encrypted,
                envelope: None,
            };
            let mut message = InMessage::new(unit.message_id())
                .with_message_type(message_type)
                .with_status(InStatus::Received)
                .with_mep(mep);
            if let Some(ref_to) = unit.ref_to_message_id() {
                message = message.with_ref_to_message_id(ref_to);
            }
            message.is_signed = as4.is_signed;
            message.is_encrypted = as4.is_encrypted;

            let stored = match unit {
                MessageUnit::UserMessage(user) => {
                    let pmode = context.receiving()?.clone();
                    self.save_user_message(message, &single, user, &pmode)
                        .await?
                }
                _ => self.save_signal(message, &single).await?,
            };

            log_message_operation(
                "received",
                "in_message",
                Some(stored.id),
                Some(stored.ebms_message_id()),
                &stored.operation.to_string(),
                stored.is_duplicate.then_some("duplicate"),
            );
            context.stored_in_messages.push(stored);
        }
        Ok(StepResult::Continue)
    }
}

/// Answer stored user messages with receipts when the policy asks for them
///
/// Receipts for pulled messages wait in `ToBePiggyBacked` on the pulled MPC
/// and ride along with the next pull request; all others are sent.
pub struct CreateReceiptStep {
    services: PipelineServices,
}

impl CreateReceiptStep {
    pub fn new(services: PipelineServices) -> Self {
        Self { services }
    }

    /// Policy the receipt is sent with: the pull's own policy, or one built
    /// from the reply settings
    fn reply_policy(
        context: &MessagingContext,
        pmode: &ReceivingPMode,
        via_pull: bool,
    ) -> Result<SendingPMode, StepError> {
        if via_pull {
            if let Some(pull_pmode) = &context.sending_pmode {
                if pull_pmode.push_configuration.url.is_some() {
                    return Ok(pull_pmode.clone());
                }
            }
        }
        let reply_url = pmode.reply_handling.reply_url.clone().ok_or_else(|| {
            StepError::validation(format!(
                "receiving policy {} asks for receipts but has no reply url",
                pmode.id
            ))
        })?;
        let mut reply = SendingPMode::new(pmode.id.clone());
        reply.push_configuration.url = Some(reply_url);
        reply.push_configuration.method = pmode.reply_handling.reply_method.clone();
        Ok(reply)
    }
}

#[async_trait]
impl Step for CreateReceiptStep {
    fn name(&self) -> &'static str {
        "create_receipt"
    }

    async fn execute(
        &self,
        context: &mut MessagingContext,
        cancel: &CancellationToken,
    ) -> Result<StepResult, StepError> {
        let Some(pmode) = context.receiving_pmode.clone() else {
            return Ok(StepResult::Continue);
        };
        if !pmode.reply_handling.send_receipt {
            return Ok(StepResult::Continue);
        }
        let answered: Vec<InMessage> = context
            .stored_in_messages
            .iter()
            .filter(|m| m.ebms_message_type == MessageType::UserMessage)
            .cloned()
            .collect();
        if answered.is_empty() {
            return Ok(StepResult::Continue);
        }

        let via_pull = context
            .received_message
            .as_ref()
            .is_some_and(|r| r.via_pull);
        let reply = Self::reply_policy(context, &pmode, via_pull)?;
        let reply_url = reply
            .push_configuration
            .url
            .clone()
            .ok_or(StepError::MissingContext("reply url"))?;

        for user in answered {
            ensure_active(cancel)?;
            let receipt = Receipt::for_message(user.ebms_message_id());
            let receipt_id = receipt.message_id.clone();
            let body = As4Message::single(MessageUnit::Receipt(receipt));
            let location = save_message(&self.services, &outbound_key(&receipt_id), &body).await?;

            let (operation, mep) = if via_pull {
                (Operation::ToBePiggyBacked, MessageExchangePattern::Pull)
            } else {
                (Operation::ToBeSent, MessageExchangePattern::Push)
            };
            let mpc = user
                .mpc
                .clone()
                .unwrap_or_else(|| system::DEFAULT_MPC.to_string());

            let out = OutMessage::new(receipt_id)
                .with_ref_to_message_id(user.ebms_message_id())
                .with_message_type(MessageType::Receipt)
                .with_sending_pmode(&reply)?
                .with_operation(operation)
                .with_status(OutStatus::Created)
                .with_mpc(mpc)
                .with_url(reply_url.clone())
                .with_mep(mep)
                .with_location(location);
            let stored = self.services.store.insert_out_message(out).await?;
            debug!(
                ebms_message_id = stored.ebms_message_id(),
                ref_to = user.ebms_message_id(),
                operation = %stored.operation,
                "Receipt created"
            );
        }
        Ok(StepResult::Continue)
    }
}
