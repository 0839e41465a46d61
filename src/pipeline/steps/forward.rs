use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{ensure_active, save_message};
use crate::collaborators::outbound_key;
use crate::logging::log_message_operation;
use crate::models::{OutMessage, RetryTarget};
use crate::pipeline::context::MessagingContext;
use crate::pipeline::errors::StepError;
use crate::pipeline::services::PipelineServices;
use crate::pipeline::step::{Step, StepResult};
use crate::state_machine::{Operation, OperationEvent, OutStatus, StateMachineError};
use crate::store::StoreError;

/// Pass a received user message on under the forwarding sending policy
///
/// The OutMessage keeps the ebMS message id; a retry after a crash finds the
/// OutMessage already stored and only completes the InMessage.
pub struct ForwardMessageStep {
    services: PipelineServices,
}

impl ForwardMessageStep {
    pub fn new(services: PipelineServices) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Step for ForwardMessageStep {
    fn name(&self) -> &'static str {
        "forward_message"
    }

    async fn execute(
        &self,
        context: &mut MessagingContext,
        cancel: &CancellationToken,
    ) -> Result<StepResult, StepError> {
        let message = context.in_message()?.clone();
        let receiving = context.receiving()?;
        let pmode_id = receiving
            .message_handling
            .forward
            .sending_pmode_id
            .clone()
            .ok_or(StepError::MissingContext("forwarding policy"))?;
        let pmode = self.services.policies.sending_pmode(&pmode_id)?;
        let as4 = context.as4()?;
        let user = as4
            .primary_user_message()
            .ok_or(StepError::MissingContext("user message"))?;

        ensure_active(cancel)?;
        let location =
            save_message(&self.services, &outbound_key(message.ebms_message_id()), as4).await?;

        let mut out = OutMessage::new(message.ebms_message_id())
            .with_sending_pmode(&pmode)?
            .with_operation(Operation::ToBeProcessed)
            .with_status(OutStatus::Submitted)
            .with_mpc(user.mpc.clone())
            .with_mep(pmode.mep)
            .with_location(location);
        if let Some(url) = &pmode.push_configuration.url {
            out = out.with_url(url.clone());
        }
        if let Some(ref_to) = &message.ebms_ref_to_message_id {
            out = out.with_ref_to_message_id(ref_to.clone());
        }
        out.from_party = message.from_party.clone();
        out.to_party = message.to_party.clone();
        out.conversation_id = message.conversation_id.clone();

        let forwarded_id = match self.services.store.insert_out_message(out).await {
            Ok(stored) => stored.id,
            Err(StoreError::Duplicate { .. }) => self
                .services
                .store
                .find_out_message_by_ebms_id(message.ebms_message_id())
                .await?
                .map(|m| m.id)
                .ok_or_else(|| {
                    StoreError::Conflict(format!(
                        "forwarded copy of {} vanished",
                        message.ebms_message_id()
                    ))
                })?,
            Err(e) => return Err(e.into()),
        };

        let target = RetryTarget::InMessage(message.id);
        if !self
            .services
            .store
            .transition(target, Operation::Forwarding, OperationEvent::Complete)
            .await?
        {
            return Err(StateMachineError::Internal(format!(
                "{target} left forwarding while it was being forwarded"
            ))
            .into());
        }

        log_message_operation(
            "forwarded",
            "in_message",
            Some(message.id),
            Some(message.ebms_message_id()),
            &Operation::Forwarded.to_string(),
            Some(&format!("out_message#{forwarded_id} via {pmode_id}")),
        );
        Ok(StepResult::Continue)
    }
}
