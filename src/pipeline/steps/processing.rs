//! Processing pipeline: secure a submitted message and hand it to the sender.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{ensure_active, save_message};
use crate::collaborators::outbound_key;
use crate::constants::RetryType;
use crate::logging::log_message_operation;
use crate::models::RetryTarget;
use crate::pipeline::context::MessagingContext;
use crate::pipeline::errors::StepError;
use crate::pipeline::services::PipelineServices;
use crate::pipeline::step::{Step, StepResult};
use crate::state_machine::{Operation, OperationEvent, StateMachineError};

pub struct SignStep {
    services: PipelineServices,
}

impl SignStep {
    pub fn new(services: PipelineServices) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Step for SignStep {
    fn name(&self) -> &'static str {
        "sign"
    }

    async fn execute(
        &self,
        context: &mut MessagingContext,
        cancel: &CancellationToken,
    ) -> Result<StepResult, StepError> {
        let signing = context.sending()?.security.signing.clone();
        if !signing.is_enabled {
            return Ok(StepResult::Continue);
        }
        ensure_active(cancel)?;
        let message = context
            .as4_message
            .take()
            .ok_or(StepError::MissingContext("as4 message"))?;
        let signed = self
            .services
            .security
            .sign(message, signing.certificate_ref.as_deref())
            .await?;
        context.as4_message = Some(signed);
        Ok(StepResult::Continue)
    }
}

pub struct EncryptStep {
    services: PipelineServices,
}

impl EncryptStep {
    pub fn new(services: PipelineServices) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Step for EncryptStep {
    fn name(&self) -> &'static str {
        "encrypt"
    }

    async fn execute(
        &self,
        context: &mut MessagingContext,
        cancel: &CancellationToken,
    ) -> Result<StepResult, StepError> {
        let encryption = context.sending()?.security.encryption.clone();
        if !encryption.is_enabled {
            return Ok(StepResult::Continue);
        }
        ensure_active(cancel)?;
        let message = context
            .as4_message
            .take()
            .ok_or(StepError::MissingContext("as4 message"))?;
        let encrypted = self
            .services
            .security
            .encrypt(message, encryption.certificate_ref.as_deref())
            .await?;
        context.as4_message = Some(encrypted);
        Ok(StepResult::Continue)
    }
}

/// Store the secured body and move the message to `ToBeSent`
///
/// The send retry record is created here, when the first send is scheduled.
pub struct StoreSecuredBodyStep {
    services: PipelineServices,
}

impl StoreSecuredBodyStep {
    pub fn new(services: PipelineServices) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Step for StoreSecuredBodyStep {
    fn name(&self) -> &'static str {
        "store_secured_body"
    }

    async fn execute(
        &self,
        context: &mut MessagingContext,
        cancel: &CancellationToken,
    ) -> Result<StepResult, StepError> {
        let message = context.out_message()?;
        let pmode = context.sending()?;
        let as4 = context.as4()?;

        ensure_active(cancel)?;
        let location = save_message(
            &self.services,
            &outbound_key(message.ebms_message_id()),
            as4,
        )
        .await?;
        let store = &self.services.store;
        store
            .update_out_message_body(message.id, &location, as4.is_signed, as4.is_encrypted)
            .await?;

        let target = RetryTarget::OutMessage(message.id);
        self.services
            .retry
            .schedule(target, RetryType::Send, &pmode.send_reliability)
            .await?;

        if !store
            .transition(target, Operation::Processing, OperationEvent::Complete)
            .await?
        {
            return Err(StateMachineError::Internal(format!(
                "{target} left processing while it was being secured"
            ))
            .into());
        }

        debug!(signed = as4.is_signed, encrypted = as4.is_encrypted, "Secured body stored");
        log_message_operation(
            "processed",
            "out_message",
            Some(message.id),
            Some(message.ebms_message_id()),
            &Operation::ToBeSent.to_string(),
            None,
        );
        Ok(StepResult::Continue)
    }
}
