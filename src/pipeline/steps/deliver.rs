use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{ensure_active, transmit};
use crate::constants::RetryType;
use crate::models::{DeliveryEnvelope, RetryTarget};
use crate::pipeline::context::MessagingContext;
use crate::pipeline::errors::StepError;
use crate::pipeline::services::PipelineServices;
use crate::pipeline::step::{Step, StepResult};
use crate::retry::RetryDecision;

/// Hand a received user message to the business application
pub struct DeliverMessageStep {
    services: PipelineServices,
}

impl DeliverMessageStep {
    pub fn new(services: PipelineServices) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Step for DeliverMessageStep {
    fn name(&self) -> &'static str {
        "deliver_message"
    }

    async fn execute(
        &self,
        context: &mut MessagingContext,
        cancel: &CancellationToken,
    ) -> Result<StepResult, StepError> {
        let message = context.in_message()?;
        let pmode = context.receiving()?;
        let user = context
            .as4()?
            .primary_user_message()
            .ok_or(StepError::MissingContext("user message"))?;

        let envelope = DeliveryEnvelope {
            ebms_message_id: message.ebms_message_id().to_string(),
            ref_to_message_id: message.ebms_ref_to_message_id.clone(),
            payloads: user.payloads.clone(),
        }
        .to_envelope()?;

        ensure_active(cancel)?;
        let result = transmit(
            &self.services.senders,
            pmode.message_handling.deliver.delivery_method.as_ref(),
            &envelope,
        )
        .await;

        let applied = self
            .services
            .retry
            .apply(
                RetryTarget::InMessage(message.id),
                RetryType::Delivery,
                result.outcome,
            )
            .await?;

        match applied.decision {
            RetryDecision::DeadLetter if applied.applied => Err(StepError::DeadLettered {
                ebms_message_id: message.ebms_message_id().to_string(),
                reason: format!("delivery ended with {}", result.outcome),
            }),
            RetryDecision::Complete if applied.applied => {
                info!(ebms_message_id = message.ebms_message_id(), "Message delivered");
                Ok(StepResult::Continue)
            }
            _ => Ok(StepResult::Continue),
        }
    }
}
