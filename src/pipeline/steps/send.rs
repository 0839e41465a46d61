use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{ensure_active, transmit};
use crate::constants::RetryType;
use crate::models::{ReceivedMessage, RetryTarget};
use crate::pipeline::context::MessagingContext;
use crate::pipeline::errors::StepError;
use crate::pipeline::services::PipelineServices;
use crate::pipeline::step::{Step, StepResult};
use crate::retry::RetryDecision;

/// Transmit a claimed OutMessage and commit the retry decision
///
/// A synchronous reply is handed on as a received message; without one the
/// pipeline ends here.
pub struct SendMessageStep {
    services: PipelineServices,
}

impl SendMessageStep {
    pub fn new(services: PipelineServices) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Step for SendMessageStep {
    fn name(&self) -> &'static str {
        "send_message"
    }

    async fn execute(
        &self,
        context: &mut MessagingContext,
        cancel: &CancellationToken,
    ) -> Result<StepResult, StepError> {
        let message = context.out_message()?.clone();
        let pmode = context.sending()?.clone();
        let envelope = context.as4()?.to_envelope()?;

        ensure_active(cancel)?;
        let result = transmit(
            &self.services.senders,
            pmode.send_method().as_ref(),
            &envelope,
        )
        .await;

        let target = RetryTarget::OutMessage(message.id);
        let applied = self
            .services
            .retry
            .apply(target, RetryType::Send, result.outcome)
            .await?;
        if !applied.applied {
            return Ok(StepResult::Stop);
        }

        match applied.decision {
            RetryDecision::Complete => {
                info!(ebms_message_id = message.ebms_message_id(), "Message sent");
                self.services.reception.track(&message, &pmode).await?;
                match result.response {
                    Some(response) => {
                        debug!(
                            ebms_message_id = message.ebms_message_id(),
                            "Processing synchronous response"
                        );
                        context.received_message = Some(ReceivedMessage {
                            content_type: response.content_type,
                            body: response.body,
                            pmode_id_hint: None,
                            via_pull: false,
                        });
                        Ok(StepResult::Continue)
                    }
                    None => Ok(StepResult::Stop),
                }
            }
            RetryDecision::Retry { .. } => Ok(StepResult::Stop),
            RetryDecision::DeadLetter => Err(StepError::DeadLettered {
                ebms_message_id: message.ebms_message_id().to_string(),
                reason: format!("send ended with {}", result.outcome),
            }),
        }
    }
}
