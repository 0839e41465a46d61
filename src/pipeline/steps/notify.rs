use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{ensure_active, transmit};
use crate::constants::{MessageType, RetryType};
use crate::models::{HasOperation, MessageUnit, NotifyEnvelope};
use crate::pipeline::context::{ContextEntity, MessagingContext};
use crate::pipeline::errors::StepError;
use crate::pipeline::services::PipelineServices;
use crate::pipeline::step::{Step, StepResult};
use crate::pmode::Method;
use crate::retry::RetryDecision;

/// Tell the business application about a receipt, an error or an exception
///
/// Receipts and errors notify the producer of the message they answer, using
/// that message's sending policy. Exceptions use the policy stored with them.
pub struct NotifyStep {
    services: PipelineServices,
}

impl NotifyStep {
    pub fn new(services: PipelineServices) -> Self {
        Self { services }
    }

    async fn signal_notification(
        &self,
        context: &MessagingContext,
    ) -> Result<(NotifyEnvelope, Option<Method>), StepError> {
        let signal = context.in_message()?;
        let original = match signal.ebms_ref_to_message_id.as_deref() {
            Some(ref_to) => self.services.store.find_out_message_by_ebms_id(ref_to).await?,
            None => None,
        };
        let pmode = original.map(|m| m.sending_pmode()).transpose()?.flatten();

        let is_receipt = signal.ebms_message_type == MessageType::Receipt;
        let method = pmode.and_then(|p| {
            if is_receipt {
                p.receipt_handling.notify_method
            } else {
                p.error_handling.notify_method
            }
        });

        let description = context.as4_message.as_ref().and_then(|m| {
            let details: Vec<String> = m
                .units
                .iter()
                .filter_map(|u| match u {
                    MessageUnit::Error(e) => Some(e),
                    _ => None,
                })
                .flat_map(|e| e.errors.iter())
                .map(|d| format!("{}: {}", d.code, d.short_description))
                .collect();
            (!details.is_empty()).then(|| details.join("; "))
        });

        let envelope = NotifyEnvelope {
            ebms_message_id: signal.ebms_message_id().to_string(),
            ref_to_message_id: signal.ebms_ref_to_message_id.clone(),
            kind: signal.ebms_message_type.to_string(),
            description,
        };
        Ok((envelope, method))
    }

    fn exception_notification(
        context: &MessagingContext,
        entity: &ContextEntity,
    ) -> Result<(NotifyEnvelope, Option<Method>), StepError> {
        let (ref_to, text, method) = match entity {
            ContextEntity::InException(e) => (
                e.ebms_ref_to_message_id.clone(),
                e.exception.clone(),
                context
                    .receiving_pmode
                    .as_ref()
                    .and_then(|p| p.exception_handling.notify_method.clone()),
            ),
            ContextEntity::OutException(e) => (
                e.ebms_ref_to_message_id.clone(),
                e.exception.clone(),
                context
                    .sending_pmode
                    .as_ref()
                    .and_then(|p| p.exception_handling.notify_method.clone()),
            ),
            _ => return Err(StepError::MissingContext("exception record")),
        };
        let envelope = NotifyEnvelope {
            ebms_message_id: format!("{}-{}", entity.entity_kind(), entity.entity_id()),
            ref_to_message_id: ref_to,
            kind: "exception".to_string(),
            description: Some(text),
        };
        Ok((envelope, method))
    }
}

#[async_trait]
impl Step for NotifyStep {
    fn name(&self) -> &'static str {
        "notify"
    }

    async fn execute(
        &self,
        context: &mut MessagingContext,
        cancel: &CancellationToken,
    ) -> Result<StepResult, StepError> {
        let entity = context
            .entity
            .clone()
            .ok_or(StepError::MissingContext("claimed entity"))?;
        let (notification, method) = match &entity {
            ContextEntity::InMessage(_) => self.signal_notification(context).await?,
            ContextEntity::OutMessage(_) => {
                return Err(StepError::MissingContext("notifiable entity"))
            }
            exception => Self::exception_notification(context, exception)?,
        };
        let envelope = notification.to_envelope()?;

        ensure_active(cancel)?;
        let result = transmit(&self.services.senders, method.as_ref(), &envelope).await;

        let applied = self
            .services
            .retry
            .apply(entity.target(), RetryType::Notification, result.outcome)
            .await?;
        match applied.decision {
            RetryDecision::DeadLetter if applied.applied => Err(StepError::DeadLettered {
                ebms_message_id: notification.ebms_message_id,
                reason: format!("notification ended with {}", result.outcome),
            }),
            RetryDecision::Complete if applied.applied => {
                info!(target = %entity.target(), kind = %notification.kind, "Notified");
                Ok(StepResult::Continue)
            }
            _ => Ok(StepResult::Continue),
        }
    }
}
