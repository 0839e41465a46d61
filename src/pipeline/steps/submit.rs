//! Submit pipeline: business payload in, `ToBeProcessed` OutMessage out.

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{ensure_active, save_message};
use crate::collaborators::outbound_key;
use crate::constants::generate_ebms_message_id;
use crate::logging::log_message_operation;
use crate::models::{As4Message, MessageUnit, OutMessage, UserMessage};
use crate::pipeline::context::{ContextEntity, MessagingContext};
use crate::pipeline::errors::StepError;
use crate::pipeline::services::PipelineServices;
use crate::pipeline::step::{Step, StepResult};
use crate::state_machine::errors::business_rule_violation;
use crate::state_machine::{Operation, OutStatus};
use crate::store::StoreError;

/// Resolve the sending policy named by the submission
pub struct RetrieveSendingPModeStep {
    services: PipelineServices,
}

impl RetrieveSendingPModeStep {
    pub fn new(services: PipelineServices) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Step for RetrieveSendingPModeStep {
    fn name(&self) -> &'static str {
        "retrieve_sending_pmode"
    }

    async fn execute(
        &self,
        context: &mut MessagingContext,
        _cancel: &CancellationToken,
    ) -> Result<StepResult, StepError> {
        let submit = context
            .submit_message
            .as_ref()
            .ok_or(StepError::MissingContext("submit message"))?;
        let pmode = self.services.policies.sending_pmode(&submit.pmode_id)?;
        context.sending_pmode = Some(pmode);
        Ok(StepResult::Continue)
    }
}

/// Reject submissions that override values the policy fixes
pub struct ValidateSubmitStep;

impl ValidateSubmitStep {
    fn check(field: &str, submitted: Option<&str>, fixed: Option<&str>) -> Result<(), StepError> {
        match (submitted, fixed) {
            (Some(submitted), Some(fixed)) if submitted != fixed => Err(business_rule_violation(
                format!("submit message may not override {field} ('{fixed}' → '{submitted}')"),
            )
            .into()),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl Step for ValidateSubmitStep {
    fn name(&self) -> &'static str {
        "validate_submit"
    }

    async fn execute(
        &self,
        context: &mut MessagingContext,
        _cancel: &CancellationToken,
    ) -> Result<StepResult, StepError> {
        let submit = context
            .submit_message
            .as_ref()
            .ok_or(StepError::MissingContext("submit message"))?;
        let pmode = context.sending()?;

        if submit.message_id.as_deref().is_some_and(str::is_empty) {
            return Err(StepError::validation("submitted message id is empty"));
        }

        if !pmode.allow_override {
            let packaging = &pmode.message_packaging;
            Self::check("mpc", submit.mpc.as_deref(), packaging.mpc.as_deref())?;
            Self::check(
                "from party",
                submit.from_party.as_deref(),
                packaging.from_party.as_deref(),
            )?;
            Self::check(
                "to party",
                submit.to_party.as_deref(),
                packaging.to_party.as_deref(),
            )?;
            Self::check(
                "conversation id",
                submit.conversation_id.as_deref(),
                packaging.conversation_id.as_deref(),
            )?;
        }
        Ok(StepResult::Continue)
    }
}

/// Build the AS4 user message from submission and policy
pub struct CreateAs4MessageStep;

#[async_trait]
impl Step for CreateAs4MessageStep {
    fn name(&self) -> &'static str {
        "create_as4_message"
    }

    async fn execute(
        &self,
        context: &mut MessagingContext,
        _cancel: &CancellationToken,
    ) -> Result<StepResult, StepError> {
        let submit = context
            .submit_message
            .as_ref()
            .ok_or(StepError::MissingContext("submit message"))?;
        let pmode = context.sending()?;
        let packaging = &pmode.message_packaging;

        let user_message = UserMessage {
            message_id: submit
                .message_id
                .clone()
                .unwrap_or_else(generate_ebms_message_id),
            ref_to_message_id: submit.ref_to_message_id.clone(),
            timestamp: Utc::now(),
            mpc: submit
                .mpc
                .clone()
                .unwrap_or_else(|| pmode.mpc().to_string()),
            from_party: submit
                .from_party
                .clone()
                .or_else(|| packaging.from_party.clone()),
            to_party: submit.to_party.clone().or_else(|| packaging.to_party.clone()),
            conversation_id: submit
                .conversation_id
                .clone()
                .or_else(|| packaging.conversation_id.clone()),
            payloads: submit.payloads.clone(),
        };
        debug!(ebms_message_id = %user_message.message_id, "AS4 user message created");
        context.as4_message = Some(As4Message::single(MessageUnit::UserMessage(user_message)));
        Ok(StepResult::Continue)
    }
}

/// Persist the body and the `ToBeProcessed` OutMessage
pub struct StoreOutMessageStep {
    services: PipelineServices,
}

impl StoreOutMessageStep {
    pub fn new(services: PipelineServices) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Step for StoreOutMessageStep {
    fn name(&self) -> &'static str {
        "store_out_message"
    }

    async fn execute(
        &self,
        context: &mut MessagingContext,
        cancel: &CancellationToken,
    ) -> Result<StepResult, StepError> {
        let pmode = context.sending()?;
        let as4 = context.as4()?;
        let user_message = as4
            .primary_user_message()
            .ok_or(StepError::MissingContext("user message"))?;
        let ebms_message_id = user_message.message_id.clone();

        ensure_active(cancel)?;
        if self
            .services
            .store
            .find_out_message_by_ebms_id(&ebms_message_id)
            .await?
            .is_some()
        {
            return Err(StepError::validation(format!(
                "message {ebms_message_id} was already submitted"
            )));
        }

        let location = save_message(&self.services, &outbound_key(&ebms_message_id), as4).await?;

        let mut message = OutMessage::new(ebms_message_id.clone())
            .with_sending_pmode(pmode)?
            .with_operation(Operation::ToBeProcessed)
            .with_status(OutStatus::Submitted)
            .with_mpc(user_message.mpc.clone())
            .with_mep(pmode.mep)
            .with_location(location);
        if let Some(url) = &pmode.push_configuration.url {
            message = message.with_url(url.clone());
        }
        if let Some(ref_to) = &user_message.ref_to_message_id {
            message = message.with_ref_to_message_id(ref_to.clone());
        }
        message.from_party = user_message.from_party.clone();
        message.to_party = user_message.to_party.clone();
        message.conversation_id = user_message.conversation_id.clone();

        let stored = match self.services.store.insert_out_message(message).await {
            Ok(stored) => stored,
            Err(StoreError::Duplicate { .. }) => {
                return Err(StepError::validation(format!(
                    "message {ebms_message_id} was already submitted"
                )))
            }
            Err(e) => return Err(e.into()),
        };

        log_message_operation(
            "submitted",
            "out_message",
            Some(stored.id),
            Some(stored.ebms_message_id()),
            &stored.operation.to_string(),
            stored.pmode_id.as_deref(),
        );
        context.entity = Some(ContextEntity::OutMessage(stored));
        Ok(StepResult::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SubmitMessage;
    use crate::pmode::SendingPMode;

    fn context(submit: SubmitMessage, pmode: SendingPMode) -> MessagingContext {
        let mut ctx = MessagingContext::for_submit(submit);
        ctx.sending_pmode = Some(pmode);
        ctx
    }

    fn fixed_mpc_pmode() -> SendingPMode {
        let mut pmode = SendingPMode::new("pm-1");
        pmode.message_packaging.mpc = Some("mpc-fixed".to_string());
        pmode
    }

    #[tokio::test]
    async fn test_override_of_fixed_value_is_rejected() {
        let submit = SubmitMessage {
            pmode_id: "pm-1".into(),
            mpc: Some("mpc-other".into()),
            ..Default::default()
        };
        let mut ctx = context(submit, fixed_mpc_pmode());

        let err = ValidateSubmitStep
            .execute(&mut ctx, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::Validation(reason) if reason.contains("mpc")));
    }

    #[tokio::test]
    async fn test_override_allowed_by_policy() {
        let submit = SubmitMessage {
            pmode_id: "pm-1".into(),
            mpc: Some("mpc-other".into()),
            ..Default::default()
        };
        let mut pmode = fixed_mpc_pmode();
        pmode.allow_override = true;
        let mut ctx = context(submit, pmode);

        let result = ValidateSubmitStep
            .execute(&mut ctx, &CancellationToken::new())
            .await;
        assert_eq!(result, Ok(StepResult::Continue));
    }

    #[tokio::test]
    async fn test_user_message_takes_policy_defaults() {
        let submit = SubmitMessage {
            pmode_id: "pm-1".into(),
            message_id: Some("given@test".into()),
            ..Default::default()
        };
        let mut ctx = context(submit, fixed_mpc_pmode());

        CreateAs4MessageStep
            .execute(&mut ctx, &CancellationToken::new())
            .await
            .unwrap();
        let user = ctx.as4().unwrap().primary_user_message().unwrap().clone();
        assert_eq!(user.message_id, "given@test");
        assert_eq!(user.mpc, "mpc-fixed");
    }
}
