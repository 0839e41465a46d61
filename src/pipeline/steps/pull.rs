//! Pull pipeline: pull request out (with an optional piggybacked signal),
//! pulled message in.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::receive::transform_inbound;
use super::{ensure_active, load_message, transmit};
use crate::logging::log_error;
use crate::models::{OutMessage, ReceivedMessage, RetryTarget};
use crate::piggyback::{PiggybackCriteria, PiggybackSelector};
use crate::pipeline::context::MessagingContext;
use crate::pipeline::errors::StepError;
use crate::pipeline::services::PipelineServices;
use crate::pipeline::step::{Step, StepResult};
use crate::state_machine::{Operation, OperationEvent};

/// Hand a piggybacked signal back so a later pull can take it
async fn release_signal(services: &PipelineServices, signal: &OutMessage) {
    let result = services
        .store
        .transition(
            RetryTarget::OutMessage(signal.id),
            Operation::Sending,
            OperationEvent::Release(Operation::ToBePiggyBacked),
        )
        .await;
    if let Err(e) = result {
        log_error(
            "pull",
            "release_signal",
            &e.to_string(),
            Some(signal.ebms_message_id()),
        );
    }
}

pub struct SelectPiggybackSignalStep {
    services: PipelineServices,
}

impl SelectPiggybackSignalStep {
    pub fn new(services: PipelineServices) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Step for SelectPiggybackSignalStep {
    fn name(&self) -> &'static str {
        "select_piggyback_signal"
    }

    async fn execute(
        &self,
        context: &mut MessagingContext,
        cancel: &CancellationToken,
    ) -> Result<StepResult, StepError> {
        let pmode = context.sending()?;
        let pull_request = context
            .as4()?
            .pull_request()
            .ok_or(StepError::MissingContext("pull request"))?;
        let Some(criteria) = PiggybackCriteria::for_pull(pull_request, pmode) else {
            return Ok(StepResult::Continue);
        };

        ensure_active(cancel)?;
        let Some(signal) = self.services.piggyback.select(&criteria).await? else {
            return Ok(StepResult::Continue);
        };

        let Some(location) = signal.message_location.clone() else {
            warn!(
                ebms_message_id = signal.ebms_message_id(),
                "Selected signal has no stored body; sending the pull request alone"
            );
            release_signal(&self.services, &signal).await;
            return Ok(StepResult::Continue);
        };
        let signal_message = match load_message(&self.services, &location).await {
            Ok(message) => message,
            Err(e) => {
                release_signal(&self.services, &signal).await;
                return Err(e);
            }
        };

        let pull = context
            .as4_message
            .take()
            .ok_or(StepError::MissingContext("pull request"))?;
        context.as4_message = Some(PiggybackSelector::bundle(pull, Some(signal_message)));
        context.piggybacked = Some(signal);
        Ok(StepResult::Continue)
    }
}

/// Send the (possibly bundled) pull request
///
/// A failed pull is not an entity failure: any piggybacked signal goes back
/// to `ToBePiggyBacked` and the next poll tries again.
pub struct SendPullRequestStep {
    services: PipelineServices,
}

impl SendPullRequestStep {
    pub fn new(services: PipelineServices) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Step for SendPullRequestStep {
    fn name(&self) -> &'static str {
        "send_pull_request"
    }

    async fn execute(
        &self,
        context: &mut MessagingContext,
        cancel: &CancellationToken,
    ) -> Result<StepResult, StepError> {
        let pmode = context.sending()?.clone();
        let envelope = context.as4()?.to_envelope()?;

        if let Err(e) = ensure_active(cancel) {
            if let Some(signal) = &context.piggybacked {
                release_signal(&self.services, signal).await;
            }
            return Err(e);
        }

        let result = transmit(&self.services.senders, pmode.send_method().as_ref(), &envelope).await;

        if !result.outcome.is_success() {
            warn!(
                pmode_id = %pmode.id,
                outcome = %result.outcome,
                "Pull request failed"
            );
            if let Some(signal) = &context.piggybacked {
                release_signal(&self.services, signal).await;
            }
            return Ok(StepResult::Stop);
        }

        if let Some(signal) = &context.piggybacked {
            self.services
                .store
                .transition(
                    RetryTarget::OutMessage(signal.id),
                    Operation::Sending,
                    OperationEvent::Complete,
                )
                .await?;
            info!(
                ebms_message_id = signal.ebms_message_id(),
                "Piggybacked signal sent"
            );
        }

        context.response = result.response;
        if context.response.is_none() {
            debug!(pmode_id = %pmode.id, "Pull request returned no response");
            return Ok(StepResult::Stop);
        }
        Ok(StepResult::Continue)
    }
}

/// Turn the pull response into the in-flight message; an empty MPC ends the run
pub struct HandlePullResponseStep {
    services: PipelineServices,
}

impl HandlePullResponseStep {
    pub fn new(services: PipelineServices) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Step for HandlePullResponseStep {
    fn name(&self) -> &'static str {
        "handle_pull_response"
    }

    async fn execute(
        &self,
        context: &mut MessagingContext,
        _cancel: &CancellationToken,
    ) -> Result<StepResult, StepError> {
        let Some(response) = context.response.take() else {
            return Ok(StepResult::Stop);
        };
        let received = ReceivedMessage {
            content_type: response.content_type,
            body: response.body,
            pmode_id_hint: None,
            via_pull: true,
        };
        let pulled = transform_inbound(&self.services, &received)?;
        if pulled.is_empty_pull_response() {
            debug!("Nothing waiting on the MPC");
            return Ok(StepResult::Stop);
        }

        context.received_message = Some(received);
        context.as4_message = Some(pulled);
        Ok(StepResult::Continue)
    }
}
