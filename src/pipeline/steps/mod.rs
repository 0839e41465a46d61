//! Concrete pipeline steps, grouped by the agent that runs them.

pub mod deliver;
pub mod forward;
pub mod load;
pub mod notify;
pub mod processing;
pub mod pull;
pub mod receive;
pub mod send;
pub mod submit;

pub use deliver::DeliverMessageStep;
pub use forward::ForwardMessageStep;
pub use load::LoadEntityStep;
pub use notify::NotifyStep;
pub use processing::{EncryptStep, SignStep, StoreSecuredBodyStep};
pub use pull::{HandlePullResponseStep, SelectPiggybackSignalStep, SendPullRequestStep};
pub use receive::{
    CreateReceiptStep, DetermineReceivingPModeStep, SaveReceivedMessageStep,
    TransformReceivedMessageStep,
};
pub use send::SendMessageStep;
pub use submit::{
    CreateAs4MessageStep, RetrieveSendingPModeStep, StoreOutMessageStep, ValidateSubmitStep,
};

use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::errors::StepError;
use super::services::PipelineServices;
use crate::collaborators::{SendResult, SenderRegistry};
use crate::models::{As4Message, Envelope};
use crate::pmode::Method;

/// Refuse to start new I/O once cancellation was requested
pub(crate) fn ensure_active(cancel: &CancellationToken) -> Result<(), StepError> {
    if cancel.is_cancelled() {
        Err(StepError::Cancelled)
    } else {
        Ok(())
    }
}

/// Store `message` as JSON under `key`, returning its location
pub(crate) async fn save_message(
    services: &PipelineServices,
    key: &str,
    message: &As4Message,
) -> Result<String, StepError> {
    let body = serde_json::to_vec(message)?;
    Ok(services.body_store.save(key, &body).await?)
}

pub(crate) async fn load_message(
    services: &PipelineServices,
    location: &str,
) -> Result<As4Message, StepError> {
    let body = services.body_store.load(location).await?;
    Ok(serde_json::from_slice(&body)?)
}

/// Send through the registered transport for `method`
///
/// A missing or unusable method can never succeed, so it is reported as a
/// fatal outcome rather than an error.
pub(crate) async fn transmit(
    senders: &SenderRegistry,
    method: Option<&Method>,
    envelope: &Envelope,
) -> SendResult {
    let Some(method) = method else {
        warn!(ebms_message_id = %envelope.ebms_message_id, "No transport method configured");
        return SendResult::fatal();
    };
    match senders.resolve(method) {
        Ok(sender) => sender.send(envelope).await,
        Err(e) => {
            warn!(
                ebms_message_id = %envelope.ebms_message_id,
                method_type = %method.method_type,
                error = %e,
                "Sender could not be resolved"
            );
            SendResult::fatal()
        }
    }
}
