use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{ensure_active, load_message};
use crate::pipeline::context::{ContextEntity, MessagingContext};
use crate::pipeline::errors::StepError;
use crate::pipeline::services::PipelineServices;
use crate::pipeline::step::{Step, StepResult};
use crate::pmode::{ReceivingPMode, SendingPMode};
use crate::state_machine::{ExpectedOperationGuard, Stage, StateGuard};

/// First step of every claiming agent
///
/// Checks the claimed entity is in the stage's in-progress Operation, then
/// restores its policy mode and, for messages, the stored AS4 message.
pub struct LoadEntityStep {
    services: PipelineServices,
    stage: Stage,
}

impl LoadEntityStep {
    pub fn new(services: PipelineServices, stage: Stage) -> Self {
        Self { services, stage }
    }

    fn sending_pmode(
        &self,
        data: Option<&str>,
        id: Option<&str>,
    ) -> Result<Option<SendingPMode>, StepError> {
        if let Some(data) = data {
            return Ok(Some(serde_json::from_str(data)?));
        }
        id.map(|id| self.services.policies.sending_pmode(id))
            .transpose()
            .map_err(StepError::from)
    }

    fn receiving_pmode(
        &self,
        data: Option<&str>,
        id: Option<&str>,
    ) -> Result<Option<ReceivingPMode>, StepError> {
        if let Some(data) = data {
            return Ok(Some(serde_json::from_str(data)?));
        }
        id.map(|id| self.services.policies.receiving_pmode(id))
            .transpose()
            .map_err(StepError::from)
    }
}

#[async_trait]
impl Step for LoadEntityStep {
    fn name(&self) -> &'static str {
        "load_entity"
    }

    async fn execute(
        &self,
        context: &mut MessagingContext,
        cancel: &CancellationToken,
    ) -> Result<StepResult, StepError> {
        let entity = context
            .entity
            .as_ref()
            .ok_or(StepError::MissingContext("claimed entity"))?;
        ExpectedOperationGuard::claimed_by(self.stage).check(entity)?;

        let location = match entity {
            ContextEntity::OutMessage(m) => {
                context.sending_pmode =
                    self.sending_pmode(m.pmode_data.as_deref(), m.pmode_id.as_deref())?;
                m.message_location.clone()
            }
            ContextEntity::InMessage(m) => {
                context.receiving_pmode =
                    self.receiving_pmode(m.pmode_data.as_deref(), m.pmode_id.as_deref())?;
                m.message_location.clone()
            }
            ContextEntity::OutException(e) => {
                context.sending_pmode = self.sending_pmode(e.pmode_data.as_deref(), None)?;
                None
            }
            ContextEntity::InException(e) => {
                context.receiving_pmode = self.receiving_pmode(e.pmode_data.as_deref(), None)?;
                None
            }
        };

        if let Some(location) = location {
            ensure_active(cancel)?;
            context.as4_message = Some(load_message(&self.services, &location).await?);
        }
        debug!(stage = %self.stage, "Claimed entity loaded");
        Ok(StepResult::Continue)
    }
}
