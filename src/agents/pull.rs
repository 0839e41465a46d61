use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::agent::{AgentCycle, PollingAgent};
use crate::error::Result;
use crate::models::{As4Message, MessageUnit, PullRequest};
use crate::pipeline::{ExceptionDecorator, MessagingContext, PipelineKind, PipelineServices};

/// Pulls on the MPC of one sending policy every interval
///
/// The policy is resolved on each poll so an updated policy takes effect
/// without restarting the agent.
pub struct PullRequestAgent {
    name: String,
    services: PipelineServices,
    sending_pmode_id: String,
    pipeline: ExceptionDecorator,
    interval: Duration,
}

impl PullRequestAgent {
    pub fn new(services: PipelineServices, sending_pmode_id: impl Into<String>, interval: Duration) -> Self {
        let sending_pmode_id = sending_pmode_id.into();
        let pipeline = PipelineKind::Pull.build(&services);
        Self {
            name: format!("pull[{sending_pmode_id}]"),
            services,
            sending_pmode_id,
            pipeline,
            interval,
        }
    }

    pub fn sending_pmode_id(&self) -> &str {
        &self.sending_pmode_id
    }
}

#[async_trait]
impl PollingAgent for PullRequestAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn poll_interval(&self) -> Duration {
        self.interval
    }

    async fn poll_once(&self, cancel: &CancellationToken) -> Result<AgentCycle> {
        let pmode = self.services.policies.sending_pmode(&self.sending_pmode_id)?;
        let pull = PullRequest::new(pmode.mpc());
        debug!(agent = %self.name, mpc = %pull.mpc, "Sending pull request");

        let context = MessagingContext::for_pull(
            As4Message::single(MessageUnit::PullRequest(pull)),
            pmode,
        );
        let result = self.pipeline.execute(context, cancel).await;

        let mut cycle = AgentCycle::default();
        cycle.record(result.succeeded);
        Ok(cycle)
    }
}
