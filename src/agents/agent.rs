use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::receiver::DatastoreReceiver;
use crate::config::AgentSettings;
use crate::error::Result;
use crate::logging::{log_agent_cycle, log_error};
use crate::pipeline::{ExceptionDecorator, MessagingContext, MessagingResult};

/// Counts for one poll
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AgentCycle {
    pub claimed: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl AgentCycle {
    pub fn record(&mut self, succeeded: bool) {
        self.claimed += 1;
        if succeeded {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
    }
}

/// Anything the relay schedules on a timer
#[async_trait]
pub trait PollingAgent: Send + Sync {
    fn name(&self) -> &str;

    fn poll_interval(&self) -> Duration;

    /// Claim and process one batch; entity failures are counted, not returned
    async fn poll_once(&self, cancel: &CancellationToken) -> Result<AgentCycle>;
}

/// Poll until cancelled
///
/// A failed poll is logged and the agent carries on with the next one.
pub async fn run_polling(agent: Arc<dyn PollingAgent>, cancel: CancellationToken) {
    let interval = agent.poll_interval();
    info!(agent = agent.name(), interval_ms = interval.as_millis() as u64, "Agent started");

    while !cancel.is_cancelled() {
        match agent.poll_once(&cancel).await {
            Ok(cycle) if cycle.claimed > 0 => {
                log_agent_cycle(agent.name(), cycle.claimed, cycle.succeeded, cycle.failed)
            }
            Ok(_) => {}
            Err(e) => log_error(agent.name(), "poll", &e.to_string(), None),
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    info!(agent = agent.name(), "Agent stopped");
}

/// Name, optional receiver and decorated pipeline
///
/// Agents with a receiver claim their own work when polled; agents without
/// one (submit, receive) are driven through [`Agent::execute`] only.
pub struct Agent {
    name: String,
    receiver: Option<Arc<dyn DatastoreReceiver>>,
    pipeline: ExceptionDecorator,
    settings: AgentSettings,
}

impl Agent {
    pub fn new(name: impl Into<String>, pipeline: ExceptionDecorator, settings: AgentSettings) -> Self {
        Self {
            name: name.into(),
            receiver: None,
            pipeline,
            settings,
        }
    }

    pub fn with_receiver(mut self, receiver: Arc<dyn DatastoreReceiver>) -> Self {
        self.receiver = Some(receiver);
        self
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    /// Poll until `cancel` fires
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        run_polling(self, cancel).await;
    }

    /// Run one message through the pipeline
    #[instrument(skip_all, fields(agent = %self.name))]
    pub async fn execute(
        &self,
        context: MessagingContext,
        cancel: &CancellationToken,
    ) -> MessagingResult {
        let result = self.pipeline.execute(context, cancel).await;
        if let Some(error) = &result.error {
            warn!(
                agent = %self.name,
                message_ids = ?result.context.message_ids(),
                error = %error,
                "Pipeline run failed"
            );
        }
        result
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("name", &self.name)
            .field("receiver", &self.receiver.as_ref().map(|r| r.describe()))
            .field("pipeline", &self.pipeline.name())
            .field("settings", &self.settings)
            .finish()
    }
}

#[async_trait]
impl PollingAgent for Agent {
    fn name(&self) -> &str {
        &self.name
    }

    fn poll_interval(&self) -> Duration {
        self.settings.poll_interval()
    }

    async fn poll_once(&self, cancel: &CancellationToken) -> Result<AgentCycle> {
        let Some(receiver) = &self.receiver else {
            return Ok(AgentCycle::default());
        };
        let contexts = receiver.receive(self.settings.batch_size).await?;
        if contexts.is_empty() {
            return Ok(AgentCycle::default());
        }
        debug!(agent = %self.name, claimed = contexts.len(), "Claimed work");

        let results: Vec<MessagingResult> = stream::iter(contexts)
            .map(|context| self.execute(context, cancel))
            .buffer_unordered(self.settings.concurrency.max(1))
            .collect()
            .await;

        let mut cycle = AgentCycle::default();
        for result in &results {
            cycle.record(result.succeeded);
        }
        Ok(cycle)
    }
}
