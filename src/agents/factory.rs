use std::sync::Arc;
use tracing::info;

use super::agent::{Agent, PollingAgent};
use super::pull::PullRequestAgent;
use super::receiver::{EntitySource, OperationReceiver};
use super::sweep::{ReceptionAwarenessAgent, RetrySweepAgent};
use crate::config::{AgentSettings, RelayConfig};
use crate::pipeline::{Direction, PipelineKind, PipelineServices};
use crate::state_machine::Operation;

/// Builds the relay's agents from configuration
#[derive(Debug, Clone)]
pub struct AgentFactory {
    config: RelayConfig,
    services: PipelineServices,
}

impl AgentFactory {
    pub fn new(config: RelayConfig, services: PipelineServices) -> Self {
        Self { config, services }
    }

    /// Accepts submissions; driven by the caller, never polled
    pub fn submit_agent(&self) -> Agent {
        Agent::new(
            "submit",
            PipelineKind::Submit.build(&self.services),
            AgentSettings::default(),
        )
    }

    /// Accepts pushed inbound messages; driven by the caller, never polled
    pub fn receive_agent(&self) -> Agent {
        Agent::new(
            "receive",
            PipelineKind::Receive.build(&self.services),
            AgentSettings::default(),
        )
    }

    fn operation_agent(
        &self,
        name: &str,
        kind: PipelineKind,
        source: EntitySource,
        from: Operation,
        settings: &AgentSettings,
    ) -> Agent {
        let receiver = OperationReceiver::new(self.services.store.clone(), source, from);
        Agent::new(name, kind.build(&self.services), settings.clone())
            .with_receiver(Arc::new(receiver))
    }

    /// Every enabled agent that claims its own work
    pub fn polling_agents(&self) -> Vec<Arc<dyn PollingAgent>> {
        let agents = &self.config.agents;
        let mut built: Vec<Arc<dyn PollingAgent>> = Vec::new();

        if agents.processing.enabled {
            built.push(Arc::new(self.operation_agent(
                "processing",
                PipelineKind::Processing,
                EntitySource::OutMessages,
                Operation::ToBeProcessed,
                &agents.processing,
            )));
        }
        if agents.send.enabled {
            built.push(Arc::new(self.operation_agent(
                "send",
                PipelineKind::Send,
                EntitySource::OutMessages,
                Operation::ToBeSent,
                &agents.send,
            )));
        }
        if agents.deliver.enabled {
            built.push(Arc::new(self.operation_agent(
                "deliver",
                PipelineKind::Deliver,
                EntitySource::InMessages,
                Operation::ToBeDelivered,
                &agents.deliver,
            )));
        }
        if agents.forward.enabled {
            built.push(Arc::new(self.operation_agent(
                "forward",
                PipelineKind::Forward,
                EntitySource::InMessages,
                Operation::ToBeForwarded,
                &agents.forward,
            )));
        }
        if agents.notify.enabled {
            let notify = [
                ("notify_in_messages", Direction::Inbound, EntitySource::InMessages),
                ("notify_in_exceptions", Direction::Inbound, EntitySource::InExceptions),
                ("notify_out_exceptions", Direction::Outbound, EntitySource::OutExceptions),
            ];
            for (name, direction, source) in notify {
                built.push(Arc::new(self.operation_agent(
                    name,
                    PipelineKind::Notify(direction),
                    source,
                    Operation::ToBeNotified,
                    &agents.notify,
                )));
            }
        }
        if agents.retry_sweep.enabled {
            built.push(Arc::new(RetrySweepAgent::new(
                self.services.store.clone(),
                agents.retry_sweep.clone(),
            )));
        }
        if agents.reception_awareness.enabled {
            built.push(Arc::new(ReceptionAwarenessAgent::new(
                self.services.store.clone(),
                self.services.reception.clone(),
                agents.reception_awareness.clone(),
            )));
        }
        for pull in &self.config.pull {
            built.push(Arc::new(PullRequestAgent::new(
                self.services.clone(),
                pull.sending_pmode_id.clone(),
                pull.poll_interval(),
            )));
        }

        info!(
            agents = ?built.iter().map(|a| a.name().to_string()).collect::<Vec<_>>(),
            "Built polling agents"
        );
        built
    }
}
