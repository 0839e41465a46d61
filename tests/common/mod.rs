#![allow(dead_code)]

pub mod builders;
pub mod transport;

pub use builders::*;
pub use transport::*;

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use as4_relay::agents::{Agent, AgentCycle, EntitySource, OperationReceiver, PollingAgent, RetrySweepAgent};
use as4_relay::collaborators::{
    InMemoryBodyStore, JsonPayloadTransformer, MarkingSecurityStrategy, SenderRegistry,
    StaticPolicyResolver,
};
use as4_relay::config::AgentSettings;
use as4_relay::models::{ReceivedMessage, SubmitMessage};
use as4_relay::pipeline::{MessagingContext, MessagingResult, PipelineKind, PipelineServices};
use as4_relay::state_machine::Operation;
use as4_relay::store::InMemoryEntityStore;

/// In-memory relay with scripted transports, driven one poll at a time
pub struct Harness {
    pub store: Arc<InMemoryEntityStore>,
    pub policies: Arc<StaticPolicyResolver>,
    pub services: PipelineServices,
    pub send: Transport,
    pub deliver: Transport,
    pub notify: Transport,
    pub cancel: CancellationToken,
}

impl Harness {
    pub fn new() -> Self {
        let store = Arc::new(InMemoryEntityStore::new());
        let policies = Arc::new(StaticPolicyResolver::new());
        let send = Transport::new("SEND");
        let deliver = Transport::new("DELIVER");
        let notify = Transport::new("NOTIFY");

        let mut senders = SenderRegistry::with_defaults();
        send.register(&mut senders);
        deliver.register(&mut senders);
        notify.register(&mut senders);

        let services = PipelineServices::new(
            store.clone(),
            policies.clone(),
            Arc::new(JsonPayloadTransformer),
            Arc::new(MarkingSecurityStrategy),
            Arc::new(InMemoryBodyStore::new()),
            Arc::new(senders),
        );

        Self {
            store,
            policies,
            services,
            send,
            deliver,
            notify,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_default_receiving_pmode(mut self, pmode_id: &str) -> Self {
        self.services = self
            .services
            .clone()
            .with_default_receiving_pmode(Some(pmode_id.to_string()));
        self
    }

    pub async fn run(&self, kind: PipelineKind, context: MessagingContext) -> MessagingResult {
        kind.build(&self.services).execute(context, &self.cancel).await
    }

    pub async fn submit(&self, message: SubmitMessage) -> MessagingResult {
        self.run(PipelineKind::Submit, MessagingContext::for_submit(message))
            .await
    }

    pub async fn receive(&self, message: ReceivedMessage) -> MessagingResult {
        self.run(PipelineKind::Receive, MessagingContext::for_received(message))
            .await
    }

    pub fn agent(&self, kind: PipelineKind, source: EntitySource, from: Operation) -> Agent {
        let receiver = OperationReceiver::new(self.store.clone(), source, from);
        Agent::new(kind.to_string(), kind.build(&self.services), AgentSettings::default())
            .with_receiver(Arc::new(receiver))
    }

    /// One poll of the agent that claims `from` in `source`
    pub async fn poll(&self, kind: PipelineKind, source: EntitySource, from: Operation) -> AgentCycle {
        self.agent(kind, source, from)
            .poll_once(&self.cancel)
            .await
            .expect("poll failed")
    }

    pub async fn poll_processing(&self) -> AgentCycle {
        self.poll(
            PipelineKind::Processing,
            EntitySource::OutMessages,
            Operation::ToBeProcessed,
        )
        .await
    }

    pub async fn poll_send(&self) -> AgentCycle {
        self.poll(PipelineKind::Send, EntitySource::OutMessages, Operation::ToBeSent)
            .await
    }

    pub async fn poll_deliver(&self) -> AgentCycle {
        self.poll(
            PipelineKind::Deliver,
            EntitySource::InMessages,
            Operation::ToBeDelivered,
        )
        .await
    }

    pub async fn sweep_retries(&self) -> AgentCycle {
        RetrySweepAgent::new(self.store.clone(), AgentSettings::default())
            .poll_once(&self.cancel)
            .await
            .expect("retry sweep failed")
    }
}
