//! # Relay Bootstrap
//!
//! Wires configuration and collaborators into running agents. The relay owns
//! a single [`CancellationToken`]; shutdown cancels it and waits for every
//! polling agent to finish its current entity.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agents::{run_polling, Agent, AgentFactory};
use crate::collaborators::{
    FileBodyStore, InMemoryBodyStore, JsonPayloadTransformer, MarkingSecurityStrategy,
    MessageBodyStore, PayloadTransformer, PolicyResolver, SecurityStrategy, SenderRegistry,
};
use crate::config::{BodyStoreKind, ConfigurationError, RelayConfig, StoreBackend};
use crate::error::Result;
use crate::models::{ReceivedMessage, SubmitMessage};
use crate::pipeline::{MessagingContext, MessagingResult, PipelineServices};
use crate::store::{EntityStore, InMemoryEntityStore, PgEntityStore, TransientRetryPolicy};

/// Collaborators the relay is built from
#[derive(Clone)]
pub struct RelayDependencies {
    pub store: Arc<dyn EntityStore>,
    pub policies: Arc<dyn PolicyResolver>,
    pub transformer: Arc<dyn PayloadTransformer>,
    pub security: Arc<dyn SecurityStrategy>,
    pub body_store: Arc<dyn MessageBodyStore>,
    pub senders: SenderRegistry,
}

impl RelayDependencies {
    /// Store and body store as configured, default transformer and security
    pub async fn from_config(config: &RelayConfig, policies: Arc<dyn PolicyResolver>) -> Result<Self> {
        let retry = TransientRetryPolicy::from_config(&config.store.transient_retry);
        let store: Arc<dyn EntityStore> = match config.store.backend {
            StoreBackend::Memory => Arc::new(InMemoryEntityStore::new().with_retry_policy(retry)),
            StoreBackend::Postgres => {
                let store = PgEntityStore::connect(&config.database, retry).await?;
                store.migrate().await?;
                Arc::new(store)
            }
        };

        let body_store: Arc<dyn MessageBodyStore> = match config.body_store.kind {
            BodyStoreKind::Memory => Arc::new(InMemoryBodyStore::new()),
            BodyStoreKind::File => {
                let directory = config.body_store.directory.clone().ok_or_else(|| {
                    ConfigurationError::missing_required_field(
                        "body_store.directory",
                        "the file body store",
                    )
                })?;
                Arc::new(FileBodyStore::new(directory))
            }
        };

        Ok(Self {
            store,
            body_store,
            ..Self::in_memory(policies)
        })
    }

    /// Everything in memory; single node and tests
    pub fn in_memory(policies: Arc<dyn PolicyResolver>) -> Self {
        Self {
            store: Arc::new(InMemoryEntityStore::new()),
            policies,
            transformer: Arc::new(JsonPayloadTransformer),
            security: Arc::new(MarkingSecurityStrategy),
            body_store: Arc::new(InMemoryBodyStore::new()),
            senders: SenderRegistry::with_defaults(),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn EntityStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_senders(mut self, senders: SenderRegistry) -> Self {
        self.senders = senders;
        self
    }

    pub fn with_security(mut self, security: Arc<dyn SecurityStrategy>) -> Self {
        self.security = security;
        self
    }

    pub fn with_transformer(mut self, transformer: Arc<dyn PayloadTransformer>) -> Self {
        self.transformer = transformer;
        self
    }

    pub fn with_body_store(mut self, body_store: Arc<dyn MessageBodyStore>) -> Self {
        self.body_store = body_store;
        self
    }
}

/// A started relay
pub struct RelaySystem {
    services: PipelineServices,
    submit: Agent,
    receive: Agent,
    cancel: CancellationToken,
    handles: Vec<(String, JoinHandle<()>)>,
}

impl RelaySystem {
    /// Validate the configuration and spawn every enabled polling agent
    pub async fn start(config: &RelayConfig, deps: RelayDependencies) -> Result<Self> {
        config.validate()?;

        let services = PipelineServices::new(
            deps.store,
            deps.policies,
            deps.transformer,
            deps.security,
            deps.body_store,
            Arc::new(deps.senders),
        )
        .with_default_receiving_pmode(config.receive.default_pmode_id.clone());

        let factory = AgentFactory::new(config.clone(), services.clone());
        let cancel = CancellationToken::new();
        let handles = factory
            .polling_agents()
            .into_iter()
            .map(|agent| {
                let name = agent.name().to_string();
                let handle = tokio::spawn(run_polling(agent, cancel.child_token()));
                (name, handle)
            })
            .collect::<Vec<_>>();

        info!(agents = handles.len(), "Relay started");
        Ok(Self {
            submit: factory.submit_agent(),
            receive: factory.receive_agent(),
            services,
            cancel,
            handles,
        })
    }

    /// Accept a message from a producer
    pub async fn submit(&self, message: SubmitMessage) -> MessagingResult {
        self.submit
            .execute(MessagingContext::for_submit(message), &self.cancel)
            .await
    }

    /// Accept a message pushed by a peer
    pub async fn receive(&self, message: ReceivedMessage) -> MessagingResult {
        self.receive
            .execute(MessagingContext::for_received(message), &self.cancel)
            .await
    }

    pub fn services(&self) -> &PipelineServices {
        &self.services
    }

    pub fn running_agents(&self) -> Vec<&str> {
        self.handles
            .iter()
            .filter(|(_, handle)| !handle.is_finished())
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Cancel every agent and wait for them to stop
    pub async fn shutdown(self) {
        info!("Relay shutting down");
        self.cancel.cancel();
        for (name, handle) in self.handles {
            if let Err(e) = handle.await {
                warn!(agent = %name, error = %e, "Agent task ended abnormally");
            }
        }
        info!("Relay stopped");
    }
}

impl std::fmt::Debug for RelaySystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelaySystem")
            .field("agents", &self.handles.iter().map(|(n, _)| n).collect::<Vec<_>>())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}
