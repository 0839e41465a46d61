use std::sync::Arc;

use crate::collaborators::{
    MessageBodyStore, PayloadTransformer, PolicyResolver, SecurityStrategy, SenderRegistry,
};
use crate::piggyback::PiggybackSelector;
use crate::retry::{ReceptionAwarenessEngine, RetryEngine};
use crate::store::EntityStore;

/// Everything the concrete steps talk to, built once per relay
#[derive(Clone)]
pub struct PipelineServices {
    pub store: Arc<dyn EntityStore>,
    pub policies: Arc<dyn PolicyResolver>,
    pub transformer: Arc<dyn PayloadTransformer>,
    pub security: Arc<dyn SecurityStrategy>,
    pub body_store: Arc<dyn MessageBodyStore>,
    pub senders: Arc<SenderRegistry>,
    pub retry: RetryEngine,
    pub reception: ReceptionAwarenessEngine,
    pub piggyback: PiggybackSelector,
    /// Receiving policy for inbound messages that carry no hint
    pub default_receiving_pmode: Option<String>,
}

impl PipelineServices {
    pub fn new(
        store: Arc<dyn EntityStore>,
        policies: Arc<dyn PolicyResolver>,
        transformer: Arc<dyn PayloadTransformer>,
        security: Arc<dyn SecurityStrategy>,
        body_store: Arc<dyn MessageBodyStore>,
        senders: Arc<SenderRegistry>,
    ) -> Self {
        let retry = RetryEngine::new(store.clone());
        let reception = ReceptionAwarenessEngine::new(store.clone(), retry.clone());
        let piggyback = PiggybackSelector::new(store.clone());
        Self {
            store,
            policies,
            transformer,
            security,
            body_store,
            senders,
            retry,
            reception,
            piggyback,
            default_receiving_pmode: None,
        }
    }

    pub fn with_default_receiving_pmode(mut self, pmode_id: Option<String>) -> Self {
        self.default_receiving_pmode = pmode_id;
        self
    }
}

impl std::fmt::Debug for PipelineServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineServices")
            .field("senders", &self.senders)
            .field("default_receiving_pmode", &self.default_receiving_pmode)
            .finish_non_exhaustive()
    }
}
