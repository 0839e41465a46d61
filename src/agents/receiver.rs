use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::instrument;

use crate::pipeline::{ContextEntity, MessagingContext};
use crate::state_machine::Operation;
use crate::store::{EntityStore, StoreResult};

/// Table an agent claims its work from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntitySource {
    InMessages,
    OutMessages,
    InExceptions,
    OutExceptions,
}

impl fmt::Display for EntitySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InMessages => write!(f, "in_messages"),
            Self::OutMessages => write!(f, "out_messages"),
            Self::InExceptions => write!(f, "in_exceptions"),
            Self::OutExceptions => write!(f, "out_exceptions"),
        }
    }
}

/// Supplies an agent with claimed entities, ready to run through a pipeline
#[async_trait]
pub trait DatastoreReceiver: Send + Sync {
    fn describe(&self) -> String;

    async fn receive(&self, limit: u32) -> StoreResult<Vec<MessagingContext>>;
}

/// Claims entities waiting in one pending Operation
pub struct OperationReceiver {
    store: Arc<dyn EntityStore>,
    source: EntitySource,
    from: Operation,
}

impl OperationReceiver {
    pub fn new(store: Arc<dyn EntityStore>, source: EntitySource, from: Operation) -> Self {
        Self {
            store,
            source,
            from,
        }
    }
}

#[async_trait]
impl DatastoreReceiver for OperationReceiver {
    fn describe(&self) -> String {
        format!("{}[{}]", self.source, self.from)
    }

    #[instrument(skip(self), fields(source = %self.source, from = %self.from))]
    async fn receive(&self, limit: u32) -> StoreResult<Vec<MessagingContext>> {
        let from = self.from;
        let entities: Vec<ContextEntity> = match self.source {
            EntitySource::InMessages => self
                .store
                .claim_in_messages(from, limit)
                .await?
                .into_iter()
                .map(ContextEntity::InMessage)
                .collect(),
            EntitySource::OutMessages => self
                .store
                .claim_out_messages(from, limit)
                .await?
                .into_iter()
                .map(ContextEntity::OutMessage)
                .collect(),
            EntitySource::InExceptions => self
                .store
                .claim_in_exceptions(from, limit)
                .await?
                .into_iter()
                .map(ContextEntity::InException)
                .collect(),
            EntitySource::OutExceptions => self
                .store
                .claim_out_exceptions(from, limit)
                .await?
                .into_iter()
                .map(ContextEntity::OutException)
                .collect(),
        };
        Ok(entities
            .into_iter()
            .map(|entity| MessagingContext::for_claimed(entity, from))
            .collect())
    }
}
