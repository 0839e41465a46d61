//! Sweeps over retry-reliability and reception-awareness records.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::agent::{AgentCycle, PollingAgent};
use crate::config::AgentSettings;
use crate::error::Result;
use crate::logging::log_error;
use crate::retry::ReceptionAwarenessEngine;
use crate::store::{EntityStore, ReceptionUpdate};

/// Re-arms entities whose retry interval has passed
///
/// Claiming moves a record `Pending → Busy`; re-arming returns it to
/// `Pending` and moves the entity from `ToBeRetried` back to its kind's
/// pending Operation in the same transaction.
pub struct RetrySweepAgent {
    store: Arc<dyn EntityStore>,
    settings: AgentSettings,
}

impl RetrySweepAgent {
    pub fn new(store: Arc<dyn EntityStore>, settings: AgentSettings) -> Self {
        Self { store, settings }
    }
}

#[async_trait]
impl PollingAgent for RetrySweepAgent {
    fn name(&self) -> &str {
        "retry_sweep"
    }

    fn poll_interval(&self) -> Duration {
        self.settings.poll_interval()
    }

    async fn poll_once(&self, cancel: &CancellationToken) -> Result<AgentCycle> {
        let due = self
            .store
            .claim_due_retries(Utc::now(), self.settings.batch_size)
            .await?;

        let mut cycle = AgentCycle::default();
        for record in due {
            // Claimed records are always re-armed, even during shutdown
            match self.store.rearm_retry(record.id).await {
                Ok(rearmed) => {
                    debug!(
                        target = %record.target,
                        retry_type = %record.retry_type,
                        retry_count = record.current_retry_count,
                        rearmed,
                        "Retry re-armed"
                    );
                    cycle.record(rearmed);
                }
                Err(e) => {
                    log_error("retry_sweep", "rearm", &e.to_string(), Some(&record.target.to_string()));
                    cycle.record(false);
                }
            }
        }
        if cancel.is_cancelled() {
            debug!("Retry sweep finished its batch after cancellation");
        }
        Ok(cycle)
    }
}

/// Resends or gives up on sent messages that were never acknowledged
pub struct ReceptionAwarenessAgent {
    store: Arc<dyn EntityStore>,
    engine: ReceptionAwarenessEngine,
    settings: AgentSettings,
}

impl ReceptionAwarenessAgent {
    pub fn new(
        store: Arc<dyn EntityStore>,
        engine: ReceptionAwarenessEngine,
        settings: AgentSettings,
    ) -> Self {
        Self {
            store,
            engine,
            settings,
        }
    }
}

#[async_trait]
impl PollingAgent for ReceptionAwarenessAgent {
    fn name(&self) -> &str {
        "reception_awareness"
    }

    fn poll_interval(&self) -> Duration {
        self.settings.poll_interval()
    }

    async fn poll_once(&self, _cancel: &CancellationToken) -> Result<AgentCycle> {
        let now = Utc::now();
        let due = self
            .store
            .claim_due_reception_awareness(now, self.settings.batch_size)
            .await?;

        let mut cycle = AgentCycle::default();
        for record in due {
            match self.engine.process(&record, now).await {
                Ok(decision) => {
                    debug!(
                        ebms_message_id = %record.ref_to_ebms_message_id,
                        ?decision,
                        "Reception awareness evaluated"
                    );
                    cycle.record(true);
                }
                Err(e) => {
                    log_error(
                        "reception_awareness",
                        "process",
                        &e.to_string(),
                        Some(&record.ref_to_ebms_message_id),
                    );
                    // Hand the claim back untouched so the next sweep retries
                    let release = ReceptionUpdate {
                        record_id: record.id,
                        current_retry_count: record.current_retry_count,
                        status: crate::constants::RetryStatus::Pending,
                        last_send_time: record.last_send_time,
                        message: None,
                        exception: None,
                    };
                    if let Err(e) = self.store.apply_reception_update(release).await {
                        log_error(
                            "reception_awareness",
                            "release",
                            &e.to_string(),
                            Some(&record.ref_to_ebms_message_id),
                        );
                    }
                    cycle.record(false);
                }
            }
        }
        Ok(cycle)
    }
}
