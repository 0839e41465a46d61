use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::engine::RetryEngine;
use crate::constants::{RetryStatus, RetryType};
use crate::models::{OutException, OutMessage, ReceptionAwareness, RetryTarget};
use crate::pmode::SendingPMode;
use crate::state_machine::OperationEvent;
use crate::store::{EntityStore, ReceptionUpdate, StoreError, StoreResult};

/// Verdict for one reception-awareness record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceptionDecision {
    /// A receipt or error arrived; stop tracking
    Acknowledged,
    /// Not due yet; hand the record back untouched
    Wait,
    /// Put the message back in `ToBeSent`
    Resend { next_retry_count: u32 },
    /// Budget used up without acknowledgement
    Exhausted,
}

/// Drives resends of sent messages that were never acknowledged
#[derive(Clone)]
pub struct ReceptionAwarenessEngine {
    store: Arc<dyn EntityStore>,
    retry: RetryEngine,
}

impl ReceptionAwarenessEngine {
    pub fn new(store: Arc<dyn EntityStore>, retry: RetryEngine) -> Self {
        Self { store, retry }
    }

    pub fn decide(
        record: &ReceptionAwareness,
        acknowledged: bool,
        now: DateTime<Utc>,
    ) -> ReceptionDecision {
        if acknowledged {
            ReceptionDecision::Acknowledged
        } else if !record.is_due(now) {
            ReceptionDecision::Wait
        } else if record.has_budget() {
            ReceptionDecision::Resend {
                next_retry_count: record.current_retry_count + 1,
            }
        } else {
            ReceptionDecision::Exhausted
        }
    }

    /// Start tracking a freshly sent message when its policy asks for it
    pub async fn track(
        &self,
        message: &OutMessage,
        pmode: &SendingPMode,
    ) -> StoreResult<Option<ReceptionAwareness>> {
        let config = &pmode.reception_awareness;
        if !config.is_enabled || message.ebms_message_type.is_signal() {
            return Ok(None);
        }
        let record = ReceptionAwareness::new(
            message.id,
            message.ebms_message_id(),
            config.retry_count,
            config.retry_interval(),
        );
        match self.store.insert_reception_awareness(record).await {
            Ok(stored) => Ok(Some(stored)),
            // A resent message keeps the record it already has
            Err(StoreError::Duplicate { .. }) => {
                self.store.find_reception_awareness(message.id).await
            }
            Err(e) => Err(e),
        }
    }

    /// Evaluate a claimed (`Busy`) record and commit the verdict
    pub async fn process(
        &self,
        record: &ReceptionAwareness,
        now: DateTime<Utc>,
    ) -> StoreResult<ReceptionDecision> {
        let message = self.store.get_out_message(record.ref_to_out_message_id).await?;
        let acknowledged = self
            .store
            .has_acknowledgement(message.ebms_message_id())
            .await?;
        let decision = Self::decide(record, acknowledged, now);

        let mut update = ReceptionUpdate {
            record_id: record.id,
            current_retry_count: record.current_retry_count,
            status: RetryStatus::Pending,
            last_send_time: record.last_send_time,
            message: None,
            exception: None,
        };
        let mut notify = None;

        match decision {
            ReceptionDecision::Acknowledged => update.status = RetryStatus::Completed,
            ReceptionDecision::Wait => {}
            ReceptionDecision::Resend { next_retry_count } => {
                update.current_retry_count = next_retry_count;
                update.last_send_time = Some(now);
                update.message = Some((message.id, OperationEvent::Resend));
            }
            ReceptionDecision::Exhausted => {
                let pmode = message.sending_pmode()?;
                let text = format!(
                    "No receipt for {} after {} resends",
                    message.ebms_message_id(),
                    record.current_retry_count
                );
                let mut exception =
                    OutException::new(Some(message.ebms_message_id().to_string()), text);
                if let Some(pmode) = &pmode {
                    exception = exception.with_pmode(pmode.id.clone(), message.pmode_data.clone());
                    let handling = &pmode.exception_handling;
                    if handling.notify_message_producer {
                        let method_type = handling
                            .notify_method
                            .as_ref()
                            .map(|m| m.method_type.clone())
                            .unwrap_or_default();
                        exception = exception.to_be_notified(method_type);
                        notify = Some(handling.reliability.clone());
                    }
                }
                update.status = RetryStatus::Completed;
                update.message = Some((message.id, OperationEvent::DeadLetter));
                update.exception = Some(exception);
            }
        }

        if !self.store.apply_reception_update(update).await? {
            debug!(
                record_id = record.id,
                ebms_message_id = message.ebms_message_id(),
                "Message left Sent before the verdict; record released"
            );
            return Ok(decision);
        }

        match decision {
            ReceptionDecision::Resend { next_retry_count } => info!(
                ebms_message_id = message.ebms_message_id(),
                retry_count = next_retry_count,
                "No acknowledgement yet; message queued for resend"
            ),
            ReceptionDecision::Exhausted => {
                warn!(
                    ebms_message_id = message.ebms_message_id(),
                    "Reception awareness exhausted; message dead-lettered"
                );
                if let Some(reliability) = notify {
                    self.schedule_exception_notification(message.ebms_message_id(), &reliability)
                        .await?;
                }
            }
            ReceptionDecision::Acknowledged | ReceptionDecision::Wait => {}
        }
        Ok(decision)
    }

    async fn schedule_exception_notification(
        &self,
        ebms_message_id: &str,
        reliability: &crate::pmode::RetryConfig,
    ) -> StoreResult<()> {
        let exceptions = self.store.find_out_exceptions_by_ref(ebms_message_id).await?;
        if let Some(latest) = exceptions.last() {
            self.retry
                .schedule(
                    RetryTarget::OutException(latest.id),
                    RetryType::Notification,
                    reliability,
                )
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn record(current: u32, total: u32) -> ReceptionAwareness {
        let mut record = ReceptionAwareness::new(1, "m@test", total, Duration::from_secs(10));
        record.current_retry_count = current;
        record
    }

    #[test]
    fn test_acknowledgement_wins() {
        let r = record(5, 5);
        let later = r.last_send_time.unwrap() + chrono::Duration::seconds(60);
        assert_eq!(
            ReceptionAwarenessEngine::decide(&r, true, later),
            ReceptionDecision::Acknowledged
        );
    }

    #[test]
    fn test_resend_until_budget_is_used() {
        let r = record(1, 2);
        let sent = r.last_send_time.unwrap();
        assert_eq!(
            ReceptionAwarenessEngine::decide(&r, false, sent + chrono::Duration::seconds(5)),
            ReceptionDecision::Wait
        );
        assert_eq!(
            ReceptionAwarenessEngine::decide(&r, false, sent + chrono::Duration::seconds(10)),
            ReceptionDecision::Resend {
                next_retry_count: 2
            }
        );

        let spent = record(2, 2);
        let sent = spent.last_send_time.unwrap();
        assert_eq!(
            ReceptionAwarenessEngine::decide(&spent, false, sent + chrono::Duration::seconds(10)),
            ReceptionDecision::Exhausted
        );
    }
}
