use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::collaborators::SendOutcome;
use crate::constants::{RetryStatus, RetryType};
use crate::logging::log_retry_decision;
use crate::models::{RetryReliability, RetryTarget};
use crate::pmode::RetryConfig;
use crate::state_machine::OperationEvent;
use crate::store::{EntityStore, RetryRecordUpdate, RetryUpdate, StoreError, StoreResult};

/// What happens to an entity after one attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum RetryDecision {
    /// Terminal success; the retry count is left as it was
    Complete,
    /// Try again once the interval has passed
    Retry { next_retry_count: u32 },
    /// Terminal failure
    DeadLetter,
}

impl RetryDecision {
    pub fn event(&self) -> OperationEvent {
        match self {
            Self::Complete => OperationEvent::Complete,
            Self::Retry { .. } => OperationEvent::ScheduleRetry,
            Self::DeadLetter => OperationEvent::DeadLetter,
        }
    }

    pub fn is_dead_letter(&self) -> bool {
        matches!(self, Self::DeadLetter)
    }
}

impl fmt::Display for RetryDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Complete => write!(f, "complete"),
            Self::Retry { next_retry_count } => write!(f, "retry({next_retry_count})"),
            Self::DeadLetter => write!(f, "dead_letter"),
        }
    }
}

/// A decision together with whether it was committed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppliedRetry {
    pub decision: RetryDecision,
    /// False when the entity had already moved on or the record was completed
    pub applied: bool,
}

/// Decides and commits the outcome of send, deliver and notify attempts
#[derive(Clone)]
pub struct RetryEngine {
    store: Arc<dyn EntityStore>,
}

impl RetryEngine {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self { store }
    }

    /// Pure decision for one attempt
    ///
    /// Fatal failures dead-letter whatever budget remains; only retryable
    /// failures consume budget; success never touches the count.
    pub fn decide(current_retry_count: u32, max_retry_count: u32, outcome: SendOutcome) -> RetryDecision {
        match outcome {
            SendOutcome::Success => RetryDecision::Complete,
            SendOutcome::FatalFailure => RetryDecision::DeadLetter,
            SendOutcome::RetryableFailure if current_retry_count < max_retry_count => {
                RetryDecision::Retry {
                    next_retry_count: current_retry_count + 1,
                }
            }
            SendOutcome::RetryableFailure => RetryDecision::DeadLetter,
        }
    }

    /// Decision for an entity whose record may be missing (zero budget)
    pub fn decide_for(record: Option<&RetryReliability>, outcome: SendOutcome) -> RetryDecision {
        match record {
            Some(record) => {
                Self::decide(record.current_retry_count, record.max_retry_count, outcome)
            }
            None => Self::decide(0, 0, outcome),
        }
    }

    /// Record changes that accompany `decision`
    pub fn record_update(
        record: &RetryReliability,
        decision: RetryDecision,
        now: DateTime<Utc>,
    ) -> RetryRecordUpdate {
        match decision {
            RetryDecision::Retry { next_retry_count } => RetryRecordUpdate {
                id: record.id,
                current_retry_count: next_retry_count,
                status: RetryStatus::Pending,
                last_retry_time: Some(now),
            },
            RetryDecision::Complete | RetryDecision::DeadLetter => RetryRecordUpdate {
                id: record.id,
                current_retry_count: record.current_retry_count,
                status: RetryStatus::Completed,
                last_retry_time: record.last_retry_time,
            },
        }
    }

    /// Create the retry record for `target` if its policy asks for retries
    ///
    /// Called when the first attempt is scheduled. Disabled reliability creates
    /// nothing, which the engine treats as a zero budget. Scheduling twice
    /// returns the existing record.
    pub async fn schedule(
        &self,
        target: RetryTarget,
        retry_type: RetryType,
        reliability: &RetryConfig,
    ) -> StoreResult<Option<RetryReliability>> {
        if !reliability.is_enabled {
            return Ok(None);
        }
        let record = RetryReliability::new(
            target,
            retry_type,
            reliability.effective_retry_count(),
            reliability.retry_interval(),
        );
        match self.store.insert_retry_reliability(record).await {
            Ok(stored) => {
                debug!(%target, %retry_type, max = stored.max_retry_count, "Retry record created");
                Ok(Some(stored))
            }
            Err(StoreError::Duplicate { .. }) => {
                self.store.find_retry_reliability(target, retry_type).await
            }
            Err(e) => Err(e),
        }
    }

    /// Decide the outcome of an attempt on `target` and commit it atomically
    ///
    /// The entity must still be in the in-progress Operation of `retry_type`;
    /// otherwise nothing is written and `applied` is false. A `Completed`
    /// record carries no budget; reception awareness reopens the send record
    /// when it resends a message.
    pub async fn apply(
        &self,
        target: RetryTarget,
        retry_type: RetryType,
        outcome: SendOutcome,
    ) -> StoreResult<AppliedRetry> {
        let record = self
            .store
            .find_retry_reliability(target, retry_type)
            .await?
            .filter(|r| !r.status.is_completed());

        let decision = Self::decide_for(record.as_ref(), outcome);
        let update = RetryUpdate {
            target,
            expected: retry_type.in_progress_operation(),
            event: decision.event(),
            record: record
                .as_ref()
                .map(|r| Self::record_update(r, decision, Utc::now())),
        };

        let applied = self.store.apply_retry_update(update).await?;
        let (count, max) = record
            .as_ref()
            .map(|r| (r.current_retry_count, r.max_retry_count))
            .unwrap_or((0, 0));
        log_retry_decision(
            &target.to_string(),
            &retry_type.to_string(),
            &outcome.to_string(),
            count,
            max,
            &decision.to_string(),
        );
        if !applied {
            warn!(%target, %retry_type, %decision, "Retry decision not applied; entity moved on");
        }
        Ok(AppliedRetry { decision, applied })
    }
}
