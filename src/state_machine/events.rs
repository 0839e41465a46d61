use serde::{Deserialize, Serialize};

use super::states::Operation;
use crate::constants::RetryType;

/// Events that move an entity's Operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum OperationEvent {
    /// An agent takes the entity for its stage
    Claim,
    /// The stage finished successfully
    Complete,
    /// The attempt failed and retry budget remains
    ScheduleRetry,
    /// A due retry puts the entity back in its kind's pending Operation
    Rearm(RetryType),
    /// Permanent failure
    DeadLetter,
    /// Hand a claimed entity back to the pending Operation it was claimed from
    Release(Operation),
    /// No acknowledgement arrived for a sent message in time
    Resend,
}

impl OperationEvent {
    /// Get a string representation of the event type for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Claim => "claim",
            Self::Complete => "complete",
            Self::ScheduleRetry => "schedule_retry",
            Self::Rearm(_) => "rearm",
            Self::DeadLetter => "dead_letter",
            Self::Release(_) => "release",
            Self::Resend => "resend",
        }
    }

    /// Check if this event ends the entity's lifecycle
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::DeadLetter)
    }
}

impl std::fmt::Display for OperationEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rearm(kind) => write!(f, "rearm({kind})"),
            Self::Release(to) => write!(f, "release({to})"),
            other => write!(f, "{}", other.event_type()),
        }
    }
}
