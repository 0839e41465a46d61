use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::entity::{same_entity, Entity, EntityId, TRANSIENT_ID};
use crate::constants::RetryStatus;

/// Acknowledgement tracking for a sent OutMessage
/// Maps to the `reception_awareness` table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceptionAwareness {
    pub id: EntityId,
    pub ref_to_out_message_id: EntityId,
    pub ref_to_ebms_message_id: String,
    pub current_retry_count: u32,
    pub total_retry_count: u32,
    pub retry_interval: Duration,
    pub last_send_time: Option<DateTime<Utc>>,
    pub status: RetryStatus,
    pub insertion_time: DateTime<Utc>,
    pub modification_time: DateTime<Utc>,
}

impl ReceptionAwareness {
    pub fn new(
        ref_to_out_message_id: EntityId,
        ref_to_ebms_message_id: impl Into<String>,
        total_retry_count: u32,
        retry_interval: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: TRANSIENT_ID,
            ref_to_out_message_id,
            ref_to_ebms_message_id: ref_to_ebms_message_id.into(),
            current_retry_count: 0,
            total_retry_count,
            retry_interval,
            last_send_time: Some(now),
            status: RetryStatus::Pending,
            insertion_time: now,
            modification_time: now,
        }
    }

    pub fn has_budget(&self) -> bool {
        self.current_retry_count < self.total_retry_count
    }

    /// The wait for an acknowledgement has run out at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        let Ok(interval) = chrono::Duration::from_std(self.retry_interval) else {
            return false;
        };
        match self.last_send_time {
            Some(sent) => sent
                .checked_add_signed(interval)
                .is_some_and(|due| due <= now),
            None => true,
        }
    }
}

impl Entity for ReceptionAwareness {
    fn id(&self) -> EntityId {
        self.id
    }

    fn insertion_time(&self) -> DateTime<Utc> {
        self.insertion_time
    }

    fn modification_time(&self) -> DateTime<Utc> {
        self.modification_time
    }
}

impl PartialEq for ReceptionAwareness {
    fn eq(&self, other: &Self) -> bool {
        same_entity(self, other)
    }
}
