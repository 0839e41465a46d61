use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use super::entity::{same_entity, Entity, EntityId, TRANSIENT_ID};
use crate::constants::{RetryStatus, RetryType};

/// The one record a retry-reliability row belongs to
///
/// Modelled as a tagged union so a row can never point at two records or none.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum RetryTarget {
    InMessage(EntityId),
    OutMessage(EntityId),
    InException(EntityId),
    OutException(EntityId),
}

impl RetryTarget {
    pub fn entity_id(&self) -> EntityId {
        match self {
            Self::InMessage(id)
            | Self::OutMessage(id)
            | Self::InException(id)
            | Self::OutException(id) => *id,
        }
    }

    /// Foreign key column holding the reference
    pub fn column(&self) -> &'static str {
        match self {
            Self::InMessage(_) => "ref_to_in_message_id",
            Self::OutMessage(_) => "ref_to_out_message_id",
            Self::InException(_) => "ref_to_in_exception_id",
            Self::OutException(_) => "ref_to_out_exception_id",
        }
    }

    /// Table of the referenced record
    pub fn table(&self) -> &'static str {
        match self {
            Self::InMessage(_) => "in_messages",
            Self::OutMessage(_) => "out_messages",
            Self::InException(_) => "in_exceptions",
            Self::OutException(_) => "out_exceptions",
        }
    }

    /// Rebuild a target from the four nullable columns; exactly one must be set
    pub fn from_columns(
        in_message: Option<EntityId>,
        out_message: Option<EntityId>,
        in_exception: Option<EntityId>,
        out_exception: Option<EntityId>,
    ) -> Option<Self> {
        match (in_message, out_message, in_exception, out_exception) {
            (Some(id), None, None, None) => Some(Self::InMessage(id)),
            (None, Some(id), None, None) => Some(Self::OutMessage(id)),
            (None, None, Some(id), None) => Some(Self::InException(id)),
            (None, None, None, Some(id)) => Some(Self::OutException(id)),
            _ => None,
        }
    }
}

impl fmt::Display for RetryTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.table(), self.entity_id())
    }
}

/// Retry bookkeeping for one (record, retry kind) pair
/// Maps to the `retry_reliability` table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryReliability {
    pub id: EntityId,
    pub target: RetryTarget,
    pub current_retry_count: u32,
    pub max_retry_count: u32,
    pub retry_interval: Duration,
    pub retry_type: RetryType,
    pub status: RetryStatus,
    pub last_retry_time: Option<DateTime<Utc>>,
    pub insertion_time: DateTime<Utc>,
    pub modification_time: DateTime<Utc>,
}

impl RetryReliability {
    pub fn new(
        target: RetryTarget,
        retry_type: RetryType,
        max_retry_count: u32,
        retry_interval: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: TRANSIENT_ID,
            target,
            current_retry_count: 0,
            max_retry_count,
            retry_interval,
            retry_type,
            status: RetryStatus::Pending,
            last_retry_time: None,
            insertion_time: now,
            modification_time: now,
        }
    }

    pub fn has_budget(&self) -> bool {
        self.current_retry_count < self.max_retry_count
    }

    /// Earliest moment the next attempt may start
    ///
    /// `None` before the first attempt, and when the interval reaches past
    /// the representable calendar.
    pub fn next_attempt_at(&self) -> Option<DateTime<Utc>> {
        let interval = chrono::Duration::from_std(self.retry_interval).ok()?;
        self.last_retry_time?.checked_add_signed(interval)
    }

    /// Eligible for the retry sweep at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if self.status != RetryStatus::Pending {
            return false;
        }
        match (self.last_retry_time, self.next_attempt_at()) {
            (None, _) => true,
            (Some(_), Some(at)) => at <= now,
            (Some(_), None) => false,
        }
    }
}

impl Entity for RetryReliability {
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

impl PartialEq for RetryReliability {
    fn eq(&self, other: &Self) -> bool {
        same_entity(self, other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_columns() {
        let target = RetryTarget::OutException(4);
        assert_eq!(target.column(), "ref_to_out_exception_id");
        assert_eq!(target.entity_id(), 4);
        assert_eq!(target.to_string(), "out_exceptions#4");
    }

    #[test]
    fn test_from_columns_requires_exactly_one() {
        assert_eq!(
            RetryTarget::from_columns(None, Some(2), None, None),
            Some(RetryTarget::OutMessage(2))
        );
        assert_eq!(RetryTarget::from_columns(Some(1), Some(2), None, None), None);
        assert_eq!(RetryTarget::from_columns(None, None, None, None), None);
    }

    #[test]
    fn test_due_after_interval() {
        let mut record = RetryReliability::new(
            RetryTarget::InMessage(1),
            RetryType::Delivery,
            3,
            Duration::from_secs(60),
        );
        let now = Utc::now();
        assert!(record.is_due(now));

        record.last_retry_time = Some(now);
        assert!(!record.is_due(now + chrono::Duration::seconds(30)));
        assert!(record.is_due(now + chrono::Duration::seconds(60)));

        record.status = RetryStatus::Busy;
        assert!(!record.is_due(now + chrono::Duration::seconds(120)));
    }

    #[test]
    fn test_interval_past_the_calendar_is_never_due() {
        let mut record = RetryReliability::new(
            RetryTarget::InMessage(1),
            RetryType::Delivery,
            3,
            Duration::from_secs(9_000_000_000_000),
        );
        let now = Utc::now();
        record.last_retry_time = Some(now);

        assert_eq!(record.next_attempt_at(), None);
        assert!(!record.is_due(now));
        assert!(!record.is_due(DateTime::<Utc>::MAX_UTC));
    }
}
