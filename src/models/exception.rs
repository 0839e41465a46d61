use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;

use super::entity::{same_entity, Entity, EntityId, HasOperation, TRANSIENT_ID};
use crate::state_machine::Operation;

/// Direction marker for exception records
pub trait ExceptionDirection: Send + Sync + 'static {
    const TABLE: &'static str;
    const KIND: &'static str;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inbound;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outbound;

impl ExceptionDirection for Inbound {
    const TABLE: &'static str = "in_exceptions";
    const KIND: &'static str = "in_exception";
}

impl ExceptionDirection for Outbound {
    const TABLE: &'static str = "out_exceptions";
    const KIND: &'static str = "out_exception";
}

/// Failure record for one message id
/// Maps to the `in_exceptions` / `out_exceptions` tables
///
/// Its Operation only ever moves along the notification chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExceptionEntity<D> {
    pub id: EntityId,
    pub ebms_ref_to_message_id: Option<String>,
    pub exception: String,
    pub pmode_id: Option<String>,
    pub pmode_data: Option<String>,
    pub message_body: Option<Vec<u8>>,
    pub operation: Operation,
    /// Method type used (or to be used) to notify about this failure
    pub notify_method: Option<String>,
    pub insertion_time: DateTime<Utc>,
    pub modification_time: DateTime<Utc>,
    #[serde(skip)]
    direction: PhantomData<D>,
}

pub type InException = ExceptionEntity<Inbound>;
pub type OutException = ExceptionEntity<Outbound>;

impl<D: ExceptionDirection> ExceptionEntity<D> {
    /// Create a transient exception record that is not scheduled for notification
    pub fn new(ebms_ref_to_message_id: Option<String>, exception: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: TRANSIENT_ID,
            ebms_ref_to_message_id,
            exception: exception.into(),
            pmode_id: None,
            pmode_data: None,
            message_body: None,
            operation: Operation::NotApplicable,
            notify_method: None,
            insertion_time: now,
            modification_time: now,
            direction: PhantomData,
        }
    }

    /// Schedule notification through the given method type
    pub fn to_be_notified(mut self, method_type: impl Into<String>) -> Self {
        self.operation = Operation::ToBeNotified;
        self.notify_method = Some(method_type.into());
        self
    }

    pub fn with_pmode(mut self, pmode_id: impl Into<String>, pmode_data: Option<String>) -> Self {
        self.pmode_id = Some(pmode_id.into());
        self.pmode_data = pmode_data;
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.message_body = Some(body);
        self
    }
}

impl<D> Entity for ExceptionEntity<D> {
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

impl<D: ExceptionDirection> HasOperation for ExceptionEntity<D> {
    fn operation(&self) -> Operation {
        self.operation
    }

    fn entity_kind(&self) -> &'static str {
        D::KIND
    }

    fn entity_id(&self) -> EntityId {
        self.id
    }
}

impl<D> PartialEq for ExceptionEntity<D> {
    fn eq(&self, other: &Self) -> bool {
        same_entity(self, other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exception_defaults_to_not_notified() {
        let exception = OutException::new(Some("m-1@test".to_string()), "send failed");
        assert_eq!(exception.operation, Operation::NotApplicable);
        assert_eq!(exception.entity_kind(), "out_exception");
        assert!(exception.is_transient());
    }

    #[test]
    fn test_to_be_notified_records_method() {
        let exception =
            InException::new(Some("m-2@test".to_string()), "deliver failed").to_be_notified("FILE");
        assert_eq!(exception.operation, Operation::ToBeNotified);
        assert_eq!(exception.notify_method.as_deref(), Some("FILE"));
    }
}
