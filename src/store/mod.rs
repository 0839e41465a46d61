//! # Entity Store
//!
//! Persisted state of every message, exception, retry-reliability and
//! reception-awareness record. All coordination between agents goes through
//! this trait: every claim is an atomic check-and-set on the Operation (or
//! retry status) column, and every multi-record change commits in one
//! transaction. Implementations never hold a transaction across a call to an
//! external sender.

pub mod error_codes;
pub mod errors;
pub mod memory;
pub mod postgres;
pub mod transient;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::constants::{MessageType, RetryStatus, RetryType};
use crate::models::{
    EntityId, InException, InMessage, OutException, OutMessage, ReceptionAwareness,
    RetryReliability, RetryTarget,
};
use crate::piggyback::PiggybackCriteria;
use crate::state_machine::{InStatus, Operation, OperationEvent, OutStatus};

pub use error_codes::PgErrorCode;
pub use errors::{StoreError, StoreResult};
pub use memory::{FaultKind, FaultRule, InMemoryEntityStore};
pub use postgres::PgEntityStore;
pub use transient::TransientRetryPolicy;

/// New retry bookkeeping for a record, written with the entity change
#[derive(Debug, Clone, PartialEq)]
pub struct RetryRecordUpdate {
    pub id: EntityId,
    pub current_retry_count: u32,
    pub status: RetryStatus,
    pub last_retry_time: Option<DateTime<Utc>>,
}

/// Outcome of one send / deliver / notify attempt, ready to commit
///
/// Applied only if the entity is still in `expected` and the record (when
/// present) is not `Completed`; otherwise nothing changes.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryUpdate {
    pub target: RetryTarget,
    pub expected: Operation,
    pub event: OperationEvent,
    pub record: Option<RetryRecordUpdate>,
}

/// Reception awareness verdict for a claimed record, ready to commit
///
/// `message` is applied to the OutMessage only while it is still `Sent`; if it
/// is not, the record is released back to `Pending` and nothing else changes.
#[derive(Debug, Clone)]
pub struct ReceptionUpdate {
    pub record_id: EntityId,
    pub current_retry_count: u32,
    pub status: RetryStatus,
    pub last_send_time: Option<DateTime<Utc>>,
    pub message: Option<(EntityId, OperationEvent)>,
    pub exception: Option<OutException>,
}

/// Transactional access to the relay's persisted records
#[async_trait]
pub trait EntityStore: Send + Sync {
    // Messages

    async fn insert_in_message(&self, message: InMessage) -> StoreResult<InMessage>;

    /// Fails with `Duplicate` when the ebMS message id is already stored
    async fn insert_out_message(&self, message: OutMessage) -> StoreResult<OutMessage>;

    async fn get_in_message(&self, id: EntityId) -> StoreResult<InMessage>;

    async fn get_out_message(&self, id: EntityId) -> StoreResult<OutMessage>;

    /// First stored (non-duplicate) inbound message with this id
    async fn find_in_message_by_ebms_id(&self, ebms_message_id: &str)
        -> StoreResult<Option<InMessage>>;

    async fn find_out_message_by_ebms_id(
        &self,
        ebms_message_id: &str,
    ) -> StoreResult<Option<OutMessage>>;

    /// Atomically move up to `limit` inbound messages from `from` to its claimed Operation
    async fn claim_in_messages(&self, from: Operation, limit: u32) -> StoreResult<Vec<InMessage>>;

    async fn claim_out_messages(&self, from: Operation, limit: u32)
        -> StoreResult<Vec<OutMessage>>;

    async fn set_in_message_status(&self, id: EntityId, status: InStatus)
        -> StoreResult<()>;

    async fn set_out_message_status(
        &self,
        id: EntityId,
        status: OutStatus,
        message_type: Option<MessageType>,
    ) -> StoreResult<()>;

    /// Record where the (secured) body lives after processing
    async fn update_out_message_body(
        &self,
        id: EntityId,
        message_location: &str,
        is_signed: bool,
        is_encrypted: bool,
    ) -> StoreResult<()>;

    /// A receipt or error referencing the message has been received
    async fn has_acknowledgement(&self, ebms_message_id: &str) -> StoreResult<bool>;

    // Exceptions

    async fn insert_in_exception(&self, exception: InException) -> StoreResult<InException>;

    async fn insert_out_exception(&self, exception: OutException) -> StoreResult<OutException>;

    async fn get_in_exception(&self, id: EntityId) -> StoreResult<InException>;

    async fn get_out_exception(&self, id: EntityId) -> StoreResult<OutException>;

    async fn claim_in_exceptions(&self, from: Operation, limit: u32)
        -> StoreResult<Vec<InException>>;

    async fn claim_out_exceptions(
        &self,
        from: Operation,
        limit: u32,
    ) -> StoreResult<Vec<OutException>>;

    async fn find_in_exceptions_by_ref(&self, ebms_message_id: &str)
        -> StoreResult<Vec<InException>>;

    async fn find_out_exceptions_by_ref(
        &self,
        ebms_message_id: &str,
    ) -> StoreResult<Vec<OutException>>;

    // Operation changes

    /// Check-and-set: apply `event` only if the record is still in `expected`
    ///
    /// Returns false when another agent moved the record first. Messages get
    /// the Status that accompanies the new Operation.
    async fn transition(
        &self,
        target: RetryTarget,
        expected: Operation,
        event: OperationEvent,
    ) -> StoreResult<bool>;

    // Retry reliability

    /// Fails with `Duplicate` when the target already has a record of this kind
    async fn insert_retry_reliability(
        &self,
        record: RetryReliability,
    ) -> StoreResult<RetryReliability>;

    async fn find_retry_reliability(
        &self,
        target: RetryTarget,
        retry_type: RetryType,
    ) -> StoreResult<Option<RetryReliability>>;

    /// Claim (`Pending → Busy`) due records whose entity waits in `ToBeRetried`
    async fn claim_due_retries(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> StoreResult<Vec<RetryReliability>>;

    /// Return a claimed record to `Pending` and re-arm its entity
    async fn rearm_retry(&self, record_id: EntityId) -> StoreResult<bool>;

    /// Commit a retry decision: record and entity in one transaction
    async fn apply_retry_update(&self, update: RetryUpdate) -> StoreResult<bool>;

    // Reception awareness

    async fn insert_reception_awareness(
        &self,
        record: ReceptionAwareness,
    ) -> StoreResult<ReceptionAwareness>;

    async fn find_reception_awareness(
        &self,
        out_message_id: EntityId,
    ) -> StoreResult<Option<ReceptionAwareness>>;

    /// Claim (`Pending → Busy`) due records whose message is still `Sent`
    async fn claim_due_reception_awareness(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> StoreResult<Vec<ReceptionAwareness>>;

    /// Commit a reception decision; a resend also reopens the message's
    /// `Send` retry record (`Completed → Pending`, count kept)
    async fn apply_reception_update(&self, update: ReceptionUpdate) -> StoreResult<bool>;

    /// Mark the record for a now-acknowledged message `Completed`
    async fn complete_reception_awareness(&self, ebms_message_id: &str) -> StoreResult<bool>;

    // Pull

    /// Select the oldest matching signal and move it to `Sending` atomically
    async fn select_piggyback_signal(
        &self,
        criteria: &PiggybackCriteria,
    ) -> StoreResult<Option<OutMessage>>;
}
