//! In-memory entity store
//!
//! One `parking_lot::Mutex` guards every table, so each trait call is a single
//! transaction. Used for tests and single-process deployments. Faults can be
//! injected per table and ebMS id to exercise transient retries and
//! persistence-after-failure handling.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use tracing::{debug, instrument};

use super::errors::{StoreError, StoreResult};
use super::transient::TransientRetryPolicy;
use super::{EntityStore, ReceptionUpdate, RetryUpdate};
use crate::constants::{MessageType, RetryStatus, RetryType};
use crate::models::{
    EntityId, ExceptionDirection, ExceptionEntity, InException, InMessage, MessageEntity,
    MessageStatus, OutException, OutMessage, ReceptionAwareness, RetryReliability, RetryTarget,
};
use crate::piggyback::PiggybackCriteria;
use crate::state_machine::{
    determine_target_operation, InStatus, Operation, OperationEvent, OutStatus,
};

/// Whether an injected fault clears up on retry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Transient,
    Permanent,
}

/// Injected failure for writes to `table`, optionally only for one ebMS id
#[derive(Debug, Clone, PartialEq)]
pub struct FaultRule {
    pub table: &'static str,
    /// Message id (or referenced message id for exceptions); `None` matches all
    pub ebms_message_id: Option<String>,
    pub kind: FaultKind,
    /// Number of failures before the rule stops firing; `None` fires forever
    pub remaining: Option<u32>,
}

impl FaultRule {
    pub fn permanent(table: &'static str, ebms_message_id: Option<&str>) -> Self {
        Self {
            table,
            ebms_message_id: ebms_message_id.map(str::to_string),
            kind: FaultKind::Permanent,
            remaining: None,
        }
    }

    pub fn transient(table: &'static str, times: u32) -> Self {
        Self {
            table,
            ebms_message_id: None,
            kind: FaultKind::Transient,
            remaining: Some(times),
        }
    }
}

#[derive(Debug, Default)]
struct Tables {
    next_id: EntityId,
    in_messages: BTreeMap<EntityId, InMessage>,
    out_messages: BTreeMap<EntityId, OutMessage>,
    in_exceptions: BTreeMap<EntityId, InException>,
    out_exceptions: BTreeMap<EntityId, OutException>,
    retry_reliability: BTreeMap<EntityId, RetryReliability>,
    reception_awareness: BTreeMap<EntityId, ReceptionAwareness>,
}

impl Tables {
    fn allocate_id(&mut self) -> EntityId {
        self.next_id += 1;
        self.next_id
    }

    /// A resent message gets its send budget back, keeping the count spent
    fn reopen_send_retry(&mut self, message_id: EntityId, now: DateTime<Utc>) {
        let target = RetryTarget::OutMessage(message_id);
        for record in self
            .retry_reliability
            .values_mut()
            .filter(|r| r.target == target && r.retry_type == RetryType::Send)
        {
            record.status = RetryStatus::Pending;
            record.modification_time = now;
        }
    }

    fn operation_of(&self, target: RetryTarget) -> Option<Operation> {
        match target {
            RetryTarget::InMessage(id) => self.in_messages.get(&id).map(|m| m.operation),
            RetryTarget::OutMessage(id) => self.out_messages.get(&id).map(|m| m.operation),
            RetryTarget::InException(id) => self.in_exceptions.get(&id).map(|e| e.operation),
            RetryTarget::OutException(id) => self.out_exceptions.get(&id).map(|e| e.operation),
        }
    }

    fn transition(
        &mut self,
        target: RetryTarget,
        expected: Operation,
        event: OperationEvent,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let not_found = StoreError::NotFound {
            table: target.table(),
            id: target.entity_id(),
        };
        match target {
            RetryTarget::InMessage(id) => {
                let message = self.in_messages.get_mut(&id).ok_or(not_found)?;
                step_message(message, expected, event, now)
            }
            RetryTarget::OutMessage(id) => {
                let message = self.out_messages.get_mut(&id).ok_or(not_found)?;
                step_message(message, expected, event, now)
            }
            RetryTarget::InException(id) => {
                let exception = self.in_exceptions.get_mut(&id).ok_or(not_found)?;
                step_exception(exception, expected, event, now)
            }
            RetryTarget::OutException(id) => {
                let exception = self.out_exceptions.get_mut(&id).ok_or(not_found)?;
                step_exception(exception, expected, event, now)
            }
        }
    }
}

fn step_message<S: MessageStatus>(
    message: &mut MessageEntity<S>,
    expected: Operation,
    event: OperationEvent,
    now: DateTime<Utc>,
) -> StoreResult<bool> {
    if message.operation != expected {
        return Ok(false);
    }
    let next = determine_target_operation(expected, event)?;
    message.operation = next;
    if let Some(status) = S::for_operation(next) {
        message.status = status;
    }
    message.modification_time = now;
    Ok(true)
}

fn step_exception<D>(
    exception: &mut ExceptionEntity<D>,
    expected: Operation,
    event: OperationEvent,
    now: DateTime<Utc>,
) -> StoreResult<bool> {
    if exception.operation != expected {
        return Ok(false);
    }
    exception.operation = determine_target_operation(expected, event)?;
    exception.modification_time = now;
    Ok(true)
}

fn claim_messages<S: MessageStatus>(
    table: &mut BTreeMap<EntityId, MessageEntity<S>>,
    from: Operation,
    limit: u32,
    now: DateTime<Utc>,
) -> StoreResult<Vec<MessageEntity<S>>> {
    let to = determine_target_operation(from, OperationEvent::Claim)?;
    Ok(table
        .values_mut()
        .filter(|m| m.operation == from)
        .take(limit as usize)
        .map(|m| {
            m.operation = to;
            m.modification_time = now;
            m.clone()
        })
        .collect())
}

fn claim_exceptions<D: ExceptionDirection + Clone>(
    table: &mut BTreeMap<EntityId, ExceptionEntity<D>>,
    from: Operation,
    limit: u32,
    now: DateTime<Utc>,
) -> StoreResult<Vec<ExceptionEntity<D>>> {
    let to = determine_target_operation(from, OperationEvent::Claim)?;
    Ok(table
        .values_mut()
        .filter(|e| e.operation == from)
        .take(limit as usize)
        .map(|e| {
            e.operation = to;
            e.modification_time = now;
            e.clone()
        })
        .collect())
}

/// Entity store held entirely in process memory
#[derive(Debug, Default)]
pub struct InMemoryEntityStore {
    tables: Mutex<Tables>,
    faults: Mutex<Vec<FaultRule>>,
    retry: TransientRetryPolicy,
}

impl InMemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retry_policy(mut self, retry: TransientRetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn inject_fault(&self, rule: FaultRule) {
        self.faults.lock().push(rule);
    }

    pub fn clear_faults(&self) {
        self.faults.lock().clear();
    }

    pub fn in_messages(&self) -> Vec<InMessage> {
        self.tables.lock().in_messages.values().cloned().collect()
    }

    pub fn out_messages(&self) -> Vec<OutMessage> {
        self.tables.lock().out_messages.values().cloned().collect()
    }

    pub fn in_exceptions(&self) -> Vec<InException> {
        self.tables.lock().in_exceptions.values().cloned().collect()
    }

    pub fn out_exceptions(&self) -> Vec<OutException> {
        self.tables.lock().out_exceptions.values().cloned().collect()
    }

    pub fn retry_records(&self) -> Vec<RetryReliability> {
        self.tables.lock().retry_reliability.values().cloned().collect()
    }

    pub fn reception_records(&self) -> Vec<ReceptionAwareness> {
        self.tables.lock().reception_awareness.values().cloned().collect()
    }

    /// Fire a matching injected fault, consuming one use of it
    fn check_fault(&self, table: &'static str, ebms_message_id: Option<&str>) -> StoreResult<()> {
        let mut faults = self.faults.lock();
        let Some(rule) = faults.iter_mut().find(|rule| {
            rule.table == table
                && rule.remaining != Some(0)
                && match (&rule.ebms_message_id, ebms_message_id) {
                    (None, _) => true,
                    (Some(wanted), Some(actual)) => wanted == actual,
                    (Some(_), None) => false,
                }
        }) else {
            return Ok(());
        };

        if let Some(remaining) = rule.remaining.as_mut() {
            *remaining -= 1;
        }
        let reason = format!("injected fault on {table}");
        match rule.kind {
            FaultKind::Transient => Err(StoreError::Transient(reason)),
            FaultKind::Permanent => Err(StoreError::Database(reason)),
        }
    }

    fn try_insert_in_message(&self, message: &InMessage) -> StoreResult<InMessage> {
        self.check_fault(InStatus::TABLE, Some(message.ebms_message_id()))?;
        let mut tables = self.tables.lock();
        let mut stored = message.clone();
        stored.id = tables.allocate_id();
        stored.modification_time = Utc::now();
        tables.in_messages.insert(stored.id, stored.clone());
        Ok(stored)
    }

    fn try_insert_out_message(&self, message: &OutMessage) -> StoreResult<OutMessage> {
        self.check_fault(OutStatus::TABLE, Some(message.ebms_message_id()))?;
        let mut tables = self.tables.lock();
        if tables
            .out_messages
            .values()
            .any(|m| m.ebms_message_id() == message.ebms_message_id())
        {
            return Err(StoreError::Duplicate {
                table: OutStatus::TABLE,
                key: message.ebms_message_id().to_string(),
            });
        }
        let mut stored = message.clone();
        stored.id = tables.allocate_id();
        stored.modification_time = Utc::now();
        tables.out_messages.insert(stored.id, stored.clone());
        Ok(stored)
    }

    fn try_insert_in_exception(&self, exception: &InException) -> StoreResult<InException> {
        self.check_fault(
            crate::models::Inbound::TABLE,
            exception.ebms_ref_to_message_id.as_deref(),
        )?;
        let mut tables = self.tables.lock();
        let mut stored = exception.clone();
        stored.id = tables.allocate_id();
        tables.in_exceptions.insert(stored.id, stored.clone());
        Ok(stored)
    }

    fn try_insert_out_exception(&self, exception: &OutException) -> StoreResult<OutException> {
        self.check_fault(
            crate::models::Outbound::TABLE,
            exception.ebms_ref_to_message_id.as_deref(),
        )?;
        let mut tables = self.tables.lock();
        let mut stored = exception.clone();
        stored.id = tables.allocate_id();
        tables.out_exceptions.insert(stored.id, stored.clone());
        Ok(stored)
    }

    fn try_set_in_message_status(&self, id: EntityId, status: InStatus) -> StoreResult<()> {
        let ebms_id = {
            let tables = self.tables.lock();
            tables
                .in_messages
                .get(&id)
                .map(|m| m.ebms_message_id().to_string())
        };
        self.check_fault(InStatus::TABLE, ebms_id.as_deref())?;

        let mut tables = self.tables.lock();
        let message = tables.in_messages.get_mut(&id).ok_or(StoreError::NotFound {
            table: InStatus::TABLE,
            id,
        })?;
        message.status = status;
        message.modification_time = Utc::now();
        Ok(())
    }

    fn try_set_out_message_status(
        &self,
        id: EntityId,
        status: OutStatus,
        message_type: Option<MessageType>,
    ) -> StoreResult<()> {
        let ebms_id = {
            let tables = self.tables.lock();
            tables
                .out_messages
                .get(&id)
                .map(|m| m.ebms_message_id().to_string())
        };
        self.check_fault(OutStatus::TABLE, ebms_id.as_deref())?;

        let mut tables = self.tables.lock();
        let message = tables
            .out_messages
            .get_mut(&id)
            .ok_or(StoreError::NotFound {
                table: OutStatus::TABLE,
                id,
            })?;
        message.status = status;
        if let Some(message_type) = message_type {
            message.ebms_message_type = message_type;
        }
        message.modification_time = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl EntityStore for InMemoryEntityStore {
    async fn insert_in_message(&self, message: InMessage) -> StoreResult<InMessage> {
        let message = &message;
        self.retry
            .run("insert_in_message", move || {
                futures::future::ready(self.try_insert_in_message(message))
            })
            .await
    }

    async fn insert_out_message(&self, message: OutMessage) -> StoreResult<OutMessage> {
        let message = &message;
        self.retry
            .run("insert_out_message", move || {
                futures::future::ready(self.try_insert_out_message(message))
            })
            .await
    }

    async fn get_in_message(&self, id: EntityId) -> StoreResult<InMessage> {
        self.tables
            .lock()
            .in_messages
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound {
                table: InStatus::TABLE,
                id,
            })
    }

    async fn get_out_message(&self, id: EntityId) -> StoreResult<OutMessage> {
        self.tables
            .lock()
            .out_messages
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound {
                table: OutStatus::TABLE,
                id,
            })
    }

    async fn find_in_message_by_ebms_id(
        &self,
        ebms_message_id: &str,
    ) -> StoreResult<Option<InMessage>> {
        Ok(self
            .tables
            .lock()
            .in_messages
            .values()
            .find(|m| m.ebms_message_id() == ebms_message_id && !m.is_duplicate)
            .cloned())
    }

    async fn find_out_message_by_ebms_id(
        &self,
        ebms_message_id: &str,
    ) -> StoreResult<Option<OutMessage>> {
        Ok(self
            .tables
            .lock()
            .out_messages
            .values()
            .find(|m| m.ebms_message_id() == ebms_message_id)
            .cloned())
    }

    #[instrument(skip(self))]
    async fn claim_in_messages(&self, from: Operation, limit: u32) -> StoreResult<Vec<InMessage>> {
        self.check_fault(InStatus::TABLE, None)?;
        let mut tables = self.tables.lock();
        let claimed = claim_messages(&mut tables.in_messages, from, limit, Utc::now())?;
        debug!(count = claimed.len(), "Claimed inbound messages");
        Ok(claimed)
    }

    #[instrument(skip(self))]
    async fn claim_out_messages(&self, from: Operation, limit: u32) -> StoreResult<Vec<OutMessage>> {
        self.check_fault(OutStatus::TABLE, None)?;
        let mut tables = self.tables.lock();
        let claimed = claim_messages(&mut tables.out_messages, from, limit, Utc::now())?;
        debug!(count = claimed.len(), "Claimed outbound messages");
        Ok(claimed)
    }

    async fn set_in_message_status(&self, id: EntityId, status: InStatus) -> StoreResult<()> {
        self.retry
            .run("set_in_message_status", move || {
                futures::future::ready(self.try_set_in_message_status(id, status))
            })
            .await
    }

    async fn set_out_message_status(
        &self,
        id: EntityId,
        status: OutStatus,
        message_type: Option<MessageType>,
    ) -> StoreResult<()> {
        self.retry
            .run("set_out_message_status", move || {
                futures::future::ready(self.try_set_out_message_status(id, status, message_type))
            })
            .await
    }

    async fn update_out_message_body(
        &self,
        id: EntityId,
        message_location: &str,
        is_signed: bool,
        is_encrypted: bool,
    ) -> StoreResult<()> {
        let mut tables = self.tables.lock();
        let message = tables
            .out_messages
            .get_mut(&id)
            .ok_or(StoreError::NotFound {
                table: OutStatus::TABLE,
                id,
            })?;
        message.message_location = Some(message_location.to_string());
        message.is_signed = is_signed;
        message.is_encrypted = is_encrypted;
        message.modification_time = Utc::now();
        Ok(())
    }

    async fn has_acknowledgement(&self, ebms_message_id: &str) -> StoreResult<bool> {
        Ok(self.tables.lock().in_messages.values().any(|m| {
            m.ebms_message_type.is_signal()
                && m.ebms_ref_to_message_id.as_deref() == Some(ebms_message_id)
        }))
    }

    async fn insert_in_exception(&self, exception: InException) -> StoreResult<InException> {
        let exception = &exception;
        self.retry
            .run("insert_in_exception", move || {
                futures::future::ready(self.try_insert_in_exception(exception))
            })
            .await
    }

    async fn insert_out_exception(&self, exception: OutException) -> StoreResult<OutException> {
        let exception = &exception;
        self.retry
            .run("insert_out_exception", move || {
                futures::future::ready(self.try_insert_out_exception(exception))
            })
            .await
    }

    async fn get_in_exception(&self, id: EntityId) -> StoreResult<InException> {
        self.tables
            .lock()
            .in_exceptions
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound {
                table: crate::models::Inbound::TABLE,
                id,
            })
    }

    async fn get_out_exception(&self, id: EntityId) -> StoreResult<OutException> {
        self.tables
            .lock()
            .out_exceptions
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound {
                table: crate::models::Outbound::TABLE,
                id,
            })
    }

    async fn claim_in_exceptions(
        &self,
        from: Operation,
        limit: u32,
    ) -> StoreResult<Vec<InException>> {
        let mut tables = self.tables.lock();
        claim_exceptions(&mut tables.in_exceptions, from, limit, Utc::now())
    }

    async fn claim_out_exceptions(
        &self,
        from: Operation,
        limit: u32,
    ) -> StoreResult<Vec<OutException>> {
        let mut tables = self.tables.lock();
        claim_exceptions(&mut tables.out_exceptions, from, limit, Utc::now())
    }

    async fn find_in_exceptions_by_ref(
        &self,
        ebms_message_id: &str,
    ) -> StoreResult<Vec<InException>> {
        Ok(self
            .tables
            .lock()
            .in_exceptions
            .values()
            .filter(|e| e.ebms_ref_to_message_id.as_deref() == Some(ebms_message_id))
            .cloned()
            .collect())
    }

    async fn find_out_exceptions_by_ref(
        &self,
        ebms_message_id: &str,
    ) -> StoreResult<Vec<OutException>> {
        Ok(self
            .tables
            .lock()
            .out_exceptions
            .values()
            .filter(|e| e.ebms_ref_to_message_id.as_deref() == Some(ebms_message_id))
            .cloned()
            .collect())
    }

    async fn transition(
        &self,
        target: RetryTarget,
        expected: Operation,
        event: OperationEvent,
    ) -> StoreResult<bool> {
        self.tables
            .lock()
            .transition(target, expected, event, Utc::now())
    }

    async fn insert_retry_reliability(
        &self,
        record: RetryReliability,
    ) -> StoreResult<RetryReliability> {
        let mut tables = self.tables.lock();
        if tables
            .retry_reliability
            .values()
            .any(|r| r.target == record.target && r.retry_type == record.retry_type)
        {
            return Err(StoreError::Duplicate {
                table: "retry_reliability",
                key: format!("{} {}", record.target, record.retry_type),
            });
        }
        let mut stored = record;
        stored.id = tables.allocate_id();
        tables.retry_reliability.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn find_retry_reliability(
        &self,
        target: RetryTarget,
        retry_type: RetryType,
    ) -> StoreResult<Option<RetryReliability>> {
        Ok(self
            .tables
            .lock()
            .retry_reliability
            .values()
            .find(|r| r.target == target && r.retry_type == retry_type)
            .cloned())
    }

    #[instrument(skip(self))]
    async fn claim_due_retries(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> StoreResult<Vec<RetryReliability>> {
        let mut tables = self.tables.lock();
        let due: Vec<EntityId> = tables
            .retry_reliability
            .values()
            .filter(|r| {
                r.is_due(now) && tables.operation_of(r.target) == Some(Operation::ToBeRetried)
            })
            .take(limit as usize)
            .map(|r| r.id)
            .collect();

        let mut claimed = Vec::with_capacity(due.len());
        for id in due {
            if let Some(record) = tables.retry_reliability.get_mut(&id) {
                record.status = RetryStatus::Busy;
                record.modification_time = now;
                claimed.push(record.clone());
            }
        }
        Ok(claimed)
    }

    async fn rearm_retry(&self, record_id: EntityId) -> StoreResult<bool> {
        let mut tables = self.tables.lock();
        let now = Utc::now();
        let record = tables
            .retry_reliability
            .get(&record_id)
            .cloned()
            .ok_or(StoreError::NotFound {
                table: "retry_reliability",
                id: record_id,
            })?;
        if record.status != RetryStatus::Busy {
            return Ok(false);
        }

        let rearmed = tables.transition(
            record.target,
            Operation::ToBeRetried,
            OperationEvent::Rearm(record.retry_type),
            now,
        )?;

        if let Some(stored) = tables.retry_reliability.get_mut(&record_id) {
            stored.status = RetryStatus::Pending;
            stored.modification_time = now;
        }
        Ok(rearmed)
    }

    async fn apply_retry_update(&self, update: RetryUpdate) -> StoreResult<bool> {
        let mut tables = self.tables.lock();
        let now = Utc::now();

        if let Some(record_update) = &update.record {
            let record = tables
                .retry_reliability
                .get(&record_update.id)
                .ok_or(StoreError::NotFound {
                    table: "retry_reliability",
                    id: record_update.id,
                })?;
            if record.status.is_completed() {
                return Ok(false);
            }
        }

        if !tables.transition(update.target, update.expected, update.event, now)? {
            return Ok(false);
        }

        if let Some(record_update) = update.record {
            if let Some(record) = tables.retry_reliability.get_mut(&record_update.id) {
                record.current_retry_count = record_update.current_retry_count;
                record.status = record_update.status;
                record.last_retry_time = record_update.last_retry_time;
                record.modification_time = now;
            }
        }
        Ok(true)
    }

    async fn insert_reception_awareness(
        &self,
        record: ReceptionAwareness,
    ) -> StoreResult<ReceptionAwareness> {
        let mut tables = self.tables.lock();
        if tables
            .reception_awareness
            .values()
            .any(|r| r.ref_to_out_message_id == record.ref_to_out_message_id)
        {
            return Err(StoreError::Duplicate {
                table: "reception_awareness",
                key: record.ref_to_ebms_message_id,
            });
        }
        let mut stored = record;
        stored.id = tables.allocate_id();
        tables.reception_awareness.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn find_reception_awareness(
        &self,
        out_message_id: EntityId,
    ) -> StoreResult<Option<ReceptionAwareness>> {
        Ok(self
            .tables
            .lock()
            .reception_awareness
            .values()
            .find(|r| r.ref_to_out_message_id == out_message_id)
            .cloned())
    }

    #[instrument(skip(self))]
    async fn claim_due_reception_awareness(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> StoreResult<Vec<ReceptionAwareness>> {
        let mut tables = self.tables.lock();
        let due: Vec<EntityId> = tables
            .reception_awareness
            .values()
            .filter(|r| {
                r.status == RetryStatus::Pending
                    && r.is_due(now)
                    && tables
                        .out_messages
                        .get(&r.ref_to_out_message_id)
                        .is_some_and(|m| m.operation == Operation::Sent)
            })
            .take(limit as usize)
            .map(|r| r.id)
            .collect();

        let mut claimed = Vec::with_capacity(due.len());
        for id in due {
            if let Some(record) = tables.reception_awareness.get_mut(&id) {
                record.status = RetryStatus::Busy;
                record.modification_time = now;
                claimed.push(record.clone());
            }
        }
        Ok(claimed)
    }

    async fn apply_reception_update(&self, update: ReceptionUpdate) -> StoreResult<bool> {
        let mut tables = self.tables.lock();
        let now = Utc::now();

        let busy = tables
            .reception_awareness
            .get(&update.record_id)
            .ok_or(StoreError::NotFound {
                table: "reception_awareness",
                id: update.record_id,
            })?
            .status
            == RetryStatus::Busy;
        if !busy {
            return Ok(false);
        }

        if let Some((message_id, event)) = update.message {
            let moved = tables.transition(
                RetryTarget::OutMessage(message_id),
                Operation::Sent,
                event,
                now,
            )?;
            if !moved {
                if let Some(record) = tables.reception_awareness.get_mut(&update.record_id) {
                    record.status = RetryStatus::Pending;
                    record.modification_time = now;
                }
                return Ok(false);
            }
            if matches!(event, OperationEvent::Resend) {
                tables.reopen_send_retry(message_id, now);
            }
        }

        if let Some(exception) = update.exception {
            let mut stored = exception;
            stored.id = tables.allocate_id();
            tables.out_exceptions.insert(stored.id, stored);
        }

        if let Some(record) = tables.reception_awareness.get_mut(&update.record_id) {
            record.current_retry_count = update.current_retry_count;
            record.status = update.status;
            record.last_send_time = update.last_send_time;
            record.modification_time = now;
        }
        Ok(true)
    }

    async fn complete_reception_awareness(&self, ebms_message_id: &str) -> StoreResult<bool> {
        let mut tables = self.tables.lock();
        let now = Utc::now();
        let mut completed = false;
        for record in tables
            .reception_awareness
            .values_mut()
            .filter(|r| r.ref_to_ebms_message_id == ebms_message_id && !r.status.is_completed())
        {
            record.status = RetryStatus::Completed;
            record.modification_time = now;
            completed = true;
        }
        Ok(completed)
    }

    #[instrument(skip(self, criteria), fields(mpc = %criteria.mpc))]
    async fn select_piggyback_signal(
        &self,
        criteria: &PiggybackCriteria,
    ) -> StoreResult<Option<OutMessage>> {
        let mut tables = self.tables.lock();
        let selected = tables
            .out_messages
            .values()
            .filter(|m| criteria.matches(m))
            .min_by_key(|m| (m.insertion_time, m.id))
            .map(|m| m.id);

        let Some(id) = selected else {
            return Ok(None);
        };
        let to = determine_target_operation(Operation::ToBePiggyBacked, OperationEvent::Claim)?;
        let message = tables.out_messages.get_mut(&id).ok_or(StoreError::NotFound {
            table: OutStatus::TABLE,
            id,
        })?;
        message.operation = to;
        message.modification_time = Utc::now();
        Ok(Some(message.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn fast_store() -> InMemoryEntityStore {
        InMemoryEntityStore::new().with_retry_policy(TransientRetryPolicy::new(
            3,
            Duration::from_millis(1),
            Duration::from_millis(1),
        ))
    }

    #[tokio::test]
    async fn test_insert_assigns_identity() {
        let store = fast_store();
        let stored = store
            .insert_out_message(OutMessage::new("a@test"))
            .await
            .unwrap();
        assert!(stored.id > 0);
        assert_eq!(store.get_out_message(stored.id).await.unwrap(), stored);
    }

    #[tokio::test]
    async fn test_duplicate_out_message_rejected() {
        let store = fast_store();
        store.insert_out_message(OutMessage::new("dup@test")).await.unwrap();
        let err = store
            .insert_out_message(OutMessage::new("dup@test"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Duplicate { .. }));
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let store = fast_store();
        for i in 0..3 {
            store
                .insert_out_message(
                    OutMessage::new(format!("m{i}@test")).with_operation(Operation::ToBeSent),
                )
                .await
                .unwrap();
        }

        let first = store.claim_out_messages(Operation::ToBeSent, 2).await.unwrap();
        let second = store.claim_out_messages(Operation::ToBeSent, 10).await.unwrap();
        let third = store.claim_out_messages(Operation::ToBeSent, 10).await.unwrap();

        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 1);
        assert!(third.is_empty());
        assert!(first.iter().all(|m| m.operation == Operation::Sending));
    }

    #[tokio::test]
    async fn test_transition_is_check_and_set() {
        let store = fast_store();
        let stored = store
            .insert_in_message(InMessage::new("in@test").with_operation(Operation::Delivering))
            .await
            .unwrap();
        let target = RetryTarget::InMessage(stored.id);

        assert!(store
            .transition(target, Operation::Delivering, OperationEvent::Complete)
            .await
            .unwrap());
        assert!(!store
            .transition(target, Operation::Delivering, OperationEvent::Complete)
            .await
            .unwrap());

        let reloaded = store.get_in_message(stored.id).await.unwrap();
        assert_eq!(reloaded.operation, Operation::Delivered);
        assert_eq!(reloaded.status, InStatus::Delivered);
    }

    #[tokio::test]
    async fn test_transient_fault_is_retried() {
        let store = fast_store();
        store.inject_fault(FaultRule::transient("out_exceptions", 2));

        let stored = store
            .insert_out_exception(OutException::new(Some("x@test".to_string()), "boom"))
            .await
            .unwrap();
        assert!(stored.id > 0);
    }

    #[tokio::test]
    async fn test_permanent_fault_targets_one_message() {
        let store = fast_store();
        store.inject_fault(FaultRule::permanent("in_exceptions", Some("bad@test")));

        assert!(store
            .insert_in_exception(InException::new(Some("bad@test".to_string()), "e"))
            .await
            .is_err());
        assert!(store
            .insert_in_exception(InException::new(Some("good@test".to_string()), "e"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_retry_records_are_unique_per_kind() {
        let store = fast_store();
        let target = RetryTarget::InMessage(1);
        let record = RetryReliability::new(target, RetryType::Delivery, 3, Duration::from_secs(1));
        store.insert_retry_reliability(record.clone()).await.unwrap();

        assert!(store.insert_retry_reliability(record).await.is_err());
        assert!(store
            .insert_retry_reliability(RetryReliability::new(
                target,
                RetryType::Notification,
                3,
                Duration::from_secs(1)
            ))
            .await
            .is_ok());
    }
}
