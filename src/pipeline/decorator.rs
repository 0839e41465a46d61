//! # Exception Decoration
//!
//! Wraps an agent's composite step. Failures are never swallowed: the
//! decorator persists what it can and always hands a failed
//! [`MessagingResult`] back to its caller.
//!
//! - Cancellation releases the claimed entity to the pending Operation it
//!   came from, so another sweep picks it up again.
//! - Transient infrastructure failures of a send, delivery or notification
//!   go through the [`RetryEngine`] like any retryable attempt; once the
//!   budget is spent they fail like everything else.
//! - Business-rule violations raised before anything was stored are rejected
//!   without persistence.
//! - Every other failure writes one exception record per referenced message
//!   id through the direction's [`ExceptionHandler`], then dead-letters the
//!   claimed entity if it is still in its in-progress Operation.
//!
//! A signal piggybacked on a failed pull request always goes back to
//! `ToBePiggyBacked`.

use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::context::{ContextEntity, MessagingContext};
use super::errors::StepError;
use super::step::Step;
use crate::collaborators::SendOutcome;
use crate::constants::{MessageType, RetryType};
use crate::logging::{log_error, log_message_operation};
use crate::models::{HasOperation, InException, OutException, RetryTarget};
use crate::retry::{RetryDecision, RetryEngine};
use crate::state_machine::{
    determine_target_operation, InStatus, Operation, OperationEvent, OutStatus,
};
use crate::store::EntityStore;

/// Outcome of one decorated pipeline run
#[derive(Debug, Clone)]
pub struct MessagingResult {
    pub succeeded: bool,
    pub context: MessagingContext,
    pub error: Option<StepError>,
}

impl MessagingResult {
    pub fn success(context: MessagingContext) -> Self {
        Self {
            succeeded: true,
            context,
            error: None,
        }
    }

    pub fn failure(context: MessagingContext, error: StepError) -> Self {
        Self {
            succeeded: false,
            context,
            error: Some(error),
        }
    }
}

/// Persists exception records for a failed run
#[async_trait]
pub trait ExceptionHandler: Send + Sync {
    fn direction(&self) -> &'static str;

    /// Best effort; returns how many exception records were written
    async fn handle(&self, context: &MessagingContext, error: &StepError) -> usize;
}

/// Error-handling wrapper applied once per agent
#[derive(Clone)]
pub struct ExceptionDecorator {
    inner: Arc<dyn Step>,
    handler: Arc<dyn ExceptionHandler>,
    store: Arc<dyn EntityStore>,
    retry: RetryEngine,
}

impl ExceptionDecorator {
    pub fn new(
        inner: Arc<dyn Step>,
        handler: Arc<dyn ExceptionHandler>,
        store: Arc<dyn EntityStore>,
        retry: RetryEngine,
    ) -> Self {
        Self {
            inner,
            handler,
            store,
            retry,
        }
    }

    pub fn name(&self) -> &'static str {
        self.inner.name()
    }

    #[instrument(skip_all, fields(pipeline = self.inner.name(), direction = self.handler.direction()))]
    pub async fn execute(
        &self,
        mut context: MessagingContext,
        cancel: &CancellationToken,
    ) -> MessagingResult {
        match self.inner.execute(&mut context, cancel).await {
            Ok(_) => MessagingResult::success(context),
            Err(error) => {
                self.release_piggybacked(&context).await;
                self.handle_failure(&context, &error).await;
                MessagingResult::failure(context, error)
            }
        }
    }

    async fn handle_failure(&self, context: &MessagingContext, error: &StepError) {
        if error.is_cancellation() {
            self.release(context, error).await;
            return;
        }

        if error.is_transient() && self.retry_transient(context, error).await {
            return;
        }

        if matches!(error, StepError::Validation(_)) && !context.has_persisted() {
            warn!(error = %error, "Rejected before anything was stored");
            return;
        }

        match &context.entity {
            // Failing to notify about an exception never creates another one
            Some(entity) if entity.is_exception() => warn!(
                entity = entity.entity_kind(),
                error = %error,
                "Exception record could not be processed"
            ),
            _ => {
                let written = self.handler.handle(context, error).await;
                debug!(written, error = %error, "Exception records persisted");
            }
        }

        self.dead_letter(context).await;
    }

    /// Charge a transient failure to the entity's retry budget
    ///
    /// Returns true when the failure is fully handled: a retry was scheduled,
    /// the decision could not be committed and the claim was released, or
    /// nothing was claimed at all. False means the failure continues down the
    /// dead-letter path.
    async fn retry_transient(&self, context: &MessagingContext, error: &StepError) -> bool {
        let Some((entity, from, _)) = Self::claimed(context) else {
            self.release(context, error).await;
            return true;
        };
        let Some(retry_type) = RetryType::for_pending(from) else {
            return false;
        };
        match self
            .retry
            .apply(entity.target(), retry_type, SendOutcome::RetryableFailure)
            .await
        {
            Ok(applied) => match applied.decision {
                RetryDecision::Retry { next_retry_count } => {
                    debug!(
                        target = %entity.target(),
                        %retry_type,
                        next_retry_count,
                        applied = applied.applied,
                        error = %error,
                        "Transient failure scheduled for retry"
                    );
                    true
                }
                RetryDecision::DeadLetter | RetryDecision::Complete => false,
            },
            Err(e) => {
                log_error(
                    "exception_decorator",
                    "retry_transient",
                    &e.to_string(),
                    Some(&entity.target().to_string()),
                );
                self.release(context, error).await;
                true
            }
        }
    }

    fn claimed(context: &MessagingContext) -> Option<(&ContextEntity, Operation, Operation)> {
        let entity = context.entity.as_ref()?;
        let from = context.claimed_from?;
        let claimed = determine_target_operation(from, OperationEvent::Claim).ok()?;
        Some((entity, from, claimed))
    }

    async fn release_piggybacked(&self, context: &MessagingContext) {
        let Some(signal) = &context.piggybacked else {
            return;
        };
        let target = RetryTarget::OutMessage(signal.id);
        match self
            .store
            .transition(
                target,
                Operation::Sending,
                OperationEvent::Release(Operation::ToBePiggyBacked),
            )
            .await
        {
            // False once the signal went out with a successful pull
            Ok(released) => debug!(%target, released, "Piggybacked signal handed back"),
            Err(e) => log_error(
                "exception_decorator",
                "release_piggybacked",
                &e.to_string(),
                Some(signal.ebms_message_id()),
            ),
        }
    }

    async fn release(&self, context: &MessagingContext, error: &StepError) {
        let Some((entity, from, claimed)) = Self::claimed(context) else {
            warn!(error = %error, "Run interrupted before any record was claimed");
            return;
        };
        match self
            .store
            .transition(entity.target(), claimed, OperationEvent::Release(from))
            .await
        {
            Ok(released) => debug!(
                target = %entity.target(),
                released,
                error = %error,
                "Claimed entity handed back"
            ),
            Err(e) => log_error(
                "exception_decorator",
                "release",
                &e.to_string(),
                Some(&entity.target().to_string()),
            ),
        }
    }

    async fn dead_letter(&self, context: &MessagingContext) {
        let Some((entity, _, claimed)) = Self::claimed(context) else {
            return;
        };
        match self
            .store
            .transition(entity.target(), claimed, OperationEvent::DeadLetter)
            .await
        {
            Ok(true) => log_message_operation(
                "dead_lettered",
                entity.entity_kind(),
                Some(entity.target().entity_id()),
                entity.ebms_message_id(),
                &Operation::DeadLettered.to_string(),
                None,
            ),
            // Already moved on, usually dead-lettered by the retry engine
            Ok(false) => {}
            Err(e) => log_error(
                "exception_decorator",
                "dead_letter",
                &e.to_string(),
                Some(&entity.target().to_string()),
            ),
        }
    }
}

fn notify_method_type(method: Option<&crate::pmode::Method>) -> String {
    method.map(|m| m.method_type.clone()).unwrap_or_default()
}

/// Writes InExceptions and marks the failed InMessages `Exception`
#[derive(Clone)]
pub struct InboundExceptionHandler {
    store: Arc<dyn EntityStore>,
    retry: RetryEngine,
}

impl InboundExceptionHandler {
    pub fn new(store: Arc<dyn EntityStore>, retry: RetryEngine) -> Self {
        Self { store, retry }
    }

    async fn mark_failed(&self, context: &MessagingContext, ebms_message_id: &str) {
        let known = context
            .stored_in_messages
            .iter()
            .chain(context.in_message().ok())
            .find(|m| m.ebms_message_id() == ebms_message_id)
            .map(|m| m.id);
        let id = match known {
            Some(id) => Some(id),
            None => match self.store.find_in_message_by_ebms_id(ebms_message_id).await {
                Ok(found) => found.map(|m| m.id),
                Err(e) => {
                    log_error("inbound_exception_handler", "find", &e.to_string(), Some(ebms_message_id));
                    None
                }
            },
        };
        if let Some(id) = id {
            if let Err(e) = self.store.set_in_message_status(id, InStatus::Exception).await {
                log_error(
                    "inbound_exception_handler",
                    "set_status",
                    &e.to_string(),
                    Some(ebms_message_id),
                );
            }
        }
    }
}

#[async_trait]
impl ExceptionHandler for InboundExceptionHandler {
    fn direction(&self) -> &'static str {
        "inbound"
    }

    async fn handle(&self, context: &MessagingContext, error: &StepError) -> usize {
        let pmode = context.receiving_pmode.clone().or_else(|| {
            context
                .in_message()
                .ok()
                .and_then(|m| m.receiving_pmode().ok().flatten())
        });
        let pmode_data = pmode.as_ref().and_then(|p| serde_json::to_string(p).ok());
        let body = context.received_message.as_ref().map(|r| r.body.clone());

        let mut ids: Vec<Option<String>> = context.message_ids().into_iter().map(Some).collect();
        if ids.is_empty() {
            ids.push(None);
        }

        let mut written = 0;
        for id in ids {
            let mut exception = InException::new(id.clone(), error.to_string());
            if let Some(pmode) = &pmode {
                exception = exception.with_pmode(pmode.id.clone(), pmode_data.clone());
                let handling = &pmode.exception_handling;
                if handling.notify_message_consumer {
                    exception =
                        exception.to_be_notified(notify_method_type(handling.notify_method.as_ref()));
                }
            }
            if let Some(body) = &body {
                exception = exception.with_body(body.clone());
            }

            match self.store.insert_in_exception(exception).await {
                Ok(stored) => {
                    written += 1;
                    log_message_operation(
                        "exception_recorded",
                        "in_exception",
                        Some(stored.id),
                        stored.ebms_ref_to_message_id.as_deref(),
                        &stored.operation.to_string(),
                        Some(&error.to_string()),
                    );
                    if let (Operation::ToBeNotified, Some(pmode)) = (stored.operation, &pmode) {
                        if let Err(e) = self
                            .retry
                            .schedule(
                                RetryTarget::InException(stored.id),
                                RetryType::Notification,
                                &pmode.exception_handling.reliability,
                            )
                            .await
                        {
                            log_error(
                                "inbound_exception_handler",
                                "schedule_notification",
                                &e.to_string(),
                                id.as_deref(),
                            );
                        }
                    }
                }
                Err(e) => log_error(
                    "inbound_exception_handler",
                    "insert_in_exception",
                    &e.to_string(),
                    id.as_deref(),
                ),
            }

            if let Some(id) = &id {
                self.mark_failed(context, id).await;
            }
        }
        written
    }
}

/// Ids an outbound failure is recorded against
///
/// A claimed OutMessage is the message that failed, even after a synchronous
/// reply has replaced the in-flight bundle.
fn failed_out_message_ids(context: &MessagingContext) -> Vec<String> {
    match &context.entity {
        Some(ContextEntity::OutMessage(message)) => vec![message.ebms_message_id().to_string()],
        _ => context.message_ids(),
    }
}

/// Writes OutExceptions and marks the failed OutMessages `Exception` / `Error`
#[derive(Clone)]
pub struct OutboundExceptionHandler {
    store: Arc<dyn EntityStore>,
    retry: RetryEngine,
}

impl OutboundExceptionHandler {
    pub fn new(store: Arc<dyn EntityStore>, retry: RetryEngine) -> Self {
        Self { store, retry }
    }

    async fn mark_failed(&self, context: &MessagingContext, ebms_message_id: &str) {
        let known = context
            .out_message()
            .ok()
            .filter(|m| m.ebms_message_id() == ebms_message_id)
            .map(|m| m.id);
        let id = match known {
            Some(id) => Some(id),
            None => match self.store.find_out_message_by_ebms_id(ebms_message_id).await {
                Ok(found) => found.map(|m| m.id),
                Err(e) => {
                    log_error("outbound_exception_handler", "find", &e.to_string(), Some(ebms_message_id));
                    None
                }
            },
        };
        if let Some(id) = id {
            if let Err(e) = self
                .store
                .set_out_message_status(id, OutStatus::Exception, Some(MessageType::Error))
                .await
            {
                log_error(
                    "outbound_exception_handler",
                    "set_status",
                    &e.to_string(),
                    Some(ebms_message_id),
                );
            }
        }
    }
}

#[async_trait]
impl ExceptionHandler for OutboundExceptionHandler {
    fn direction(&self) -> &'static str {
        "outbound"
    }

    async fn handle(&self, context: &MessagingContext, error: &StepError) -> usize {
        let pmode = context.sending_pmode.clone().or_else(|| {
            context
                .out_message()
                .ok()
                .and_then(|m| m.sending_pmode().ok().flatten())
        });
        let pmode_data = pmode.as_ref().and_then(|p| serde_json::to_string(p).ok());

        let mut ids: Vec<Option<String>> = failed_out_message_ids(context)
            .into_iter()
            .map(Some)
            .collect();
        if ids.is_empty() {
            ids.push(None);
        }

        let mut written = 0;
        for id in ids {
            let mut exception = OutException::new(id.clone(), error.to_string());
            if let Some(pmode) = &pmode {
                exception = exception.with_pmode(pmode.id.clone(), pmode_data.clone());
                let handling = &pmode.exception_handling;
                if handling.notify_message_producer {
                    exception =
                        exception.to_be_notified(notify_method_type(handling.notify_method.as_ref()));
                }
            }

            match self.store.insert_out_exception(exception).await {
                Ok(stored) => {
                    written += 1;
                    log_message_operation(
                        "exception_recorded",
                        "out_exception",
                        Some(stored.id),
                        stored.ebms_ref_to_message_id.as_deref(),
                        &stored.operation.to_string(),
                        Some(&error.to_string()),
                    );
                    if let (Operation::ToBeNotified, Some(pmode)) = (stored.operation, &pmode) {
                        if let Err(e) = self
                            .retry
                            .schedule(
                                RetryTarget::OutException(stored.id),
                                RetryType::Notification,
                                &pmode.exception_handling.reliability,
                            )
                            .await
                        {
                            log_error(
                                "outbound_exception_handler",
                                "schedule_notification",
                                &e.to_string(),
                                id.as_deref(),
                            );
                        }
                    }
                }
                Err(e) => log_error(
                    "outbound_exception_handler",
                    "insert_out_exception",
                    &e.to_string(),
                    id.as_deref(),
                ),
            }

            if let Some(id) = &id {
                self.mark_failed(context, id).await;
            }
        }
        written
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{As4Message, InMessage, MessageUnit, OutMessage, Receipt};
    use crate::pipeline::step::StepResult;
    use crate::pmode::RetryConfig;
    use crate::store::{InMemoryEntityStore, StoreError};
    use chrono::Utc;

    struct Failing(StepError);

    #[async_trait]
    impl Step for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn execute(
            &self,
            _context: &mut MessagingContext,
            _cancel: &CancellationToken,
        ) -> Result<StepResult, StepError> {
            Err(self.0.clone())
        }
    }

    fn transient() -> StepError {
        StepError::Store(StoreError::Transient("connection reset".into()))
    }

    fn inbound(store: &Arc<InMemoryEntityStore>, error: StepError) -> ExceptionDecorator {
        let retry = RetryEngine::new(store.clone());
        ExceptionDecorator::new(
            Arc::new(Failing(error)),
            Arc::new(InboundExceptionHandler::new(store.clone(), retry.clone())),
            store.clone(),
            retry,
        )
    }

    fn outbound(store: &Arc<InMemoryEntityStore>, error: StepError) -> ExceptionDecorator {
        let retry = RetryEngine::new(store.clone());
        ExceptionDecorator::new(
            Arc::new(Failing(error)),
            Arc::new(OutboundExceptionHandler::new(store.clone(), retry.clone())),
            store.clone(),
            retry,
        )
    }

    async fn claim_out(store: &InMemoryEntityStore, from: Operation) -> MessagingContext {
        let mut claimed = store.claim_out_messages(from, 1).await.unwrap();
        let message = claimed.pop().expect("one message to claim");
        MessagingContext::for_claimed(ContextEntity::OutMessage(message), from)
    }

    #[tokio::test]
    async fn test_transient_delivery_failures_spend_the_budget() {
        let store = Arc::new(InMemoryEntityStore::new());
        let message = store
            .insert_in_message(InMessage::new("in@test").with_operation(Operation::ToBeDelivered))
            .await
            .unwrap();
        let target = RetryTarget::InMessage(message.id);
        RetryEngine::new(store.clone())
            .schedule(target, RetryType::Delivery, &RetryConfig::enabled(2, 0))
            .await
            .unwrap();
        let decorator = inbound(&store, transient());
        let cancel = CancellationToken::new();

        for attempt in 1..=2 {
            let claimed = store
                .claim_in_messages(Operation::ToBeDelivered, 1)
                .await
                .unwrap();
            assert_eq!(claimed.len(), 1, "attempt {attempt}");
            let context = MessagingContext::for_claimed(
                ContextEntity::InMessage(claimed[0].clone()),
                Operation::ToBeDelivered,
            );
            let result = decorator.execute(context, &cancel).await;
            assert!(!result.succeeded);
            assert_eq!(
                store.get_in_message(message.id).await.unwrap().operation,
                Operation::ToBeRetried
            );

            let due = store.claim_due_retries(Utc::now(), 10).await.unwrap();
            assert_eq!(due.len(), 1);
            assert_eq!(due[0].current_retry_count, attempt);
            assert!(store.rearm_retry(due[0].id).await.unwrap());
        }
        assert!(store.in_exceptions().is_empty());

        let claimed = store
            .claim_in_messages(Operation::ToBeDelivered, 1)
            .await
            .unwrap();
        let context = MessagingContext::for_claimed(
            ContextEntity::InMessage(claimed[0].clone()),
            Operation::ToBeDelivered,
        );
        decorator.execute(context, &cancel).await;

        let stored = store.get_in_message(message.id).await.unwrap();
        assert_eq!(stored.operation, Operation::DeadLettered);
        assert_eq!(stored.status, InStatus::Exception);
        let exceptions = store.find_in_exceptions_by_ref("in@test").await.unwrap();
        assert_eq!(exceptions.len(), 1);
        let record = store
            .find_retry_reliability(target, RetryType::Delivery)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.current_retry_count, 2);
        assert!(record.status.is_completed());
    }

    #[tokio::test]
    async fn test_transient_failure_without_retry_kind_dead_letters() {
        let store = Arc::new(InMemoryEntityStore::new());
        let message = store
            .insert_out_message(OutMessage::new("out@test").with_operation(Operation::ToBeProcessed))
            .await
            .unwrap();
        let context = claim_out(&store, Operation::ToBeProcessed).await;

        let result = outbound(&store, transient())
            .execute(context, &CancellationToken::new())
            .await;

        assert!(result.error.unwrap().is_transient());
        let stored = store.get_out_message(message.id).await.unwrap();
        assert_eq!(stored.operation, Operation::DeadLettered);
        assert_eq!(stored.status, OutStatus::Exception);
        assert_eq!(store.find_out_exceptions_by_ref("out@test").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_send_is_handed_back() {
        let store = Arc::new(InMemoryEntityStore::new());
        let message = store
            .insert_out_message(OutMessage::new("out@test").with_operation(Operation::ToBeSent))
            .await
            .unwrap();
        let context = claim_out(&store, Operation::ToBeSent).await;

        let result = outbound(&store, StepError::Cancelled)
            .execute(context, &CancellationToken::new())
            .await;

        assert!(result.error.unwrap().is_cancellation());
        let stored = store.get_out_message(message.id).await.unwrap();
        assert_eq!(stored.operation, Operation::ToBeSent);
        assert!(store.out_exceptions().is_empty());
    }

    #[tokio::test]
    async fn test_failed_pull_hands_piggybacked_signal_back() {
        let store = Arc::new(InMemoryEntityStore::new());
        let signal = store
            .insert_out_message(
                OutMessage::new("receipt@test")
                    .with_message_type(MessageType::Receipt)
                    .with_operation(Operation::ToBePiggyBacked),
            )
            .await
            .unwrap();
        let target = RetryTarget::OutMessage(signal.id);
        assert!(store
            .transition(target, Operation::ToBePiggyBacked, OperationEvent::Claim)
            .await
            .unwrap());
        let context = MessagingContext {
            piggybacked: Some(store.get_out_message(signal.id).await.unwrap()),
            ..Default::default()
        };

        inbound(&store, StepError::MissingContext("pull response"))
            .execute(context, &CancellationToken::new())
            .await;

        assert_eq!(
            store.get_out_message(signal.id).await.unwrap().operation,
            Operation::ToBePiggyBacked
        );
    }

    #[tokio::test]
    async fn test_send_failure_after_reply_is_recorded_against_sent_message() {
        let store = Arc::new(InMemoryEntityStore::new());
        store
            .insert_out_message(OutMessage::new("sent@test").with_operation(Operation::ToBeSent))
            .await
            .unwrap();
        let mut context = claim_out(&store, Operation::ToBeSent).await;
        let reply = Receipt::for_message("sent@test");
        let reply_id = reply.message_id.clone();
        context.as4_message = Some(As4Message::single(MessageUnit::Receipt(reply)));

        outbound(&store, StepError::MissingContext("receiving pmode"))
            .execute(context, &CancellationToken::new())
            .await;

        assert_eq!(store.find_out_exceptions_by_ref("sent@test").await.unwrap().len(), 1);
        assert!(store.find_out_exceptions_by_ref(&reply_id).await.unwrap().is_empty());
        let stored = store.find_out_message_by_ebms_id("sent@test").await.unwrap().unwrap();
        assert_eq!(stored.operation, Operation::DeadLettered);
        assert_eq!(stored.status, OutStatus::Exception);
    }
}
