//! # Retry and Reception Awareness
//!
//! The business-level retry engine. Every send, deliver and notify attempt
//! ends in a [`SendOutcome`]; the engine turns it into a [`RetryDecision`] and
//! commits the retry record and the entity's Operation in one store
//! transaction. Eligibility for the next attempt is `last_retry_time +
//! retry_interval <= now` at the next sweep, so nothing depends on in-process
//! timers surviving a restart.
//!
//! Reception awareness watches sent user messages for a receipt and queues
//! resends (or dead-letters) when none arrives in time.
//!
//! ```rust
//! use as4_relay::constants::RetryType;
//! use as4_relay::models::{InMessage, RetryTarget};
//! use as4_relay::retry::{RetryDecision, RetryEngine, SendOutcome};
//! use as4_relay::state_machine::Operation;
//! use as4_relay::store::{EntityStore, InMemoryEntityStore};
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let store = Arc::new(InMemoryEntityStore::new());
//! let message = store
//!     .insert_in_message(InMessage::new("m-1@example").with_operation(Operation::Delivering))
//!     .await
//!     .unwrap();
//!
//! // Without a retry record the budget is zero
//! let engine = RetryEngine::new(store.clone());
//! let applied = engine
//!     .apply(
//!         RetryTarget::InMessage(message.id),
//!         RetryType::Delivery,
//!         SendOutcome::RetryableFailure,
//!     )
//!     .await
//!     .unwrap();
//! assert_eq!(applied.decision, RetryDecision::DeadLetter);
//! assert_eq!(
//!     store.get_in_message(message.id).await.unwrap().operation,
//!     Operation::DeadLettered
//! );
//! # });
//! ```

pub mod engine;
pub mod reception;

pub use crate::collaborators::SendOutcome;
pub use engine::{AppliedRetry, RetryDecision, RetryEngine};
pub use reception::{ReceptionAwarenessEngine, ReceptionDecision};
