//! # Persisted Records and In-flight Messages
//!
//! The four record kinds tracked by the entity store (messages, exceptions,
//! retry-reliability and reception-awareness records) together with the
//! in-flight message model the pipeline steps pass around.

pub mod entity;
pub mod exception;
pub mod in_flight;
pub mod message;
pub mod reception_awareness;
pub mod retry_reliability;

pub use entity::{same_entity, Entity, EntityId, HasOperation, TRANSIENT_ID};
pub use exception::{
    ExceptionDirection, ExceptionEntity, InException, Inbound, OutException, Outbound,
};
pub use in_flight::{
    As4Message, DeliveryEnvelope, Envelope, ErrorDetail, ErrorSignal, MessageUnit,
    NotifyEnvelope, Payload, PullRequest, Receipt, ReceivedMessage, SubmitMessage, UserMessage,
};
pub use message::{InMessage, MessageEntity, MessageStatus, OutMessage};
pub use reception_awareness::ReceptionAwareness;
pub use retry_reliability::{RetryReliability, RetryTarget};
