//! # External Collaborators
//!
//! Narrow interfaces the pipeline consumes: policy lookup, payload
//! transformation, transport senders, message security and body storage.
//! Each comes with a small implementation usable in tests and single-node
//! deployments; production wiring replaces them through [`crate::bootstrap`].

pub mod body_store;
pub mod errors;
pub mod policy;
pub mod security;
pub mod sender;
pub mod transformer;

pub use body_store::{inbound_key, outbound_key, FileBodyStore, InMemoryBodyStore, MessageBodyStore};
pub use errors::{CollaboratorError, CollaboratorResult};
pub use policy::{PolicyResolver, StaticPolicyResolver};
pub use security::{MarkingSecurityStrategy, SecurityStrategy};
pub use sender::{FileSender, SendOutcome, SendResult, Sender, SenderFactory, SenderRegistry};
pub use transformer::{JsonPayloadTransformer, PayloadTransformer};
