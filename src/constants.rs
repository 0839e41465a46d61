//! # System Constants
//!
//! Enumerations and constants shared by the entity records, the policy modes
//! and the pipeline. Every enumeration persists as its `Display` string so the
//! tables stay readable for operational tooling.

use serde::{Deserialize, Serialize};
use std::fmt;

// Re-export state types for convenience
pub use crate::state_machine::{InStatus, Operation, OutStatus};

/// Internal system identifiers
pub mod system {
    /// URI scheme used for message bodies kept by the body store
    pub const BODY_LOCATION_SCHEME: &str = "as4-relay";

    /// Default MPC defined by the ebMS 3.0 core specification
    pub const DEFAULT_MPC: &str =
        "http://docs.oasis-open.org/ebxml-msg/ebms/v3.0/ns/core/200704/defaultMPC";

    /// Suffix appended to generated ebMS message ids
    pub const MESSAGE_ID_DOMAIN: &str = "as4-relay";

    /// Content type of envelopes produced by the relay
    pub const ENVELOPE_CONTENT_TYPE: &str = "application/soap+xml";

    /// Error code the ebMS core uses for "no message available on this MPC"
    pub const EMPTY_MPC_ERROR_CODE: &str = "EBMS:0006";

    /// Upper bound on entities claimed by one agent poll
    pub const MAX_CLAIM_BATCH: u32 = 500;

    /// Longest retry or reception-awareness interval a policy can ask for (one year)
    pub const MAX_RETRY_INTERVAL_SECS: u64 = 365 * 24 * 60 * 60;
}

/// Generate a new globally unique ebMS message id
pub fn generate_ebms_message_id() -> String {
    format!("{}@{}", uuid::Uuid::new_v4(), system::MESSAGE_ID_DOMAIN)
}

/// Message exchange pattern the message travels with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageExchangePattern {
    #[default]
    Push,
    Pull,
}

impl fmt::Display for MessageExchangePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Push => write!(f, "push"),
            Self::Pull => write!(f, "pull"),
        }
    }
}

impl std::str::FromStr for MessageExchangePattern {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "push" => Ok(Self::Push),
            "pull" => Ok(Self::Pull),
            _ => Err(format!("Invalid message exchange pattern: {s}")),
        }
    }
}

/// ebMS message type of a stored message unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    #[default]
    UserMessage,
    Receipt,
    Error,
}

impl MessageType {
    /// Receipts and errors are signal messages
    pub fn is_signal(&self) -> bool {
        matches!(self, Self::Receipt | Self::Error)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UserMessage => write!(f, "user_message"),
            Self::Receipt => write!(f, "receipt"),
            Self::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user_message" => Ok(Self::UserMessage),
            "receipt" => Ok(Self::Receipt),
            "error" => Ok(Self::Error),
            _ => Err(format!("Invalid message type: {s}")),
        }
    }
}

/// Kind of work a retry-reliability record tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryType {
    Delivery,
    Notification,
    Send,
}

impl RetryType {
    /// Retry kind that governs an entity claimed from `pending`
    pub fn for_pending(pending: Operation) -> Option<Self> {
        match pending {
            Operation::ToBeDelivered => Some(Self::Delivery),
            Operation::ToBeNotified => Some(Self::Notification),
            Operation::ToBeSent => Some(Self::Send),
            _ => None,
        }
    }

    /// Operation the entity returns to when a retry is re-armed
    pub fn pending_operation(&self) -> Operation {
        match self {
            Self::Delivery => Operation::ToBeDelivered,
            Self::Notification => Operation::ToBeNotified,
            Self::Send => Operation::ToBeSent,
        }
    }

    /// Operation the entity is in while the attempt is running
    pub fn in_progress_operation(&self) -> Operation {
        match self {
            Self::Delivery => Operation::Delivering,
            Self::Notification => Operation::Notifying,
            Self::Send => Operation::Sending,
        }
    }

    /// Terminal Operation after a successful attempt
    pub fn success_operation(&self) -> Operation {
        match self {
            Self::Delivery => Operation::Delivered,
            Self::Notification => Operation::Notified,
            Self::Send => Operation::Sent,
        }
    }
}

impl fmt::Display for RetryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Delivery => write!(f, "delivery"),
            Self::Notification => write!(f, "notification"),
            Self::Send => write!(f, "send"),
        }
    }
}

impl std::str::FromStr for RetryType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "delivery" => Ok(Self::Delivery),
            "notification" => Ok(Self::Notification),
            "send" => Ok(Self::Send),
            _ => Err(format!("Invalid retry type: {s}")),
        }
    }
}

/// Claim flag shared by retry-reliability and reception-awareness records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RetryStatus {
    #[default]
    Pending,
    Busy,
    Completed,
}

impl RetryStatus {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl fmt::Display for RetryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Busy => write!(f, "busy"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

impl std::str::FromStr for RetryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "busy" => Ok(Self::Busy),
            "completed" => Ok(Self::Completed),
            _ => Err(format!("Invalid retry status: {s}")),
        }
    }
}
