use serde::{Deserialize, Serialize};
use std::fmt;

/// What happens next to a message or exception record
///
/// Values form independent sub-chains per lifecycle stage
/// (`ToBeSent → Sending → Sent`, `ToBeDelivered → Delivering → Delivered`, ...).
/// `NotApplicable` is the resting value for records that need no further work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    #[default]
    NotApplicable,
    ToBeProcessed,
    Processing,
    ToBeSent,
    Sending,
    Sent,
    DeadLettered,
    ToBeForwarded,
    Forwarding,
    Forwarded,
    ToBeRetried,
    ToBeNotified,
    Notifying,
    Notified,
    ToBeDelivered,
    Delivering,
    Delivered,
    ToBePiggyBacked,
}

impl Operation {
    /// Waiting to be claimed by an agent
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            Self::ToBeProcessed
                | Self::ToBeSent
                | Self::ToBeForwarded
                | Self::ToBeNotified
                | Self::ToBeDelivered
                | Self::ToBePiggyBacked
        )
    }

    /// Claimed and currently being worked on
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            Self::Processing | Self::Sending | Self::Forwarding | Self::Notifying | Self::Delivering
        )
    }

    /// No agent picks the record up again on its own
    ///
    /// `Sent` can still be re-armed by reception awareness when no receipt
    /// arrives in time.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::NotApplicable
                | Self::Sent
                | Self::DeadLettered
                | Self::Forwarded
                | Self::Notified
                | Self::Delivered
        )
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotApplicable => "not_applicable",
            Self::ToBeProcessed => "to_be_processed",
            Self::Processing => "processing",
            Self::ToBeSent => "to_be_sent",
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::DeadLettered => "dead_lettered",
            Self::ToBeForwarded => "to_be_forwarded",
            Self::Forwarding => "forwarding",
            Self::Forwarded => "forwarded",
            Self::ToBeRetried => "to_be_retried",
            Self::ToBeNotified => "to_be_notified",
            Self::Notifying => "notifying",
            Self::Notified => "notified",
            Self::ToBeDelivered => "to_be_delivered",
            Self::Delivering => "delivering",
            Self::Delivered => "delivered",
            Self::ToBePiggyBacked => "to_be_piggy_backed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_applicable" => Ok(Self::NotApplicable),
            "to_be_processed" => Ok(Self::ToBeProcessed),
            "processing" => Ok(Self::Processing),
            "to_be_sent" => Ok(Self::ToBeSent),
            "sending" => Ok(Self::Sending),
            "sent" => Ok(Self::Sent),
            "dead_lettered" => Ok(Self::DeadLettered),
            "to_be_forwarded" => Ok(Self::ToBeForwarded),
            "forwarding" => Ok(Self::Forwarding),
            "forwarded" => Ok(Self::Forwarded),
            "to_be_retried" => Ok(Self::ToBeRetried),
            "to_be_notified" => Ok(Self::ToBeNotified),
            "notifying" => Ok(Self::Notifying),
            "notified" => Ok(Self::Notified),
            "to_be_delivered" => Ok(Self::ToBeDelivered),
            "delivering" => Ok(Self::Delivering),
            "delivered" => Ok(Self::Delivered),
            "to_be_piggy_backed" => Ok(Self::ToBePiggyBacked),
            _ => Err(format!("Invalid operation: {s}")),
        }
    }
}

/// Monitoring status of an inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InStatus {
    #[default]
    Received,
    Delivered,
    Created,
    Notified,
    Exception,
}

impl fmt::Display for InStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Received => write!(f, "received"),
            Self::Delivered => write!(f, "delivered"),
            Self::Created => write!(f, "created"),
            Self::Notified => write!(f, "notified"),
            Self::Exception => write!(f, "exception"),
        }
    }
}

impl std::str::FromStr for InStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "received" => Ok(Self::Received),
            "delivered" => Ok(Self::Delivered),
            "created" => Ok(Self::Created),
            "notified" => Ok(Self::Notified),
            "exception" => Ok(Self::Exception),
            _ => Err(format!("Invalid inbound status: {s}")),
        }
    }
}

/// Monitoring status of an outbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OutStatus {
    #[default]
    Submitted,
    Nack,
    Ack,
    Sent,
    Created,
    Notified,
    Exception,
}

impl fmt::Display for OutStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Submitted => write!(f, "submitted"),
            Self::Nack => write!(f, "nack"),
            Self::Ack => write!(f, "ack"),
            Self::Sent => write!(f, "sent"),
            Self::Created => write!(f, "created"),
            Self::Notified => write!(f, "notified"),
            Self::Exception => write!(f, "exception"),
        }
    }
}

impl std::str::FromStr for OutStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "submitted" => Ok(Self::Submitted),
            "nack" => Ok(Self::Nack),
            "ack" => Ok(Self::Ack),
            "sent" => Ok(Self::Sent),
            "created" => Ok(Self::Created),
            "notified" => Ok(Self::Notified),
            "exception" => Ok(Self::Exception),
            _ => Err(format!("Invalid outbound status: {s}")),
        }
    }
}

/// Pipeline stage that claims entities in one Operation sub-chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Processing,
    Send,
    Deliver,
    Notify,
    Forward,
}

impl Stage {
    /// Operation an entity must have for this stage to claim it
    pub fn pending(&self) -> Operation {
        match self {
            Self::Processing => Operation::ToBeProcessed,
            Self::Send => Operation::ToBeSent,
            Self::Deliver => Operation::ToBeDelivered,
            Self::Notify => Operation::ToBeNotified,
            Self::Forward => Operation::ToBeForwarded,
        }
    }

    /// Operation while the stage works on the entity
    pub fn in_progress(&self) -> Operation {
        match self {
            Self::Processing => Operation::Processing,
            Self::Send => Operation::Sending,
            Self::Deliver => Operation::Delivering,
            Self::Notify => Operation::Notifying,
            Self::Forward => Operation::Forwarding,
        }
    }

    /// Operation after the stage succeeds
    pub fn done(&self) -> Operation {
        match self {
            Self::Processing => Operation::ToBeSent,
            Self::Send => Operation::Sent,
            Self::Deliver => Operation::Delivered,
            Self::Notify => Operation::Notified,
            Self::Forward => Operation::Forwarded,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Processing => write!(f, "processing"),
            Self::Send => write!(f, "send"),
            Self::Deliver => write!(f, "deliver"),
            Self::Notify => write!(f, "notify"),
            Self::Forward => write!(f, "forward"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_classification() {
        assert!(Operation::ToBeSent.is_pending());
        assert!(Operation::ToBePiggyBacked.is_pending());
        assert!(Operation::Delivering.is_in_progress());
        assert!(Operation::DeadLettered.is_terminal());
        assert!(!Operation::ToBeRetried.is_terminal());
        assert!(!Operation::ToBeRetried.is_pending());
    }

    #[test]
    fn test_operation_string_conversion() {
        assert_eq!(Operation::ToBePiggyBacked.to_string(), "to_be_piggy_backed");
        assert_eq!(
            "dead_lettered".parse::<Operation>().unwrap(),
            Operation::DeadLettered
        );
        assert!("teleporting".parse::<Operation>().is_err());
    }

    #[test]
    fn test_status_serde() {
        let json = serde_json::to_string(&OutStatus::Nack).unwrap();
        assert_eq!(json, "\"nack\"");

        let parsed: InStatus = serde_json::from_str("\"exception\"").unwrap();
        assert_eq!(parsed, InStatus::Exception);
    }

    #[test]
    fn test_stage_sub_chains() {
        for stage in [
            Stage::Processing,
            Stage::Send,
            Stage::Deliver,
            Stage::Notify,
            Stage::Forward,
        ] {
            assert!(stage.pending().is_pending());
            assert!(stage.in_progress().is_in_progress());
            assert_ne!(stage.pending(), stage.done());
        }
    }
}
