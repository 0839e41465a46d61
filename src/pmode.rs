//! # Processing Modes
//!
//! Policy documents that govern how an exchange is processed: where a message
//! goes, whether it is signed or encrypted, how receipts are handled and how
//! often delivery or notification is retried. Loading and watching policy
//! files is left to a `PolicyResolver`; the pipeline only reads these types.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::constants::{system, MessageExchangePattern};

/// Transport method: a sender discriminator plus its parameters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Method {
    /// Registry key of the sender, e.g. `FILE`
    #[serde(rename = "type")]
    pub method_type: String,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

impl Method {
    pub fn new(method_type: impl Into<String>) -> Self {
        Self {
            method_type: method_type.into(),
            parameters: HashMap::new(),
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(String::as_str)
    }
}

/// Retry budget for delivery, notification or send
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub is_enabled: bool,
    pub retry_count: u32,
    pub retry_interval_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            is_enabled: false,
            retry_count: 0,
            retry_interval_secs: 60,
        }
    }
}

impl RetryConfig {
    pub fn enabled(retry_count: u32, retry_interval_secs: u64) -> Self {
        Self {
            is_enabled: true,
            retry_count,
            retry_interval_secs,
        }
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs.min(system::MAX_RETRY_INTERVAL_SECS))
    }

    /// Budget that applies; disabled reliability means no retries at all
    pub fn effective_retry_count(&self) -> u32 {
        if self.is_enabled {
            self.retry_count
        } else {
            0
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PushConfiguration {
    pub url: Option<String>,
    /// Transport used to send; defaults to the `url` scheme when absent
    pub method: Option<Method>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagePackaging {
    pub mpc: Option<String>,
    pub from_party: Option<String>,
    pub to_party: Option<String>,
    pub conversation_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SigningConfig {
    pub is_enabled: bool,
    pub certificate_ref: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    pub is_enabled: bool,
    pub certificate_ref: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub signing: SigningConfig,
    pub encryption: EncryptionConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceptionAwarenessConfig {
    pub is_enabled: bool,
    pub retry_count: u32,
    pub retry_interval_secs: u64,
}

impl ReceptionAwarenessConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs.min(system::MAX_RETRY_INTERVAL_SECS))
    }
}

/// How the producing application hears about receipts, errors or exceptions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyHandling {
    pub notify_message_producer: bool,
    pub notify_method: Option<Method>,
    pub reliability: RetryConfig,
}

/// Sending side policy
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SendingPMode {
    pub id: String,
    /// Submit messages may fill values the policy leaves empty
    pub allow_override: bool,
    pub mep: MessageExchangePattern,
    pub push_configuration: PushConfiguration,
    pub message_packaging: MessagePackaging,
    pub security: SecurityConfig,
    pub reception_awareness: ReceptionAwarenessConfig,
    pub send_reliability: RetryConfig,
    pub receipt_handling: NotifyHandling,
    pub error_handling: NotifyHandling,
    pub exception_handling: NotifyHandling,
}

impl SendingPMode {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Transport method for outbound messages
    ///
    /// Falls back to the url scheme (`file://...` → `FILE`) with the url as the
    /// `location` parameter.
    pub fn send_method(&self) -> Option<Method> {
        let push = &self.push_configuration;
        if let Some(method) = &push.method {
            return Some(method.clone());
        }
        let url = push.url.as_deref()?;
        let (scheme, _) = url.split_once("://")?;
        Some(Method::new(scheme.to_ascii_uppercase()).with_parameter("location", url))
    }

    pub fn mpc(&self) -> &str {
        self.message_packaging
            .mpc
            .as_deref()
            .unwrap_or(crate::constants::system::DEFAULT_MPC)
    }

    pub fn signing_enabled(&self) -> bool {
        self.security.signing.is_enabled
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplyHandling {
    pub send_receipt: bool,
    /// Where receipts and errors for pushed messages go
    pub reply_url: Option<String>,
    pub reply_method: Option<Method>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliverConfig {
    pub is_enabled: bool,
    pub delivery_method: Option<Method>,
    pub reliability: RetryConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwardConfig {
    /// Sending policy used to pass the message on
    pub sending_pmode_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageHandling {
    pub deliver: DeliverConfig,
    pub forward: ForwardConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerNotifyHandling {
    pub notify_message_consumer: bool,
    pub notify_method: Option<Method>,
    pub reliability: RetryConfig,
}

/// Receiving side policy
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceivingPMode {
    pub id: String,
    pub reply_handling: ReplyHandling,
    pub message_handling: MessageHandling,
    pub exception_handling: ConsumerNotifyHandling,
}

impl ReceivingPMode {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn forwards(&self) -> bool {
        self.message_handling.forward.sending_pmode_id.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_method_from_url_scheme() {
        let mut pmode = SendingPMode::new("pm");
        pmode.push_configuration.url = Some("file:///tmp/out".to_string());

        let method = pmode.send_method().unwrap();
        assert_eq!(method.method_type, "FILE");
        assert_eq!(method.parameter("location"), Some("file:///tmp/out"));
    }

    #[test]
    fn test_explicit_method_wins() {
        let mut pmode = SendingPMode::new("pm");
        pmode.push_configuration.url = Some("http://partner/msh".to_string());
        pmode.push_configuration.method = Some(Method::new("FILE").with_parameter("location", "/x"));

        assert_eq!(pmode.send_method().unwrap().method_type, "FILE");
    }

    #[test]
    fn test_disabled_reliability_has_no_budget() {
        let mut reliability = RetryConfig::enabled(3, 5);
        assert_eq!(reliability.effective_retry_count(), 3);
        reliability.is_enabled = false;
        assert_eq!(reliability.effective_retry_count(), 0);
    }

    #[test]
    fn test_retry_interval_is_capped() {
        let reliability = RetryConfig::enabled(1, u64::MAX);
        assert_eq!(
            reliability.retry_interval(),
            Duration::from_secs(system::MAX_RETRY_INTERVAL_SECS)
        );
        let awareness = ReceptionAwarenessConfig {
            is_enabled: true,
            retry_count: 1,
            retry_interval_secs: 9_000_000_000_000,
        };
        assert_eq!(
            awareness.retry_interval(),
            Duration::from_secs(system::MAX_RETRY_INTERVAL_SECS)
        );
    }

    #[test]
    fn test_pmode_deserializes_with_defaults() {
        let pmode: ReceivingPMode = serde_json::from_str(
            r#"{"id":"recv","message_handling":{"deliver":{"is_enabled":true,"delivery_method":{"type":"FILE"}}}}"#,
        )
        .unwrap();
        assert!(pmode.message_handling.deliver.is_enabled);
        assert!(!pmode.forwards());
        assert!(!pmode.exception_handling.notify_message_consumer);
    }
}
