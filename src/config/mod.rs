//! # Relay Configuration
//!
//! One explicitly constructed configuration object, built at startup and
//! handed to the bootstrap. Values come from an optional TOML file layered
//! under `AS4_RELAY__`-prefixed environment variables.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use as4_relay::config::ConfigLoader;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ConfigLoader::load(None)?;
//! let send_batch = config.agents.send.batch_size;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigLoader;

/// Root configuration structure mirroring `config/as4-relay.toml`
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RelayConfig {
    pub database: DatabaseConfig,
    pub store: StoreConfig,
    pub agents: AgentsConfig,
    pub pull: Vec<PullAgentSettings>,
    pub body_store: BodyStoreConfig,
    pub receive: ReceiveConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
    pub acquire_timeout_seconds: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
            acquire_timeout_seconds: 30,
        }
    }
}

impl DatabaseConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_seconds)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Memory,
    Postgres,
}

impl fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory => write!(f, "memory"),
            Self::Postgres => write!(f, "postgres"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub transient_retry: TransientRetryConfig,
}

/// Bounded retry for transient store failures (serialization conflicts, deadlocks)
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TransientRetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for TransientRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 10,
            max_delay_ms: 1_000,
        }
    }
}

/// Polling settings of one agent
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct AgentSettings {
    pub enabled: bool,
    pub poll_interval_ms: u64,
    /// Entities claimed per poll
    pub batch_size: u32,
    /// Entities processed concurrently within one poll
    pub concurrency: usize,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: 1_000,
            batch_size: 20,
            concurrency: 4,
        }
    }
}

impl AgentSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct AgentsConfig {
    pub processing: AgentSettings,
    pub send: AgentSettings,
    pub deliver: AgentSettings,
    pub notify: AgentSettings,
    pub forward: AgentSettings,
    pub retry_sweep: AgentSettings,
    pub reception_awareness: AgentSettings,
}

impl AgentsConfig {
    /// Every polling agent's settings with the name it logs under
    pub fn named(&self) -> [(&'static str, &AgentSettings); 7] {
        [
            ("processing", &self.processing),
            ("send", &self.send),
            ("deliver", &self.deliver),
            ("notify", &self.notify),
            ("forward", &self.forward),
            ("retry_sweep", &self.retry_sweep),
            ("reception_awareness", &self.reception_awareness),
        ]
    }
}

/// One pull agent: periodically pulls on the MPC of a sending policy
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PullAgentSettings {
    pub sending_pmode_id: String,
    #[serde(default = "default_pull_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_pull_interval_ms() -> u64 {
    5_000
}

impl PullAgentSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BodyStoreKind {
    #[default]
    Memory,
    File,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BodyStoreConfig {
    pub kind: BodyStoreKind,
    pub directory: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ReceiveConfig {
    /// Receiving policy used when an inbound message carries no hint
    pub default_pmode_id: Option<String>,
}

impl RelayConfig {
    /// Validate configuration for consistency and required fields
    pub fn validate(&self) -> ConfigResult<()> {
        if self.store.backend == StoreBackend::Postgres
            && self.database.url.as_deref().map_or(true, str::is_empty)
        {
            return Err(ConfigurationError::missing_required_field(
                "database.url",
                "the postgres store backend",
            ));
        }

        if self.database.max_connections == 0 {
            return Err(ConfigurationError::invalid_value(
                "database.max_connections",
                "0",
                "pool size must be greater than 0",
            ));
        }

        if self.store.transient_retry.max_attempts == 0 {
            return Err(ConfigurationError::invalid_value(
                "store.transient_retry.max_attempts",
                "0",
                "at least one attempt is required",
            ));
        }

        for (name, settings) in self.agents.named() {
            if settings.batch_size == 0 {
                return Err(ConfigurationError::invalid_value(
                    format!("agents.{name}.batch_size"),
                    "0",
                    "batch size must be greater than 0",
                ));
            }
            if settings.concurrency == 0 {
                return Err(ConfigurationError::invalid_value(
                    format!("agents.{name}.concurrency"),
                    "0",
                    "concurrency must be greater than 0",
                ));
            }
        }

        for pull in &self.pull {
            if pull.sending_pmode_id.is_empty() {
                return Err(ConfigurationError::missing_required_field(
                    "pull.sending_pmode_id",
                    "pull agent configuration",
                ));
            }
        }

        if self.body_store.kind == BodyStoreKind::File && self.body_store.directory.is_none() {
            return Err(ConfigurationError::missing_required_field(
                "body_store.directory",
                "the file body store",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = RelayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.store.backend, StoreBackend::Memory);
    }

    #[test]
    fn test_postgres_requires_url() {
        let mut config = RelayConfig::default();
        config.store.backend = StoreBackend::Postgres;
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigurationError::MissingRequiredField { ref field, .. } if field == "database.url"
        ));

        config.database.url = Some("postgresql://localhost/as4".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_batch_rejected() {
        let mut config = RelayConfig::default();
        config.agents.notify.batch_size = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("agents.notify.batch_size"));
    }

    #[test]
    fn test_zero_transient_attempts_rejected() {
        let mut config = RelayConfig::default();
        config.store.transient_retry.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_file_body_store_requires_directory() {
        let mut config = RelayConfig::default();
        config.body_store.kind = BodyStoreKind::File;
        assert!(config.validate().is_err());
    }
}
