//! Configuration Loader
//!
//! Layers an optional TOML file under `AS4_RELAY__`-prefixed environment
//! variables (`AS4_RELAY__AGENTS__SEND__BATCH_SIZE=50`) and validates the result.

use config::{Config, Environment, File, FileFormat};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::error::{ConfigResult, ConfigurationError};
use super::RelayConfig;

/// Default configuration file looked up when no explicit path is given
pub const DEFAULT_CONFIG_PATH: &str = "config/as4-relay.toml";

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "AS4_RELAY";

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from `path`, or from the default location if it exists
    ///
    /// An explicit path must exist; the default location is optional.
    pub fn load(path: Option<&Path>) -> ConfigResult<RelayConfig> {
        let (file, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
        };

        debug!(
            path = %file.display(),
            required,
            "Loading relay configuration"
        );

        let settings = Config::builder()
            .add_source(File::from(file.as_path()).format(FileFormat::Toml).required(required))
            .add_source(Self::environment())
            .build()
            .map_err(|e| ConfigurationError::load_error(file.display().to_string(), e))?;

        Self::finish(settings, &file.display().to_string())
    }

    /// Load configuration from TOML text, still honouring environment overrides
    pub fn load_from_str(toml: &str) -> ConfigResult<RelayConfig> {
        let settings = Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .add_source(Self::environment())
            .build()
            .map_err(|e| ConfigurationError::load_error("inline toml", e))?;

        Self::finish(settings, "inline toml")
    }

    /// Runtime environment name (`AS4_RELAY_ENV`, then `APP_ENV`, then `development`)
    pub fn detect_environment() -> String {
        std::env::var("AS4_RELAY_ENV")
            .or_else(|_| std::env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string())
    }

    fn environment() -> Environment {
        Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true)
    }

    fn finish(settings: Config, source_name: &str) -> ConfigResult<RelayConfig> {
        let config: RelayConfig = settings
            .try_deserialize()
            .map_err(|e| ConfigurationError::load_error(source_name, e))?;

        config.validate()?;

        info!(
            source = source_name,
            environment = %Self::detect_environment(),
            store_backend = %config.store.backend,
            pull_agents = config.pull.len(),
            "Configuration loaded successfully"
        );

        Ok(config)
    }
}
