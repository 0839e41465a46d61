//! # Senders
//!
//! Transport senders are looked up by the method type a policy mode names
//! (`FILE`, `HTTP`, ...). The registry maps each discriminator to a factory and
//! is built once at startup; every resolution yields a freshly configured
//! sender, so senders never share per-destination state.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

use super::errors::{CollaboratorError, CollaboratorResult};
use crate::models::Envelope;
use crate::pmode::Method;

/// Three-valued result of a send, deliver or notify attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendOutcome {
    Success,
    /// Transient problem; trying again later may work
    RetryableFailure,
    /// Retrying cannot fix it (malformed data, rejected by the receiver)
    FatalFailure,
}

impl SendOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for SendOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::RetryableFailure => write!(f, "retryable_failure"),
            Self::FatalFailure => write!(f, "fatal_failure"),
        }
    }
}

/// Outcome of one transmission plus the synchronous reply, if any
#[derive(Debug, Clone, PartialEq)]
pub struct SendResult {
    pub outcome: SendOutcome,
    pub response: Option<Envelope>,
}

impl SendResult {
    pub fn success() -> Self {
        Self {
            outcome: SendOutcome::Success,
            response: None,
        }
    }

    pub fn with_response(response: Envelope) -> Self {
        Self {
            outcome: SendOutcome::Success,
            response: Some(response),
        }
    }

    pub fn retryable() -> Self {
        Self {
            outcome: SendOutcome::RetryableFailure,
            response: None,
        }
    }

    pub fn fatal() -> Self {
        Self {
            outcome: SendOutcome::FatalFailure,
            response: None,
        }
    }
}

/// Transport used to send, deliver or notify
///
/// Ordinary transport failures are reported through [`SendOutcome`], never as
/// errors.
#[async_trait]
pub trait Sender: Send + Sync {
    /// Apply the method parameters of the policy mode
    fn configure(&mut self, parameters: &HashMap<String, String>) -> CollaboratorResult<()>;

    async fn send(&self, envelope: &Envelope) -> SendResult;
}

pub type SenderFactory = Arc<dyn Fn() -> Box<dyn Sender> + Send + Sync>;

/// Discriminator → sender factory
#[derive(Clone, Default)]
pub struct SenderRegistry {
    factories: HashMap<String, SenderFactory>,
}

impl SenderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the senders shipped in this crate
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(FileSender::METHOD_TYPE, || {
            Box::new(FileSender::default()) as Box<dyn Sender>
        });
        registry
    }

    /// Register a factory; keys are case-insensitive
    pub fn register<F>(&mut self, method_type: &str, factory: F)
    where
        F: Fn() -> Box<dyn Sender> + Send + Sync + 'static,
    {
        self.factories
            .insert(method_type.to_ascii_uppercase(), Arc::new(factory));
    }

    pub fn method_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.keys().cloned().collect();
        types.sort();
        types
    }

    /// Build and configure a sender for `method`
    pub fn resolve(&self, method: &Method) -> CollaboratorResult<Box<dyn Sender>> {
        let factory = self
            .factories
            .get(&method.method_type.to_ascii_uppercase())
            .ok_or_else(|| CollaboratorError::UnknownSender(method.method_type.clone()))?;
        let mut sender = factory();
        sender.configure(&method.parameters)?;
        debug!(method_type = %method.method_type, "Resolved sender");
        Ok(sender)
    }
}

impl fmt::Debug for SenderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SenderRegistry")
            .field("method_types", &self.method_types())
            .finish()
    }
}

/// Writes each envelope as a file into a directory
///
/// Parameter `location` is the target directory, optionally as a `file://` url.
#[derive(Debug, Default)]
pub struct FileSender {
    directory: Option<PathBuf>,
}

impl FileSender {
    pub const METHOD_TYPE: &'static str = "FILE";

    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: Some(directory.into()),
        }
    }

    fn file_name(envelope: &Envelope) -> String {
        let stem: String = envelope
            .ebms_message_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
            .collect();
        let extension = if envelope.content_type.contains("json") {
            "json"
        } else {
            "xml"
        };
        format!("{stem}.{extension}")
    }
}

#[async_trait]
impl Sender for FileSender {
    fn configure(&mut self, parameters: &HashMap<String, String>) -> CollaboratorResult<()> {
        let location = parameters.get("location").ok_or_else(|| {
            CollaboratorError::Configuration("FILE method requires a 'location' parameter".into())
        })?;
        let path = location.strip_prefix("file://").unwrap_or(location);
        if path.is_empty() {
            return Err(CollaboratorError::Configuration(
                "FILE location must not be empty".to_string(),
            ));
        }
        self.directory = Some(PathBuf::from(path));
        Ok(())
    }

    async fn send(&self, envelope: &Envelope) -> SendResult {
        let Some(directory) = &self.directory else {
            warn!("FILE sender used without a location");
            return SendResult::fatal();
        };

        if let Err(e) = tokio::fs::create_dir_all(directory).await {
            warn!(directory = %directory.display(), error = %e, "Cannot create FILE destination");
            return SendResult::retryable();
        }

        let path = directory.join(Self::file_name(envelope));
        match tokio::fs::write(&path, &envelope.body).await {
            Ok(()) => {
                debug!(path = %path.display(), "Envelope written");
                SendResult::success()
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "FILE send failed");
                SendResult::retryable()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(id: &str) -> Envelope {
        Envelope {
            ebms_message_id: id.to_string(),
            content_type: "application/json".to_string(),
            body: b"{}".to_vec(),
        }
    }

    #[tokio::test]
    async fn test_file_sender_writes_envelope() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SenderRegistry::with_defaults();
        let method = Method::new("file")
            .with_parameter("location", format!("file://{}", dir.path().display()));

        let sender = registry.resolve(&method).unwrap();
        let result = sender.send(&envelope("abc@test")).await;

        assert_eq!(result.outcome, SendOutcome::Success);
        let written = std::fs::read(dir.path().join("abc_test.json")).unwrap();
        assert_eq!(written, b"{}".to_vec());
    }

    #[tokio::test]
    async fn test_unwritable_location_is_retryable() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();

        let sender = FileSender::new(blocker.join("nested"));
        let result = sender.send(&envelope("x@test")).await;
        assert_eq!(result.outcome, SendOutcome::RetryableFailure);
    }

    #[test]
    fn test_unknown_method_type() {
        let registry = SenderRegistry::with_defaults();
        let err = registry.resolve(&Method::new("SMTP")).err().unwrap();
        assert_eq!(err, CollaboratorError::UnknownSender("SMTP".to_string()));
    }

    #[test]
    fn test_file_sender_requires_location() {
        let registry = SenderRegistry::with_defaults();
        let err = registry.resolve(&Method::new("FILE")).err().unwrap();
        assert!(matches!(err, CollaboratorError::Configuration(_)));
    }
}
