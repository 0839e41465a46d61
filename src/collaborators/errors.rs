use thiserror::Error;

/// Failures reported by the external collaborators of the pipeline
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CollaboratorError {
    #[error("Policy mode not found: {0}")]
    PolicyNotFound(String),

    #[error("Unsupported content: {0}")]
    UnsupportedContent(String),

    #[error("Malformed content: {0}")]
    MalformedContent(String),

    #[error("Certificate not found: {0}")]
    CertificateNotFound(String),

    #[error("Cryptographic failure: {0}")]
    Cryptographic(String),

    #[error("Message body not found: {0}")]
    BodyNotFound(String),

    #[error("No sender registered for method type '{0}'")]
    UnknownSender(String),

    #[error("Collaborator configuration error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for CollaboratorError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

pub type CollaboratorResult<T> = Result<T, CollaboratorError>;
