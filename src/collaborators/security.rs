use async_trait::async_trait;

use super::errors::{CollaboratorError, CollaboratorResult};
use crate::models::As4Message;

/// Signs and encrypts outbound messages
#[async_trait]
pub trait SecurityStrategy: Send + Sync {
    async fn sign(
        &self,
        message: As4Message,
        certificate_ref: Option<&str>,
    ) -> CollaboratorResult<As4Message>;

    async fn encrypt(
        &self,
        message: As4Message,
        certificate_ref: Option<&str>,
    ) -> CollaboratorResult<As4Message>;
}

/// Marks messages signed / encrypted without applying any cryptography
///
/// Suitable for tests and for links secured at the transport layer. A
/// certificate reference is still required so misconfigured policies fail the
/// same way they would with a real strategy.
#[derive(Debug, Clone, Default)]
pub struct MarkingSecurityStrategy;

fn require_certificate(certificate_ref: Option<&str>) -> CollaboratorResult<&str> {
    certificate_ref
        .filter(|c| !c.is_empty())
        .ok_or_else(|| CollaboratorError::CertificateNotFound("<none configured>".to_string()))
}

#[async_trait]
impl SecurityStrategy for MarkingSecurityStrategy {
    async fn sign(
        &self,
        mut message: As4Message,
        certificate_ref: Option<&str>,
    ) -> CollaboratorResult<As4Message> {
        require_certificate(certificate_ref)?;
        message.is_signed = true;
        Ok(message)
    }

    async fn encrypt(
        &self,
        mut message: As4Message,
        certificate_ref: Option<&str>,
    ) -> CollaboratorResult<As4Message> {
        require_certificate(certificate_ref)?;
        message.is_encrypted = true;
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_marks_message() {
        let signed = MarkingSecurityStrategy
            .sign(As4Message::default(), Some("cert-a"))
            .await
            .unwrap();
        assert!(signed.is_signed);
        assert!(!signed.is_encrypted);
    }

    #[tokio::test]
    async fn test_missing_certificate() {
        let err = MarkingSecurityStrategy
            .encrypt(As4Message::default(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, CollaboratorError::CertificateNotFound(_)));
    }
}
