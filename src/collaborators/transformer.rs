use super::errors::{CollaboratorError, CollaboratorResult};
use crate::constants::system;
use crate::models::{As4Message, ReceivedMessage};

/// Turns raw received content into an in-flight message
pub trait PayloadTransformer: Send + Sync {
    fn transform(&self, received: &ReceivedMessage) -> CollaboratorResult<As4Message>;
}

/// Reads the JSON rendition of an AS4 message produced by [`As4Message::to_envelope`]
#[derive(Debug, Clone, Default)]
pub struct JsonPayloadTransformer;

impl JsonPayloadTransformer {
    const ACCEPTED: [&'static str; 2] = [system::ENVELOPE_CONTENT_TYPE, "application/json"];
}

impl PayloadTransformer for JsonPayloadTransformer {
    fn transform(&self, received: &ReceivedMessage) -> CollaboratorResult<As4Message> {
        let media_type = received
            .content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        if !Self::ACCEPTED.contains(&media_type.as_str()) {
            return Err(CollaboratorError::UnsupportedContent(
                received.content_type.clone(),
            ));
        }

        serde_json::from_slice(&received.body)
            .map_err(|e| CollaboratorError::MalformedContent(e.to_string()))
    }
}
