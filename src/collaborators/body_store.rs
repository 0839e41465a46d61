//! Message body storage
//!
//! Bodies are addressed by location strings of the form
//! `as4-relay://<key>`, so message records never depend on where a body
//! physically lives.

use async_trait::async_trait;
use dashmap::DashMap;
use std::path::PathBuf;
use tracing::debug;

use super::errors::{CollaboratorError, CollaboratorResult};
use crate::constants::system::BODY_LOCATION_SCHEME;

/// Persists and retrieves message bodies by location
#[async_trait]
pub trait MessageBodyStore: Send + Sync {
    /// Store `body` under `key`, replacing any previous content; returns its location
    async fn save(&self, key: &str, body: &[u8]) -> CollaboratorResult<String>;

    async fn load(&self, location: &str) -> CollaboratorResult<Vec<u8>>;
}

/// Body key of an inbound message
pub fn inbound_key(ebms_message_id: &str) -> String {
    format!("in/{ebms_message_id}")
}

/// Body key of an outbound message
pub fn outbound_key(ebms_message_id: &str) -> String {
    format!("out/{ebms_message_id}")
}

fn location_for(key: &str) -> String {
    format!("{BODY_LOCATION_SCHEME}://{key}")
}

fn key_of(location: &str) -> CollaboratorResult<&str> {
    location
        .strip_prefix(BODY_LOCATION_SCHEME)
        .and_then(|rest| rest.strip_prefix("://"))
        .filter(|key| !key.is_empty())
        .ok_or_else(|| CollaboratorError::BodyNotFound(location.to_string()))
}

#[derive(Debug, Default)]
pub struct InMemoryBodyStore {
    bodies: DashMap<String, Vec<u8>>,
}

impl InMemoryBodyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.bodies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bodies.is_empty()
    }
}

#[async_trait]
impl MessageBodyStore for InMemoryBodyStore {
    async fn save(&self, key: &str, body: &[u8]) -> CollaboratorResult<String> {
        self.bodies.insert(key.to_string(), body.to_vec());
        Ok(location_for(key))
    }

    async fn load(&self, location: &str) -> CollaboratorResult<Vec<u8>> {
        let key = key_of(location)?;
        self.bodies
            .get(key)
            .map(|body| body.value().clone())
            .ok_or_else(|| CollaboratorError::BodyNotFound(location.to_string()))
    }
}

/// Keeps one file per body below a directory
#[derive(Debug, Clone)]
pub struct FileBodyStore {
    directory: PathBuf,
}

impl FileBodyStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let file_name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
            .collect();
        self.directory.join(file_name)
    }
}

#[async_trait]
impl MessageBodyStore for FileBodyStore {
    async fn save(&self, key: &str, body: &[u8]) -> CollaboratorResult<String> {
        tokio::fs::create_dir_all(&self.directory).await?;
        let path = self.path_for(key);
        tokio::fs::write(&path, body).await?;
        debug!(path = %path.display(), bytes = body.len(), "Stored message body");
        Ok(location_for(key))
    }

    async fn load(&self, location: &str) -> CollaboratorResult<Vec<u8>> {
        let path = self.path_for(key_of(location)?);
        match tokio::fs::read(&path).await {
            Ok(body) => Ok(body),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(CollaboratorError::BodyNotFound(location.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = InMemoryBodyStore::new();
        let location = store.save(&outbound_key("m@test"), b"body").await.unwrap();
        assert_eq!(location, "as4-relay://out/m@test");
        assert_eq!(store.load(&location).await.unwrap(), b"body".to_vec());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_directions_do_not_collide() {
        let store = InMemoryBodyStore::new();
        let inbound = store.save(&inbound_key("m@test"), b"in").await.unwrap();
        let outbound = store.save(&outbound_key("m@test"), b"out").await.unwrap();
        assert_eq!(store.load(&inbound).await.unwrap(), b"in".to_vec());
        assert_eq!(store.load(&outbound).await.unwrap(), b"out".to_vec());
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBodyStore::new(dir.path().join("bodies"));
        let location = store.save(&inbound_key("m@test"), b"payload").await.unwrap();
        assert_eq!(store.load(&location).await.unwrap(), b"payload".to_vec());
    }

    #[tokio::test]
    async fn test_missing_body() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBodyStore::new(dir.path());
        assert!(matches!(
            store.load("as4-relay://out/absent").await,
            Err(CollaboratorError::BodyNotFound(_))
        ));
        assert!(matches!(
            InMemoryBodyStore::new().load("s3://elsewhere").await,
            Err(CollaboratorError::BodyNotFound(_))
        ));
    }
}
