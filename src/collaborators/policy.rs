use parking_lot::RwLock;
use std::collections::HashMap;

use super::errors::{CollaboratorError, CollaboratorResult};
use crate::pmode::{ReceivingPMode, SendingPMode};

/// Looks up immutable policy modes by id
pub trait PolicyResolver: Send + Sync {
    fn sending_pmode(&self, id: &str) -> CollaboratorResult<SendingPMode>;

    fn receiving_pmode(&self, id: &str) -> CollaboratorResult<ReceivingPMode>;
}

/// Policy modes registered up front and kept in memory
#[derive(Debug, Default)]
pub struct StaticPolicyResolver {
    sending: RwLock<HashMap<String, SendingPMode>>,
    receiving: RwLock<HashMap<String, ReceivingPMode>>,
}

impl StaticPolicyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sending(self, pmode: SendingPMode) -> Self {
        self.insert_sending(pmode);
        self
    }

    pub fn with_receiving(self, pmode: ReceivingPMode) -> Self {
        self.insert_receiving(pmode);
        self
    }

    /// Add or replace a sending policy
    pub fn insert_sending(&self, pmode: SendingPMode) {
        self.sending.write().insert(pmode.id.clone(), pmode);
    }

    /// Add or replace a receiving policy
    pub fn insert_receiving(&self, pmode: ReceivingPMode) {
        self.receiving.write().insert(pmode.id.clone(), pmode);
    }
}

impl PolicyResolver for StaticPolicyResolver {
    fn sending_pmode(&self, id: &str) -> CollaboratorResult<SendingPMode> {
        self.sending
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| CollaboratorError::PolicyNotFound(id.to_string()))
    }

    fn receiving_pmode(&self, id: &str) -> CollaboratorResult<ReceivingPMode> {
        self.receiving
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| CollaboratorError::PolicyNotFound(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_by_direction() {
        let resolver = StaticPolicyResolver::new()
            .with_sending(SendingPMode::new("send-1"))
            .with_receiving(ReceivingPMode::new("recv-1"));

        assert_eq!(resolver.sending_pmode("send-1").unwrap().id, "send-1");
        assert_eq!(resolver.receiving_pmode("recv-1").unwrap().id, "recv-1");
        assert_eq!(
            resolver.sending_pmode("recv-1").unwrap_err(),
            CollaboratorError::PolicyNotFound("recv-1".to_string())
        );
    }
}
