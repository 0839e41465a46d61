//! # Pull Piggybacking
//!
//! Before a pull request goes out, at most one pending receipt or error that
//! waits on the same MPC and destination is bundled behind it, saving the
//! responder a round trip. Selection and the `ToBePiggyBacked → Sending`
//! move happen in one store transaction, so two pull agents can never bundle
//! the same signal.

use std::sync::Arc;
use tracing::{debug, instrument};

use crate::models::{As4Message, OutMessage, PullRequest};
use crate::pmode::SendingPMode;
use crate::state_machine::Operation;
use crate::store::{EntityStore, StoreResult};

/// What a stored signal must match to ride along with a pull request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PiggybackCriteria {
    pub mpc: String,
    pub url: String,
    /// Message-level signing configured on the sending policy
    pub signing_enabled: bool,
}

impl PiggybackCriteria {
    /// Criteria for pull requests sent with `pmode`; none without a push url
    pub fn for_pull(pull_request: &PullRequest, pmode: &SendingPMode) -> Option<Self> {
        let url = pmode.push_configuration.url.clone()?;
        Some(Self {
            mpc: pull_request.mpc.clone(),
            url,
            signing_enabled: pmode.signing_enabled(),
        })
    }

    /// Eligibility of a stored signal; ordering is the store's concern
    ///
    /// With signing disabled only unsigned signals qualify; signed ones wait
    /// for an authenticated pull.
    pub fn matches(&self, message: &OutMessage) -> bool {
        message.operation == Operation::ToBePiggyBacked
            && message.ebms_message_type.is_signal()
            && message.mpc.as_deref() == Some(self.mpc.as_str())
            && message.url.as_deref() == Some(self.url.as_str())
            && (self.signing_enabled || !message.is_signed)
    }
}

/// Picks the signal to bundle and builds the outgoing bundle
#[derive(Clone)]
pub struct PiggybackSelector {
    store: Arc<dyn EntityStore>,
}

impl PiggybackSelector {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self { store }
    }

    /// Claim the oldest matching signal, moving it to `Sending`
    #[instrument(skip(self), fields(mpc = %criteria.mpc, url = %criteria.url))]
    pub async fn select(&self, criteria: &PiggybackCriteria) -> StoreResult<Option<OutMessage>> {
        let selected = self.store.select_piggyback_signal(criteria).await?;
        match &selected {
            Some(signal) => debug!(
                entity_id = signal.id,
                ebms_message_id = signal.ebms_message_id(),
                "Piggybacking signal on pull request"
            ),
            None => debug!("No signal to piggyback; pull request goes alone"),
        }
        Ok(selected)
    }

    /// Pull request first, then the signal's units
    pub fn bundle(pull_request: As4Message, signal: Option<As4Message>) -> As4Message {
        let mut bundle = pull_request;
        if let Some(signal) = signal {
            bundle.units.extend(signal.units);
        }
        bundle
    }
}
