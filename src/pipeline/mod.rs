//! # Messaging Pipeline
//!
//! Agents run a [`CompositeStep`] wrapped once in an [`ExceptionDecorator`].
//! Steps receive the in-flight [`MessagingContext`] and a cancellation token,
//! and either continue, stop the chain early or raise a typed [`StepError`].
//!
//! Each stage performs exactly one forward Operation transition on success,
//! either directly or through the retry engine; the decorator handles
//! everything that goes wrong.

pub mod context;
pub mod decorator;
pub mod errors;
pub mod services;
pub mod step;
pub mod steps;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

pub use context::{ContextEntity, MessagingContext};
pub use decorator::{
    ExceptionDecorator, ExceptionHandler, InboundExceptionHandler, MessagingResult,
    OutboundExceptionHandler,
};
pub use errors::StepError;
pub use services::PipelineServices;
pub use step::{CompositeStep, Step, StepResult};

use crate::state_machine::Stage;
use steps::*;

/// Which side an exception record is written for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

/// The standard pipelines, one per agent role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineKind {
    Submit,
    Receive,
    Processing,
    Send,
    Pull,
    Deliver,
    Forward,
    Notify(Direction),
}

impl PipelineKind {
    pub fn direction(&self) -> Direction {
        match self {
            Self::Submit | Self::Processing | Self::Send => Direction::Outbound,
            Self::Receive | Self::Pull | Self::Deliver | Self::Forward => Direction::Inbound,
            Self::Notify(direction) => *direction,
        }
    }

    /// Composite step for this role
    pub fn composite(&self, services: &PipelineServices) -> CompositeStep {
        let s = || services.clone();
        match self {
            Self::Submit => CompositeStep::new("submit")
                .then(RetrieveSendingPModeStep::new(s()))
                .then(ValidateSubmitStep)
                .then(CreateAs4MessageStep)
                .then(StoreOutMessageStep::new(s())),
            Self::Receive => store_received(
                CompositeStep::new("receive").then(TransformReceivedMessageStep::new(s())),
                services,
            ),
            Self::Processing => CompositeStep::new("processing")
                .then(LoadEntityStep::new(s(), Stage::Processing))
                .then(SignStep::new(s()))
                .then(EncryptStep::new(s()))
                .then(StoreSecuredBodyStep::new(s())),
            // A synchronous reply continues as a received message
            Self::Send => store_received(
                CompositeStep::new("send")
                    .then(LoadEntityStep::new(s(), Stage::Send))
                    .then(SendMessageStep::new(s()))
                    .then(TransformReceivedMessageStep::new(s())),
                services,
            ),
            Self::Pull => store_received(
                CompositeStep::new("pull")
                    .then(SelectPiggybackSignalStep::new(s()))
                    .then(SendPullRequestStep::new(s()))
                    .then(HandlePullResponseStep::new(s())),
                services,
            ),
            Self::Deliver => CompositeStep::new("deliver")
                .then(LoadEntityStep::new(s(), Stage::Deliver))
                .then(DeliverMessageStep::new(s())),
            Self::Forward => CompositeStep::new("forward")
                .then(LoadEntityStep::new(s(), Stage::Forward))
                .then(ForwardMessageStep::new(s())),
            Self::Notify(_) => CompositeStep::new("notify")
                .then(LoadEntityStep::new(s(), Stage::Notify))
                .then(NotifyStep::new(s())),
        }
    }

    /// Composite step wrapped in the exception decorator of its direction
    pub fn build(&self, services: &PipelineServices) -> ExceptionDecorator {
        let handler: Arc<dyn ExceptionHandler> = match self.direction() {
            Direction::Inbound => Arc::new(InboundExceptionHandler::new(
                services.store.clone(),
                services.retry.clone(),
            )),
            Direction::Outbound => Arc::new(OutboundExceptionHandler::new(
                services.store.clone(),
                services.retry.clone(),
            )),
        };
        ExceptionDecorator::new(
            Arc::new(self.composite(services)),
            handler,
            services.store.clone(),
            services.retry.clone(),
        )
    }
}

/// Policy lookup, storage and receipts shared by every inbound path
fn store_received(composite: CompositeStep, services: &PipelineServices) -> CompositeStep {
    composite
        .then(DetermineReceivingPModeStep::new(services.clone()))
        .then(SaveReceivedMessageStep::new(services.clone()))
        .then(CreateReceiptStep::new(services.clone()))
}

impl fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Submit => write!(f, "submit"),
            Self::Receive => write!(f, "receive"),
            Self::Processing => write!(f, "processing"),
            Self::Send => write!(f, "send"),
            Self::Pull => write!(f, "pull"),
            Self::Deliver => write!(f, "deliver"),
            Self::Forward => write!(f, "forward"),
            Self::Notify(Direction::Inbound) => write!(f, "notify_inbound"),
            Self::Notify(Direction::Outbound) => write!(f, "notify_outbound"),
        }
    }
}
