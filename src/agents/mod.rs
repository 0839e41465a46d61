//! # Agents
//!
//! Long-running workers. Operation agents claim entities waiting in one
//! pending Operation and run them through a decorated pipeline; sweep agents
//! re-arm due retries and evaluate reception awareness; pull agents send a
//! pull request per configured sending policy. Claims are atomic in the
//! store, so any number of agent instances can poll the same table.

pub mod agent;
pub mod factory;
pub mod pull;
pub mod receiver;
pub mod sweep;

pub use agent::{run_polling, Agent, AgentCycle, PollingAgent};
pub use factory::AgentFactory;
pub use pull::PullRequestAgent;
pub use receiver::{DatastoreReceiver, EntitySource, OperationReceiver};
pub use sweep::{ReceptionAwarenessAgent, RetrySweepAgent};
