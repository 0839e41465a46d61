// Operation state machine for relay entities
//
// Every message and exception record carries an Operation that drives what the
// pipeline does next and, for messages, a Status that only serves monitoring.
// Transitions are decided by one table so every agent, the retry engine and the
// stores agree on which moves are legal.

pub mod errors;
pub mod events;
pub mod guards;
pub mod operation_machine;
pub mod states;

// Re-export main types for convenient access
pub use errors::{GuardError, StateMachineError, StateMachineResult};
pub use events::OperationEvent;
pub use guards::{ExpectedOperationGuard, StateGuard};
pub use operation_machine::{determine_target_operation, OperationStateMachine};
pub use states::{InStatus, Operation, OutStatus, Stage};
