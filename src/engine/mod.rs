//! Engine loop: state machine, command handling and the stage pipeline.

mod command;
mod context;
mod orchestrator;
mod state_machine;

pub use command::{EngineCommand, EngineEvent, EngineHandle, EngineSnapshot, TradingMode};
pub use context::EngineContext;
pub use orchestrator::Orchestrator;
pub use state_machine::StateMachine;
