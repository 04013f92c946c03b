pub mod cli;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod execution;
pub mod indicators;
pub mod position;
pub mod risk;
pub mod scanner;
pub mod signal;

pub use config::{AppConfig, TradingPreset};
pub use engine::{EngineHandle, EngineSnapshot, Orchestrator, TradingMode};
pub use error::{EngineError, ErrorClass, Result};
