//! Deployment engine

pub mod fsm;
pub mod git;
pub mod log_sink;
pub mod orchestrator;
pub mod ports;
pub mod runner;
pub mod supervisor;
pub mod unit;

pub use orchestrator::{EngineConfig, Orchestrator};
