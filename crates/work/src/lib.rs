//! Orchestration root
//!
//! Wires the scheduler, optimizer and validation engine behind one
//! [`Orchestrator`], and carries configuration loading and tracing setup.

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod executor;
pub mod orchestrator;
pub mod telemetry;

pub use config::{LogFormat, LoggingConfig, OrchestratorConfig};
pub use error::{OrchestratorError, Result};
pub use executor::{ExecutionOutput, TaskExecutor};
pub use orchestrator::{Orchestrator, RunSummary};
pub use telemetry::init_tracing;
