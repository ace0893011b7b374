//! Orchestrator errors.

use conductor_evolution::OptimizerError;
use conductor_execution::SchedulerError;
use conductor_quality::ValidationError;
use thiserror::Error;

/// Errors surfaced by the orchestrator.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Scheduling failed
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    /// Optimization failed
    #[error(transparent)]
    Optimizer(#[from] OptimizerError),

    /// Validation misuse
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Configuration could not be parsed
    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),

    /// Configuration could not be read
    #[error("cannot read configuration: {0}")]
    Io(#[from] std::io::Error),

    /// Logging could not be installed
    #[error("cannot initialise tracing: {0}")]
    Telemetry(String),
}

/// Result type for orchestrator operations.
pub type Result<T> = std::result::Result<T, OrchestratorError>;
