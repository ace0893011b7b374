//! Task execution callback.

use async_trait::async_trait;
use conductor_core::Task;
use conductor_quality::{Artifact, ValidationContext};

/// What a task produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionOutput {
    /// Produced files
    pub artifacts: Vec<Artifact>,
    /// Summary of the work done
    pub summary: String,
}

impl ExecutionOutput {
    /// Empty output.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an artifact.
    pub fn with_artifact(mut self, path: impl Into<String>, content: impl Into<String>) -> Self {
        self.artifacts.push(Artifact {
            path: path.into(),
            content: content.into(),
        });
        self
    }

    /// Set the summary.
    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = summary.into();
        self
    }

    /// Validation input for the task that produced this output.
    pub fn into_context(self, task: Task) -> ValidationContext {
        let mut context = ValidationContext::new(task).with_summary(self.summary);
        context.artifacts = self.artifacts;
        context
    }
}

/// Runs tasks on behalf of the orchestrator.
///
/// An error is recorded as a failed attempt; the scheduler decides whether
/// the task is retried.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Execute a task.
    async fn execute(&self, task: Task) -> anyhow::Result<ExecutionOutput>;
}
