//! The orchestration root.
//!
//! Owns one scheduler, one optimizer and one validation engine and exposes
//! the surface collaborators use: submit tasks, register criteria, query
//! state, and drive execution through a [`TaskExecutor`].

use conductor_core::{RecommendationId, Task, TaskFilter, TaskId, TaskSpec, TaskStatus};
use conductor_evolution::{
    OptimizationRecommendation, OptimizationResult, PerformanceMetrics, PerformanceOptimizer,
    SysinfoProbe, SystemProbe,
};
use conductor_execution::{FailureDisposition, ScheduledTask, TaskPriorityScheduler};
use conductor_quality::{
    ValidationContext, ValidationCriteria, ValidationEngine, ValidationReport, ValidationStatus,
};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{AbortHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::config::OrchestratorConfig;
use crate::error::Result;
use crate::executor::{ExecutionOutput, TaskExecutor};

/// Outcome of [`Orchestrator::run_until_idle`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    /// Tasks that completed
    pub completed: usize,
    /// Failed attempts, including retried ones
    pub failed_attempts: usize,
    /// Attempts that were requeued
    pub retried: usize,
    /// Tasks cancelled after exhausting retries
    pub cancelled: usize,
    /// Tasks left queued or blocked when nothing more could run
    pub unfinished: usize,
    /// Validation reports of completed tasks
    pub reports: Vec<ValidationReport>,
}

enum Outcome {
    Finished(ExecutionOutput),
    Errored(String),
    TimedOut(Duration),
}

/// Wires the scheduler, optimizer and validation engine together.
pub struct Orchestrator {
    config: OrchestratorConfig,
    scheduler: Arc<TaskPriorityScheduler>,
    optimizer: Arc<PerformanceOptimizer>,
    validation: Arc<ValidationEngine>,
}

impl Orchestrator {
    /// Build every component from `config`, sampling memory via `sysinfo`.
    pub fn new(config: OrchestratorConfig) -> Self {
        Self::with_probe(config, Arc::new(SysinfoProbe::new()))
    }

    /// Build every component with a custom memory probe.
    pub fn with_probe(config: OrchestratorConfig, probe: Arc<dyn SystemProbe>) -> Self {
        let scheduler = Arc::new(TaskPriorityScheduler::new(config.scheduler.clone()));
        let optimizer = Arc::new(PerformanceOptimizer::with_parts(
            config.optimizer.clone(),
            scheduler.clone(),
            scheduler.clone(),
            probe,
        ));
        let validation = Arc::new(ValidationEngine::new(config.validation.clone()));
        Self {
            config,
            scheduler,
            optimizer,
            validation,
        }
    }

    /// Configuration the components were built from.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// The scheduler.
    pub fn scheduler(&self) -> &Arc<TaskPriorityScheduler> {
        &self.scheduler
    }

    /// The optimizer.
    pub fn optimizer(&self) -> &Arc<PerformanceOptimizer> {
        &self.optimizer
    }

    /// The validation engine.
    pub fn validation(&self) -> &Arc<ValidationEngine> {
        &self.validation
    }

    // === Lifecycle ===

    /// Start the optimizer loops.
    pub fn start(&self) -> bool {
        self.optimizer.start()
    }

    /// Stop the optimizer loops.
    pub async fn shutdown(&self) {
        self.optimizer.stop().await;
    }

    // === Tasks ===

    /// Submit a task.
    pub fn submit_task(&self, spec: TaskSpec) -> Result<TaskId> {
        Ok(self.scheduler.submit_task(spec)?)
    }

    /// Get a task by id.
    pub fn get_task(&self, task_id: TaskId) -> Option<Task> {
        self.scheduler.get_task(task_id)
    }

    /// List tasks matching a filter.
    pub fn list_tasks(&self, filter: &TaskFilter) -> Vec<Task> {
        self.scheduler.list_tasks(filter)
    }

    /// Cancel a task that has not finished.
    pub fn cancel_task(&self, task_id: TaskId) -> Result<()> {
        Ok(self.scheduler.cancel_task(task_id)?)
    }

    /// Projected order of the pending tasks.
    pub fn schedule(&self) -> Result<Vec<ScheduledTask>> {
        Ok(self.scheduler.schedule_pending()?)
    }

    // === Optimization ===

    /// Take a fresh performance snapshot.
    pub fn current_metrics(&self) -> PerformanceMetrics {
        self.optimizer.collect_metrics()
    }

    /// Live recommendations, generating a set if none are held.
    pub fn recommendations(&self) -> Vec<OptimizationRecommendation> {
        let live = self.optimizer.recommendations();
        if live.is_empty() {
            self.optimizer.generate_recommendations()
        } else {
            live
        }
    }

    /// Apply a recommendation by id.
    pub async fn apply_recommendation(&self, id: RecommendationId) -> Result<OptimizationResult> {
        Ok(self.optimizer.apply_recommendation(id).await?)
    }

    /// Revert an applied recommendation.
    pub fn revert_optimization(&self, id: RecommendationId) -> Result<()> {
        Ok(self.optimizer.revert_optimization(id)?)
    }

    // === Validation ===

    /// Register or replace a validation criterion.
    pub fn register_criteria(&self, criteria: ValidationCriteria) -> Result<()> {
        Ok(self.validation.register_criteria(criteria)?)
    }

    /// Validate a task's output.
    pub async fn validate(&self, context: ValidationContext) -> ValidationReport {
        self.validation.validate_task(context).await
    }

    /// Latest validation report for a task.
    pub fn validation_report(&self, task_id: TaskId) -> Option<ValidationReport> {
        self.validation.report(task_id)
    }

    /// Validation status for a task.
    pub fn validation_status(&self, task_id: TaskId) -> Option<ValidationStatus> {
        self.validation.status(task_id)
    }

    // === Execution ===

    /// Dispatch ready tasks to `executor` until nothing more can run.
    ///
    /// Each assignment runs on its own tokio task under the scheduler's
    /// timeout. Completed tasks are validated; failed attempts go back to
    /// the scheduler, which requeues or cancels them.
    pub async fn run_until_idle(&self, executor: Arc<dyn TaskExecutor>) -> Result<RunSummary> {
        let mut attempts = Attempts::default();
        let mut validations: JoinSet<ValidationReport> = JoinSet::new();
        let mut summary = RunSummary::default();

        loop {
            for assignment in self.scheduler.dispatch_ready()? {
                let task = self.scheduler.start_task(assignment.task.id)?;
                debug!(task_id = %task.id, timeout_ms = assignment.timeout.as_millis() as u64, "executing task");
                attempts.spawn(task.id, execute(executor.clone(), task, assignment.timeout));
            }

            let Some((task_id, outcome)) = attempts.next().await else {
                break;
            };
            self.settle(task_id, outcome, &mut summary, &mut validations)?;
        }

        summary.unfinished = self
            .scheduler
            .list_tasks(&TaskFilter::default().with_status([TaskStatus::Queued, TaskStatus::Blocked]))
            .len();
        if summary.unfinished > 0 {
            warn!(unfinished = summary.unfinished, "run stopped with tasks that cannot be dispatched");
        }

        while let Some(joined) = validations.join_next().await {
            match joined {
                Ok(report) => summary.reports.push(report),
                Err(e) => warn!(error = %e, "validation task lost"),
            }
        }

        info!(
            completed = summary.completed,
            failed_attempts = summary.failed_attempts,
            cancelled = summary.cancelled,
            unfinished = summary.unfinished,
            "run finished"
        );
        Ok(summary)
    }

    /// Report one attempt's outcome to the scheduler.
    fn settle(
        &self,
        task_id: TaskId,
        outcome: Outcome,
        summary: &mut RunSummary,
        validations: &mut JoinSet<ValidationReport>,
    ) -> Result<()> {
        let reason = match outcome {
            Outcome::Finished(output) => {
                self.scheduler.complete_task(task_id)?;
                summary.completed += 1;
                if let Some(finished) = self.scheduler.get_task(task_id) {
                    let engine = self.validation.clone();
                    let context = output.into_context(finished);
                    validations.spawn(async move { engine.validate_task(context).await });
                }
                return Ok(());
            }
            Outcome::Errored(reason) => reason,
            Outcome::TimedOut(limit) => format!("timed out after {}ms", limit.as_millis()),
        };

        summary.failed_attempts += 1;
        match self.scheduler.fail_task(task_id, &reason)? {
            FailureDisposition::Requeued { .. } => summary.retried += 1,
            FailureDisposition::Exhausted => summary.cancelled += 1,
        }
        Ok(())
    }
}

/// Running attempts, keyed back to their tasks.
#[derive(Default)]
struct Attempts {
    set: JoinSet<Outcome>,
    tasks: HashMap<tokio::task::Id, TaskId>,
}

impl Attempts {
    fn spawn<F>(&mut self, task_id: TaskId, attempt: F) -> AbortHandle
    where
        F: Future<Output = Outcome> + Send + 'static,
    {
        let handle = self.set.spawn(attempt);
        self.tasks.insert(handle.id(), task_id);
        handle
    }

    /// Next finished attempt. A lost attempt comes back as an error so its
    /// task is failed and its resources released.
    async fn next(&mut self) -> Option<(TaskId, Outcome)> {
        loop {
            let (id, outcome) = match self.set.join_next_with_id().await? {
                Ok((id, outcome)) => (id, outcome),
                Err(e) => {
                    warn!(error = %e, "execution task lost");
                    (e.id(), Outcome::Errored(format!("execution task lost: {e}")))
                }
            };
            match self.tasks.remove(&id) {
                Some(task_id) => return Some((task_id, outcome)),
                None => warn!(%id, "finished attempt has no task"),
            }
        }
    }
}

/// Run one task, isolating panics and enforcing the timeout.
async fn execute(executor: Arc<dyn TaskExecutor>, task: Task, timeout: Duration) -> Outcome {
    let mut job = tokio::spawn(async move { executor.execute(task).await });
    match tokio::time::timeout(timeout, &mut job).await {
        Ok(Ok(Ok(output))) => Outcome::Finished(output),
        Ok(Ok(Err(e))) => Outcome::Errored(format!("{e:#}")),
        Ok(Err(e)) => Outcome::Errored(format!("executor panicked: {e}")),
        Err(_) => {
            job.abort();
            Outcome::TimedOut(timeout)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_evolution::{StaticProbe, SystemSample};
    use conductor_execution::SchedulerConfig;

    #[tokio::test]
    async fn test_lost_attempt_fails_task_and_releases_resources() {
        let config = OrchestratorConfig::default().with_scheduler(
            SchedulerConfig::new()
                .with_capacities([("cpu", 4)])
                .with_default_max_retries(0),
        );
        let orch = Orchestrator::with_probe(config, Arc::new(StaticProbe(SystemSample::default())));
        let id = orch.submit_task(TaskSpec::new("held").with_resource("cpu", 3)).unwrap();
        assert_eq!(orch.scheduler.dispatch_ready().unwrap().len(), 1);
        orch.scheduler.start_task(id).unwrap();
        assert_eq!(orch.scheduler.pool().usage("cpu").unwrap().allocated, 3);

        let mut attempts = Attempts::default();
        attempts.spawn(id, std::future::pending()).abort();
        let (task_id, outcome) = attempts.next().await.unwrap();
        assert_eq!(task_id, id);
        assert!(matches!(&outcome, Outcome::Errored(reason) if reason.contains("lost")));

        let mut summary = RunSummary::default();
        let mut validations = JoinSet::new();
        orch.settle(task_id, outcome, &mut summary, &mut validations).unwrap();

        assert_eq!(summary.failed_attempts, 1);
        assert_eq!(summary.cancelled, 1);
        assert_eq!(orch.get_task(id).unwrap().status, TaskStatus::Cancelled);
        assert_eq!(orch.scheduler.pool().usage("cpu").unwrap().allocated, 0);
        assert!(attempts.next().await.is_none());
    }
}
