//! Driving tasks through an executor until the queue drains.

use anyhow::bail;
use async_trait::async_trait;
use conductor_core::{Task, TaskId, TaskSpec, TaskStatus};
use conductor_evolution::{StaticProbe, SystemSample};
use conductor_execution::SchedulerConfig;
use conductor_quality::{builtin, ValidationStatus};
use conductor_work::{ExecutionOutput, Orchestrator, OrchestratorConfig, TaskExecutor};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn orchestrator(scheduler: SchedulerConfig) -> Orchestrator {
    Orchestrator::with_probe(
        OrchestratorConfig::default().with_scheduler(scheduler),
        Arc::new(StaticProbe(SystemSample::default())),
    )
}

/// Records the order tasks ran in and produces one source file each.
#[derive(Default)]
struct Recorder {
    ran: Mutex<Vec<String>>,
}

#[async_trait]
impl TaskExecutor for Recorder {
    async fn execute(&self, task: Task) -> anyhow::Result<ExecutionOutput> {
        self.ran.lock().unwrap().push(task.title.clone());
        let content = if task.title == "sloppy" {
            "fn f() {}\n// TODO: finish"
        } else {
            "fn f() {}"
        };
        Ok(ExecutionOutput::new()
            .with_artifact(format!("src/{}.rs", task.title), content)
            .with_summary(format!("implemented {}", task.title)))
    }
}

/// Fails each task a fixed number of times before succeeding.
struct Flaky {
    failures: u32,
    seen: Mutex<HashMap<TaskId, u32>>,
}

#[async_trait]
impl TaskExecutor for Flaky {
    async fn execute(&self, task: Task) -> anyhow::Result<ExecutionOutput> {
        let attempt = {
            let mut seen = self.seen.lock().unwrap();
            let n = seen.entry(task.id).or_default();
            *n += 1;
            *n
        };
        if attempt <= self.failures {
            bail!("attempt {attempt} failed");
        }
        Ok(ExecutionOutput::new().with_summary("done"))
    }
}

/// Hangs on tasks titled "stuck" and panics on tasks titled "boom".
struct Misbehaving;

#[async_trait]
impl TaskExecutor for Misbehaving {
    async fn execute(&self, task: Task) -> anyhow::Result<ExecutionOutput> {
        match task.title.as_str() {
            "stuck" => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(ExecutionOutput::new())
            }
            "boom" => panic!("executor bug"),
            _ => Ok(ExecutionOutput::new()),
        }
    }
}

#[tokio::test]
async fn test_runs_in_dependency_order_and_validates() {
    let orch = orchestrator(SchedulerConfig::default());
    orch.register_criteria(builtin::marker_scan(builtin::DEFAULT_MARKER_PATTERN).unwrap())
        .unwrap();

    let base = orch.submit_task(TaskSpec::new("base")).unwrap();
    let sloppy = orch.submit_task(TaskSpec::new("sloppy").depends_on(base)).unwrap();
    orch.submit_task(TaskSpec::new("clean").depends_on(sloppy)).unwrap();

    let recorder = Arc::new(Recorder::default());
    let summary = orch.run_until_idle(recorder.clone()).await.unwrap();

    assert_eq!(*recorder.ran.lock().unwrap(), ["base", "sloppy", "clean"]);
    assert_eq!(summary.completed, 3);
    assert_eq!(summary.failed_attempts, 0);
    assert_eq!(summary.unfinished, 0);
    assert_eq!(summary.reports.len(), 3);

    // Non-critical failures ask for review instead of failing the task
    let report = orch.validation_report(sloppy).unwrap();
    assert_eq!(report.status, ValidationStatus::RequiresReview);
    assert_eq!(report.summary.warnings, 1);
    assert_eq!(orch.validation_status(base), Some(ValidationStatus::Passed));
    assert!(!orch.scheduler().has_pending_work());
}

#[tokio::test]
async fn test_failed_attempts_are_retried() {
    let orch = orchestrator(SchedulerConfig::new().with_default_max_retries(2));
    let id = orch.submit_task(TaskSpec::new("flaky")).unwrap();

    let executor = Arc::new(Flaky {
        failures: 2,
        seen: Mutex::new(HashMap::new()),
    });
    let summary = orch.run_until_idle(executor).await.unwrap();

    assert_eq!(summary.failed_attempts, 2);
    assert_eq!(summary.retried, 2);
    assert_eq!(summary.completed, 1);
    let task = orch.get_task(id).unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.retry_count, 2);
}

#[tokio::test]
async fn test_exhausted_retries_cancel_the_task() {
    let orch = orchestrator(SchedulerConfig::new().with_default_max_retries(1));
    let id = orch.submit_task(TaskSpec::new("doomed")).unwrap();

    let executor = Arc::new(Flaky {
        failures: u32::MAX,
        seen: Mutex::new(HashMap::new()),
    });
    let summary = orch.run_until_idle(executor).await.unwrap();

    assert_eq!(summary.failed_attempts, 2);
    assert_eq!(summary.retried, 1);
    assert_eq!(summary.cancelled, 1);
    assert_eq!(orch.get_task(id).unwrap().status, TaskStatus::Cancelled);
    assert!(summary.reports.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_timeouts_and_panics_are_contained() {
    let orch = orchestrator(
        SchedulerConfig::new()
            .with_default_timeout(Duration::from_millis(200))
            .with_default_max_retries(0),
    );
    let stuck = orch.submit_task(TaskSpec::new("stuck")).unwrap();
    let boom = orch.submit_task(TaskSpec::new("boom")).unwrap();
    let after = orch.submit_task(TaskSpec::new("after").depends_on(stuck)).unwrap();
    let fine = orch.submit_task(TaskSpec::new("fine")).unwrap();

    let summary = orch.run_until_idle(Arc::new(Misbehaving)).await.unwrap();

    assert_eq!(summary.completed, 1);
    assert_eq!(summary.cancelled, 2);
    assert_eq!(summary.unfinished, 1);
    assert_eq!(orch.get_task(stuck).unwrap().status, TaskStatus::Cancelled);
    assert_eq!(orch.get_task(boom).unwrap().status, TaskStatus::Cancelled);
    assert_eq!(orch.get_task(after).unwrap().status, TaskStatus::Blocked);
    assert_eq!(orch.get_task(fine).unwrap().status, TaskStatus::Completed);
    assert!(!orch.scheduler().has_pending_work());
}
