//! Validation engine.
//!
//! Runs the criteria applicable to a completed task in bounded batches and
//! folds the results into a [`ValidationReport`]. Concurrent requests for the
//! same task share one run.

use conductor_core::{duration_ms, CriteriaId, EventBus, EventName, TaskId};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::context::ValidationContext;
use crate::criteria::ValidationCriteria;
use crate::executor::execute_with_retry;
use crate::registry::CriteriaRegistry;
use crate::report::{ValidationReport, ValidationStatus};

/// Misuse of the validation API. Criterion failures are never errors.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// Criteria ids must be non-empty
    #[error("criteria id must not be empty")]
    EmptyCriteriaId,

    /// A zero timeout would fail every attempt
    #[error("criteria {0} has a zero timeout")]
    ZeroTimeout(CriteriaId),

    /// A built-in criterion was given a bad pattern
    #[error("invalid pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
}

/// Result type for validation operations.
pub type Result<T> = std::result::Result<T, ValidationError>;

/// Validation engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Criteria run concurrently per batch
    pub batch_size: usize,

    /// Criteria slower than this are reported as bottlenecks
    #[serde(with = "duration_ms")]
    pub slow_criterion_threshold: Duration,

    /// Slow criteria listed per report
    pub max_reported_bottlenecks: usize,

    /// Failure share above which the report suggests reviewing complexity
    pub review_failure_rate: f64,

    /// Backoff before retry `n` is this times `2^n`
    #[serde(with = "duration_ms")]
    pub retry_backoff_base: Duration,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            slow_criterion_threshold: Duration::from_secs(10),
            max_reported_bottlenecks: 5,
            review_failure_rate: 0.3,
            retry_backoff_base: Duration::from_secs(1),
        }
    }
}

impl ValidationConfig {
    /// Create a default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the batch size.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Set the slow criterion threshold.
    pub fn with_slow_criterion_threshold(mut self, threshold: Duration) -> Self {
        self.slow_criterion_threshold = threshold;
        self
    }

    /// Set the retry backoff base.
    pub fn with_retry_backoff_base(mut self, base: Duration) -> Self {
        self.retry_backoff_base = base;
        self
    }
}

/// Notifications published by the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationEvent {
    /// A run started
    Started {
        /// Task
        task_id: TaskId,
        /// Criteria selected
        criteria: usize,
    },
    /// A run finished without a critical failure
    Completed {
        /// Task
        task_id: TaskId,
        /// Verdict
        status: ValidationStatus,
        /// Overall score
        score: f64,
    },
    /// A run finished with a critical failure
    Failed {
        /// Task
        task_id: TaskId,
        /// Failed criteria
        failed: usize,
        /// Overall score
        score: f64,
    },
    /// A criterion was registered or replaced
    CriteriaRegistered {
        /// Criterion
        criteria_id: CriteriaId,
        /// Whether it replaced an earlier one
        replaced: bool,
    },
}

impl EventName for ValidationEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::Started { .. } => "validationStarted",
            Self::Completed { .. } => "validationCompleted",
            Self::Failed { .. } => "validationFailed",
            Self::CriteriaRegistered { .. } => "criteriaRegistered",
        }
    }
}

type InFlight = Shared<BoxFuture<'static, ValidationReport>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Runs validation criteria against completed tasks.
pub struct ValidationEngine {
    config: ValidationConfig,
    registry: RwLock<CriteriaRegistry>,
    in_flight: Arc<Mutex<HashMap<TaskId, InFlight>>>,
    reports: Arc<Mutex<HashMap<TaskId, ValidationReport>>>,
    events: EventBus<ValidationEvent>,
}

impl ValidationEngine {
    /// Create an engine with no criteria.
    pub fn new(config: ValidationConfig) -> Self {
        Self {
            config,
            registry: RwLock::new(CriteriaRegistry::new()),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            reports: Arc::new(Mutex::new(HashMap::new())),
            events: EventBus::default(),
        }
    }

    /// Configuration.
    pub fn config(&self) -> &ValidationConfig {
        &self.config
    }

    /// Subscribe to validation events.
    pub fn subscribe(&self) -> broadcast::Receiver<ValidationEvent> {
        self.events.subscribe()
    }

    // === Criteria ===

    /// Register a criterion, replacing any with the same id.
    pub fn register_criteria(&self, criteria: ValidationCriteria) -> Result<()> {
        if criteria.id.as_str().trim().is_empty() {
            return Err(ValidationError::EmptyCriteriaId);
        }
        if criteria.timeout.is_zero() {
            return Err(ValidationError::ZeroTimeout(criteria.id));
        }

        let criteria_id = criteria.id.clone();
        let replaced = self
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register(criteria)
            .is_some();

        debug!(criteria = %criteria_id, replaced, "criteria registered");
        self.events.publish(ValidationEvent::CriteriaRegistered {
            criteria_id,
            replaced,
        });
        Ok(())
    }

    /// Remove a criterion.
    pub fn unregister_criteria(&self, id: &CriteriaId) -> Option<ValidationCriteria> {
        self.registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .unregister(id)
    }

    /// Get a criterion by id.
    pub fn criteria(&self, id: &CriteriaId) -> Option<ValidationCriteria> {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// All criteria, ordered by id.
    pub fn list_criteria(&self) -> Vec<ValidationCriteria> {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .list()
            .into_iter()
            .cloned()
            .collect()
    }

    // === Validation ===

    /// Validate a completed task.
    ///
    /// A second call for a task that is already being validated waits for
    /// the same run instead of starting another one. The run is spawned, so
    /// it completes and stores its report even if every caller goes away.
    pub async fn validate_task(&self, context: ValidationContext) -> ValidationReport {
        let task_id = context.task_id();
        let run = {
            let mut in_flight = lock(&self.in_flight);
            match in_flight.get(&task_id) {
                Some(run) => {
                    debug!(task_id = %task_id, "joining in-flight validation");
                    run.clone()
                }
                None => {
                    let criteria = self
                        .registry
                        .read()
                        .unwrap_or_else(PoisonError::into_inner)
                        .applicable(context.task.category);
                    let handle = tokio::spawn(
                        ValidationRun {
                            config: self.config.clone(),
                            criteria,
                            context: Arc::new(context),
                            events: self.events.clone(),
                            reports: self.reports.clone(),
                            in_flight: self.in_flight.clone(),
                        }
                        .execute(),
                    );
                    let entries = self.in_flight.clone();
                    let run = async move {
                        match handle.await {
                            Ok(report) => report,
                            Err(e) => {
                                // Only a panic or runtime shutdown ends a run early
                                lock(&entries).remove(&task_id);
                                std::panic::resume_unwind(e.into_panic())
                            }
                        }
                    }
                    .boxed()
                    .shared();
                    in_flight.insert(task_id, run.clone());
                    run
                }
            }
        };
        run.await
    }

    /// Latest finished report for a task.
    pub fn report(&self, task_id: TaskId) -> Option<ValidationReport> {
        lock(&self.reports).get(&task_id).cloned()
    }

    /// `Validating` while a run is in flight, otherwise the last verdict.
    pub fn status(&self, task_id: TaskId) -> Option<ValidationStatus> {
        if lock(&self.in_flight).contains_key(&task_id) {
            return Some(ValidationStatus::Validating);
        }
        lock(&self.reports).get(&task_id).map(|r| r.status)
    }
}

/// Everything one run needs, owned so the run can be shared.
struct ValidationRun {
    config: ValidationConfig,
    criteria: Vec<ValidationCriteria>,
    context: Arc<ValidationContext>,
    events: EventBus<ValidationEvent>,
    reports: Arc<Mutex<HashMap<TaskId, ValidationReport>>>,
    in_flight: Arc<Mutex<HashMap<TaskId, InFlight>>>,
}

impl ValidationRun {
    async fn execute(self) -> ValidationReport {
        let task_id = self.context.task_id();
        let started_at = chrono::Utc::now();
        let started = Instant::now();

        info!(task_id = %task_id, criteria = self.criteria.len(), "validation started");
        self.events.publish(ValidationEvent::Started {
            task_id,
            criteria: self.criteria.len(),
        });

        let mut results = Vec::with_capacity(self.criteria.len());
        for batch in self.criteria.chunks(self.config.batch_size.max(1)) {
            let runs = batch.iter().map(|criteria| {
                execute_with_retry(criteria, self.context.clone(), self.config.retry_backoff_base)
            });
            results.extend(futures::future::join_all(runs).await);
        }

        let report = ValidationReport::build(
            task_id,
            results,
            started_at,
            started.elapsed(),
            &self.config,
        );

        lock(&self.reports).insert(task_id, report.clone());
        lock(&self.in_flight).remove(&task_id);

        if report.status == ValidationStatus::Failed {
            warn!(
                task_id = %task_id,
                score = report.score,
                failed = report.summary.failed,
                critical = report.summary.critical,
                "validation failed"
            );
            self.events.publish(ValidationEvent::Failed {
                task_id,
                failed: report.summary.failed,
                score: report.score,
            });
        } else {
            info!(
                task_id = %task_id,
                status = %report.status,
                score = report.score,
                "validation completed"
            );
            self.events.publish(ValidationEvent::Completed {
                task_id,
                status: report.status,
                score: report.score,
            });
        }
        report
    }
}
