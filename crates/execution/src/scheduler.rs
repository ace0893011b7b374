//! Priority scheduling with dependency ordering and resource allocation.
//!
//! The scheduler owns the live task set. Every dispatch pass rebuilds a
//! [`DependencyGraph`](crate::DependencyGraph) snapshot, sorts it with the
//! active [`SchedulingStrategy`], and hands out worker slots and resources
//! in that order.

use conductor_core::{
    duration_ms, AllocationId, EventBus, EventName, Task, TaskFilter, TaskId,
    TaskPriority, TaskSpec, TaskStatus, Time, TransitionError,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::dependency::{DependencyResolver, GraphError};
use crate::resource::{Allocation, ResourceError, ResourcePool};
use crate::stats::QueueStats;
use crate::strategy::SchedulingStrategy;

/// Samples kept for duration, latency and wait statistics.
const RECENT_SAMPLE_LIMIT: usize = 100;

/// Window used for throughput and error-rate counts.
const THROUGHPUT_WINDOW: Duration = Duration::from_secs(60);

/// Scheduler errors.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Dependency graph could not be built or sorted
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// Resource bookkeeping failed
    #[error(transparent)]
    Resource(#[from] ResourceError),

    /// Illegal status change
    #[error(transparent)]
    Transition(#[from] TransitionError),

    /// No task with this id
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),
}

/// Result type for scheduler operations.
pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Queue aging thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityThresholds {
    /// Wait after which a queued task is raised one priority level
    #[serde(with = "duration_ms")]
    pub starvation_wait: Duration,

    /// Aging never raises a task above this level
    pub aging_ceiling: TaskPriority,
}

impl Default for PriorityThresholds {
    fn default() -> Self {
        Self {
            starvation_wait: Duration::from_secs(600),
            aging_ceiling: TaskPriority::High,
        }
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Worker slots
    pub max_concurrent_tasks: usize,

    /// Execution timeout handed to workers
    #[serde(with = "duration_ms")]
    pub default_timeout: Duration,

    /// Retry budget for tasks that do not declare one
    pub default_max_retries: u32,

    /// Capacity per resource type
    pub resource_capacities: BTreeMap<String, u32>,

    /// Queue aging
    pub priority_thresholds: PriorityThresholds,

    /// Tie-break heuristic
    pub strategy: SchedulingStrategy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 5,
            default_timeout: Duration::from_secs(300), // 5 minutes
            default_max_retries: 3,
            resource_capacities: BTreeMap::from([("cpu".to_string(), 4), ("memory".to_string(), 8)]),
            priority_thresholds: PriorityThresholds::default(),
            strategy: SchedulingStrategy::default(),
        }
    }
}

impl SchedulerConfig {
    /// Create a default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set worker slots (at least one).
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent_tasks = max.max(1);
        self
    }

    /// Set execution timeout.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Set default retry budget.
    pub fn with_default_max_retries(mut self, retries: u32) -> Self {
        self.default_max_retries = retries;
        self
    }

    /// Replace all resource capacities.
    pub fn with_capacities<I, S>(mut self, capacities: I) -> Self
    where
        I: IntoIterator<Item = (S, u32)>,
        S: Into<String>,
    {
        self.resource_capacities = capacities.into_iter().map(|(k, v)| (k.into(), v)).collect();
        self
    }

    /// Set one resource capacity.
    pub fn with_resource(mut self, resource: impl Into<String>, capacity: u32) -> Self {
        self.resource_capacities.insert(resource.into(), capacity);
        self
    }

    /// Set aging thresholds.
    pub fn with_priority_thresholds(mut self, thresholds: PriorityThresholds) -> Self {
        self.priority_thresholds = thresholds;
        self
    }

    /// Set tie-break strategy.
    pub fn with_strategy(mut self, strategy: SchedulingStrategy) -> Self {
        self.strategy = strategy;
        self
    }
}

/// Notifications published by the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    /// Task received a worker slot and its resources
    TaskAssigned {
        /// Task
        task_id: TaskId,
        /// Reservation held for it
        allocation_id: AllocationId,
    },
    /// Task finished successfully
    TaskCompleted {
        /// Task
        task_id: TaskId,
        /// Measured run time
        duration: Duration,
    },
    /// Task attempt failed
    TaskFailed {
        /// Task
        task_id: TaskId,
        /// Failure reason from the worker
        reason: String,
        /// Whether the task went back to the queue
        requeued: bool,
    },
    /// Task cancelled
    TaskCancelled {
        /// Task
        task_id: TaskId,
    },
    /// Aging pass ran
    QueueRebalanced {
        /// Tasks whose effective priority was raised
        promoted: Vec<TaskId>,
        /// Queue depth at the time of the pass
        queued: usize,
    },
}

impl EventName for SchedulerEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::TaskAssigned { .. } => "task:assigned",
            Self::TaskCompleted { .. } => "task:completed",
            Self::TaskFailed { .. } => "task:failed",
            Self::TaskCancelled { .. } => "task:cancelled",
            Self::QueueRebalanced { .. } => "queue:rebalanced",
        }
    }
}

/// One entry of a computed schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTask {
    /// Task
    pub task_id: TaskId,
    /// Zero-based position in the sequence
    pub position: usize,
    /// Projected start, from position and average run time
    pub estimated_start: Time,
    /// Projected run time
    #[serde(with = "duration_ms")]
    pub estimated_duration: Duration,
}

/// A task handed to a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    /// Snapshot of the task at dispatch
    pub task: Task,
    /// Reservation held until the task finishes
    pub allocation_id: AllocationId,
    /// Units held per resource type
    pub units: BTreeMap<String, u32>,
    /// Execution timeout
    pub timeout: Duration,
}

/// What happened to a failed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Back in the queue; `attempt` is the retry number
    Requeued {
        /// Retry number, starting at 1
        attempt: u32,
    },
    /// Retry budget spent; the task is cancelled
    Exhausted,
}

/// Outcome of an aging pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebalanceSummary {
    /// Tasks raised one level
    pub promoted: Vec<TaskId>,
    /// Queued tasks seen
    pub queued: usize,
}

#[derive(Debug)]
struct TaskEntry {
    task: Task,
    effective_priority: TaskPriority,
    queued_at: Instant,
    last_aged: Instant,
    started_at: Option<Instant>,
}

#[derive(Debug)]
struct SchedulerState {
    tasks: HashMap<TaskId, TaskEntry>,
    /// Submission order
    order: Vec<TaskId>,
    allocations: HashMap<TaskId, Allocation>,
    max_concurrent: usize,
    strategy: SchedulingStrategy,
    durations: VecDeque<Duration>,
    latencies: VecDeque<Duration>,
    waits: VecDeque<Duration>,
    completions: VecDeque<Instant>,
    failures: VecDeque<Instant>,
    completed_total: u64,
    failed_total: u64,
}

impl SchedulerState {
    fn entry_mut(&mut self, id: TaskId) -> Result<&mut TaskEntry> {
        self.tasks.get_mut(&id).ok_or(SchedulerError::TaskNotFound(id))
    }

    fn count(&self, status: TaskStatus) -> usize {
        self.tasks.values().filter(|e| e.task.status == status).count()
    }

    fn active_count(&self) -> usize {
        self.tasks.values().filter(|e| e.task.status.is_active()).count()
    }

    fn dependencies_met(&self, id: TaskId) -> bool {
        self.tasks.get(&id).is_some_and(|entry| {
            entry.task.hard_dependencies().all(|dep| {
                self.tasks
                    .get(&dep)
                    .is_some_and(|d| d.task.status == TaskStatus::Completed)
            })
        })
    }

    fn average_duration(&self) -> Option<Duration> {
        mean(&self.durations)
    }

    fn prune_window(&mut self, now: Instant) {
        for marks in [&mut self.completions, &mut self.failures] {
            while marks
                .front()
                .is_some_and(|t| now.saturating_duration_since(*t) > THROUGHPUT_WINDOW)
            {
                marks.pop_front();
            }
        }
    }

    /// Requeue blocked tasks that were waiting on `completed`.
    fn unblock_dependents(&mut self, completed: TaskId) -> std::result::Result<Vec<TaskId>, TransitionError> {
        let ready: Vec<TaskId> = self
            .order
            .iter()
            .copied()
            .filter(|id| {
                self.tasks.get(id).is_some_and(|e| {
                    e.task.status == TaskStatus::Blocked
                        && e.task.hard_dependencies().any(|d| d == completed)
                })
            })
            .filter(|id| self.dependencies_met(*id))
            .collect();

        for id in &ready {
            if let Some(entry) = self.tasks.get_mut(id) {
                entry.task.transition(TaskStatus::Queued)?;
            }
        }
        Ok(ready)
    }
}

fn push_sample(samples: &mut VecDeque<Duration>, sample: Duration) {
    if samples.len() == RECENT_SAMPLE_LIMIT {
        samples.pop_front();
    }
    samples.push_back(sample);
}

fn mean<'a>(samples: impl IntoIterator<Item = &'a Duration>) -> Option<Duration> {
    let (total, n) = samples
        .into_iter()
        .fold((Duration::ZERO, 0u32), |(sum, n), d| (sum.saturating_add(*d), n + 1));
    (n > 0).then(|| total / n)
}

/// Orders tasks by dependencies and priority, and meters out worker slots
/// and pooled resources.
pub struct TaskPriorityScheduler {
    config: SchedulerConfig,
    resolver: DependencyResolver,
    pool: ResourcePool,
    state: Mutex<SchedulerState>,
    events: EventBus<SchedulerEvent>,
}

impl TaskPriorityScheduler {
    /// Create a scheduler and its resource pool.
    pub fn new(config: SchedulerConfig) -> Self {
        let pool = ResourcePool::new(config.resource_capacities.clone());
        let state = SchedulerState {
            tasks: HashMap::new(),
            order: Vec::new(),
            allocations: HashMap::new(),
            max_concurrent: config.max_concurrent_tasks.max(1),
            strategy: config.strategy,
            durations: VecDeque::new(),
            latencies: VecDeque::new(),
            waits: VecDeque::new(),
            completions: VecDeque::new(),
            failures: VecDeque::new(),
            completed_total: 0,
            failed_total: 0,
        };
        info!(
            max_concurrent = state.max_concurrent,
            strategy = %state.strategy,
            "scheduler created"
        );
        Self {
            config,
            resolver: DependencyResolver::new(),
            pool,
            state: Mutex::new(state),
            events: EventBus::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current configuration, including runtime tuning.
    pub fn config(&self) -> SchedulerConfig {
        let state = self.lock();
        SchedulerConfig {
            max_concurrent_tasks: state.max_concurrent,
            strategy: state.strategy,
            resource_capacities: self
                .pool
                .snapshot()
                .into_iter()
                .map(|u| (u.resource_type, u.capacity))
                .collect(),
            ..self.config.clone()
        }
    }

    /// The shared resource pool.
    pub fn pool(&self) -> &ResourcePool {
        &self.pool
    }

    /// Subscribe to scheduler events.
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    // === Task lifecycle ===

    /// Add a task to the queue.
    ///
    /// Every hard or soft dependency must name an already submitted task and
    /// every resource type must exist in the pool.
    pub fn submit_task(&self, spec: TaskSpec) -> Result<TaskId> {
        let task = Task::from_spec(spec, self.config.default_max_retries);

        for constraint in task.resource_constraints.iter().filter(|c| c.max_units > 0) {
            if !self.pool.has_resource(&constraint.resource_type) {
                return Err(ResourceError::UnknownResource(constraint.resource_type.clone()).into());
            }
        }

        let mut state = self.lock();
        if let Some(missing) = task
            .dependencies
            .iter()
            .find(|d| !state.tasks.contains_key(&d.task_id))
        {
            return Err(GraphError::UnknownDependency {
                task: task.id,
                dependency: missing.task_id,
            }
            .into());
        }

        let id = task.id;
        let now = Instant::now();
        info!(task_id = %id, title = %task.title, priority = ?task.priority, "task submitted");
        state.order.push(id);
        state.tasks.insert(
            id,
            TaskEntry {
                effective_priority: task.priority,
                task,
                queued_at: now,
                last_aged: now,
                started_at: None,
            },
        );
        Ok(id)
    }

    /// Get a task by id.
    pub fn get_task(&self, task_id: TaskId) -> Option<Task> {
        self.lock().tasks.get(&task_id).map(|e| e.task.clone())
    }

    /// Tasks matching `filter`, in submission order.
    pub fn list_tasks(&self, filter: &TaskFilter) -> Vec<Task> {
        let state = self.lock();
        state
            .order
            .iter()
            .filter_map(|id| state.tasks.get(id))
            .filter(|e| filter.matches(&e.task))
            .map(|e| e.task.clone())
            .collect()
    }

    /// Cancel a queued or blocked task. Running tasks are not affected.
    pub fn cancel_task(&self, task_id: TaskId) -> Result<()> {
        let mut state = self.lock();
        state.entry_mut(task_id)?.task.transition(TaskStatus::Cancelled)?;
        info!(task_id = %task_id, "task cancelled");
        self.events.publish(SchedulerEvent::TaskCancelled { task_id });
        Ok(())
    }

    // === Ordering ===

    /// Order an arbitrary task set without touching the live queue.
    ///
    /// Fails on unknown dependencies or hard cycles. Start times assume the
    /// current concurrency limit and the average historical run time,
    /// falling back to the mean of the tasks' own estimates.
    pub fn schedule_sequence(&self, tasks: &[Task]) -> Result<Vec<ScheduledTask>> {
        let (strategy, max_concurrent, historical) = {
            let state = self.lock();
            (state.strategy, state.max_concurrent, state.average_duration())
        };

        let graph = self.resolver.build_from_tasks(tasks.to_vec())?;
        let order = self
            .resolver
            .topological_sort_by(&graph, |task, position| strategy.key(task, task.priority, position))?;

        let average = historical
            .or_else(|| mean(tasks.iter().map(|t| &t.estimated_duration).filter(|d| !d.is_zero())))
            .unwrap_or_default();

        let estimates = order.into_iter().filter_map(|id| {
            graph.task(id).map(|t| (id, t.estimated_duration))
        });
        Ok(project(estimates, 0, max_concurrent, average))
    }

    /// Projected order of every queued or blocked task in the live queue.
    pub fn schedule_pending(&self) -> Result<Vec<ScheduledTask>> {
        let state = self.lock();
        let order = self.sorted(&state)?;
        let average = state
            .average_duration()
            .or_else(|| {
                mean(
                    state
                        .tasks
                        .values()
                        .map(|e| &e.task.estimated_duration)
                        .filter(|d| !d.is_zero()),
                )
            })
            .unwrap_or_default();

        let pending = order.into_iter().filter_map(|id| {
            state
                .tasks
                .get(&id)
                .filter(|e| matches!(e.task.status, TaskStatus::Queued | TaskStatus::Blocked))
                .map(|e| (id, e.task.estimated_duration))
        });
        Ok(project(pending, state.active_count(), state.max_concurrent, average))
    }

    fn sorted(&self, state: &SchedulerState) -> Result<Vec<TaskId>> {
        let tasks: Vec<Task> = state
            .order
            .iter()
            .filter_map(|id| state.tasks.get(id))
            .map(|e| e.task.clone())
            .collect();
        let graph = self.resolver.build_from_tasks(tasks)?;
        let strategy = state.strategy;
        let order = self.resolver.topological_sort_by(&graph, |task, position| {
            let priority = state
                .tasks
                .get(&task.id)
                .map_or(task.priority, |e| e.effective_priority);
            strategy.key(task, priority, position)
        })?;
        Ok(order)
    }

    // === Dispatch ===

    /// Hand out free worker slots to ready tasks, in schedule order.
    ///
    /// Tasks with an incomplete hard dependency are marked blocked. A task
    /// whose resources are not available stays queued; it is retried on
    /// the next pass.
    pub fn dispatch_ready(&self) -> Result<Vec<Assignment>> {
        let mut state = self.lock();
        let order = self.sorted(&state)?;
        let max_concurrent = state.max_concurrent;
        let mut active = state.active_count();
        let mut assignments = Vec::new();
        let now = Instant::now();

        for id in order {
            let Some(status) = state.tasks.get(&id).map(|e| e.task.status) else {
                continue;
            };
            if !matches!(status, TaskStatus::Queued | TaskStatus::Blocked) {
                continue;
            }

            let ready = state.dependencies_met(id);
            let entry = state.entry_mut(id)?;
            if !ready {
                if status == TaskStatus::Queued {
                    entry.task.transition(TaskStatus::Blocked)?;
                    debug!(task_id = %id, "task blocked on hard dependency");
                }
                continue;
            }
            if status == TaskStatus::Blocked {
                entry.task.transition(TaskStatus::Queued)?;
                debug!(task_id = %id, "task unblocked");
            }
            if active >= max_concurrent {
                continue;
            }

            let Some(allocation) = self.pool.try_allocate(id, &entry.task.resource_constraints) else {
                continue;
            };
            if let Err(err) = entry.task.transition(TaskStatus::Allocated) {
                self.pool.release(allocation)?;
                return Err(err.into());
            }

            let wait = now.saturating_duration_since(entry.queued_at);
            let assignment = Assignment {
                task: entry.task.clone(),
                allocation_id: allocation.id(),
                units: allocation.units().clone(),
                timeout: self.config.default_timeout,
            };
            push_sample(&mut state.waits, wait);
            state.allocations.insert(id, allocation);
            active += 1;

            debug!(task_id = %id, allocation = %assignment.allocation_id, wait_ms = wait.as_millis() as u64, "task assigned");
            self.events.publish(SchedulerEvent::TaskAssigned {
                task_id: id,
                allocation_id: assignment.allocation_id,
            });
            assignments.push(assignment);
        }

        Ok(assignments)
    }

    /// Reserve a task's resources directly against the pool.
    ///
    /// `None` means capacity is short and the caller should retry later.
    pub fn allocate_resources(&self, task: &Task) -> Option<Allocation> {
        self.pool.try_allocate(task.id, &task.resource_constraints)
    }

    /// Return a reservation made by [`Self::allocate_resources`].
    pub fn release_resources(&self, allocation: Allocation) -> Result<()> {
        Ok(self.pool.release(allocation)?)
    }

    /// Mark an allocated task as running.
    pub fn start_task(&self, task_id: TaskId) -> Result<Task> {
        let mut state = self.lock();
        let entry = state.entry_mut(task_id)?;
        entry.task.transition(TaskStatus::InProgress)?;
        entry.started_at = Some(Instant::now());
        debug!(task_id = %task_id, "task started");
        Ok(entry.task.clone())
    }

    /// Give an allocated, not yet started task back to the queue.
    pub fn requeue_task(&self, task_id: TaskId) -> Result<()> {
        let mut state = self.lock();
        state.entry_mut(task_id)?.task.transition(TaskStatus::Queued)?;
        if let Some(allocation) = state.allocations.remove(&task_id) {
            self.pool.release(allocation)?;
        }
        debug!(task_id = %task_id, "task requeued");
        Ok(())
    }

    /// Record a successful run, release its resources and requeue blocked
    /// dependents whose hard dependencies are now complete.
    pub fn complete_task(&self, task_id: TaskId) -> Result<Duration> {
        let mut state = self.lock();
        let now = Instant::now();
        let (duration, latency) = {
            let entry = state.entry_mut(task_id)?;
            entry.task.transition(TaskStatus::Completed)?;
            (
                entry
                    .started_at
                    .map_or(Duration::ZERO, |s| now.saturating_duration_since(s)),
                now.saturating_duration_since(entry.queued_at),
            )
        };

        if let Some(allocation) = state.allocations.remove(&task_id) {
            self.pool.release(allocation)?;
        }
        push_sample(&mut state.durations, duration);
        push_sample(&mut state.latencies, latency);
        state.completions.push_back(now);
        state.completed_total += 1;
        state.prune_window(now);

        let unblocked = state.unblock_dependents(task_id)?;
        info!(
            task_id = %task_id,
            duration_ms = duration.as_millis() as u64,
            unblocked = unblocked.len(),
            "task completed"
        );
        self.events.publish(SchedulerEvent::TaskCompleted { task_id, duration });
        Ok(duration)
    }

    /// Record a failed run.
    ///
    /// The task is requeued while it has retries left, otherwise cancelled.
    pub fn fail_task(&self, task_id: TaskId, reason: &str) -> Result<FailureDisposition> {
        let mut state = self.lock();
        let now = Instant::now();
        let disposition = {
            let entry = state.entry_mut(task_id)?;
            entry.task.transition(TaskStatus::Failed)?;
            entry.started_at = None;
            if entry.task.can_retry() {
                entry.task.retry_count += 1;
                entry.task.transition(TaskStatus::Queued)?;
                entry.queued_at = now;
                entry.last_aged = now;
                entry.effective_priority = entry.task.priority;
                FailureDisposition::Requeued {
                    attempt: entry.task.retry_count,
                }
            } else {
                entry.task.transition(TaskStatus::Cancelled)?;
                FailureDisposition::Exhausted
            }
        };

        if let Some(allocation) = state.allocations.remove(&task_id) {
            self.pool.release(allocation)?;
        }
        state.failures.push_back(now);
        state.failed_total += 1;
        state.prune_window(now);

        let requeued = matches!(disposition, FailureDisposition::Requeued { .. });
        warn!(task_id = %task_id, reason = %reason, requeued, "task failed");
        self.events.publish(SchedulerEvent::TaskFailed {
            task_id,
            reason: reason.to_string(),
            requeued,
        });
        Ok(disposition)
    }

    /// Park a running task that hit an unmet dependency at run time.
    ///
    /// Its resources are released; the next dispatch pass requeues it once
    /// its hard dependencies are complete.
    pub fn block_task(&self, task_id: TaskId) -> Result<()> {
        let mut state = self.lock();
        let entry = state.entry_mut(task_id)?;
        entry.task.transition(TaskStatus::Blocked)?;
        entry.started_at = None;
        if let Some(allocation) = state.allocations.remove(&task_id) {
            self.pool.release(allocation)?;
        }
        debug!(task_id = %task_id, "task blocked");
        Ok(())
    }

    // === Statistics ===

    /// Snapshot of queue state and recent history.
    pub fn queue_stats(&self) -> QueueStats {
        let mut state = self.lock();
        state.prune_window(Instant::now());
        QueueStats {
            taken_at: chrono::Utc::now(),
            queued: state.count(TaskStatus::Queued),
            blocked: state.count(TaskStatus::Blocked),
            allocated: state.count(TaskStatus::Allocated),
            in_progress: state.count(TaskStatus::InProgress),
            completed: state.count(TaskStatus::Completed),
            failed: state.count(TaskStatus::Failed),
            cancelled: state.count(TaskStatus::Cancelled),
            completed_total: state.completed_total,
            failed_total: state.failed_total,
            max_concurrent: state.max_concurrent,
            strategy: state.strategy,
            recent_durations: state.durations.iter().copied().collect(),
            recent_latencies: state.latencies.iter().copied().collect(),
            recent_waits: state.waits.iter().copied().collect(),
            window: THROUGHPUT_WINDOW,
            completed_in_window: state.completions.len(),
            failed_in_window: state.failures.len(),
            resources: self.pool.snapshot(),
        }
    }

    // === Tuning ===

    /// Worker slots.
    pub fn max_concurrent(&self) -> usize {
        self.lock().max_concurrent
    }

    /// Change the number of worker slots (at least one). Returns the old value.
    pub fn set_max_concurrent(&self, max: usize) -> usize {
        let mut state = self.lock();
        let previous = std::mem::replace(&mut state.max_concurrent, max.max(1));
        info!(previous, current = state.max_concurrent, "max concurrent tasks changed");
        previous
    }

    /// Active strategy.
    pub fn strategy(&self) -> SchedulingStrategy {
        self.lock().strategy
    }

    /// Switch strategy. Returns the old one.
    pub fn set_strategy(&self, strategy: SchedulingStrategy) -> SchedulingStrategy {
        let mut state = self.lock();
        let previous = std::mem::replace(&mut state.strategy, strategy);
        info!(previous = %previous, current = %strategy, "scheduling strategy changed");
        previous
    }

    /// Resize a resource pool. Returns the old capacity.
    pub fn set_capacity(&self, resource: &str, capacity: u32) -> Result<u32> {
        Ok(self.pool.set_capacity(resource, capacity)?)
    }

    /// Raise the effective priority of queued tasks that have waited longer
    /// than the starvation threshold, one level per threshold period.
    pub fn rebalance_queue(&self) -> RebalanceSummary {
        let thresholds = &self.config.priority_thresholds;
        let now = Instant::now();
        let mut state = self.lock();
        let SchedulerState { order, tasks, .. } = &mut *state;

        let mut promoted = Vec::new();
        let mut queued = 0;
        for id in order.iter() {
            let Some(entry) = tasks.get_mut(id) else {
                continue;
            };
            if entry.task.status != TaskStatus::Queued {
                continue;
            }
            queued += 1;
            if entry.effective_priority >= thresholds.aging_ceiling
                || now.saturating_duration_since(entry.last_aged) < thresholds.starvation_wait
            {
                continue;
            }
            entry.effective_priority = entry.effective_priority.raised().min(thresholds.aging_ceiling);
            entry.last_aged = now;
            debug!(task_id = %id, priority = ?entry.effective_priority, "task aged");
            promoted.push(*id);
        }

        info!(queued, promoted = promoted.len(), "queue rebalanced");
        self.events.publish(SchedulerEvent::QueueRebalanced {
            promoted: promoted.clone(),
            queued,
        });
        RebalanceSummary { promoted, queued }
    }

    /// Effective priority after aging.
    pub fn effective_priority(&self, task_id: TaskId) -> Option<TaskPriority> {
        self.lock().tasks.get(&task_id).map(|e| e.effective_priority)
    }

    /// Execution timeout for assignments.
    pub fn default_timeout(&self) -> Duration {
        self.config.default_timeout
    }

    /// Whether any task can still make progress.
    pub fn has_pending_work(&self) -> bool {
        let state = self.lock();
        state.tasks.values().any(|e| {
            matches!(
                e.task.status,
                TaskStatus::Queued | TaskStatus::Allocated | TaskStatus::InProgress
            ) || (e.task.status == TaskStatus::Blocked && !blocked_forever(&state, &e.task))
        })
    }
}

/// A blocked task whose hard dependency chain reaches a cancelled task.
fn blocked_forever(state: &SchedulerState, task: &Task) -> bool {
    let mut stack: Vec<TaskId> = task.hard_dependencies().collect();
    let mut seen = std::collections::HashSet::new();
    while let Some(id) = stack.pop() {
        if !seen.insert(id) {
            continue;
        }
        let Some(entry) = state.tasks.get(&id) else {
            return true;
        };
        match entry.task.status {
            TaskStatus::Cancelled => return true,
            TaskStatus::Completed => {}
            _ => stack.extend(entry.task.hard_dependencies()),
        }
    }
    false
}

fn project(
    order: impl IntoIterator<Item = (TaskId, Duration)>,
    offset: usize,
    max_concurrent: usize,
    average: Duration,
) -> Vec<ScheduledTask> {
    let now = chrono::Utc::now();
    let slots = max_concurrent.max(1);
    order
        .into_iter()
        .enumerate()
        .map(|(position, (task_id, estimate))| {
            let wave = u32::try_from((offset + position) / slots).unwrap_or(u32::MAX);
            let offset = chrono::Duration::from_std(average.saturating_mul(wave))
                .unwrap_or_else(|_| chrono::Duration::zero());
            ScheduledTask {
                task_id,
                position,
                estimated_start: now + offset,
                estimated_duration: if estimate.is_zero() { average } else { estimate },
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler(max_concurrent: usize) -> TaskPriorityScheduler {
        TaskPriorityScheduler::new(
            SchedulerConfig::new()
                .with_max_concurrent(max_concurrent)
                .with_capacities([("cpu", 4)]),
        )
    }

    fn task(spec: TaskSpec) -> Task {
        Task::from_spec(spec, 3)
    }

    #[test]
    fn test_sequence_honours_hard_edges_only() {
        let s = scheduler(2);
        let a = task(TaskSpec::new("A"));
        let b = task(TaskSpec::new("B").depends_on(a.id).with_priority(TaskPriority::Critical));
        let c = task(TaskSpec::new("C").prefers_after(a.id).with_priority(TaskPriority::Critical));

        let seq = s.schedule_sequence(&[a.clone(), b.clone(), c.clone()]).unwrap();
        let ids: Vec<_> = seq.iter().map(|e| e.task_id).collect();
        let pos = |id| ids.iter().position(|x| *x == id).unwrap();

        assert_eq!(ids.len(), 3);
        assert!(pos(a.id) < pos(b.id));
        // The soft edge does not hold C back behind the lower-priority A.
        assert_eq!(ids[0], c.id);
    }

    #[test]
    fn test_sequence_is_deterministic() {
        let s = scheduler(3);
        let root = task(TaskSpec::new("root"));
        let mut tasks = vec![root.clone()];
        for i in 0..20 {
            let priority = [TaskPriority::Low, TaskPriority::High, TaskPriority::Medium][i % 3];
            tasks.push(task(
                TaskSpec::new(format!("t{i}"))
                    .with_priority(priority)
                    .depends_on(root.id),
            ));
        }

        let first: Vec<_> = s.schedule_sequence(&tasks).unwrap().into_iter().map(|e| e.task_id).collect();
        let second: Vec<_> = s.schedule_sequence(&tasks).unwrap().into_iter().map(|e| e.task_id).collect();
        assert_eq!(first, second);
        assert_eq!(first[0], root.id);
    }

    #[test]
    fn test_sequence_reports_hard_cycle() {
        let s = scheduler(1);
        let mut a = task(TaskSpec::new("A"));
        let b = task(TaskSpec::new("B").depends_on(a.id));
        a.dependencies.push(conductor_core::TaskDependency::hard(b.id));

        let err = s.schedule_sequence(&[a, b]).unwrap_err();
        assert!(matches!(err, SchedulerError::Graph(GraphError::CycleDetected { .. })));
    }

    #[test]
    fn test_sequence_estimates_start_by_wave() {
        let s = scheduler(2);
        let tasks: Vec<Task> = (0..3)
            .map(|i| task(TaskSpec::new(format!("t{i}")).with_estimated_duration(Duration::from_secs(10))))
            .collect();

        let seq = s.schedule_sequence(&tasks).unwrap();
        assert_eq!(seq[0].estimated_start, seq[1].estimated_start);
        let gap = seq[2].estimated_start - seq[0].estimated_start;
        assert!(gap >= chrono::Duration::seconds(10));
        assert_eq!(seq[2].estimated_duration, Duration::from_secs(10));
    }

    #[test]
    fn test_allocation_waits_for_release() {
        let s = scheduler(5);
        let first = task(TaskSpec::new("first").with_resource("cpu", 3));
        let second = task(TaskSpec::new("second").with_resource("cpu", 2));

        let held = s.allocate_resources(&first).expect("first fits");
        assert!(s.allocate_resources(&second).is_none());
        assert_eq!(s.pool().usage("cpu").unwrap().allocated, 3);

        s.release_resources(held).unwrap();
        let next = s.allocate_resources(&second).expect("second fits after release");
        assert_eq!(s.pool().usage("cpu").unwrap().allocated, 2);
        s.release_resources(next).unwrap();
    }

    #[test]
    fn test_submit_rejects_unknown_dependency_and_resource() {
        let s = scheduler(1);
        let ghost = TaskId::new();
        let err = s.submit_task(TaskSpec::new("x").depends_on(ghost)).unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::Graph(GraphError::UnknownDependency { dependency, .. }) if dependency == ghost
        ));

        let err = s.submit_task(TaskSpec::new("y").with_resource("gpu", 1)).unwrap_err();
        assert!(matches!(err, SchedulerError::Resource(ResourceError::UnknownResource(ref r)) if r == "gpu"));
        assert!(s.list_tasks(&TaskFilter::default()).is_empty());
    }

    #[test]
    fn test_dispatch_blocks_then_releases_dependents() {
        let s = scheduler(4);
        let a = s.submit_task(TaskSpec::new("A")).unwrap();
        let b = s.submit_task(TaskSpec::new("B").depends_on(a)).unwrap();

        let assigned = s.dispatch_ready().unwrap();
        assert_eq!(assigned.len(), 1);
        assert_eq!(assigned[0].task.id, a);
        assert_eq!(s.get_task(b).unwrap().status, TaskStatus::Blocked);

        s.start_task(a).unwrap();
        s.complete_task(a).unwrap();
        assert_eq!(s.get_task(b).unwrap().status, TaskStatus::Queued);

        let assigned = s.dispatch_ready().unwrap();
        assert_eq!(assigned.len(), 1);
        assert_eq!(assigned[0].task.id, b);
    }

    #[test]
    fn test_dispatch_respects_concurrency_and_capacity() {
        let s = scheduler(2);
        let heavy = s.submit_task(TaskSpec::new("heavy").with_resource("cpu", 3)).unwrap();
        let medium = s.submit_task(TaskSpec::new("medium").with_resource("cpu", 2)).unwrap();
        let light = s.submit_task(TaskSpec::new("light").with_resource("cpu", 1)).unwrap();

        let ids: Vec<_> = s.dispatch_ready().unwrap().into_iter().map(|a| a.task.id).collect();
        // medium does not fit beside heavy; light does.
        assert_eq!(ids, vec![heavy, light]);
        assert_eq!(s.get_task(medium).unwrap().status, TaskStatus::Queued);
        assert!(s.dispatch_ready().unwrap().is_empty());

        let stats = s.queue_stats();
        assert_eq!(stats.active(), 2);
        assert_eq!(stats.queued, 1);
        assert_eq!(stats.recent_waits.len(), 2);
    }

    #[test]
    fn test_failure_requeues_until_budget_spent() {
        let s = scheduler(1);
        let id = s.submit_task(TaskSpec::new("flaky").with_max_retries(1)).unwrap();

        s.dispatch_ready().unwrap();
        s.start_task(id).unwrap();
        assert_eq!(
            s.fail_task(id, "boom").unwrap(),
            FailureDisposition::Requeued { attempt: 1 }
        );
        assert_eq!(s.get_task(id).unwrap().status, TaskStatus::Queued);
        assert_eq!(s.pool().active_allocations(), 0);

        s.dispatch_ready().unwrap();
        s.start_task(id).unwrap();
        assert_eq!(s.fail_task(id, "boom").unwrap(), FailureDisposition::Exhausted);
        assert_eq!(s.get_task(id).unwrap().status, TaskStatus::Cancelled);
        assert_eq!(s.queue_stats().failed_total, 2);
    }

    #[test]
    fn test_cancel_only_affects_waiting_tasks() {
        let s = scheduler(1);
        let running = s.submit_task(TaskSpec::new("running")).unwrap();
        let waiting = s.submit_task(TaskSpec::new("waiting")).unwrap();
        s.dispatch_ready().unwrap();
        s.start_task(running).unwrap();

        assert!(matches!(s.cancel_task(running), Err(SchedulerError::Transition(_))));
        s.cancel_task(waiting).unwrap();
        assert_eq!(s.get_task(waiting).unwrap().status, TaskStatus::Cancelled);
        assert!(matches!(s.cancel_task(TaskId::new()), Err(SchedulerError::TaskNotFound(_))));
    }

    #[test]
    fn test_dependents_of_cancelled_task_are_not_pending() {
        let s = scheduler(1);
        let a = s.submit_task(TaskSpec::new("A")).unwrap();
        let b = s.submit_task(TaskSpec::new("B").depends_on(a)).unwrap();
        s.cancel_task(a).unwrap();
        s.dispatch_ready().unwrap();

        assert_eq!(s.get_task(b).unwrap().status, TaskStatus::Blocked);
        assert!(!s.has_pending_work());
    }

    #[test]
    fn test_list_tasks_filters() {
        let s = scheduler(1);
        s.submit_task(TaskSpec::new("low").with_priority(TaskPriority::Low)).unwrap();
        let high = s.submit_task(TaskSpec::new("high").with_priority(TaskPriority::High)).unwrap();

        let found = s.list_tasks(&TaskFilter::default().with_min_priority(TaskPriority::High));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, high);
        assert_eq!(s.list_tasks(&TaskFilter::default()).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rebalance_ages_starving_tasks() {
        let s = TaskPriorityScheduler::new(SchedulerConfig::new().with_priority_thresholds(
            PriorityThresholds {
                starvation_wait: Duration::from_secs(60),
                aging_ceiling: TaskPriority::High,
            },
        ));
        let mut events = s.subscribe();

        let old = s.submit_task(TaskSpec::new("old").with_priority(TaskPriority::Low)).unwrap();
        tokio::time::advance(Duration::from_secs(90)).await;
        let fresh = s.submit_task(TaskSpec::new("fresh").with_priority(TaskPriority::Medium)).unwrap();

        let summary = s.rebalance_queue();
        assert_eq!(summary.promoted, vec![old]);
        assert_eq!(summary.queued, 2);
        assert_eq!(s.effective_priority(old), Some(TaskPriority::Medium));
        assert_eq!(s.get_task(old).unwrap().priority, TaskPriority::Low);

        // Same effective priority: submission order decides.
        let pending = s.schedule_pending().unwrap();
        assert_eq!(pending[0].task_id, old);
        assert_eq!(pending[1].task_id, fresh);

        let event = events.recv().await.unwrap();
        assert_eq!(event.name(), "queue:rebalanced");

        // Not aged again before another full period.
        assert!(s.rebalance_queue().promoted.is_empty());
    }

    #[tokio::test]
    async fn test_assignment_publishes_event() {
        let s = scheduler(1);
        let mut events = s.subscribe();
        let id = s.submit_task(TaskSpec::new("t")).unwrap();
        let assigned = s.dispatch_ready().unwrap();

        match events.recv().await.unwrap() {
            SchedulerEvent::TaskAssigned { task_id, allocation_id } => {
                assert_eq!(task_id, id);
                assert_eq!(allocation_id, assigned[0].allocation_id);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_tuning_surface() {
        let s = scheduler(2);
        assert_eq!(s.set_max_concurrent(0), 2);
        assert_eq!(s.config().max_concurrent_tasks, 1);
        assert_eq!(
            s.set_strategy(SchedulingStrategy::ShortestJobFirst),
            SchedulingStrategy::DependencyAware
        );
        assert_eq!(s.set_capacity("cpu", 8).unwrap(), 4);
        assert_eq!(s.config().resource_capacities.get("cpu"), Some(&8));

        let id = s.submit_task(TaskSpec::new("t").with_resource("cpu", 6)).unwrap();
        s.dispatch_ready().unwrap();
        assert!(matches!(
            s.set_capacity("cpu", 2),
            Err(SchedulerError::Resource(ResourceError::CapacityBelowAllocated { .. }))
        ));
        s.requeue_task(id).unwrap();
        assert_eq!(s.pool().usage("cpu").unwrap().allocated, 0);
    }

    #[test]
    fn test_config_serde_defaults() {
        let config: SchedulerConfig =
            serde_json::from_str(r#"{"max_concurrent_tasks": 8, "strategy": "priority_first"}"#).unwrap();
        assert_eq!(config.max_concurrent_tasks, 8);
        assert_eq!(config.strategy, SchedulingStrategy::PriorityFirst);
        assert_eq!(config.default_timeout, Duration::from_secs(300));
        assert_eq!(config.resource_capacities.get("memory"), Some(&8));
    }
}
