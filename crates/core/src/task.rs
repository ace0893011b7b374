//! Task model - the unit of work the orchestrator sequences and validates.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::id::TaskId;
use crate::Time;

/// A task represents a unit of work submitted by a collaborator.
///
/// The payload itself is opaque: the orchestrator only reads the scheduling
/// attributes below and only ever mutates `status` and `retry_count`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier
    pub id: TaskId,

    /// Task title
    pub title: String,

    /// Detailed description
    pub description: String,

    /// Category, used to pick validation criteria
    pub category: TaskCategory,

    /// Scheduling priority
    pub priority: TaskPriority,

    /// Current status
    pub status: TaskStatus,

    /// Resources that must be reserved before the task may run
    pub resource_constraints: Vec<ResourceConstraint>,

    /// Expected run time
    #[serde(with = "crate::duration_ms")]
    pub estimated_duration: Duration,

    /// Tasks this one depends on
    pub dependencies: Vec<TaskDependency>,

    /// How many times the task has been retried
    pub retry_count: u32,

    /// Retry budget
    pub max_retries: u32,

    /// Provenance
    pub metadata: TaskMetadata,
}

impl Task {
    /// Build a queued task from a submission spec.
    pub fn from_spec(spec: TaskSpec, default_max_retries: u32) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: TaskId::new(),
            title: spec.title,
            description: spec.description,
            category: spec.category,
            priority: spec.priority,
            status: TaskStatus::Queued,
            resource_constraints: spec.resource_constraints,
            estimated_duration: spec.estimated_duration,
            dependencies: spec.dependencies,
            retry_count: 0,
            max_retries: spec.max_retries.unwrap_or(default_max_retries),
            metadata: TaskMetadata {
                created_at: now,
                updated_at: now,
                created_by: spec.created_by,
            },
        }
    }

    /// Move the task to a new status, enforcing the state machine.
    pub fn transition(&mut self, to: TaskStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(to) {
            return Err(TransitionError {
                task_id: self.id,
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.metadata.updated_at = chrono::Utc::now();
        Ok(())
    }

    /// Ids of hard dependencies.
    pub fn hard_dependencies(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.dependencies
            .iter()
            .filter(|d| d.kind == DependencyKind::Hard)
            .map(|d| d.task_id)
    }

    /// Whether another retry is allowed.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Sum of all declared resource units.
    pub fn resource_footprint(&self) -> u64 {
        self.resource_constraints
            .iter()
            .map(|c| u64::from(c.max_units))
            .sum()
    }
}

/// Specification for submitting a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Task title
    pub title: String,
    /// Description
    #[serde(default)]
    pub description: String,
    /// Category
    #[serde(default)]
    pub category: TaskCategory,
    /// Priority
    #[serde(default)]
    pub priority: TaskPriority,
    /// Required resources
    #[serde(default)]
    pub resource_constraints: Vec<ResourceConstraint>,
    /// Dependencies on already-submitted tasks
    #[serde(default)]
    pub dependencies: Vec<TaskDependency>,
    /// Expected run time
    #[serde(default, with = "crate::duration_ms")]
    pub estimated_duration: Duration,
    /// Retry budget (scheduler default when absent)
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Who submitted the task
    #[serde(default = "default_creator")]
    pub created_by: String,
}

fn default_creator() -> String {
    "system".to_string()
}

impl TaskSpec {
    /// Create a spec with defaults for everything but the title.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: String::new(),
            category: TaskCategory::default(),
            priority: TaskPriority::default(),
            resource_constraints: Vec::new(),
            dependencies: Vec::new(),
            estimated_duration: Duration::ZERO,
            max_retries: None,
            created_by: default_creator(),
        }
    }

    /// Set description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set category.
    pub fn with_category(mut self, category: TaskCategory) -> Self {
        self.category = category;
        self
    }

    /// Set priority.
    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Require `units` of `resource_type`.
    pub fn with_resource(mut self, resource_type: impl Into<String>, units: u32) -> Self {
        self.resource_constraints.push(ResourceConstraint {
            resource_type: resource_type.into(),
            max_units: units,
        });
        self
    }

    /// Add a hard dependency.
    pub fn depends_on(mut self, task_id: TaskId) -> Self {
        self.dependencies.push(TaskDependency::hard(task_id));
        self
    }

    /// Add a soft dependency.
    pub fn prefers_after(mut self, task_id: TaskId) -> Self {
        self.dependencies.push(TaskDependency::soft(task_id));
        self
    }

    /// Set the estimated duration.
    pub fn with_estimated_duration(mut self, duration: Duration) -> Self {
        self.estimated_duration = duration;
        self
    }

    /// Set the retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Set the submitter.
    pub fn created_by(mut self, creator: impl Into<String>) -> Self {
        self.created_by = creator.into();
        self
    }
}

/// Immutable provenance of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMetadata {
    /// Creation timestamp
    pub created_at: Time,
    /// Last status change
    pub updated_at: Time,
    /// Submitter
    pub created_by: String,
}

/// Ordinal task priority. Declaration order is significance order.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    /// Only when nothing else is waiting
    Background,
    /// Low
    Low,
    /// Normal work
    #[default]
    Medium,
    /// High
    High,
    /// Must run first
    Critical,
}

impl TaskPriority {
    /// The next level up, saturating at `Critical`.
    pub fn raised(self) -> Self {
        match self {
            Self::Background => Self::Low,
            Self::Low => Self::Medium,
            Self::Medium => Self::High,
            Self::High | Self::Critical => Self::Critical,
        }
    }
}

/// Closed set of task categories.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskCategory {
    /// Writing or changing code
    #[default]
    Implementation,
    /// Writing tests
    Testing,
    /// Writing documentation
    Documentation,
    /// Investigation
    Research,
    /// Architecture and design work
    Design,
    /// Shipping
    Deployment,
    /// Upkeep and refactoring
    Maintenance,
    /// Reviewing other work
    Review,
}

/// Task status.
///
/// ```text
/// queued → allocated → in_progress → completed | failed | blocked
/// blocked → queued            (hard dependency completed)
/// failed  → queued | cancelled (retry budget)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be scheduled
    Queued,
    /// Resources reserved, not yet running
    Allocated,
    /// Being executed
    InProgress,
    /// Finished successfully
    Completed,
    /// Execution failed
    Failed,
    /// Waiting on an unmet hard dependency
    Blocked,
    /// Terminal, will not run
    Cancelled,
}

impl TaskStatus {
    /// Whether `self → to` is a legal transition.
    pub fn can_transition_to(self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            (Queued, Allocated)
                | (Queued, Blocked)
                | (Queued, Cancelled)
                | (Allocated, InProgress)
                | (Allocated, Queued)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Blocked)
                | (Blocked, Queued)
                | (Blocked, Cancelled)
                | (Failed, Queued)
                | (Failed, Cancelled)
        )
    }

    /// No further transitions are possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Holding or about to hold resources.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Allocated | Self::InProgress)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Allocated => "allocated",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Illegal status change.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("task {task_id}: cannot move from {from} to {to}")]
pub struct TransitionError {
    /// Task being moved
    pub task_id: TaskId,
    /// Current status
    pub from: TaskStatus,
    /// Requested status
    pub to: TaskStatus,
}

/// A resource the task must reserve before running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceConstraint {
    /// Pool name, e.g. "cpu"
    pub resource_type: String,
    /// Units to reserve
    pub max_units: u32,
}

/// Kind of dependency edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    /// Predecessor must complete first
    Hard,
    /// Advisory ordering only
    Soft,
}

/// Edge from a task to one it depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDependency {
    /// The predecessor
    pub task_id: TaskId,
    /// Edge kind
    pub kind: DependencyKind,
}

impl TaskDependency {
    /// Hard edge to `task_id`.
    pub fn hard(task_id: TaskId) -> Self {
        Self { task_id, kind: DependencyKind::Hard }
    }

    /// Soft edge to `task_id`.
    pub fn soft(task_id: TaskId) -> Self {
        Self { task_id, kind: DependencyKind::Soft }
    }
}

/// Filter for querying tasks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskFilter {
    /// Filter by status
    pub status: Option<Vec<TaskStatus>>,

    /// Filter by minimum priority
    pub min_priority: Option<TaskPriority>,

    /// Filter by category
    pub category: Option<Vec<TaskCategory>>,
}

impl TaskFilter {
    /// Only tasks in one of `statuses`.
    pub fn with_status(mut self, statuses: impl IntoIterator<Item = TaskStatus>) -> Self {
        self.status = Some(statuses.into_iter().collect());
        self
    }

    /// Only tasks at or above `priority`.
    pub fn with_min_priority(mut self, priority: TaskPriority) -> Self {
        self.min_priority = Some(priority);
        self
    }

    /// Only tasks in one of `categories`.
    pub fn with_category(mut self, categories: impl IntoIterator<Item = TaskCategory>) -> Self {
        self.category = Some(categories.into_iter().collect());
        self
    }

    /// Whether `task` passes every predicate.
    pub fn matches(&self, task: &Task) -> bool {
        if let Some(statuses) = &self.status {
            if !statuses.contains(&task.status) {
                return false;
            }
        }
        if let Some(min) = self.min_priority {
            if task.priority < min {
                return false;
            }
        }
        if let Some(categories) = &self.category {
            if !categories.contains(&task.category) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(priority: TaskPriority) -> Task {
        Task::from_spec(TaskSpec::new("t").with_priority(priority), 3)
    }

    #[test]
    fn test_priority_ordering() {
        assert!(TaskPriority::Background < TaskPriority::Low);
        assert!(TaskPriority::Low < TaskPriority::Medium);
        assert!(TaskPriority::Medium < TaskPriority::High);
        assert!(TaskPriority::High < TaskPriority::Critical);
        assert_eq!(TaskPriority::Critical.raised(), TaskPriority::Critical);
        assert_eq!(TaskPriority::Low.raised(), TaskPriority::Medium);
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut t = task(TaskPriority::Medium);
        assert_eq!(t.status, TaskStatus::Queued);
        t.transition(TaskStatus::Allocated).unwrap();
        t.transition(TaskStatus::InProgress).unwrap();
        t.transition(TaskStatus::Completed).unwrap();
        assert!(t.status.is_terminal());
    }

    #[test]
    fn test_illegal_transition_is_rejected() {
        let mut t = task(TaskPriority::Medium);
        let err = t.transition(TaskStatus::Completed).unwrap_err();
        assert_eq!(err.from, TaskStatus::Queued);
        assert_eq!(err.to, TaskStatus::Completed);
        assert_eq!(t.status, TaskStatus::Queued);
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        let all = [
            TaskStatus::Queued,
            TaskStatus::Allocated,
            TaskStatus::InProgress,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Blocked,
            TaskStatus::Cancelled,
        ];
        for to in all {
            assert!(!TaskStatus::Completed.can_transition_to(to));
            assert!(!TaskStatus::Cancelled.can_transition_to(to));
        }
    }

    #[test]
    fn test_failed_can_retry_or_cancel() {
        assert!(TaskStatus::Failed.can_transition_to(TaskStatus::Queued));
        assert!(TaskStatus::Failed.can_transition_to(TaskStatus::Cancelled));
        assert!(!TaskStatus::Failed.can_transition_to(TaskStatus::InProgress));
    }

    #[test]
    fn test_spec_defaults_max_retries() {
        let t = Task::from_spec(TaskSpec::new("t"), 4);
        assert_eq!(t.max_retries, 4);
        let t = Task::from_spec(TaskSpec::new("t").with_max_retries(1), 4);
        assert_eq!(t.max_retries, 1);
        assert!(t.can_retry());
    }

    #[test]
    fn test_hard_dependencies_skip_soft_edges() {
        let a = TaskId::new();
        let b = TaskId::new();
        let t = Task::from_spec(TaskSpec::new("t").depends_on(a).prefers_after(b), 0);
        let hard: Vec<_> = t.hard_dependencies().collect();
        assert_eq!(hard, vec![a]);
    }

    #[test]
    fn test_filter_matches() {
        let t = Task::from_spec(
            TaskSpec::new("t")
                .with_priority(TaskPriority::High)
                .with_category(TaskCategory::Testing),
            0,
        );
        assert!(TaskFilter::default().matches(&t));
        assert!(TaskFilter::default().with_status([TaskStatus::Queued]).matches(&t));
        assert!(!TaskFilter::default().with_status([TaskStatus::Blocked]).matches(&t));
        assert!(TaskFilter::default().with_min_priority(TaskPriority::Medium).matches(&t));
        assert!(!TaskFilter::default().with_min_priority(TaskPriority::Critical).matches(&t));
        assert!(!TaskFilter::default()
            .with_category([TaskCategory::Documentation])
            .matches(&t));
    }

    #[test]
    fn test_spec_deserializes_with_defaults() {
        let spec: TaskSpec = serde_json::from_str(
            r#"{"title": "build", "priority": "high", "estimated_duration": 1500}"#,
        )
        .unwrap();
        assert_eq!(spec.priority, TaskPriority::High);
        assert_eq!(spec.category, TaskCategory::Implementation);
        assert_eq!(spec.estimated_duration, Duration::from_millis(1500));
        assert_eq!(spec.created_by, "system");
    }

    #[test]
    fn test_resource_footprint() {
        let t = Task::from_spec(
            TaskSpec::new("t").with_resource("cpu", 2).with_resource("memory", 3),
            0,
        );
        assert_eq!(t.resource_footprint(), 5);
    }
}
