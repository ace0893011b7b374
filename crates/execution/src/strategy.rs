//! Scheduling strategies.
//!
//! A strategy only decides between tasks that are ready at the same time;
//! hard-dependency order is enforced by the resolver regardless.

use conductor_core::{Task, TaskPriority};
use serde::{Deserialize, Serialize};

use crate::dependency::priority_rank;

/// Tie-break heuristic used when several tasks are ready at once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingStrategy {
    /// Priority, then submission order
    #[default]
    DependencyAware,
    /// Priority, then shorter estimate, then submission order
    PriorityFirst,
    /// Smaller resource footprint, then priority, then submission order
    ResourceOptimal,
    /// Shorter estimate, then priority, then submission order
    ShortestJobFirst,
}

/// Sort key: smaller runs first.
pub type StrategyKey = (u64, u64, u64);

impl SchedulingStrategy {
    /// Ordering key for a ready task.
    ///
    /// `priority` is the task's effective priority, which may differ from its
    /// declared one after queue aging; `position` is its submission index.
    pub fn key(self, task: &Task, priority: TaskPriority, position: usize) -> StrategyKey {
        let rank = priority_rank(priority);
        let position = position as u64;
        let estimate = u64::try_from(task.estimated_duration.as_millis()).unwrap_or(u64::MAX);
        match self {
            Self::DependencyAware => (rank, position, 0),
            Self::PriorityFirst => (rank, estimate, position),
            Self::ResourceOptimal => (task.resource_footprint(), rank, position),
            Self::ShortestJobFirst => (estimate, rank, position),
        }
    }

    /// Name used in configuration and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DependencyAware => "dependency_aware",
            Self::PriorityFirst => "priority_first",
            Self::ResourceOptimal => "resource_optimal",
            Self::ShortestJobFirst => "shortest_job_first",
        }
    }
}

impl std::fmt::Display for SchedulingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
