//! Execution layer - dependency resolution, resource pools and scheduling.

#![warn(missing_docs)]

pub mod dependency;
pub mod resource;
pub mod strategy;
pub mod scheduler;
pub mod stats;

pub use dependency::{
    CycleKind, DependencyCycle, DependencyEdge, DependencyGraph, DependencyResolver, GraphError,
};
pub use resource::{Allocation, ResourceError, ResourcePool, ResourceUsage};
pub use strategy::{SchedulingStrategy, StrategyKey};
pub use scheduler::{
    Assignment, FailureDisposition, PriorityThresholds, RebalanceSummary, ScheduledTask,
    SchedulerConfig, SchedulerError, SchedulerEvent, TaskPriorityScheduler,
};
pub use stats::QueueStats;
