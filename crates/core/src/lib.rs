//! Conductor core data models.
//!
//! This crate defines the task model, identifiers and the event channel
//! shared by the scheduling, optimization and validation layers.

#![warn(missing_docs)]

// Core identities
mod id;

// Task model
mod task;
mod severity;

// Events
pub mod event;

pub mod duration_ms;

// Re-exports
pub use id::*;

pub use task::{
    DependencyKind, ResourceConstraint, Task, TaskCategory, TaskDependency, TaskFilter,
    TaskMetadata, TaskPriority, TaskSpec, TaskStatus, TransitionError,
};
pub use severity::Severity;
pub use event::{EventBus, EventName};

/// Timestamp type
pub type Time = chrono::DateTime<chrono::Utc>;
