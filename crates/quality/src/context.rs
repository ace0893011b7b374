//! What a validator gets to look at.

use conductor_core::{Task, TaskId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A file or document produced by a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Path or name
    pub path: String,
    /// Text content
    pub content: String,
}

/// A completed task and its output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationContext {
    /// The task being validated
    pub task: Task,
    /// Produced artifacts
    pub artifacts: Vec<Artifact>,
    /// Free-form summary of the work done
    pub summary: String,
    /// Extra key/value data for custom validators
    pub metadata: BTreeMap<String, String>,
}

impl ValidationContext {
    /// Context with no artifacts.
    pub fn new(task: Task) -> Self {
        Self {
            task,
            artifacts: Vec::new(),
            summary: String::new(),
            metadata: BTreeMap::new(),
        }
    }

    /// Id of the task.
    pub fn task_id(&self) -> TaskId {
        self.task.id
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

    /// Add a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}
