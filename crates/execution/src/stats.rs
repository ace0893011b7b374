//! Point-in-time queue statistics exported by the scheduler.

use conductor_core::Time;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::resource::ResourceUsage;
use crate::strategy::SchedulingStrategy;

/// Snapshot of the scheduler's queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    /// When the snapshot was taken
    pub taken_at: Time,

    /// Tasks waiting to be dispatched
    pub queued: usize,
    /// Tasks waiting on a hard dependency
    pub blocked: usize,
    /// Tasks holding resources, not yet started
    pub allocated: usize,
    /// Tasks running
    pub in_progress: usize,
    /// Tasks currently completed
    pub completed: usize,
    /// Tasks currently failed
    pub failed: usize,
    /// Tasks cancelled
    pub cancelled: usize,

    /// Completions since start
    pub completed_total: u64,
    /// Failures since start, counting each attempt
    pub failed_total: u64,

    /// Concurrency limit
    pub max_concurrent: usize,
    /// Active tie-break strategy
    pub strategy: SchedulingStrategy,

    /// Execution times of recently completed tasks
    pub recent_durations: Vec<Duration>,
    /// Queue-to-completion latencies of recently completed tasks
    pub recent_latencies: Vec<Duration>,
    /// Queue-to-allocation waits of recently dispatched tasks
    pub recent_waits: Vec<Duration>,

    /// Width of the throughput window
    #[serde(with = "conductor_core::duration_ms")]
    pub window: Duration,
    /// Completions inside the window
    pub completed_in_window: usize,
    /// Failures inside the window
    pub failed_in_window: usize,

    /// Per-resource usage
    pub resources: Vec<ResourceUsage>,
}

impl QueueStats {
    /// Tasks holding a worker slot.
    pub fn active(&self) -> usize {
        self.allocated + self.in_progress
    }

    /// Tasks waiting for dispatch.
    pub fn backlog(&self) -> usize {
        self.queued
    }

    /// Free worker slots.
    pub fn available_slots(&self) -> usize {
        self.max_concurrent.saturating_sub(self.active())
    }

    /// Completions per minute over the window.
    pub fn throughput_per_minute(&self) -> f64 {
        let minutes = self.window.as_secs_f64() / 60.0;
        if minutes <= 0.0 {
            0.0
        } else {
            self.completed_in_window as f64 / minutes
        }
    }

    /// Failed share of finished attempts inside the window.
    pub fn error_rate(&self) -> f64 {
        let finished = self.completed_in_window + self.failed_in_window;
        if finished == 0 {
            0.0
        } else {
            self.failed_in_window as f64 / finished as f64
        }
    }
}
