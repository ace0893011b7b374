//! Seams between the optimizer and the scheduler it tunes.

use conductor_execution::{QueueStats, SchedulingStrategy, TaskPriorityScheduler};

/// Supplies queue statistics.
pub trait MetricsSource: Send + Sync {
    /// Current queue snapshot.
    fn queue_stats(&self) -> QueueStats;
}

/// Knobs the optimizer may turn.
///
/// Setters return the previous value so the change can be reverted.
pub trait TuningTarget: Send + Sync {
    /// Worker slots.
    fn max_concurrent(&self) -> usize;
    /// Change worker slots.
    fn set_max_concurrent(&self, value: usize) -> usize;
    /// Active strategy.
    fn strategy(&self) -> SchedulingStrategy;
    /// Switch strategy.
    fn set_strategy(&self, strategy: SchedulingStrategy) -> SchedulingStrategy;
    /// Capacity of a resource type, if known.
    fn capacity(&self, resource: &str) -> Option<u32>;
    /// Resize a resource type.
    fn set_capacity(&self, resource: &str, capacity: u32) -> anyhow::Result<u32>;
    /// Run an aging pass; returns how many tasks were promoted.
    fn rebalance_queue(&self) -> usize;
}

impl MetricsSource for TaskPriorityScheduler {
    fn queue_stats(&self) -> QueueStats {
        TaskPriorityScheduler::queue_stats(self)
    }
}

impl TuningTarget for TaskPriorityScheduler {
    fn max_concurrent(&self) -> usize {
        TaskPriorityScheduler::max_concurrent(self)
    }

    fn set_max_concurrent(&self, value: usize) -> usize {
        TaskPriorityScheduler::set_max_concurrent(self, value)
    }

    fn strategy(&self) -> SchedulingStrategy {
        TaskPriorityScheduler::strategy(self)
    }

    fn set_strategy(&self, strategy: SchedulingStrategy) -> SchedulingStrategy {
        TaskPriorityScheduler::set_strategy(self, strategy)
    }

    fn capacity(&self, resource: &str) -> Option<u32> {
        self.pool().usage(resource).ok().map(|u| u.capacity)
    }

    fn set_capacity(&self, resource: &str, capacity: u32) -> anyhow::Result<u32> {
        Ok(TaskPriorityScheduler::set_capacity(self, resource, capacity)?)
    }

    fn rebalance_queue(&self) -> usize {
        TaskPriorityScheduler::rebalance_queue(self).promoted.len()
    }
}
