//! Performance snapshots.

use conductor_core::{duration_ms, Severity, Time};
use conductor_execution::{QueueStats, SchedulingStrategy};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::probe::SystemSample;

/// Queue health.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMetrics {
    /// Tasks waiting for dispatch
    pub depth: usize,
    /// Tasks waiting on dependencies
    pub blocked: usize,
    /// Tasks holding a worker slot
    pub active: usize,
    /// Mean queue-to-dispatch wait
    #[serde(with = "duration_ms")]
    pub average_wait: Duration,
    /// Share of runnable work that is actually running
    pub efficiency: f64,
    /// Tie-break strategy in effect
    pub strategy: SchedulingStrategy,
}

/// Execution outcomes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    /// Completions per minute
    pub throughput_per_minute: f64,
    /// Mean run time of recent tasks
    #[serde(with = "duration_ms")]
    pub average_duration: Duration,
    /// Completions since start
    pub completed_total: u64,
    /// Failed attempts since start
    pub failed_total: u64,
}

/// Worker slot usage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMetrics {
    /// Worker slots
    pub total_workers: usize,
    /// Slots in use
    pub busy_workers: usize,
    /// Free slots
    pub available_workers: usize,
    /// busy / total
    pub utilization: f64,
    /// Mean over peak utilisation across resource types
    pub load_balance_efficiency: f64,
}

/// Host and latency figures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemMetrics {
    /// Resident memory of this process
    pub memory_used_bytes: u64,
    /// Memory budget the usage is measured against
    pub memory_budget_bytes: u64,
    /// used / budget
    pub memory_utilization: f64,
    /// Median queue-to-completion latency
    #[serde(with = "duration_ms")]
    pub latency_p50: Duration,
    /// 95th percentile latency
    #[serde(with = "duration_ms")]
    pub latency_p95: Duration,
    /// 99th percentile latency
    #[serde(with = "duration_ms")]
    pub latency_p99: Duration,
    /// Failed share of finished attempts in the window
    pub error_rate: f64,
}

/// Subsystem a bottleneck was found in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BottleneckKind {
    /// Task queue
    Queue,
    /// Worker pool
    Agent,
    /// Host resources or latency
    System,
}

/// A condition constraining throughput.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bottleneck {
    /// Where
    pub kind: BottleneckKind,
    /// How bad
    pub severity: Severity,
    /// Human readable summary
    pub description: String,
    /// Tasks held up by it
    pub affected_tasks: usize,
    /// What an operator could do
    pub suggested_actions: Vec<String>,
}

/// Immutable performance snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    /// When the snapshot was taken
    pub timestamp: Time,
    /// Window the rates cover
    #[serde(with = "duration_ms")]
    pub window: Duration,
    /// Queue
    pub queue: QueueMetrics,
    /// Execution
    pub execution: ExecutionMetrics,
    /// Workers
    pub agents: AgentMetrics,
    /// Host and latency
    pub system: SystemMetrics,
    /// Detected bottlenecks
    pub bottlenecks: Vec<Bottleneck>,
}

impl PerformanceMetrics {
    /// Derive a snapshot from queue statistics and a host sample.
    ///
    /// Bottlenecks are left empty; see [`crate::detect_bottlenecks`].
    pub fn from_samples(stats: &QueueStats, system: SystemSample, heap_budget: Option<u64>) -> Self {
        let active = stats.active();
        let runnable = active + stats.queued;
        let efficiency = if runnable == 0 {
            1.0
        } else {
            active as f64 / runnable as f64
        };

        let total_workers = stats.max_concurrent;
        let utilization = if total_workers == 0 {
            0.0
        } else {
            (active as f64 / total_workers as f64).min(1.0)
        };

        let budget = heap_budget
            .filter(|b| *b > 0)
            .unwrap_or(system.memory_total_bytes);
        let memory_utilization = if budget == 0 {
            0.0
        } else {
            system.memory_used_bytes as f64 / budget as f64
        };

        let mut latencies = stats.recent_latencies.clone();
        latencies.sort_unstable();

        Self {
            timestamp: stats.taken_at,
            window: stats.window,
            queue: QueueMetrics {
                depth: stats.queued,
                blocked: stats.blocked,
                active,
                average_wait: mean(&stats.recent_waits),
                efficiency,
                strategy: stats.strategy,
            },
            execution: ExecutionMetrics {
                throughput_per_minute: stats.throughput_per_minute(),
                average_duration: mean(&stats.recent_durations),
                completed_total: stats.completed_total,
                failed_total: stats.failed_total,
            },
            agents: AgentMetrics {
                total_workers,
                busy_workers: active,
                available_workers: stats.available_slots(),
                utilization,
                load_balance_efficiency: load_balance(stats),
            },
            system: SystemMetrics {
                memory_used_bytes: system.memory_used_bytes,
                memory_budget_bytes: budget,
                memory_utilization,
                latency_p50: percentile(&latencies, 50.0),
                latency_p95: percentile(&latencies, 95.0),
                latency_p99: percentile(&latencies, 99.0),
                error_rate: stats.error_rate(),
            },
            bottlenecks: Vec::new(),
        }
    }

    /// Worst bottleneck severity, if any.
    pub fn worst_severity(&self) -> Option<Severity> {
        self.bottlenecks.iter().map(|b| b.severity).max()
    }
}

fn mean(samples: &[Duration]) -> Duration {
    match u32::try_from(samples.len()) {
        Ok(0) | Err(_) => Duration::ZERO,
        Ok(n) => samples.iter().sum::<Duration>() / n,
    }
}

/// Nearest-rank percentile over sorted samples.
fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

fn load_balance(stats: &QueueStats) -> f64 {
    let utilizations: Vec<f64> = stats
        .resources
        .iter()
        .filter(|r| r.capacity > 0)
        .map(|r| r.utilization())
        .collect();
    let peak = utilizations.iter().copied().fold(0.0, f64::max);
    if peak <= 0.0 {
        return 1.0;
    }
    let avg = utilizations.iter().sum::<f64>() / utilizations.len() as f64;
    avg / peak
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use conductor_execution::ResourceUsage;

    pub(crate) fn queue_stats(queued: usize, in_progress: usize, max_concurrent: usize) -> QueueStats {
        QueueStats {
            taken_at: chrono::Utc::now(),
            queued,
            blocked: 0,
            allocated: 0,
            in_progress,
            completed: 0,
            failed: 0,
            cancelled: 0,
            completed_total: 0,
            failed_total: 0,
            max_concurrent,
            strategy: SchedulingStrategy::default(),
            recent_durations: Vec::new(),
            recent_latencies: Vec::new(),
            recent_waits: Vec::new(),
            window: Duration::from_secs(60),
            completed_in_window: 0,
            failed_in_window: 0,
            resources: Vec::new(),
        }
    }

    pub(crate) fn sample(used: u64, total: u64) -> SystemSample {
        SystemSample {
            memory_used_bytes: used,
            memory_total_bytes: total,
        }
    }

    #[test]
    fn test_queue_efficiency_and_utilization() {
        let m = PerformanceMetrics::from_samples(&queue_stats(30, 5, 5), sample(1, 100), None);
        assert!((m.queue.efficiency - 5.0 / 35.0).abs() < 1e-9);
        assert_eq!(m.agents.available_workers, 0);
        assert!((m.agents.utilization - 1.0).abs() < 1e-9);

        let idle = PerformanceMetrics::from_samples(&queue_stats(0, 0, 5), sample(1, 100), None);
        assert_eq!(idle.queue.efficiency, 1.0);
        assert_eq!(idle.agents.utilization, 0.0);
    }

    #[test]
    fn test_memory_budget_defaults_to_host_total() {
        let stats = queue_stats(0, 0, 1);
        let m = PerformanceMetrics::from_samples(&stats, sample(50, 200), None);
        assert_eq!(m.system.memory_budget_bytes, 200);
        assert!((m.system.memory_utilization - 0.25).abs() < 1e-9);

        let m = PerformanceMetrics::from_samples(&stats, sample(50, 200), Some(100));
        assert!((m.system.memory_utilization - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_latency_percentiles() {
        let mut stats = queue_stats(0, 0, 1);
        stats.recent_latencies = (1..=100).rev().map(Duration::from_secs).collect();
        let m = PerformanceMetrics::from_samples(&stats, sample(0, 0), None);
        assert_eq!(m.system.latency_p50, Duration::from_secs(50));
        assert_eq!(m.system.latency_p95, Duration::from_secs(95));
        assert_eq!(m.system.latency_p99, Duration::from_secs(99));
        assert_eq!(m.system.memory_utilization, 0.0);
    }

    #[test]
    fn test_load_balance_across_resources() {
        let mut stats = queue_stats(0, 2, 4);
        stats.resources = vec![
            ResourceUsage {
                resource_type: "cpu".into(),
                capacity: 4,
                allocated: 4,
            },
            ResourceUsage {
                resource_type: "memory".into(),
                capacity: 8,
                allocated: 0,
            },
        ];
        let m = PerformanceMetrics::from_samples(&stats, sample(0, 1), None);
        assert!((m.agents.load_balance_efficiency - 0.5).abs() < 1e-9);
    }
}
