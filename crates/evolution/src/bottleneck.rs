//! Rule-based bottleneck detection.

use conductor_core::{duration_ms, Severity};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::metrics::{Bottleneck, BottleneckKind, PerformanceMetrics};

/// Limits that flag a bottleneck.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BottleneckThresholds {
    /// Queue depth above this multiple of active tasks is a backlog
    pub backlog_ratio: f64,

    /// Memory utilisation above this is critical
    pub memory_critical: f64,

    /// p95 latency above this is a latency bottleneck
    #[serde(with = "duration_ms")]
    pub p95_latency_ceiling: Duration,
}

impl Default for BottleneckThresholds {
    fn default() -> Self {
        Self {
            backlog_ratio: 3.0,
            memory_critical: 0.9,
            p95_latency_ceiling: Duration::from_secs(300),
        }
    }
}

/// Evaluate every rule against a snapshot.
pub fn detect_bottlenecks(
    metrics: &PerformanceMetrics,
    thresholds: &BottleneckThresholds,
) -> Vec<Bottleneck> {
    let mut found = Vec::new();
    let queue = &metrics.queue;

    if queue.depth as f64 > thresholds.backlog_ratio * queue.active as f64 {
        found.push(Bottleneck {
            kind: BottleneckKind::Queue,
            severity: Severity::High,
            description: format!(
                "queue backlog of {} exceeds {}x the {} active tasks",
                queue.depth, thresholds.backlog_ratio, queue.active
            ),
            affected_tasks: queue.depth,
            suggested_actions: vec![
                "raise max concurrent tasks".to_string(),
                "rebalance queue priorities".to_string(),
            ],
        });
    }

    if metrics.agents.available_workers == 0 && queue.depth > 0 {
        found.push(Bottleneck {
            kind: BottleneckKind::Agent,
            severity: Severity::Critical,
            description: format!(
                "all {} workers busy with {} tasks waiting",
                metrics.agents.total_workers, queue.depth
            ),
            affected_tasks: queue.depth,
            suggested_actions: vec!["add worker slots".to_string()],
        });
    }

    let system = &metrics.system;
    if system.memory_utilization > thresholds.memory_critical {
        found.push(Bottleneck {
            kind: BottleneckKind::System,
            severity: Severity::Critical,
            description: format!(
                "memory at {:.0}% of budget",
                system.memory_utilization * 100.0
            ),
            affected_tasks: queue.active,
            suggested_actions: vec![
                "lower max concurrent tasks".to_string(),
                "raise the memory budget".to_string(),
            ],
        });
    }

    if system.latency_p95 > thresholds.p95_latency_ceiling {
        found.push(Bottleneck {
            kind: BottleneckKind::System,
            severity: Severity::High,
            description: format!(
                "p95 latency {}ms above ceiling {}ms",
                system.latency_p95.as_millis(),
                thresholds.p95_latency_ceiling.as_millis()
            ),
            affected_tasks: queue.depth + queue.active,
            suggested_actions: vec!["prioritise short tasks".to_string()],
        });
    }

    found
}
