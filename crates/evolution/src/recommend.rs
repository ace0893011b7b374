//! Recommendation rules.
//!
//! Each rule looks at one domain of the latest snapshot and independently
//! proposes at most one recommendation.

use conductor_core::{duration_ms, RecommendationId, Severity, Time};
use conductor_execution::SchedulingStrategy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::action::OptimizationAction;
use crate::metrics::PerformanceMetrics;

/// Domain a recommendation addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationKind {
    /// Runnable work sitting in the queue
    QueueEfficiency,
    /// Completion rate
    Throughput,
    /// Idle worker slots
    AgentUtilization,
    /// Uneven use of resource types
    LoadBalance,
    /// Process memory
    MemoryPressure,
    /// Queue-to-completion latency
    Latency,
}

/// A proposed tuning action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationRecommendation {
    /// Id used to apply or revert it
    pub id: RecommendationId,
    /// Domain
    pub kind: RecommendationKind,
    /// Short title
    pub title: String,
    /// Why it was proposed
    pub description: String,
    /// Urgency
    pub priority: Severity,
    /// Expected improvement of the targeted figure, as a fraction
    pub expected_impact: f64,
    /// Safe to apply without an operator
    pub automatic: bool,
    /// Changes to make
    pub actions: Vec<OptimizationAction>,
    /// Confidence in the diagnosis, 0.0 to 1.0
    pub confidence: f64,
    /// When it was produced
    pub created_at: Time,
    /// How long it stays valid
    #[serde(with = "duration_ms")]
    pub ttl: Duration,
}

impl OptimizationRecommendation {
    /// End of the validity period.
    pub fn expires_at(&self) -> Time {
        self.created_at + chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::zero())
    }

    /// Whether the validity period has passed.
    pub fn is_expired(&self, now: Time) -> bool {
        now >= self.expires_at()
    }
}

/// Limits that trigger recommendations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecommendationThresholds {
    /// Queue efficiency floor
    pub queue_efficiency: f64,
    /// Completions per minute floor while work is waiting
    pub throughput_floor: f64,
    /// Worker utilisation floor while work is waiting
    pub agent_utilization: f64,
    /// Load-balance efficiency floor
    pub load_balance: f64,
    /// Memory utilisation above which to shed load
    pub memory_pressure: f64,
    /// Memory utilisation above which shedding is critical
    pub memory_critical: f64,
    /// p95 latency ceiling
    #[serde(with = "duration_ms")]
    pub p95_latency_ceiling: Duration,
    /// Worker slots are never raised above this
    pub max_concurrency_ceiling: usize,
}

impl Default for RecommendationThresholds {
    fn default() -> Self {
        Self {
            queue_efficiency: 0.8,
            throughput_floor: 1.0,
            agent_utilization: 0.6,
            load_balance: 0.7,
            memory_pressure: 0.8,
            memory_critical: 0.9,
            p95_latency_ceiling: Duration::from_secs(300),
            max_concurrency_ceiling: 32,
        }
    }
}

/// Run every rule against `metrics`, most urgent first.
pub fn generate_recommendations(
    metrics: &PerformanceMetrics,
    thresholds: &RecommendationThresholds,
) -> Vec<OptimizationRecommendation> {
    let now = chrono::Utc::now();
    let mut out: Vec<OptimizationRecommendation> = [
        memory_pressure(metrics, thresholds),
        queue_efficiency(metrics, thresholds),
        latency(metrics, thresholds),
        throughput(metrics, thresholds),
        agent_utilization(metrics, thresholds),
        load_balance(metrics, thresholds),
    ]
    .into_iter()
    .flatten()
    .map(|draft| draft.finish(now))
    .collect();

    out.sort_by(|a, b| b.priority.cmp(&a.priority));
    out
}

struct Draft {
    kind: RecommendationKind,
    title: &'static str,
    description: String,
    priority: Severity,
    expected_impact: f64,
    automatic: bool,
    actions: Vec<OptimizationAction>,
    confidence: f64,
    ttl: Duration,
}

impl Draft {
    fn finish(self, now: Time) -> OptimizationRecommendation {
        OptimizationRecommendation {
            id: RecommendationId::new(),
            kind: self.kind,
            title: self.title.to_string(),
            description: self.description,
            priority: self.priority,
            expected_impact: self.expected_impact,
            automatic: self.automatic,
            actions: self.actions,
            confidence: self.confidence,
            created_at: now,
            ttl: self.ttl,
        }
    }
}

fn under_memory_pressure(m: &PerformanceMetrics, t: &RecommendationThresholds) -> bool {
    m.system.memory_utilization > t.memory_pressure
}

fn switch_strategy(m: &PerformanceMetrics, to: SchedulingStrategy) -> Option<OptimizationAction> {
    (m.queue.strategy != to).then_some(OptimizationAction::SetStrategy { strategy: to })
}

fn queue_efficiency(m: &PerformanceMetrics, t: &RecommendationThresholds) -> Option<Draft> {
    let efficiency = m.queue.efficiency;
    if m.queue.depth == 0 || efficiency >= t.queue_efficiency {
        return None;
    }

    let mut actions = Vec::new();
    let workers = m.agents.total_workers;
    if !under_memory_pressure(m, t) && workers < t.max_concurrency_ceiling {
        let value = (workers + (workers / 2).max(1)).min(t.max_concurrency_ceiling);
        actions.push(OptimizationAction::SetMaxConcurrent { value });
    }
    actions.push(OptimizationAction::RebalanceQueue);

    Some(Draft {
        kind: RecommendationKind::QueueEfficiency,
        title: "Improve Queue Efficiency",
        description: format!(
            "only {:.0}% of runnable tasks are running ({} queued, {} active)",
            efficiency * 100.0,
            m.queue.depth,
            m.queue.active
        ),
        priority: if efficiency < 0.5 { Severity::High } else { Severity::Medium },
        expected_impact: t.queue_efficiency - efficiency,
        automatic: true,
        actions,
        confidence: 0.8,
        ttl: Duration::from_secs(600),
    })
}

fn throughput(m: &PerformanceMetrics, t: &RecommendationThresholds) -> Option<Draft> {
    let rate = m.execution.throughput_per_minute;
    if m.queue.depth == 0 || m.execution.completed_total == 0 || rate >= t.throughput_floor {
        return None;
    }
    let action = switch_strategy(m, SchedulingStrategy::ShortestJobFirst)?;
    Some(Draft {
        kind: RecommendationKind::Throughput,
        title: "Increase Throughput",
        description: format!(
            "{rate:.2} completions per minute is below the floor of {:.2}",
            t.throughput_floor
        ),
        priority: Severity::Medium,
        expected_impact: 0.15,
        automatic: true,
        actions: vec![action],
        confidence: 0.6,
        ttl: Duration::from_secs(900),
    })
}

fn agent_utilization(m: &PerformanceMetrics, t: &RecommendationThresholds) -> Option<Draft> {
    let utilization = m.agents.utilization;
    if m.queue.depth == 0 || utilization >= t.agent_utilization {
        return None;
    }
    let action = switch_strategy(m, SchedulingStrategy::ResourceOptimal)?;
    Some(Draft {
        kind: RecommendationKind::AgentUtilization,
        title: "Improve Agent Utilization",
        description: format!(
            "{} of {} workers idle while {} tasks wait for resources",
            m.agents.available_workers, m.agents.total_workers, m.queue.depth
        ),
        priority: Severity::Medium,
        expected_impact: t.agent_utilization - utilization,
        automatic: true,
        actions: vec![action],
        confidence: 0.7,
        ttl: Duration::from_secs(600),
    })
}

fn load_balance(m: &PerformanceMetrics, t: &RecommendationThresholds) -> Option<Draft> {
    let balance = m.agents.load_balance_efficiency;
    if balance >= t.load_balance {
        return None;
    }
    Some(Draft {
        kind: RecommendationKind::LoadBalance,
        title: "Balance Resource Load",
        description: format!(
            "resource utilisation is uneven ({:.0}% balance); review pool capacities",
            balance * 100.0
        ),
        priority: Severity::Low,
        expected_impact: t.load_balance - balance,
        automatic: false,
        actions: vec![OptimizationAction::RebalanceQueue],
        confidence: 0.5,
        ttl: Duration::from_secs(1800),
    })
}

fn memory_pressure(m: &PerformanceMetrics, t: &RecommendationThresholds) -> Option<Draft> {
    let used = m.system.memory_utilization;
    if !under_memory_pressure(m, t) {
        return None;
    }
    let workers = m.agents.total_workers;
    let mut actions = Vec::new();
    if workers > 1 {
        actions.push(OptimizationAction::SetMaxConcurrent {
            value: workers - (workers / 4).max(1),
        });
    }
    Some(Draft {
        kind: RecommendationKind::MemoryPressure,
        title: "Reduce Memory Pressure",
        description: format!("memory at {:.0}% of budget", used * 100.0),
        priority: if used > t.memory_critical {
            Severity::Critical
        } else {
            Severity::High
        },
        expected_impact: used - t.memory_pressure,
        automatic: !actions.is_empty(),
        actions,
        confidence: 0.75,
        ttl: Duration::from_secs(300),
    })
}

fn latency(m: &PerformanceMetrics, t: &RecommendationThresholds) -> Option<Draft> {
    let p95 = m.system.latency_p95;
    if p95 <= t.p95_latency_ceiling {
        return None;
    }
    let mut actions: Vec<_> = switch_strategy(m, SchedulingStrategy::PriorityFirst).into_iter().collect();
    actions.push(OptimizationAction::RebalanceQueue);
    Some(Draft {
        kind: RecommendationKind::Latency,
        title: "Reduce Task Latency",
        description: format!(
            "p95 latency {}s above ceiling {}s",
            p95.as_secs(),
            t.p95_latency_ceiling.as_secs()
        ),
        priority: Severity::High,
        expected_impact: 0.2,
        automatic: true,
        actions,
        confidence: 0.65,
        ttl: Duration::from_secs(600),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::tests::{queue_stats, sample};

    fn metrics(queued: usize, active: usize, slots: usize) -> PerformanceMetrics {
        PerformanceMetrics::from_samples(&queue_stats(queued, active, slots), sample(10, 100), None)
    }

    #[test]
    fn test_backlog_yields_automatic_queue_recommendation() {
        let recs = generate_recommendations(&metrics(30, 5, 5), &RecommendationThresholds::default());
        let queue = recs
            .iter()
            .find(|r| r.title == "Improve Queue Efficiency")
            .expect("queue recommendation");
        assert!(queue.automatic);
        assert_eq!(queue.priority, Severity::High);
        assert_eq!(
            queue.actions,
            vec![
                OptimizationAction::SetMaxConcurrent { value: 7 },
                OptimizationAction::RebalanceQueue,
            ]
        );
        assert!(queue.confidence > 0.0 && queue.ttl > Duration::ZERO);
    }

    #[test]
    fn test_healthy_system_yields_nothing() {
        assert!(generate_recommendations(&metrics(0, 3, 5), &RecommendationThresholds::default()).is_empty());
    }

    #[test]
    fn test_sorted_by_priority() {
        let mut stats = queue_stats(10, 1, 8);
        stats.recent_latencies = vec![Duration::from_secs(900); 10];
        stats.completed_total = 4;
        let m = PerformanceMetrics::from_samples(&stats, sample(95, 100), None);

        let recs = generate_recommendations(&m, &RecommendationThresholds::default());
        let priorities: Vec<_> = recs.iter().map(|r| r.priority).collect();
        let mut sorted = priorities.clone();
        sorted.sort_by(|a, b| b.cmp(a));
        assert_eq!(priorities, sorted);
        assert_eq!(recs[0].kind, RecommendationKind::MemoryPressure);
        assert_eq!(recs[0].priority, Severity::Critical);

        // Under memory pressure the queue rule does not add workers.
        let queue = recs.iter().find(|r| r.kind == RecommendationKind::QueueEfficiency).unwrap();
        assert_eq!(queue.actions, vec![OptimizationAction::RebalanceQueue]);
    }

    #[test]
    fn test_strategy_rules_skip_when_already_active() {
        let mut stats = queue_stats(4, 1, 8);
        stats.strategy = SchedulingStrategy::ResourceOptimal;
        let m = PerformanceMetrics::from_samples(&stats, sample(10, 100), None);
        let recs = generate_recommendations(&m, &RecommendationThresholds::default());
        assert!(recs.iter().all(|r| r.kind != RecommendationKind::AgentUtilization));
    }

    #[test]
    fn test_expiry() {
        let recs = generate_recommendations(&metrics(30, 5, 5), &RecommendationThresholds::default());
        let rec = &recs[0];
        assert!(!rec.is_expired(rec.created_at));
        assert!(rec.is_expired(rec.expires_at()));
    }
}
