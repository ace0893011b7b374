//! Performance optimizer - measures the scheduler and tunes it.
//!
//! Two independent loops run once [`PerformanceOptimizer::start`] is called:
//! a monitoring tick that records a [`PerformanceMetrics`] snapshot, and a
//! slower optimization tick that derives recommendations and applies the
//! urgent automatic ones.

use conductor_core::{duration_ms, EventBus, EventName, RecommendationId, Severity, Time};
use conductor_execution::TaskPriorityScheduler;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::action::RevertPlan;
use crate::bottleneck::{detect_bottlenecks, BottleneckThresholds};
use crate::history::{HistoryInterval, MetricsHistory, TrendReport};
use crate::metrics::PerformanceMetrics;
use crate::probe::{SysinfoProbe, SystemProbe};
use crate::recommend::{generate_recommendations, OptimizationRecommendation, RecommendationThresholds};
use crate::source::{MetricsSource, TuningTarget};

/// Optimizer errors.
#[derive(Debug, Error)]
pub enum OptimizerError {
    /// No live recommendation with this id (unknown or expired)
    #[error("recommendation not found: {0}")]
    RecommendationNotFound(RecommendationId),

    /// The recommendation was already applied
    #[error("recommendation {0} is already applied")]
    AlreadyApplied(RecommendationId),

    /// Nothing was applied for this id
    #[error("recommendation {0} was not applied")]
    NotApplied(RecommendationId),

    /// The optimization changed nothing that can be undone
    #[error("optimization {0} has no revert plan")]
    NotRevertible(RecommendationId),

    /// Already reverted
    #[error("optimization {0} was already reverted")]
    AlreadyReverted(RecommendationId),

    /// Settings moved since the optimization; reverting would clobber them
    #[error("cannot revert {id}: {detail}")]
    StateDrifted {
        /// Optimization
        id: RecommendationId,
        /// What changed
        detail: String,
    },

    /// All optimization slots are in use
    #[error("no optimization slot available")]
    NoSlotAvailable,

    /// A tuning call failed while reverting
    #[error("tuning failed: {0}")]
    Tuning(String),
}

/// Result type for optimizer operations.
pub type Result<T> = std::result::Result<T, OptimizerError>;

/// Optimizer configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Metrics sampling period
    #[serde(with = "duration_ms")]
    pub monitoring_interval: Duration,

    /// Optimization cycle period
    #[serde(with = "duration_ms")]
    pub optimization_interval: Duration,

    /// Optimizations that may be in flight at once
    pub max_concurrent_optimizations: usize,

    /// Apply automatic recommendations without an operator
    pub auto_apply: bool,

    /// Wait before measuring the impact of an applied optimization
    #[serde(with = "duration_ms")]
    pub impact_measurement_delay: Duration,

    /// Memory budget; the host total when unset
    pub heap_budget_bytes: Option<u64>,

    /// Bottleneck rules
    pub bottleneck_thresholds: BottleneckThresholds,

    /// Recommendation rules
    pub recommendation_thresholds: RecommendationThresholds,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            monitoring_interval: Duration::from_secs(30),
            optimization_interval: Duration::from_secs(300),
            max_concurrent_optimizations: 3,
            auto_apply: true,
            impact_measurement_delay: Duration::from_secs(10),
            heap_budget_bytes: None,
            bottleneck_thresholds: BottleneckThresholds::default(),
            recommendation_thresholds: RecommendationThresholds::default(),
        }
    }
}

impl OptimizerConfig {
    /// Create a default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the monitoring period.
    pub fn with_monitoring_interval(mut self, interval: Duration) -> Self {
        self.monitoring_interval = interval;
        self
    }

    /// Set the optimization period.
    pub fn with_optimization_interval(mut self, interval: Duration) -> Self {
        self.optimization_interval = interval;
        self
    }

    /// Set the optimization slot count.
    pub fn with_max_concurrent_optimizations(mut self, max: usize) -> Self {
        self.max_concurrent_optimizations = max;
        self
    }

    /// Enable or disable automatic application.
    pub fn with_auto_apply(mut self, enabled: bool) -> Self {
        self.auto_apply = enabled;
        self
    }

    /// Set the impact measurement delay.
    pub fn with_impact_measurement_delay(mut self, delay: Duration) -> Self {
        self.impact_measurement_delay = delay;
        self
    }

    /// Set the memory budget.
    pub fn with_heap_budget(mut self, bytes: u64) -> Self {
        self.heap_budget_bytes = Some(bytes);
        self
    }
}

/// Notifications published by the optimizer.
#[derive(Debug, Clone, PartialEq)]
pub enum OptimizerEvent {
    /// Loops started
    Started,
    /// Loops stopped
    Stopped,
    /// An optimization attempt finished
    Applied {
        /// Recommendation applied
        recommendation_id: RecommendationId,
        /// Whether every action succeeded
        success: bool,
    },
    /// An optimization was reverted
    Reverted {
        /// Recommendation reverted
        recommendation_id: RecommendationId,
    },
    /// New recommendations were produced
    Recommendations {
        /// How many
        count: usize,
        /// Those that need an operator
        manual: Vec<OptimizationRecommendation>,
    },
}

impl EventName for OptimizerEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::Started => "optimization:started",
            Self::Stopped => "optimization:stopped",
            Self::Applied { .. } => "optimization:applied",
            Self::Reverted { .. } => "optimization:reverted",
            Self::Recommendations { .. } => "optimization:recommendations",
        }
    }
}

/// Outcome of applying a recommendation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationResult {
    /// Recommendation applied
    pub recommendation_id: RecommendationId,
    /// Recommendation title
    pub title: String,
    /// Whether every action succeeded
    pub success: bool,
    /// When it was applied
    pub applied_at: Time,
    /// Change in queue efficiency after the measurement delay
    pub measured_impact: Option<f64>,
    /// What changed, and any failure
    pub side_effects: Vec<String>,
    /// How to undo it
    pub revert: Option<RevertPlan>,
    /// Whether it has been reverted
    pub reverted: bool,
}

/// Running optimization tallies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptimizationStats {
    /// Successful applications
    pub applied: u64,
    /// Failed applications
    pub failed: u64,
    /// Reverts
    pub reverted: u64,
}

impl OptimizationStats {
    /// Successful share of attempts; 1.0 before any attempt.
    pub fn success_rate(&self) -> f64 {
        let attempts = self.applied + self.failed;
        if attempts == 0 {
            1.0
        } else {
            self.applied as f64 / attempts as f64
        }
    }
}

/// Optimizer status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerStatus {
    /// Loops running
    pub running: bool,
    /// Slots in use
    pub active_optimizations: usize,
    /// Slot limit
    pub max_concurrent_optimizations: usize,
    /// Live recommendations
    pub pending_recommendations: usize,
    /// Time of the newest snapshot
    pub last_sample_at: Option<Time>,
    /// Tallies
    pub stats: OptimizationStats,
}

#[derive(Default)]
struct OptimizerState {
    latest: Option<PerformanceMetrics>,
    history: MetricsHistory,
    recommendations: Vec<OptimizationRecommendation>,
    results: HashMap<RecommendationId, OptimizationResult>,
    /// Recommendations being applied right now
    applying: HashSet<RecommendationId>,
    stats: OptimizationStats,
}

struct Loops {
    shutdown: broadcast::Sender<()>,
    handles: Vec<JoinHandle<()>>,
}

/// Scoped optimization slot; released on drop.
struct OptimizationSlot<'a>(&'a AtomicUsize);

impl<'a> OptimizationSlot<'a> {
    fn acquire(counter: &'a AtomicUsize, max: usize) -> Option<Self> {
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .ok()
            .map(|_| Self(counter))
    }
}

impl Drop for OptimizationSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Claim on one recommendation while it is applied; released on drop.
struct ApplyingClaim<'a> {
    state: &'a Mutex<OptimizerState>,
    id: RecommendationId,
}

impl Drop for ApplyingClaim<'_> {
    fn drop(&mut self) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .applying
            .remove(&self.id);
    }
}

/// Measures the scheduler and applies corrective tuning.
pub struct PerformanceOptimizer {
    config: OptimizerConfig,
    source: Arc<dyn MetricsSource>,
    target: Arc<dyn TuningTarget>,
    probe: Arc<dyn SystemProbe>,
    state: Mutex<OptimizerState>,
    active: AtomicUsize,
    events: EventBus<OptimizerEvent>,
    loops: Mutex<Option<Loops>>,
}

impl PerformanceOptimizer {
    /// Optimizer for a scheduler, sampling memory through `sysinfo`.
    pub fn new(config: OptimizerConfig, scheduler: Arc<TaskPriorityScheduler>) -> Self {
        Self::with_parts(
            config,
            scheduler.clone(),
            scheduler,
            Arc::new(SysinfoProbe::new()),
        )
    }

    /// Optimizer over explicit seams.
    pub fn with_parts(
        config: OptimizerConfig,
        source: Arc<dyn MetricsSource>,
        target: Arc<dyn TuningTarget>,
        probe: Arc<dyn SystemProbe>,
    ) -> Self {
        Self {
            config,
            source,
            target,
            probe,
            state: Mutex::new(OptimizerState::default()),
            active: AtomicUsize::new(0),
            events: EventBus::default(),
            loops: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, OptimizerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Configuration.
    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Subscribe to optimizer events.
    pub fn subscribe(&self) -> broadcast::Receiver<OptimizerEvent> {
        self.events.subscribe()
    }

    // === Lifecycle ===

    /// Start both loops. Returns `false` if they are already running.
    pub fn start(self: &Arc<Self>) -> bool {
        let mut loops = self.loops.lock().unwrap_or_else(PoisonError::into_inner);
        if loops.is_some() {
            return false;
        }

        let (shutdown, _) = broadcast::channel(1);
        let monitoring = spawn_loop(
            Arc::downgrade(self),
            shutdown.subscribe(),
            self.config.monitoring_interval,
            false,
            |optimizer| async move {
                optimizer.collect_metrics();
            },
        );
        let optimization = spawn_loop(
            Arc::downgrade(self),
            shutdown.subscribe(),
            self.config.optimization_interval,
            true,
            |optimizer| async move {
                optimizer.run_optimization_cycle().await;
            },
        );
        *loops = Some(Loops {
            shutdown,
            handles: vec![monitoring, optimization],
        });
        drop(loops);

        info!(
            monitoring_ms = self.config.monitoring_interval.as_millis() as u64,
            optimization_ms = self.config.optimization_interval.as_millis() as u64,
            "performance optimizer started"
        );
        self.events.publish(OptimizerEvent::Started);
        true
    }

    /// Stop both loops and wait for them to exit. Returns `false` if they
    /// were not running.
    pub async fn stop(&self) -> bool {
        let loops = self.loops.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(loops) = loops else {
            return false;
        };
        let _ = loops.shutdown.send(());
        for handle in loops.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "optimizer loop ended abnormally");
            }
        }
        info!("performance optimizer stopped");
        self.events.publish(OptimizerEvent::Stopped);
        true
    }

    /// Whether the loops are running.
    pub fn is_running(&self) -> bool {
        self.loops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    // === Monitoring ===

    fn sample(&self) -> PerformanceMetrics {
        let stats = self.source.queue_stats();
        let mut metrics =
            PerformanceMetrics::from_samples(&stats, self.probe.sample(), self.config.heap_budget_bytes);
        metrics.bottlenecks = detect_bottlenecks(&metrics, &self.config.bottleneck_thresholds);
        metrics
    }

    /// Take a snapshot, detect bottlenecks and append it to history.
    pub fn collect_metrics(&self) -> PerformanceMetrics {
        let metrics = self.sample();
        for bottleneck in &metrics.bottlenecks {
            if bottleneck.severity >= Severity::High {
                warn!(
                    kind = ?bottleneck.kind,
                    severity = %bottleneck.severity,
                    affected = bottleneck.affected_tasks,
                    "{}",
                    bottleneck.description
                );
            }
        }
        debug!(
            queued = metrics.queue.depth,
            active = metrics.queue.active,
            efficiency = metrics.queue.efficiency,
            bottlenecks = metrics.bottlenecks.len(),
            "metrics collected"
        );

        let mut state = self.lock();
        state.history.record(&metrics);
        state.latest = Some(metrics.clone());
        metrics
    }

    /// Newest snapshot, if any has been taken.
    pub fn latest_metrics(&self) -> Option<PerformanceMetrics> {
        self.lock().latest.clone()
    }

    /// Trends for one history interval.
    pub fn trends(&self, interval: HistoryInterval) -> Option<TrendReport> {
        self.lock().history.trends(interval)
    }

    /// Samples held for one history interval.
    pub fn history_len(&self, interval: HistoryInterval) -> usize {
        self.lock().history.len(interval)
    }

    // === Recommendations ===

    /// Derive recommendations from the newest snapshot (taking one if
    /// needed), replacing the previous set.
    pub fn generate_recommendations(&self) -> Vec<OptimizationRecommendation> {
        let metrics = match self.latest_metrics() {
            Some(m) => m,
            None => self.collect_metrics(),
        };
        let recommendations =
            generate_recommendations(&metrics, &self.config.recommendation_thresholds);

        self.lock().recommendations = recommendations.clone();

        let manual: Vec<_> = recommendations
            .iter()
            .filter(|r| !r.automatic || !self.config.auto_apply)
            .cloned()
            .collect();
        info!(count = recommendations.len(), manual = manual.len(), "recommendations generated");
        self.events.publish(OptimizerEvent::Recommendations {
            count: recommendations.len(),
            manual,
        });
        recommendations
    }

    /// Live recommendations, most urgent first.
    pub fn recommendations(&self) -> Vec<OptimizationRecommendation> {
        let now = chrono::Utc::now();
        let mut state = self.lock();
        state.recommendations.retain(|r| !r.is_expired(now));
        state.recommendations.clone()
    }

    // === Optimization ===

    /// One optimization pass: sample, recommend, and apply the high and
    /// critical automatic recommendations within the slot limit.
    ///
    /// Failures are recorded in the returned results, never raised.
    pub async fn run_optimization_cycle(&self) -> Vec<OptimizationResult> {
        self.collect_metrics();
        let urgent: Vec<_> = self
            .generate_recommendations()
            .into_iter()
            .filter(|r| r.priority >= Severity::High)
            .filter(|r| r.automatic && self.config.auto_apply)
            .collect();
        if urgent.is_empty() {
            debug!("optimization cycle found nothing to apply");
            return Vec::new();
        }

        let attempts = urgent.iter().map(|r| self.apply_recommendation(r.id));
        let mut results = Vec::new();
        for (outcome, rec) in futures::future::join_all(attempts).await.into_iter().zip(&urgent) {
            match outcome {
                Ok(result) => results.push(result),
                Err(OptimizerError::NoSlotAvailable) => {
                    debug!(recommendation = %rec.id, "optimization deferred, no slot available");
                }
                Err(e) => warn!(recommendation = %rec.id, error = %e, "optimization skipped"),
            }
        }
        results
    }

    /// Apply one recommendation by id.
    ///
    /// Unknown ids and a full slot table are errors; a failing action is
    /// not. It yields an unsuccessful result after rolling back whatever
    /// the earlier actions changed.
    pub async fn apply_recommendation(&self, id: RecommendationId) -> Result<OptimizationResult> {
        let rec = {
            let now = chrono::Utc::now();
            let mut state = self.lock();
            if state.applying.contains(&id) || state.results.get(&id).is_some_and(|r| !r.reverted) {
                return Err(OptimizerError::AlreadyApplied(id));
            }
            let rec = state
                .recommendations
                .iter()
                .find(|r| r.id == id && !r.is_expired(now))
                .cloned()
                .ok_or(OptimizerError::RecommendationNotFound(id))?;
            state.applying.insert(id);
            rec
        };
        let _claim = ApplyingClaim {
            state: &self.state,
            id,
        };

        let _slot = OptimizationSlot::acquire(&self.active, self.config.max_concurrent_optimizations)
            .ok_or(OptimizerError::NoSlotAvailable)?;

        info!(recommendation = %id, title = %rec.title, "applying optimization");
        let before = self.sample();
        let applied_at = chrono::Utc::now();

        let mut plan = RevertPlan::default();
        let mut side_effects = Vec::new();
        let mut failure = None;
        for action in &rec.actions {
            match action.apply(self.target.as_ref(), &mut plan) {
                Ok(note) => side_effects.push(note),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        let success = failure.is_none();
        if let Some(err) = failure {
            warn!(recommendation = %id, error = %err, "optimization action failed");
            side_effects.push(format!("failed: {err:#}"));
            match std::mem::take(&mut plan).execute(self.target.as_ref()) {
                Ok(()) => side_effects.push("rolled back".to_string()),
                Err(e) => side_effects.push(format!("rollback failed: {e:#}")),
            }
        }

        let measured_impact = if success {
            tokio::time::sleep(self.config.impact_measurement_delay).await;
            let after = self.sample();
            Some(after.queue.efficiency - before.queue.efficiency)
        } else {
            None
        };

        let result = OptimizationResult {
            recommendation_id: id,
            title: rec.title.clone(),
            success,
            applied_at,
            measured_impact,
            side_effects,
            revert: (success && !plan.is_empty()).then_some(plan),
            reverted: false,
        };

        {
            let mut state = self.lock();
            if success {
                state.stats.applied += 1;
            } else {
                state.stats.failed += 1;
            }
            state.results.insert(id, result.clone());
        }

        info!(
            recommendation = %id,
            success,
            impact = measured_impact.unwrap_or_default(),
            "optimization finished"
        );
        self.events.publish(OptimizerEvent::Applied {
            recommendation_id: id,
            success,
        });
        Ok(result)
    }

    /// Undo an applied optimization.
    ///
    /// Refuses with [`OptimizerError::StateDrifted`] when any setting it
    /// touched has since been changed by someone else.
    pub fn revert_optimization(&self, id: RecommendationId) -> Result<()> {
        let mut state = self.lock();
        let result = state
            .results
            .get_mut(&id)
            .ok_or(OptimizerError::NotApplied(id))?;
        if result.reverted {
            return Err(OptimizerError::AlreadyReverted(id));
        }
        let plan = result
            .revert
            .clone()
            .ok_or(OptimizerError::NotRevertible(id))?;

        if let Some(detail) = plan.drift(self.target.as_ref()) {
            warn!(recommendation = %id, detail = %detail, "revert refused, state drifted");
            return Err(OptimizerError::StateDrifted { id, detail });
        }
        plan.execute(self.target.as_ref())
            .map_err(|e| OptimizerError::Tuning(format!("{e:#}")))?;

        result.revert = None;
        result.reverted = true;
        state.stats.reverted += 1;
        drop(state);

        info!(recommendation = %id, "optimization reverted");
        self.events.publish(OptimizerEvent::Reverted {
            recommendation_id: id,
        });
        Ok(())
    }

    /// Result recorded for a recommendation.
    pub fn result(&self, id: RecommendationId) -> Option<OptimizationResult> {
        self.lock().results.get(&id).cloned()
    }

    /// Running tallies.
    pub fn stats(&self) -> OptimizationStats {
        self.lock().stats
    }

    /// Current status.
    pub fn status(&self) -> OptimizerStatus {
        let running = self.is_running();
        let now = chrono::Utc::now();
        let state = self.lock();
        OptimizerStatus {
            running,
            active_optimizations: self.active.load(Ordering::Acquire),
            max_concurrent_optimizations: self.config.max_concurrent_optimizations,
            pending_recommendations: state
                .recommendations
                .iter()
                .filter(|r| !r.is_expired(now))
                .count(),
            last_sample_at: state.latest.as_ref().map(|m| m.timestamp),
            stats: state.stats,
        }
    }
}

/// Run `tick` every `period` until shutdown or until the optimizer is dropped.
fn spawn_loop<F, Fut>(
    optimizer: Weak<PerformanceOptimizer>,
    mut shutdown: broadcast::Receiver<()>,
    period: Duration,
    delay_first: bool,
    tick: F,
) -> JoinHandle<()>
where
    F: Fn(Arc<PerformanceOptimizer>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let period = period.max(Duration::from_millis(1));
        let start = if delay_first {
            tokio::time::Instant::now() + period
        } else {
            tokio::time::Instant::now()
        };
        let mut ticker = tokio::time::interval_at(start, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {
                    let Some(optimizer) = optimizer.upgrade() else {
                        break;
                    };
                    tick(optimizer).await;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::OptimizationAction;
    use crate::metrics::BottleneckKind;
    use crate::probe::{StaticProbe, SystemSample};
    use crate::recommend::RecommendationKind;
    use conductor_core::{Task, TaskSpec};
    use conductor_execution::SchedulerConfig;

    fn probe() -> Arc<dyn SystemProbe> {
        Arc::new(StaticProbe(SystemSample {
            memory_used_bytes: 100,
            memory_total_bytes: 1_000,
        }))
    }

    /// 35 tasks on five slots: 5 active, 30 queued.
    fn backlogged() -> Arc<TaskPriorityScheduler> {
        let scheduler = Arc::new(TaskPriorityScheduler::new(
            SchedulerConfig::new().with_max_concurrent(5),
        ));
        for i in 0..35 {
            scheduler.submit_task(TaskSpec::new(format!("task {i}"))).unwrap();
        }
        assert_eq!(scheduler.dispatch_ready().unwrap().len(), 5);
        scheduler
    }

    fn optimizer(scheduler: Arc<TaskPriorityScheduler>, config: OptimizerConfig) -> Arc<PerformanceOptimizer> {
        Arc::new(PerformanceOptimizer::with_parts(
            config,
            scheduler.clone(),
            scheduler,
            probe(),
        ))
    }

    #[test]
    fn test_backlog_snapshot_and_recommendation() {
        let opt = optimizer(backlogged(), OptimizerConfig::default());
        let metrics = opt.collect_metrics();

        assert_eq!(metrics.queue.depth, 30);
        assert_eq!(metrics.queue.active, 5);
        assert!(metrics
            .bottlenecks
            .iter()
            .any(|b| b.kind == BottleneckKind::Queue && b.severity == Severity::High));

        let recs = opt.generate_recommendations();
        let queue = recs
            .iter()
            .find(|r| r.title == "Improve Queue Efficiency")
            .unwrap();
        assert!(queue.automatic);
        assert_eq!(opt.recommendations().len(), recs.len());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_applies_and_revert_restores() {
        let scheduler = backlogged();
        let opt = optimizer(scheduler.clone(), OptimizerConfig::default());
        let mut events = opt.subscribe();

        let results = opt.run_optimization_cycle().await;
        assert_eq!(results.len(), 1);
        let result = &results[0];
        assert!(result.success);
        assert!(result.measured_impact.is_some());
        assert!(result.revert.is_some());
        assert_eq!(scheduler.max_concurrent(), 7);
        assert_eq!(opt.stats().applied, 1);
        assert_eq!(opt.status().active_optimizations, 0);

        assert_eq!(events.recv().await.unwrap().name(), "optimization:recommendations");
        assert_eq!(events.recv().await.unwrap().name(), "optimization:applied");

        opt.revert_optimization(result.recommendation_id).unwrap();
        assert_eq!(scheduler.max_concurrent(), 5);
        assert!(matches!(
            opt.revert_optimization(result.recommendation_id),
            Err(OptimizerError::AlreadyReverted(_))
        ));
        assert_eq!(opt.stats().reverted, 1);
        assert_eq!(events.recv().await.unwrap().name(), "optimization:reverted");
    }

    #[tokio::test(start_paused = true)]
    async fn test_revert_refuses_after_drift() {
        let scheduler = backlogged();
        let opt = optimizer(scheduler.clone(), OptimizerConfig::default());
        let result = opt.run_optimization_cycle().await.remove(0);

        scheduler.set_max_concurrent(9);
        let err = opt.revert_optimization(result.recommendation_id).unwrap_err();
        assert!(matches!(err, OptimizerError::StateDrifted { .. }));
        assert_eq!(scheduler.max_concurrent(), 9);
        // The plan is kept; once the drift is undone the revert goes through.
        scheduler.set_max_concurrent(7);
        opt.revert_optimization(result.recommendation_id).unwrap();
        assert_eq!(scheduler.max_concurrent(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slots_cap_concurrent_optimizations() {
        let opt = optimizer(
            backlogged(),
            OptimizerConfig::default().with_max_concurrent_optimizations(1),
        );
        opt.collect_metrics();
        let id = opt.generate_recommendations()[0].id;

        let (a, b) = tokio::join!(opt.apply_recommendation(id), opt.apply_recommendation(id));
        let outcomes = [a.is_ok(), b.is_ok()];
        assert_eq!(outcomes.iter().filter(|ok| **ok).count(), 1);
        assert!(matches!(
            if a.is_err() { a } else { b },
            Err(OptimizerError::NoSlotAvailable)
        ));
        assert_eq!(opt.status().active_optimizations, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_apply_of_one_recommendation_runs_once() {
        let scheduler = backlogged();
        let opt = optimizer(scheduler.clone(), OptimizerConfig::default());
        opt.collect_metrics();
        let id = opt.generate_recommendations()[0].id;

        let (a, b) = tokio::join!(opt.apply_recommendation(id), opt.apply_recommendation(id));
        assert_eq!([a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count(), 1);
        assert!(matches!(
            if a.is_err() { a } else { b },
            Err(OptimizerError::AlreadyApplied(_))
        ));
        assert_eq!(opt.stats().applied, 1);
        assert_eq!(scheduler.max_concurrent(), 7);

        // The claim is dropped once the first apply finishes
        opt.revert_optimization(id).unwrap();
        assert!(opt.apply_recommendation(id).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_apply_releases_its_claim() {
        let opt = optimizer(backlogged(), OptimizerConfig::default());
        opt.collect_metrics();
        let id = opt.generate_recommendations()[0].id;

        // Cancelled during the impact measurement sleep
        let cancelled =
            tokio::time::timeout(Duration::from_secs(1), opt.apply_recommendation(id)).await;
        assert!(cancelled.is_err());
        assert_eq!(opt.status().active_optimizations, 0);
        assert!(!matches!(
            opt.apply_recommendation(id).await,
            Err(OptimizerError::AlreadyApplied(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_action_is_recorded_not_raised() {
        let scheduler = backlogged();
        let opt = optimizer(scheduler.clone(), OptimizerConfig::default());
        let rec = OptimizationRecommendation {
            id: RecommendationId::new(),
            kind: RecommendationKind::QueueEfficiency,
            title: "Shrink cpu".into(),
            description: String::new(),
            priority: Severity::High,
            expected_impact: 0.1,
            automatic: true,
            actions: vec![
                OptimizationAction::SetMaxConcurrent { value: 6 },
                OptimizationAction::SetCapacity {
                    resource: "gpu".into(),
                    capacity: 1,
                },
                OptimizationAction::SetCapacity {
                    resource: "cpu".into(),
                    capacity: 0,
                },
            ],
            confidence: 1.0,
            created_at: chrono::Utc::now(),
            ttl: Duration::from_secs(60),
        };
        let id = rec.id;
        opt.lock().recommendations.push(rec);

        // Holding cpu makes the third action fail after two succeeded.
        let held = scheduler
            .allocate_resources(&Task::from_spec(
                TaskSpec::new("hog").with_resource("cpu", 2),
                0,
            ))
            .unwrap();

        let result = opt.apply_recommendation(id).await.unwrap();
        assert!(!result.success);
        assert!(result.revert.is_none());
        assert!(result.side_effects.iter().any(|s| s.starts_with("failed:")));
        assert!(result.side_effects.iter().any(|s| s == "rolled back"));
        assert_eq!(scheduler.max_concurrent(), 5);
        assert_eq!(opt.stats().failed, 1);
        assert!(opt.stats().success_rate() < 1.0);

        scheduler.release_resources(held).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_loops_sample_until_stopped() {
        let opt = optimizer(
            backlogged(),
            OptimizerConfig::default()
                .with_monitoring_interval(Duration::from_secs(30))
                .with_optimization_interval(Duration::from_secs(300)),
        );
        let mut events = opt.subscribe();

        assert!(opt.start());
        assert!(!opt.start());
        assert_eq!(events.recv().await.unwrap(), OptimizerEvent::Started);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(opt.latest_metrics().is_some());
        assert!(opt.status().running);

        assert!(opt.stop().await);
        assert!(!opt.is_running());
        assert!(!opt.stop().await);
        assert_eq!(events.recv().await.unwrap(), OptimizerEvent::Stopped);
    }

    #[test]
    fn test_unknown_ids() {
        let opt = optimizer(backlogged(), OptimizerConfig::default());
        let ghost = RecommendationId::new();
        assert!(matches!(opt.revert_optimization(ghost), Err(OptimizerError::NotApplied(_))));
        assert!(opt.trends(HistoryInterval::Minute).is_none());
        assert_eq!(opt.stats().success_rate(), 1.0);
    }

    #[tokio::test]
    async fn test_apply_unknown_recommendation() {
        let opt = optimizer(backlogged(), OptimizerConfig::default());
        assert!(matches!(
            opt.apply_recommendation(RecommendationId::new()).await,
            Err(OptimizerError::RecommendationNotFound(_))
        ));
    }
}
