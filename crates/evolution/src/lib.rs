//! Evolution layer - performance monitoring and self-tuning.
//!
//! Samples the scheduler, detects bottlenecks, proposes tuning actions and
//! applies the urgent ones with an undo record.

#![warn(missing_docs)]

mod action;
mod bottleneck;
mod history;
mod metrics;
mod optimizer;
mod probe;
mod recommend;
mod source;

pub use action::{OptimizationAction, RevertPlan, RevertStep};
pub use bottleneck::{detect_bottlenecks, BottleneckThresholds};
pub use history::{HistoryInterval, MetricsHistory, Trend, TrendReport};
pub use metrics::{
    AgentMetrics, Bottleneck, BottleneckKind, ExecutionMetrics, PerformanceMetrics, QueueMetrics,
    SystemMetrics,
};
pub use optimizer::{
    OptimizationResult, OptimizationStats, OptimizerConfig, OptimizerError, OptimizerEvent,
    OptimizerStatus, PerformanceOptimizer, Result,
};
pub use probe::{StaticProbe, SysinfoProbe, SystemProbe, SystemSample};
pub use recommend::{
    generate_recommendations, OptimizationRecommendation, RecommendationKind,
    RecommendationThresholds,
};
pub use source::{MetricsSource, TuningTarget};
