//! Bounded metrics history and trend analysis.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

use crate::metrics::PerformanceMetrics;

/// Samples compared on each side of a trend.
const TREND_WINDOW: usize = 10;

/// Relative change below which a figure is stable.
const TREND_THRESHOLD: f64 = 0.05;

/// History granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryInterval {
    /// One sample per minute, last hour
    Minute,
    /// One sample per hour, last day
    Hour,
    /// One sample per day, last month
    Day,
    /// One sample per week, last year
    Week,
}

impl HistoryInterval {
    /// All intervals, finest first.
    pub const ALL: [HistoryInterval; 4] = [Self::Minute, Self::Hour, Self::Day, Self::Week];

    /// Ring capacity.
    pub fn capacity(self) -> usize {
        match self {
            Self::Minute => 60,
            Self::Hour => 24,
            Self::Day => 30,
            Self::Week => 52,
        }
    }

    /// Minimum spacing between samples.
    pub fn period(self) -> Duration {
        match self {
            Self::Minute => Duration::from_secs(60),
            Self::Hour => Duration::from_secs(3_600),
            Self::Day => Duration::from_secs(86_400),
            Self::Week => Duration::from_secs(604_800),
        }
    }

    fn index(self) -> usize {
        match self {
            Self::Minute => 0,
            Self::Hour => 1,
            Self::Day => 2,
            Self::Week => 3,
        }
    }
}

/// Direction of a figure over time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    /// Getting better
    Improving,
    /// Getting worse
    Degrading,
    /// Within the threshold
    Stable,
}

/// Trends for one history interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendReport {
    /// Interval analysed
    pub interval: HistoryInterval,
    /// Completions per minute
    pub throughput: Trend,
    /// p95 latency
    pub latency: Trend,
    /// Queue efficiency
    pub efficiency: Trend,
    /// Error rate
    pub error_rate: Trend,
}

/// Ring buffers of snapshots, one per interval.
#[derive(Debug, Clone, Default)]
pub struct MetricsHistory {
    rings: [VecDeque<PerformanceMetrics>; 4],
}

impl MetricsHistory {
    /// Empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a snapshot to every ring whose period has elapsed since its
    /// newest sample. Full rings drop their oldest sample.
    pub fn record(&mut self, metrics: &PerformanceMetrics) {
        for interval in HistoryInterval::ALL {
            let ring = &mut self.rings[interval.index()];
            let due = ring.back().map_or(true, |last| {
                (metrics.timestamp - last.timestamp)
                    .to_std()
                    .is_ok_and(|elapsed| elapsed >= interval.period())
            });
            if !due {
                continue;
            }
            if ring.len() == interval.capacity() {
                ring.pop_front();
            }
            ring.push_back(metrics.clone());
        }
    }

    /// Samples of one interval, oldest first.
    pub fn samples(&self, interval: HistoryInterval) -> impl Iterator<Item = &PerformanceMetrics> {
        self.rings[interval.index()].iter()
    }

    /// Number of samples in one interval.
    pub fn len(&self, interval: HistoryInterval) -> usize {
        self.rings[interval.index()].len()
    }

    /// Newest snapshot at the finest interval.
    pub fn latest(&self) -> Option<&PerformanceMetrics> {
        self.rings[HistoryInterval::Minute.index()].back()
    }

    /// Compare the newest ten samples with the ten before them.
    ///
    /// Returns `None` until the interval holds twenty samples.
    pub fn trends(&self, interval: HistoryInterval) -> Option<TrendReport> {
        let ring = &self.rings[interval.index()];
        if ring.len() < TREND_WINDOW * 2 {
            return None;
        }
        let start = ring.len() - TREND_WINDOW * 2;
        let previous: Vec<_> = ring.range(start..start + TREND_WINDOW).collect();
        let recent: Vec<_> = ring.range(start + TREND_WINDOW..).collect();

        let compare = |f: fn(&PerformanceMetrics) -> f64, higher_is_better: bool| {
            classify(avg(&previous, f), avg(&recent, f), higher_is_better)
        };

        Some(TrendReport {
            interval,
            throughput: compare(|m| m.execution.throughput_per_minute, true),
            latency: compare(|m| m.system.latency_p95.as_secs_f64(), false),
            efficiency: compare(|m| m.queue.efficiency, true),
            error_rate: compare(|m| m.system.error_rate, false),
        })
    }
}

fn avg(samples: &[&PerformanceMetrics], f: fn(&PerformanceMetrics) -> f64) -> f64 {
    samples.iter().map(|m| f(m)).sum::<f64>() / samples.len() as f64
}

fn classify(previous: f64, recent: f64, higher_is_better: bool) -> Trend {
    let change = if previous.abs() < f64::EPSILON {
        if recent.abs() < f64::EPSILON {
            0.0
        } else {
            recent.signum()
        }
    } else {
        (recent - previous) / previous.abs()
    };

    if change.abs() <= TREND_THRESHOLD {
        Trend::Stable
    } else if (change > 0.0) == higher_is_better {
        Trend::Improving
    } else {
        Trend::Degrading
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::tests::{queue_stats, sample};
    use chrono::TimeZone;

    fn snapshot(minutes: i64, throughput: usize, p95_secs: u64) -> PerformanceMetrics {
        let mut stats = queue_stats(1, 1, 2);
        stats.taken_at = chrono::Utc.timestamp_opt(0, 0).unwrap() + chrono::Duration::minutes(minutes);
        stats.completed_in_window = throughput;
        stats.recent_latencies = vec![Duration::from_secs(p95_secs)];
        PerformanceMetrics::from_samples(&stats, sample(1, 10), None)
    }

    #[test]
    fn test_rings_are_bounded_and_keep_newest() {
        let mut history = MetricsHistory::new();
        for minute in 0..100 {
            history.record(&snapshot(minute, 1, 1));
        }
        assert_eq!(history.len(HistoryInterval::Minute), 60);
        assert_eq!(history.len(HistoryInterval::Hour), 2);
        assert_eq!(history.len(HistoryInterval::Day), 1);

        let first = history.samples(HistoryInterval::Minute).next().unwrap();
        assert_eq!(first.timestamp, snapshot(40, 1, 1).timestamp);
        assert_eq!(history.latest().unwrap().timestamp, snapshot(99, 1, 1).timestamp);
    }

    #[test]
    fn test_samples_closer_than_period_are_skipped() {
        let mut history = MetricsHistory::new();
        let mut half = snapshot(0, 1, 1);
        history.record(&half);
        half.timestamp += chrono::Duration::seconds(30);
        history.record(&half);
        assert_eq!(history.len(HistoryInterval::Minute), 1);
    }

    #[test]
    fn test_trends_need_twenty_samples() {
        let mut history = MetricsHistory::new();
        for minute in 0..19 {
            history.record(&snapshot(minute, 1, 1));
        }
        assert!(history.trends(HistoryInterval::Minute).is_none());
        history.record(&snapshot(19, 1, 1));
        let report = history.trends(HistoryInterval::Minute).unwrap();
        assert_eq!(report.throughput, Trend::Stable);
        assert_eq!(report.latency, Trend::Stable);
    }

    #[test]
    fn test_trends_classify_direction() {
        let mut history = MetricsHistory::new();
        for minute in 0..10 {
            history.record(&snapshot(minute, 10, 10));
        }
        for minute in 10..20 {
            history.record(&snapshot(minute, 20, 30));
        }
        let report = history.trends(HistoryInterval::Minute).unwrap();
        assert_eq!(report.throughput, Trend::Improving);
        assert_eq!(report.latency, Trend::Degrading);
        assert_eq!(report.efficiency, Trend::Stable);
    }

    #[test]
    fn test_small_change_is_stable() {
        assert_eq!(classify(100.0, 104.0, true), Trend::Stable);
        assert_eq!(classify(100.0, 106.0, true), Trend::Improving);
        assert_eq!(classify(100.0, 94.0, false), Trend::Improving);
        assert_eq!(classify(0.0, 0.0, true), Trend::Stable);
    }
}
