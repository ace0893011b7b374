//! Per-criterion results and the aggregate report.

use conductor_core::{duration_ms, CriteriaId, Severity, TaskId, Time};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use crate::criteria::CriteriaCategory;
use crate::engine::ValidationConfig;

/// Outcome of one criterion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CriterionStatus {
    /// Passed
    Passed,
    /// Failed, timed out or errored
    Failed,
}

/// Overall verdict for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationStatus {
    /// A run is in flight
    Validating,
    /// Nothing failed
    Passed,
    /// A critical criterion failed
    Failed,
    /// Only non-critical criteria failed
    RequiresReview,
}

impl std::fmt::Display for ValidationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Validating => "VALIDATING",
            Self::Passed => "PASSED",
            Self::Failed => "FAILED",
            Self::RequiresReview => "REQUIRES_REVIEW",
        };
        f.write_str(s)
    }
}

/// Result of running one criterion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    /// Criterion
    pub criteria_id: CriteriaId,
    /// Criterion name
    pub name: String,
    /// Criterion category
    pub category: CriteriaCategory,
    /// Outcome
    pub status: CriterionStatus,
    /// Score from 0 to 100
    pub score: f64,
    /// Severity taken from the criterion
    pub severity: Severity,
    /// Explanation
    pub message: String,
    /// How to fix a failure
    pub suggestions: Vec<String>,
    /// Supporting observations
    pub evidence: Vec<String>,
    /// Wall time across all attempts
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    /// Attempts made
    pub attempts: u32,
}

impl ValidationResult {
    /// Whether the criterion failed.
    pub fn failed(&self) -> bool {
        self.status == CriterionStatus::Failed
    }
}

/// Result counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSummary {
    /// Criteria run
    pub total: usize,
    /// Passed
    pub passed: usize,
    /// Failed
    pub failed: usize,
    /// Failed with critical severity
    pub critical: usize,
    /// Failed with severity below high
    pub warnings: usize,
}

/// A criterion that took longer than the slow threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlowCriterion {
    /// Criterion
    pub criteria_id: CriteriaId,
    /// How long it took
    #[serde(with = "duration_ms")]
    pub duration: Duration,
}

/// Aggregate outcome of a validation run. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    /// Task validated
    pub task_id: TaskId,
    /// Verdict
    pub status: ValidationStatus,
    /// Severity-weighted average score
    pub score: f64,
    /// Per-criterion results
    pub results: Vec<ValidationResult>,
    /// Counts
    pub summary: ReportSummary,
    /// Slowest criteria over the threshold
    pub bottlenecks: Vec<SlowCriterion>,
    /// Deduplicated follow-ups
    pub recommendations: Vec<String>,
    /// When the run started
    pub started_at: Time,
    /// When the run finished
    pub completed_at: Time,
    /// Run wall time
    #[serde(with = "duration_ms")]
    pub duration: Duration,
}

impl ValidationReport {
    /// Aggregate results into a report.
    pub fn build(
        task_id: TaskId,
        results: Vec<ValidationResult>,
        started_at: Time,
        duration: Duration,
        config: &ValidationConfig,
    ) -> Self {
        let summary = summarize(&results);
        Self {
            task_id,
            status: verdict(&results),
            score: weighted_score(&results),
            bottlenecks: slow_criteria(&results, config),
            recommendations: recommendations(&results, &summary, config),
            summary,
            results,
            started_at,
            completed_at: chrono::Utc::now(),
            duration,
        }
    }
}

/// A critical failure fails the task; any other failure needs review.
pub fn verdict(results: &[ValidationResult]) -> ValidationStatus {
    let mut failed = results.iter().filter(|r| r.failed()).peekable();
    if failed.peek().is_none() {
        return ValidationStatus::Passed;
    }
    if failed.any(|r| r.severity == Severity::Critical) {
        ValidationStatus::Failed
    } else {
        ValidationStatus::RequiresReview
    }
}

fn summarize(results: &[ValidationResult]) -> ReportSummary {
    let failed = || results.iter().filter(|r| r.failed());
    ReportSummary {
        total: results.len(),
        passed: results.len() - failed().count(),
        failed: failed().count(),
        critical: failed().filter(|r| r.severity == Severity::Critical).count(),
        warnings: failed().filter(|r| r.severity < Severity::High).count(),
    }
}

/// Scores weighted by severity; 100 when nothing ran.
fn weighted_score(results: &[ValidationResult]) -> f64 {
    let total_weight: f64 = results.iter().map(|r| r.severity.weight()).sum();
    if total_weight <= 0.0 {
        return 100.0;
    }
    results
        .iter()
        .map(|r| r.score.clamp(0.0, 100.0) * r.severity.weight())
        .sum::<f64>()
        / total_weight
}

fn slow_criteria(results: &[ValidationResult], config: &ValidationConfig) -> Vec<SlowCriterion> {
    let mut slow: Vec<_> = results
        .iter()
        .filter(|r| r.duration > config.slow_criterion_threshold)
        .map(|r| SlowCriterion {
            criteria_id: r.criteria_id.clone(),
            duration: r.duration,
        })
        .collect();
    slow.sort_by(|a, b| b.duration.cmp(&a.duration));
    slow.truncate(config.max_reported_bottlenecks);
    slow
}

fn recommendations(
    results: &[ValidationResult],
    summary: &ReportSummary,
    config: &ValidationConfig,
) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out: Vec<String> = results
        .iter()
        .filter(|r| r.failed())
        .flat_map(|r| r.suggestions.iter())
        .filter(|s| seen.insert(*s))
        .cloned()
        .collect();

    if summary.total > 0 {
        let failure_rate = summary.failed as f64 / summary.total as f64;
        if failure_rate > config.review_failure_rate {
            out.push(format!(
                "Review task complexity: {} of {} criteria failed",
                summary.failed, summary.total
            ));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(id: &str, passed: bool, severity: Severity) -> ValidationResult {
        ValidationResult {
            criteria_id: id.into(),
            name: id.to_string(),
            category: CriteriaCategory::CodeQuality,
            status: if passed {
                CriterionStatus::Passed
            } else {
                CriterionStatus::Failed
            },
            score: if passed { 100.0 } else { 0.0 },
            severity,
            message: String::new(),
            suggestions: Vec::new(),
            evidence: Vec::new(),
            duration: Duration::from_millis(10),
            attempts: 1,
        }
    }

    fn build(results: Vec<ValidationResult>) -> ValidationReport {
        ValidationReport::build(
            TaskId::new(),
            results,
            chrono::Utc::now(),
            Duration::ZERO,
            &ValidationConfig::default(),
        )
    }

    #[test]
    fn test_verdict_rule() {
        let critical = vec![
            result("a", false, Severity::Critical),
            result("b", true, Severity::Low),
            result("c", true, Severity::Medium),
        ];
        assert_eq!(verdict(&critical), ValidationStatus::Failed);

        let minor = vec![result("a", false, Severity::High), result("b", true, Severity::Critical)];
        assert_eq!(verdict(&minor), ValidationStatus::RequiresReview);

        let clean = vec![result("a", true, Severity::Critical)];
        assert_eq!(verdict(&clean), ValidationStatus::Passed);
        assert_eq!(verdict(&[]), ValidationStatus::Passed);
    }

    #[test]
    fn test_summary_and_weighted_score() {
        let report = build(vec![
            result("a", false, Severity::Critical),
            result("b", false, Severity::Low),
            result("c", true, Severity::Medium),
            result("d", true, Severity::High),
        ]);
        assert_eq!(report.summary.total, 4);
        assert_eq!(report.summary.passed, 2);
        assert_eq!(report.summary.failed, 2);
        assert_eq!(report.summary.critical, 1);
        assert_eq!(report.summary.warnings, 1);
        // (0*4 + 0*1 + 100*2 + 100*3) / 10
        assert!((report.score - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_report_passes() {
        let report = build(Vec::new());
        assert_eq!(report.status, ValidationStatus::Passed);
        assert_eq!(report.score, 100.0);
        assert!(report.recommendations.is_empty());
    }

    #[test]
    fn test_recommendations_are_deduplicated() {
        let mut a = result("a", false, Severity::Low);
        a.suggestions = vec!["add tests".into(), "split the module".into()];
        let mut b = result("b", false, Severity::Low);
        b.suggestions = vec!["add tests".into()];
        let mut c = result("c", true, Severity::Low);
        c.suggestions = vec!["ignored on pass".into()];

        let report = build(vec![a, b, c]);
        assert_eq!(report.recommendations[0], "add tests");
        assert_eq!(report.recommendations[1], "split the module");
        assert!(report.recommendations[2].starts_with("Review task complexity"));
        assert_eq!(report.recommendations.len(), 3);
    }

    #[test]
    fn test_complexity_note_needs_high_failure_rate() {
        let mut results: Vec<_> = (0..9).map(|i| result(&i.to_string(), true, Severity::Low)).collect();
        results.push(result("x", false, Severity::Low));
        let report = build(results);
        assert!(report.recommendations.is_empty());
    }

    #[test]
    fn test_slowest_five_over_threshold() {
        let results: Vec<_> = (0..7)
            .map(|i| {
                let mut r = result(&format!("slow{i}"), true, Severity::Low);
                r.duration = Duration::from_secs(11 + i);
                r
            })
            .chain(std::iter::once(result("fast", true, Severity::Low)))
            .collect();
        let report = build(results);
        assert_eq!(report.bottlenecks.len(), 5);
        assert_eq!(report.bottlenecks[0].criteria_id.as_str(), "slow6");
        assert_eq!(report.bottlenecks[4].criteria_id.as_str(), "slow2");
    }

    #[test]
    fn test_status_serializes_upper_case() {
        let json = serde_json::to_string(&ValidationStatus::RequiresReview).unwrap();
        assert_eq!(json, "\"REQUIRES_REVIEW\"");
    }
}
