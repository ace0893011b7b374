//! Built-in criteria a collaborator may register.

use async_trait::async_trait;
use conductor_core::Severity;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;

use crate::context::ValidationContext;
use crate::criteria::{CriteriaCategory, ValidationCriteria, Validator, ValidatorOutput};
use crate::engine::Result;

/// Default marker pattern for [`marker_scan`].
pub const DEFAULT_MARKER_PATTERN: &str = r"\b(TODO|FIXME|XXX|HACK)\b";

/// Points deducted per marker found.
const MARKER_PENALTY: f64 = 10.0;

/// Fails when the task produced no artifacts.
pub fn artifacts_present() -> ValidationCriteria {
    ValidationCriteria::new(
        "artifacts-present",
        CriteriaCategory::Functionality,
        Arc::new(ArtifactsPresent),
    )
    .with_name("Artifacts present")
    .with_severity(Severity::High)
    .with_timeout(Duration::from_secs(5))
}

struct ArtifactsPresent;

#[async_trait]
impl Validator for ArtifactsPresent {
    async fn validate(&self, context: Arc<ValidationContext>) -> anyhow::Result<ValidatorOutput> {
        let non_empty = context
            .artifacts
            .iter()
            .filter(|a| !a.content.trim().is_empty())
            .count();
        Ok(match (context.artifacts.len(), non_empty) {
            (0, _) => ValidatorOutput::fail("no artifacts produced")
                .with_suggestion("Attach the files the task changed or created"),
            (total, 0) => ValidatorOutput::fail(format!("all {total} artifacts are empty"))
                .with_suggestion("Attach the files the task changed or created"),
            (total, non_empty) => {
                ValidatorOutput::pass(format!("{non_empty} of {total} artifacts have content"))
                    .with_score(100.0 * non_empty as f64 / total as f64)
            }
        })
    }
}

/// Fails when artifacts contain unfinished-work markers matching `pattern`.
///
/// Each marker costs ten points; evidence lists `path:line` for each hit.
pub fn marker_scan(pattern: &str) -> Result<ValidationCriteria> {
    let pattern = Regex::new(pattern)?;
    Ok(ValidationCriteria::new(
        "marker-scan",
        CriteriaCategory::CodeQuality,
        Arc::new(MarkerScan { pattern }),
    )
    .with_name("Unfinished work markers")
    .with_severity(Severity::Low)
    .with_timeout(Duration::from_secs(10)))
}

struct MarkerScan {
    pattern: Regex,
}

#[async_trait]
impl Validator for MarkerScan {
    async fn validate(&self, context: Arc<ValidationContext>) -> anyhow::Result<ValidatorOutput> {
        let pattern = &self.pattern;
        let hits: Vec<String> = context
            .artifacts
            .iter()
            .flat_map(|artifact| {
                artifact
                    .content
                    .lines()
                    .enumerate()
                    .filter(move |(_, line)| pattern.is_match(line))
                    .map(move |(n, _)| format!("{}:{}", artifact.path, n + 1))
            })
            .collect();

        if hits.is_empty() {
            return Ok(ValidatorOutput::pass("no unfinished work markers"));
        }

        let mut output = ValidatorOutput::fail(format!("{} unfinished work markers", hits.len()))
            .with_score((100.0 - MARKER_PENALTY * hits.len() as f64).max(0.0))
            .with_suggestion("Resolve or ticket the remaining TODO/FIXME markers");
        output.evidence = hits;
        Ok(output)
    }
}

/// Fails when neither a documentation file nor doc comments were produced.
pub fn documentation_present() -> Result<ValidationCriteria> {
    let doc_path = Regex::new(r"(?i)(^|/)(readme[^/]*|docs?/.+|[^/]+\.(md|rst|adoc))$")?;
    let doc_comment = Regex::new(r"(?m)^\s*(///|//!|/\*\*|#\s*\w|\x22\x22\x22)")?;
    Ok(ValidationCriteria::new(
        "documentation-present",
        CriteriaCategory::Documentation,
        Arc::new(DocumentationPresent {
            doc_path,
            doc_comment,
        }),
    )
    .with_name("Documentation present")
    .with_severity(Severity::Medium)
    .with_timeout(Duration::from_secs(5)))
}

struct DocumentationPresent {
    doc_path: Regex,
    doc_comment: Regex,
}

#[async_trait]
impl Validator for DocumentationPresent {
    async fn validate(&self, context: Arc<ValidationContext>) -> anyhow::Result<ValidatorOutput> {
        let files: Vec<&str> = context
            .artifacts
            .iter()
            .filter(|a| self.doc_path.is_match(&a.path))
            .map(|a| a.path.as_str())
            .collect();
        if !files.is_empty() {
            let mut output = ValidatorOutput::pass(format!("{} documentation files", files.len()));
            output.evidence = files.into_iter().map(String::from).collect();
            return Ok(output);
        }

        let commented = context
            .artifacts
            .iter()
            .filter(|a| self.doc_comment.is_match(&a.content))
            .count();
        Ok(if commented > 0 {
            ValidatorOutput::pass(format!("{commented} artifacts carry doc comments")).with_score(80.0)
        } else {
            ValidatorOutput::fail("no documentation found")
                .with_suggestion("Add a README or doc comments describing the change")
        })
    }
}

/// Fails when the work summary is shorter than `min_chars` characters.
pub fn summary_length(min_chars: usize) -> ValidationCriteria {
    ValidationCriteria::new(
        "summary-length",
        CriteriaCategory::Compliance,
        Arc::new(SummaryLength { min_chars }),
    )
    .with_name("Work summary")
    .with_severity(Severity::Low)
    .with_timeout(Duration::from_secs(5))
}

struct SummaryLength {
    min_chars: usize,
}

#[async_trait]
impl Validator for SummaryLength {
    async fn validate(&self, context: Arc<ValidationContext>) -> anyhow::Result<ValidatorOutput> {
        let len = context.summary.trim().chars().count();
        Ok(if len >= self.min_chars {
            ValidatorOutput::pass(format!("summary has {len} characters"))
        } else {
            ValidatorOutput::fail(format!(
                "summary has {len} characters, at least {} expected",
                self.min_chars
            ))
            .with_score(100.0 * len as f64 / self.min_chars.max(1) as f64)
            .with_suggestion("Describe what was done and why")
        })
    }
}

/// Every built-in criterion with default settings.
pub fn all() -> Result<Vec<ValidationCriteria>> {
    Ok(vec![
        artifacts_present(),
        marker_scan(DEFAULT_MARKER_PATTERN)?,
        documentation_present()?,
        summary_length(40),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_core::{Task, TaskSpec};

    fn context() -> ValidationContext {
        ValidationContext::new(Task::from_spec(TaskSpec::new("t"), 0))
    }

    async fn run(criteria: &ValidationCriteria, ctx: ValidationContext) -> ValidatorOutput {
        criteria.validator.validate(Arc::new(ctx)).await.unwrap()
    }

    #[tokio::test]
    async fn test_artifacts_present() {
        let c = artifacts_present();
        assert!(!run(&c, context()).await.passed);
        assert!(!run(&c, context().with_artifact("a.rs", "  ")).await.passed);

        let out = run(&c, context().with_artifact("a.rs", "fn main() {}").with_artifact("b.rs", "")).await;
        assert!(out.passed);
        assert_eq!(out.score, 50.0);
    }

    #[tokio::test]
    async fn test_marker_scan_reports_locations() {
        let c = marker_scan(DEFAULT_MARKER_PATTERN).unwrap();
        let ctx = context().with_artifact("src/lib.rs", "fn a() {}\n// TODO: handle errors\n// FIXME\n// todos are fine");
        let out = run(&c, ctx).await;
        assert!(!out.passed);
        assert_eq!(out.evidence, ["src/lib.rs:2", "src/lib.rs:3"]);
        assert_eq!(out.score, 80.0);

        assert!(run(&c, context().with_artifact("a.rs", "clean")).await.passed);
    }

    #[test]
    fn test_marker_scan_rejects_bad_pattern() {
        assert!(matches!(
            marker_scan("(unclosed"),
            Err(crate::engine::ValidationError::InvalidPattern(_))
        ));
    }

    #[tokio::test]
    async fn test_documentation_present() {
        let c = documentation_present().unwrap();
        let out = run(&c, context().with_artifact("docs/guide.md", "# Guide")).await;
        assert!(out.passed);
        assert_eq!(out.evidence, ["docs/guide.md"]);

        let out = run(&c, context().with_artifact("src/lib.rs", "/// Adds.\npub fn add() {}")).await;
        assert!(out.passed);
        assert_eq!(out.score, 80.0);

        assert!(!run(&c, context().with_artifact("src/lib.rs", "pub fn add() {}")).await.passed);
    }

    #[tokio::test]
    async fn test_summary_length() {
        let c = summary_length(10);
        assert!(run(&c, context().with_summary("Implemented the parser")).await.passed);
        let out = run(&c, context().with_summary("short")).await;
        assert!(!out.passed);
        assert_eq!(out.score, 50.0);
    }

    #[test]
    fn test_all_builtins_have_distinct_ids() {
        let all = all().unwrap();
        let mut ids: Vec<_> = all.iter().map(|c| c.id.clone()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), all.len());
    }
}
