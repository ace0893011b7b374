//! Validation criteria and the validator seam.

use async_trait::async_trait;
use conductor_core::{CriteriaId, Severity, TaskCategory};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::context::ValidationContext;

/// What a criterion checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CriteriaCategory {
    /// Code quality
    CodeQuality,
    /// Security
    Security,
    /// Performance
    Performance,
    /// Behaviour matches intent
    Functionality,
    /// Documentation
    Documentation,
    /// Tests
    Testing,
    /// Policy and process
    Compliance,
}

impl CriteriaCategory {
    /// Criteria categories that apply to a task category.
    pub fn for_task(category: TaskCategory) -> &'static [CriteriaCategory] {
        use CriteriaCategory::*;
        match category {
            TaskCategory::Implementation => &[CodeQuality, Security, Performance],
            TaskCategory::Testing => &[Testing, Functionality],
            TaskCategory::Documentation => &[Documentation, Functionality],
            TaskCategory::Research => &[Documentation],
            TaskCategory::Design => &[Documentation, Functionality],
            TaskCategory::Deployment => &[Security, Compliance, Functionality],
            TaskCategory::Maintenance => &[CodeQuality, Performance],
            TaskCategory::Review => &[CodeQuality, Compliance],
        }
    }
}

/// What a validator concluded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatorOutput {
    /// Whether the check passed
    pub passed: bool,
    /// Score from 0 to 100
    pub score: f64,
    /// Short explanation
    pub message: String,
    /// How to fix a failure
    pub suggestions: Vec<String>,
    /// Supporting observations
    pub evidence: Vec<String>,
}

impl ValidatorOutput {
    /// A pass with full score.
    pub fn pass(message: impl Into<String>) -> Self {
        Self {
            passed: true,
            score: 100.0,
            message: message.into(),
            suggestions: Vec::new(),
            evidence: Vec::new(),
        }
    }

    /// A failure with zero score.
    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            passed: false,
            score: 0.0,
            message: message.into(),
            suggestions: Vec::new(),
            evidence: Vec::new(),
        }
    }

    /// Override the score.
    pub fn with_score(mut self, score: f64) -> Self {
        self.score = score;
        self
    }

    /// Add a suggestion.
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    /// Add evidence.
    pub fn with_evidence(mut self, evidence: impl Into<String>) -> Self {
        self.evidence.push(evidence.into());
        self
    }
}

/// Checks one aspect of a completed task.
///
/// Returning an error is treated like a timeout: the attempt is retried and,
/// once retries are spent, recorded as a failing result.
#[async_trait]
pub trait Validator: Send + Sync {
    /// Inspect the task.
    async fn validate(&self, context: Arc<ValidationContext>) -> anyhow::Result<ValidatorOutput>;
}

/// Adapts an async closure into a [`Validator`].
pub struct FnValidator<F>(F);

impl<F> FnValidator<F> {
    /// Wrap a closure.
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> Validator for FnValidator<F>
where
    F: Fn(Arc<ValidationContext>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<ValidatorOutput>> + Send + 'static,
{
    async fn validate(&self, context: Arc<ValidationContext>) -> anyhow::Result<ValidatorOutput> {
        (self.0)(context).await
    }
}

/// A named, categorized, severity-tagged check.
#[derive(Clone)]
pub struct ValidationCriteria {
    /// Registry key
    pub id: CriteriaId,
    /// Display name
    pub name: String,
    /// Category used to select it
    pub category: CriteriaCategory,
    /// Severity of a failure
    pub severity: Severity,
    /// Per-attempt time limit
    pub timeout: Duration,
    /// Extra attempts after the first
    pub retry_count: u32,
    /// The check
    pub validator: Arc<dyn Validator>,
}

impl ValidationCriteria {
    /// Criterion with a 30 s timeout, no retries and medium severity.
    pub fn new(
        id: impl Into<CriteriaId>,
        category: CriteriaCategory,
        validator: Arc<dyn Validator>,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.to_string(),
            id,
            category,
            severity: Severity::Medium,
            timeout: Duration::from_secs(30),
            retry_count: 0,
            validator,
        }
    }

    /// Criterion backed by an async closure.
    pub fn from_fn<F, Fut>(id: impl Into<CriteriaId>, category: CriteriaCategory, f: F) -> Self
    where
        F: Fn(Arc<ValidationContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<ValidatorOutput>> + Send + 'static,
    {
        Self::new(id, category, Arc::new(FnValidator::new(f)))
    }

    /// Set the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the severity.
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Set the per-attempt timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the retry count.
    pub fn with_retry_count(mut self, retries: u32) -> Self {
        self.retry_count = retries;
        self
    }
}

impl std::fmt::Debug for ValidationCriteria {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidationCriteria")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("category", &self.category)
            .field("severity", &self.severity)
            .field("timeout", &self.timeout)
            .field("retry_count", &self.retry_count)
            .finish_non_exhaustive()
    }
}
