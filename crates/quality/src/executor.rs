//! Runs one criterion under a timeout with retries.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinError;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::context::ValidationContext;
use crate::criteria::{ValidationCriteria, ValidatorOutput};
use crate::report::{CriterionStatus, ValidationResult};

/// Why an attempt produced no verdict.
#[derive(Debug)]
enum AttemptError {
    TimedOut(Duration),
    Errored(anyhow::Error),
    Panicked(String),
}

impl std::fmt::Display for AttemptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TimedOut(limit) => write!(f, "timed out after {}ms", limit.as_millis()),
            Self::Errored(e) => write!(f, "validator error: {e:#}"),
            Self::Panicked(msg) => write!(f, "validator panicked: {msg}"),
        }
    }
}

/// Run `criteria` against `context`.
///
/// Each attempt races the validator against the criterion's timeout. An
/// error, panic or timeout is retried up to `retry_count` times, sleeping
/// `backoff_base * 2^attempt` between attempts (attempt numbering starts at
/// zero). A validator that returns a failing verdict is not retried.
///
/// Never fails: a criterion that never produced a verdict becomes a failing
/// result carrying the last error and the criterion's severity.
pub async fn execute_with_retry(
    criteria: &ValidationCriteria,
    context: Arc<ValidationContext>,
    backoff_base: Duration,
) -> ValidationResult {
    let started = Instant::now();
    let max_attempts = criteria.retry_count.saturating_add(1);
    let mut errors = Vec::new();

    for attempt in 0..max_attempts {
        match run_attempt(criteria, context.clone()).await {
            Ok(output) => {
                debug!(
                    criteria = %criteria.id,
                    task_id = %context.task.id,
                    passed = output.passed,
                    attempt,
                    "criterion finished"
                );
                return from_output(criteria, output, started.elapsed(), attempt + 1);
            }
            Err(e) => {
                warn!(
                    criteria = %criteria.id,
                    task_id = %context.task.id,
                    attempt,
                    error = %e,
                    "criterion attempt failed"
                );
                errors.push(e);
            }
        }

        if attempt + 1 < max_attempts {
            tokio::time::sleep(backoff_base.saturating_mul(2u32.saturating_pow(attempt))).await;
        }
    }

    let last = errors
        .last()
        .map(ToString::to_string)
        .unwrap_or_default();
    ValidationResult {
        criteria_id: criteria.id.clone(),
        name: criteria.name.clone(),
        category: criteria.category,
        status: CriterionStatus::Failed,
        score: 0.0,
        severity: criteria.severity,
        message: format!("{} failed after {} attempts: {last}", criteria.name, max_attempts),
        suggestions: vec![match errors.last() {
            Some(AttemptError::TimedOut(_)) => {
                format!("Raise the timeout of {} or make it faster", criteria.name)
            }
            _ => format!("Fix the {} validator", criteria.name),
        }],
        evidence: errors
            .iter()
            .enumerate()
            .map(|(i, e)| format!("attempt {}: {e}", i + 1))
            .collect(),
        duration: started.elapsed(),
        attempts: max_attempts,
    }
}

/// One attempt, isolated on its own task so a panic stays contained.
async fn run_attempt(
    criteria: &ValidationCriteria,
    context: Arc<ValidationContext>,
) -> Result<ValidatorOutput, AttemptError> {
    let validator = criteria.validator.clone();
    let mut handle = tokio::spawn(async move { validator.validate(context).await });

    match tokio::time::timeout(criteria.timeout, &mut handle).await {
        Ok(Ok(Ok(output))) => Ok(output),
        Ok(Ok(Err(e))) => Err(AttemptError::Errored(e)),
        Ok(Err(e)) => Err(AttemptError::Panicked(join_message(e))),
        Err(_) => {
            handle.abort();
            Err(AttemptError::TimedOut(criteria.timeout))
        }
    }
}

fn join_message(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload: Box<dyn Any + Send> = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn from_output(
    criteria: &ValidationCriteria,
    output: ValidatorOutput,
    duration: Duration,
    attempts: u32,
) -> ValidationResult {
    ValidationResult {
        criteria_id: criteria.id.clone(),
        name: criteria.name.clone(),
        category: criteria.category,
        status: if output.passed {
            CriterionStatus::Passed
        } else {
            CriterionStatus::Failed
        },
        score: output.score.clamp(0.0, 100.0),
        severity: criteria.severity,
        message: output.message,
        suggestions: output.suggestions,
        evidence: output.evidence,
        duration,
        attempts,
    }
}
