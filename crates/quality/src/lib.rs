//! Quality layer - validation criteria and task verdicts.
//!
//! Criteria are registered by id and selected per task category. The
//! [`ValidationEngine`] runs them with timeouts and retries and reports a
//! pass, fail or review verdict.

#![warn(missing_docs)]

pub mod builtin;
pub mod context;
pub mod criteria;
pub mod engine;
pub mod executor;
pub mod registry;
pub mod report;

pub use context::{Artifact, ValidationContext};
pub use criteria::{CriteriaCategory, FnValidator, ValidationCriteria, Validator, ValidatorOutput};
pub use engine::{Result, ValidationConfig, ValidationEngine, ValidationError, ValidationEvent};
pub use executor::execute_with_retry;
pub use registry::CriteriaRegistry;
pub use report::{
    verdict, CriterionStatus, ReportSummary, SlowCriterion, ValidationReport, ValidationResult,
    ValidationStatus,
};
