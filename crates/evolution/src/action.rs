//! Tuning actions and their revert plans.

use conductor_execution::SchedulingStrategy;
use serde::{Deserialize, Serialize};

use crate::source::TuningTarget;

/// One concrete change to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum OptimizationAction {
    /// Resize the worker pool
    SetMaxConcurrent {
        /// New slot count
        value: usize,
    },
    /// Switch the tie-break strategy
    SetStrategy {
        /// New strategy
        strategy: SchedulingStrategy,
    },
    /// Resize a resource pool
    SetCapacity {
        /// Resource type
        resource: String,
        /// New capacity
        capacity: u32,
    },
    /// Run a priority aging pass
    RebalanceQueue,
}

impl OptimizationAction {
    /// Apply to `target`, recording how to undo it in `plan`.
    ///
    /// Returns a one-line description of the side effect.
    pub fn apply(&self, target: &dyn TuningTarget, plan: &mut RevertPlan) -> anyhow::Result<String> {
        match self {
            Self::SetMaxConcurrent { value } => {
                let previous = target.set_max_concurrent(*value);
                let applied = target.max_concurrent();
                plan.steps.push(RevertStep::MaxConcurrent { applied, previous });
                Ok(format!("max_concurrent {previous} -> {applied}"))
            }
            Self::SetStrategy { strategy } => {
                let previous = target.set_strategy(*strategy);
                plan.steps.push(RevertStep::Strategy {
                    applied: *strategy,
                    previous,
                });
                Ok(format!("strategy {previous} -> {strategy}"))
            }
            Self::SetCapacity { resource, capacity } => {
                let previous = target.set_capacity(resource, *capacity)?;
                plan.steps.push(RevertStep::Capacity {
                    resource: resource.clone(),
                    applied: *capacity,
                    previous,
                });
                Ok(format!("{resource} capacity {previous} -> {capacity}"))
            }
            Self::RebalanceQueue => {
                let promoted = target.rebalance_queue();
                Ok(format!("queue rebalanced, {promoted} tasks promoted"))
            }
        }
    }
}

/// Undo record for one applied change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum RevertStep {
    /// Worker slot change
    MaxConcurrent {
        /// Value the optimization set
        applied: usize,
        /// Value to restore
        previous: usize,
    },
    /// Strategy change
    Strategy {
        /// Value the optimization set
        applied: SchedulingStrategy,
        /// Value to restore
        previous: SchedulingStrategy,
    },
    /// Capacity change
    Capacity {
        /// Resource type
        resource: String,
        /// Value the optimization set
        applied: u32,
        /// Value to restore
        previous: u32,
    },
}

impl RevertStep {
    /// Describe how the target moved away from the applied value, if it did.
    fn drift(&self, target: &dyn TuningTarget) -> Option<String> {
        match self {
            Self::MaxConcurrent { applied, .. } => {
                let current = target.max_concurrent();
                (current != *applied)
                    .then(|| format!("max_concurrent is {current}, optimization set {applied}"))
            }
            Self::Strategy { applied, .. } => {
                let current = target.strategy();
                (current != *applied)
                    .then(|| format!("strategy is {current}, optimization set {applied}"))
            }
            Self::Capacity { resource, applied, .. } => match target.capacity(resource) {
                Some(current) if current == *applied => None,
                Some(current) => Some(format!(
                    "{resource} capacity is {current}, optimization set {applied}"
                )),
                None => Some(format!("{resource} no longer exists")),
            },
        }
    }

    fn undo(&self, target: &dyn TuningTarget) -> anyhow::Result<()> {
        match self {
            Self::MaxConcurrent { previous, .. } => {
                target.set_max_concurrent(*previous);
            }
            Self::Strategy { previous, .. } => {
                target.set_strategy(*previous);
            }
            Self::Capacity { resource, previous, .. } => {
                target.set_capacity(resource, *previous)?;
            }
        }
        Ok(())
    }
}

/// Serializable undo capability for an applied optimization.
///
/// Executing the plan consumes it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevertPlan {
    steps: Vec<RevertStep>,
}

impl RevertPlan {
    /// Recorded steps, in application order.
    pub fn steps(&self) -> &[RevertStep] {
        &self.steps
    }

    /// Nothing to undo.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// First difference between the target and what the plan expects.
    pub fn drift(&self, target: &dyn TuningTarget) -> Option<String> {
        self.steps.iter().find_map(|step| step.drift(target))
    }

    /// Undo every step, newest first.
    pub fn execute(self, target: &dyn TuningTarget) -> anyhow::Result<()> {
        for step in self.steps.iter().rev() {
            step.undo(target)?;
        }
        Ok(())
    }
}
