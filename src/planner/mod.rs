//! Planning and execution.
//!
//! This module compares desired and recorded state ([`DiffEngine`]), orders
//! the resulting change-set into waves ([`PlanScheduler`]) and applies the
//! plan against a provider ([`PlanExecutor`]).

mod diff;
mod executor;
mod plan;

pub use diff::{
    ChangeOp, ChangeSet, ChangeSetEntry, ChangeSummary, DiffEngine, PlannedValue, ReplacePolicy,
};
pub use executor::{
    CANCELLED, CancelToken, ExecutionResult, PlanExecutor, StepOutcome, StepStatus,
};
pub use plan::{ExecutionPlan, PlanScheduler, PlannedStep, StepAction};
