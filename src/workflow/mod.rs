//! Workflows: planning, persistence model, execution and viewing.
//!
//! ## Flow
//!
//! - `PlanGenerator` - turns a goal into a [`Plan`]
//! - `WorkflowStore::create` - persists the plan as a [`Workflow`]
//! - `RunExecutor` - executes a [`Run`] of the workflow step by step
//! - `RunViewer` - follows a run as it progresses

mod executor;
mod model;
mod planning;
mod viewer;

pub use executor::{
    Advance, ExecutorError, RunCanceller, RunExecutor, RunHandle, RunLocks, StepOutcome,
    ABSORBED_ERROR_OUTPUT, CRM_OUTPUT, DEFAULT_RECIPIENT, WAIT_OUTPUT,
};
pub use model::{
    new_id, Plan, PlannedStep, Run, RunPatch, RunStatus, SentEmail, Step, StepRun, StepRunPatch,
    StepRunStatus, StepType, Workflow, WorkflowStatus,
};
pub use planning::{EmailDraft, PlanError, PlanGenerator};
pub use viewer::{render, RunSnapshot, RunViewer};
