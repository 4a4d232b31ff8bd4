//! Run execution engine.
//!
//! A run advances one step at a time, always the lowest-order `pending` step.
//! [`RunExecutor::advance`] performs one such move; [`RunExecutor::spawn`]
//! loops it in a background task until the run is terminal or cancelled.
//!
//! Every advance holds a per-run lock, so two drivers of the same run never
//! execute a step concurrently. Different runs do not share a lock.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::model::{
    new_id, Run, RunPatch, RunStatus, SentEmail, Step, StepRunPatch, StepRunStatus, StepType,
};
use super::planning::PlanGenerator;
use crate::core::{ExecutorSettings, FailurePolicy};
use crate::store::{RunStore, StoreError, WorkflowStore};

/// Output of a `wait` step.
pub const WAIT_OUTPUT: &str = "Waited successfully.";

/// Output of an `update_crm` step.
pub const CRM_OUTPUT: &str = "CRM updated successfully.";

/// Output of a failed step under [`FailurePolicy::Absorb`].
pub const ABSORBED_ERROR_OUTPUT: &str = "Error executing step.";

/// Recipient used when a `send_email` step does not name one.
pub const DEFAULT_RECIPIENT: &str = "subscribers@example.com";

/// Result of executing a single step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Success { output: String },
    Failed { reason: String },
}

/// What one call to [`RunExecutor::advance`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advance {
    /// The run is not running; nothing was touched
    Idle(RunStatus),
    /// One step was executed; `run_status` is the run's status afterwards
    Stepped { step_id: String, status: StepRunStatus, run_status: RunStatus },
    /// No pending step was left and the run was closed
    Finished(RunStatus),
}

/// Errors that stop the executor.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("workflow {workflow_id} of run {run_id} not found")]
    MissingWorkflow { workflow_id: String, run_id: String },

    #[error("step {0} is not part of the workflow")]
    MissingStep(String),

    #[error("run task failed: {0}")]
    Task(String),
}

/// Per-run async locks.
#[derive(Debug, Default)]
pub struct RunLocks {
    locks: parking_lot::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl RunLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, run_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.locks.lock().entry(run_id.to_string()).or_default())
    }

    /// Drop the lock entry once nobody holds or waits on it.
    fn prune(&self, run_id: &str) {
        let mut locks = self.locks.lock();
        if locks.get(run_id).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(run_id);
        }
    }

    /// Number of runs with a live lock entry.
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Executes runs against the workflow and run stores.
#[derive(Clone)]
pub struct RunExecutor {
    workflows: WorkflowStore,
    runs: RunStore,
    planner: PlanGenerator,
    settings: ExecutorSettings,
    context: Option<Value>,
    locks: Arc<RunLocks>,
}

impl RunExecutor {
    /// Create an executor with default settings.
    pub fn new(workflows: WorkflowStore, runs: RunStore, planner: PlanGenerator) -> Self {
        Self {
            workflows,
            runs,
            planner,
            settings: ExecutorSettings::default(),
            context: None,
            locks: Arc::new(RunLocks::new()),
        }
    }

    /// Create executor with custom settings.
    pub fn with_settings(mut self, settings: ExecutorSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Context object passed to content steps along with their prompt.
    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }

    pub fn runs(&self) -> &RunStore {
        &self.runs
    }

    pub fn workflows(&self) -> &WorkflowStore {
        &self.workflows
    }

    pub fn locks(&self) -> &RunLocks {
        &self.locks
    }

    /// Execute the next pending step of a run.
    ///
    /// Level-triggered: calling this on a run that is not `running` is a no-op,
    /// so extra calls never touch `finished_at` again.
    pub async fn advance(&self, run_id: &str) -> Result<Advance, ExecutorError> {
        let lock = self.locks.get(run_id);
        let result = {
            let _guard = lock.lock().await;
            self.advance_locked(run_id).await
        };
        drop(lock);
        self.locks.prune(run_id);
        result
    }

    async fn advance_locked(&self, run_id: &str) -> Result<Advance, ExecutorError> {
        let run = self
            .runs
            .get_run_by_id(run_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("run {run_id}")))?;

        if run.status != RunStatus::Running {
            return Ok(Advance::Idle(run.status));
        }

        let Some(next) = run.next_pending() else {
            // A step left `running` or `failed` means the run cannot complete
            let status =
                if run.all_completed() { RunStatus::Completed } else { RunStatus::Failed };
            self.runs.update_run(run_id, RunPatch::finish(status)).await?;
            info!(run_id, status = %status, "Run finished");
            return Ok(Advance::Finished(status));
        };

        let workflow = self.workflows.get_by_id(&run.workflow_id).await?.ok_or_else(|| {
            ExecutorError::MissingWorkflow {
                workflow_id: run.workflow_id.clone(),
                run_id: run_id.to_string(),
            }
        })?;
        let step = workflow
            .step(&next.step_id)
            .ok_or_else(|| ExecutorError::MissingStep(next.step_id.clone()))?;

        self.runs.update_step_run(run_id, &step.id, StepRunPatch::start()).await?;
        debug!(run_id, step = %step.title, kind = %step.step_type, "Step started");

        let outcome = self.execute_step(&run, step).await;

        let (status, output) = match outcome {
            StepOutcome::Success { output } => (StepRunStatus::Completed, output),
            StepOutcome::Failed { reason } => {
                warn!(run_id, step = %step.title, %reason, "Step failed");
                match self.settings.failure_policy {
                    FailurePolicy::FailRun => (StepRunStatus::Failed, reason),
                    FailurePolicy::Absorb => {
                        (StepRunStatus::Completed, ABSORBED_ERROR_OUTPUT.to_string())
                    }
                }
            }
        };

        self.runs.update_step_run(run_id, &step.id, StepRunPatch::finish(status, output)).await?;
        debug!(run_id, step = %step.title, status = %status, "Step finished");

        let pending_left = run
            .step_runs
            .iter()
            .any(|sr| sr.status == StepRunStatus::Pending && sr.step_id != step.id);

        let run_status = if status == StepRunStatus::Failed {
            RunStatus::Failed
        } else if pending_left {
            RunStatus::Running
        } else {
            RunStatus::Completed
        };

        if run_status.is_terminal() {
            self.runs.update_run(run_id, RunPatch::finish(run_status)).await?;
            info!(run_id, status = %run_status, "Run finished");
        }

        Ok(Advance::Stepped { step_id: step.id.clone(), status, run_status })
    }

    /// Dispatch a step on its type. Never fails; errors become `Failed` outcomes.
    async fn execute_step(&self, run: &Run, step: &Step) -> StepOutcome {
        let result = match step.step_type {
            StepType::Wait => Ok(WAIT_OUTPUT.to_string()),
            StepType::UpdateCrm => Ok(CRM_OUTPUT.to_string()),
            StepType::SendEmail => self.send_email(run, step).await,
            StepType::GenerateContent => self
                .planner
                .generate_step_content(step.prompt(), self.context.as_ref())
                .await
                .map_err(anyhow::Error::from),
        };

        match result {
            Ok(output) => StepOutcome::Success { output },
            Err(e) => StepOutcome::Failed { reason: e.to_string() },
        }
    }

    async fn send_email(&self, run: &Run, step: &Step) -> anyhow::Result<String> {
        let draft = self.planner.draft_email(step.prompt()).await?;
        let recipient = step.config_str("to").unwrap_or(DEFAULT_RECIPIENT).to_string();

        let email = SentEmail {
            id: new_id(),
            run_id: Some(run.id.clone()),
            step_id: Some(step.id.clone()),
            recipient: recipient.clone(),
            subject: draft.subject,
            body: draft.body,
            sent_at: Utc::now(),
        };
        self.runs.record_email(&email).await?;

        Ok(format!("Email sent to {}: {}", recipient, email.subject))
    }

    /// Mark a running run as cancelled. Pending steps stay pending.
    pub async fn cancel_run(&self, run_id: &str) -> Result<RunStatus, ExecutorError> {
        let lock = self.locks.get(run_id);
        let result = async {
            let _guard = lock.lock().await;
            let run = self
                .runs
                .get_run_by_id(run_id)
                .await?
                .ok_or_else(|| StoreError::NotFound(format!("run {run_id}")))?;

            if run.status != RunStatus::Running {
                return Ok(run.status);
            }

            self.runs.update_run(run_id, RunPatch::finish(RunStatus::Cancelled)).await?;
            info!(run_id, "Run cancelled");
            Ok(RunStatus::Cancelled)
        }
        .await;
        drop(lock);
        self.locks.prune(run_id);
        result
    }

    /// Advance a run until it is terminal, checking for cancellation between steps.
    pub async fn run_to_completion(
        &self,
        run_id: &str,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<RunStatus, ExecutorError> {
        loop {
            if *cancel.borrow() {
                return self.cancel_run(run_id).await;
            }

            match self.advance(run_id).await? {
                Advance::Idle(status) | Advance::Finished(status) => return Ok(status),
                Advance::Stepped { run_status, .. } if run_status.is_terminal() => {
                    return Ok(run_status)
                }
                Advance::Stepped { .. } => {}
            }

            let delay = self.settings.step_delay();
            if !delay.is_zero() {
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    changed = cancel.changed() => {
                        // Sender gone: nobody can cancel any more, keep pacing
                        if changed.is_err() {
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
            }
        }
    }

    /// Run a run to completion in a background task.
    pub fn spawn(&self, run_id: &str) -> RunHandle {
        let (tx, mut rx) = watch::channel(false);
        let executor = self.clone();
        let id = run_id.to_string();

        let task = tokio::spawn(async move {
            let result = executor.run_to_completion(&id, &mut rx).await;
            match &result {
                Ok(status) => info!(run_id = %id, status = %status, "Run task done"),
                Err(e) => {
                    error!(run_id = %id, error = %e, "Run task stopped");
                    executor.abandon_run(&id).await;
                }
            }
            result
        });

        RunHandle { run_id: run_id.to_string(), cancel: RunCanceller(Arc::new(tx)), task }
    }

    /// Close a run whose driver stopped on an error, so it does not stay
    /// `running` forever. Best effort: a failure here is only logged.
    async fn abandon_run(&self, run_id: &str) {
        let lock = self.locks.get(run_id);
        let result: Result<bool, StoreError> = async {
            let _guard = lock.lock().await;
            match self.runs.get_run_by_id(run_id).await? {
                Some(run) if run.status == RunStatus::Running => {
                    self.runs.update_run(run_id, RunPatch::finish(RunStatus::Failed)).await?;
                    Ok(true)
                }
                _ => Ok(false),
            }
        }
        .await;
        drop(lock);
        self.locks.prune(run_id);

        match result {
            Ok(true) => warn!(run_id, "Run marked as failed after executor error"),
            Ok(false) => {}
            Err(e) => warn!(run_id, error = %e, "Could not mark stopped run as failed"),
        }
    }

    /// Create a run of a workflow and start executing it.
    pub async fn start(&self, workflow_id: &str) -> Result<RunHandle, ExecutorError> {
        let run = self.runs.create_run(workflow_id).await?;
        Ok(self.spawn(&run.id))
    }
}

/// Cancels a background run. Outlives the [`RunHandle`] it came from.
#[derive(Debug, Clone)]
pub struct RunCanceller(Arc<watch::Sender<bool>>);

impl RunCanceller {
    /// Ask the task to stop before its next step.
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }
}

/// Handle to a run executing in the background.
#[derive(Debug)]
pub struct RunHandle {
    run_id: String,
    cancel: RunCanceller,
    task: JoinHandle<Result<RunStatus, ExecutorError>>,
}

impl RunHandle {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Ask the task to stop before its next step.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// A canceller that stays usable while [`RunHandle::join`] is pending.
    pub fn canceller(&self) -> RunCanceller {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the task and return the final run status.
    pub async fn join(self) -> Result<RunStatus, ExecutorError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(ExecutorError::Task(e.to_string())),
        }
    }
}
