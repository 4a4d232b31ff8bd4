//! Run store.

use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use super::{PersistencePort, Result, RunEvent, RunEvents, StoreError};
use crate::workflow::{
    new_id, Run, RunPatch, RunStatus, SentEmail, StepRun, StepRunPatch, StepRunStatus,
};

/// Creates runs and applies status updates, publishing a [`RunEvent`] for
/// every successful write.
#[derive(Clone)]
pub struct RunStore {
    port: Arc<dyn PersistencePort>,
    events: RunEvents,
}

impl RunStore {
    pub fn new(port: Arc<dyn PersistencePort>) -> Self {
        Self { port, events: RunEvents::new() }
    }

    /// The change channel of this store.
    pub fn events(&self) -> &RunEvents {
        &self.events
    }

    pub fn port(&self) -> &Arc<dyn PersistencePort> {
        &self.port
    }

    /// Start a run of a workflow.
    ///
    /// Every step gets a `pending` step run, in step order. The run and all of
    /// its step runs are written in one backend call, so the run is never seen
    /// with a partial step run set.
    pub async fn create_run(&self, workflow_id: &str) -> Result<Run> {
        let workflow = self
            .port
            .get_workflow(workflow_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("workflow {workflow_id}")))?;

        let run_id = new_id();
        let step_runs = workflow
            .steps
            .iter()
            .map(|step| StepRun {
                id: new_id(),
                run_id: run_id.clone(),
                step_id: step.id.clone(),
                step_order: step.order,
                status: StepRunStatus::Pending,
                output: None,
                started_at: None,
                finished_at: None,
            })
            .collect();

        let run = Run {
            id: run_id,
            workflow_id: workflow.id.clone(),
            status: RunStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            step_runs,
        };

        self.port.insert_run(&run).await?;
        info!(run_id = %run.id, workflow_id = %workflow.id, steps = run.step_runs.len(), "Run created");

        self.events.publish(RunEvent::Created { run_id: run.id.clone() });
        Ok(run)
    }

    pub async fn get_run_by_id(&self, id: &str) -> Result<Option<Run>> {
        self.port.get_run(id).await
    }

    /// Runs of a workflow, newest first.
    pub async fn list_runs(&self, workflow_id: &str) -> Result<Vec<Run>> {
        self.port.list_runs(workflow_id).await
    }

    /// Merge a partial update into a run. Last writer wins.
    pub async fn update_run(&self, id: &str, patch: RunPatch) -> Result<()> {
        self.port.update_run(id, &patch).await?;
        self.events.publish(RunEvent::RunUpdated { run_id: id.to_string(), status: patch.status });
        Ok(())
    }

    /// Merge a partial update into one step run. Last writer wins.
    pub async fn update_step_run(
        &self,
        run_id: &str,
        step_id: &str,
        patch: StepRunPatch,
    ) -> Result<()> {
        self.port.update_step_run(run_id, step_id, &patch).await?;
        self.events.publish(RunEvent::StepRunUpdated {
            run_id: run_id.to_string(),
            step_id: step_id.to_string(),
            status: patch.status,
        });
        Ok(())
    }

    /// Append an email to the sent log.
    pub async fn record_email(&self, email: &SentEmail) -> Result<()> {
        self.port.insert_email(email).await
    }

    pub async fn list_emails(&self) -> Result<Vec<SentEmail>> {
        self.port.list_emails().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{LocalStore, WorkflowStore};
    use crate::workflow::{Plan, PlannedStep, StepType};

    fn stores() -> (WorkflowStore, RunStore) {
        let port: Arc<dyn PersistencePort> = Arc::new(LocalStore::in_memory());
        (WorkflowStore::new(Arc::clone(&port)), RunStore::new(port))
    }

    fn plan(n: usize) -> Plan {
        Plan {
            summary: String::new(),
            steps: (0..n)
                .map(|i| PlannedStep::new(format!("Step {i}"), StepType::Wait))
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_create_run_initializes_all_steps_pending() {
        let (workflows, runs) = stores();
        let workflow = workflows.create("wf", &plan(5)).await.unwrap();

        let run = runs.create_run(&workflow.id).await.unwrap();

        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.step_runs.len(), workflow.steps.len());
        assert!(run.step_runs.iter().all(|sr| sr.status == StepRunStatus::Pending));
        for (sr, step) in run.step_runs.iter().zip(&workflow.steps) {
            assert_eq!(sr.step_id, step.id);
            assert_eq!(sr.step_order, step.order);
        }

        let stored = runs.get_run_by_id(&run.id).await.unwrap().unwrap();
        assert_eq!(stored, run);
    }

    #[tokio::test]
    async fn test_create_run_for_missing_workflow_fails() {
        let (_, runs) = stores();
        let err = runs.create_run("does-not-exist").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_updates_publish_events() {
        let (workflows, runs) = stores();
        let workflow = workflows.create("wf", &plan(1)).await.unwrap();
        let run = runs.create_run(&workflow.id).await.unwrap();
        let step_id = run.step_runs[0].step_id.clone();

        let mut rx = runs.events().subscribe();
        runs.update_step_run(&run.id, &step_id, StepRunPatch::start()).await.unwrap();
        runs.update_run(&run.id, RunPatch::finish(RunStatus::Completed)).await.unwrap();

        assert_eq!(
            rx.recv().await.unwrap(),
            RunEvent::StepRunUpdated {
                run_id: run.id.clone(),
                step_id,
                status: Some(StepRunStatus::Running),
            }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            RunEvent::RunUpdated { run_id: run.id.clone(), status: Some(RunStatus::Completed) }
        );
    }

    #[tokio::test]
    async fn test_last_writer_wins() {
        let (workflows, runs) = stores();
        let workflow = workflows.create("wf", &plan(1)).await.unwrap();
        let run = runs.create_run(&workflow.id).await.unwrap();
        let step_id = run.step_runs[0].step_id.clone();

        let first = StepRunPatch { output: Some("first".to_string()), ..Default::default() };
        let second = StepRunPatch { output: Some("second".to_string()), ..Default::default() };
        runs.update_step_run(&run.id, &step_id, first).await.unwrap();
        runs.update_step_run(&run.id, &step_id, second).await.unwrap();

        let stored = runs.get_run_by_id(&run.id).await.unwrap().unwrap();
        assert_eq!(stored.step_runs[0].output.as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn test_list_runs_for_workflow() {
        let (workflows, runs) = stores();
        let a = workflows.create("a", &plan(1)).await.unwrap();
        let b = workflows.create("b", &plan(1)).await.unwrap();

        runs.create_run(&a.id).await.unwrap();
        runs.create_run(&a.id).await.unwrap();
        runs.create_run(&b.id).await.unwrap();

        assert_eq!(runs.list_runs(&a.id).await.unwrap().len(), 2);
        assert_eq!(runs.list_runs(&b.id).await.unwrap().len(), 1);
    }
}
