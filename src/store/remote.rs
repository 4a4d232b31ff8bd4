//! Hosted relational backend.
//!
//! Talks to a PostgREST-compatible REST API (as exposed by Supabase) with
//! the tables `workflows`, `workflow_steps`, `workflow_runs`,
//! `workflow_step_runs` and `sent_emails`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{PersistencePort, Result, StoreError};
use crate::workflow::{
    Run, RunPatch, RunStatus, SentEmail, Step, StepRun, StepRunPatch, StepType, Workflow,
    WorkflowStatus,
};

const WORKFLOWS: &str = "workflows";
const STEPS: &str = "workflow_steps";
const RUNS: &str = "workflow_runs";
const STEP_RUNS: &str = "workflow_step_runs";
const EMAILS: &str = "sent_emails";

/// REST client for the hosted backend.
#[derive(Debug, Clone)]
pub struct RemoteStore {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

/// Row of the `workflows` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WorkflowRow {
    id: String,
    name: String,
    #[serde(default)]
    description: String,
    status: WorkflowStatus,
    created_at: DateTime<Utc>,
}

/// Row of the `workflow_steps` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StepRow {
    id: String,
    workflow_id: String,
    step_order: u32,
    #[serde(rename = "type")]
    step_type: StepType,
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    config: serde_json::Value,
}

/// Row of the `workflow_runs` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RunRow {
    id: String,
    workflow_id: String,
    status: RunStatus,
    started_at: DateTime<Utc>,
    #[serde(default)]
    finished_at: Option<DateTime<Utc>>,
}

impl From<&Workflow> for WorkflowRow {
    fn from(w: &Workflow) -> Self {
        Self {
            id: w.id.clone(),
            name: w.name.clone(),
            description: w.description.clone(),
            status: w.status,
            created_at: w.created_at,
        }
    }
}

impl From<&Step> for StepRow {
    fn from(s: &Step) -> Self {
        Self {
            id: s.id.clone(),
            workflow_id: s.workflow_id.clone(),
            step_order: s.order,
            step_type: s.step_type,
            title: s.title.clone(),
            description: s.description.clone(),
            config: s.config.clone(),
        }
    }
}

impl From<StepRow> for Step {
    fn from(row: StepRow) -> Self {
        Self {
            id: row.id,
            workflow_id: row.workflow_id,
            order: row.step_order,
            step_type: row.step_type,
            title: row.title,
            description: row.description,
            config: row.config,
        }
    }
}

impl From<&Run> for RunRow {
    fn from(r: &Run) -> Self {
        Self {
            id: r.id.clone(),
            workflow_id: r.workflow_id.clone(),
            status: r.status,
            started_at: r.started_at,
            finished_at: r.finished_at,
        }
    }
}

/// Assemble a workflow from its row and step rows, sorting steps by order.
fn assemble_workflow(row: WorkflowRow, steps: Vec<StepRow>) -> Workflow {
    let mut workflow = Workflow {
        id: row.id,
        name: row.name,
        description: row.description,
        status: row.status,
        created_at: row.created_at,
        steps: steps.into_iter().map(Step::from).collect(),
    };
    // Insert acknowledgements can arrive out of order
    workflow.sort_steps();
    workflow
}

fn assemble_run(row: RunRow, step_runs: Vec<StepRun>) -> Run {
    let mut run = Run {
        id: row.id,
        workflow_id: row.workflow_id,
        status: row.status,
        started_at: row.started_at,
        finished_at: row.finished_at,
        step_runs,
    };
    run.sort_step_runs();
    run
}

/// PostgREST `eq` filter value.
fn eq(value: &str) -> String {
    format!("eq.{value}")
}

/// PostgREST `in` filter value.
fn in_list<'a>(values: impl IntoIterator<Item = &'a str>) -> String {
    let joined: Vec<String> = values.into_iter().map(|v| format!("\"{v}\"")).collect();
    format!("in.({})", joined.join(","))
}

impl RemoteStore {
    /// Create a client for the backend at `base_url`.
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client: reqwest::Client::new(),
        }
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn request(&self, method: reqwest::Method, table: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, self.table_url(table))
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();

        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(StoreError::Unauthorized);
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Backend(format!("{status}: {body}")));
        }

        Ok(response)
    }

    async fn select<T: DeserializeOwned>(
        &self,
        table: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<T>> {
        let mut params: Vec<(&str, String)> = vec![("select", "*".to_string())];
        params.extend(query.iter().cloned());

        let response = self.request(reqwest::Method::GET, table).query(&params).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn insert<T: Serialize + ?Sized>(&self, table: &str, rows: &T) -> Result<()> {
        let response = self
            .request(reqwest::Method::POST, table)
            .header("Prefer", "return=minimal")
            .json(rows)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    /// Patch matching rows. Errors with `NotFound` when no row matched.
    async fn patch<T: Serialize>(
        &self,
        table: &str,
        filters: &[(&str, String)],
        body: &T,
        what: String,
    ) -> Result<()> {
        let response = self
            .request(reqwest::Method::PATCH, table)
            .header("Prefer", "return=representation")
            .query(filters)
            .json(body)
            .send()
            .await?;

        let rows: Vec<serde_json::Value> = Self::check(response).await?.json().await?;
        if rows.is_empty() {
            return Err(StoreError::NotFound(what));
        }
        Ok(())
    }

    async fn delete(&self, table: &str, filters: &[(&str, String)]) -> Result<()> {
        let response = self.request(reqwest::Method::DELETE, table).query(filters).send().await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn step_runs_for(&self, run_ids: &[&str]) -> Result<Vec<StepRun>> {
        if run_ids.is_empty() {
            return Ok(Vec::new());
        }
        self.select(
            STEP_RUNS,
            &[
                ("run_id", in_list(run_ids.iter().copied())),
                ("order", "step_order.asc".to_string()),
            ],
        )
        .await
    }
}

#[async_trait]
impl PersistencePort for RemoteStore {
    async fn insert_workflow(&self, workflow: &Workflow) -> Result<()> {
        self.insert(WORKFLOWS, &WorkflowRow::from(workflow)).await?;

        let steps: Vec<StepRow> = workflow.steps.iter().map(StepRow::from).collect();
        if !steps.is_empty() {
            if let Err(e) = self.insert(STEPS, &steps).await {
                // Leave no workflow without its steps behind
                let by_id = [("id", eq(&workflow.id))];
                if let Err(rollback) = self.delete(WORKFLOWS, &by_id).await {
                    tracing::warn!(
                        workflow_id = %workflow.id,
                        error = %rollback,
                        "Failed to remove workflow after step insert failed"
                    );
                }
                return Err(e);
            }
        }

        tracing::debug!(workflow_id = %workflow.id, steps = steps.len(), "Workflow inserted");
        Ok(())
    }

    async fn get_workflow(&self, id: &str) -> Result<Option<Workflow>> {
        let by_id = [("id", eq(id))];
        let by_workflow = [("workflow_id", eq(id)), ("order", "step_order.asc".to_string())];

        // Parent and children are independent reads
        let (rows, steps) = futures::try_join!(
            self.select::<WorkflowRow>(WORKFLOWS, &by_id),
            self.select::<StepRow>(STEPS, &by_workflow),
        )?;

        Ok(rows.into_iter().next().map(|row| assemble_workflow(row, steps)))
    }

    async fn list_workflows(&self) -> Result<Vec<Workflow>> {
        let rows: Vec<WorkflowRow> =
            self.select(WORKFLOWS, &[("order", "created_at.desc".to_string())]).await?;
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let steps: Vec<StepRow> = self
            .select(
                STEPS,
                &[
                    ("workflow_id", in_list(rows.iter().map(|r| r.id.as_str()))),
                    ("order", "step_order.asc".to_string()),
                ],
            )
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let own: Vec<StepRow> =
                    steps.iter().filter(|s| s.workflow_id == row.id).cloned().collect();
                assemble_workflow(row, own)
            })
            .collect())
    }

    async fn insert_run(&self, run: &Run) -> Result<()> {
        self.insert(RUNS, &RunRow::from(run)).await?;

        if !run.step_runs.is_empty() {
            if let Err(e) = self.insert(STEP_RUNS, &run.step_runs).await {
                // A run is never observed without its full step run set
                let by_id = [("id", eq(&run.id))];
                if let Err(rollback) = self.delete(RUNS, &by_id).await {
                    tracing::warn!(
                        run_id = %run.id,
                        error = %rollback,
                        "Failed to remove run after step run insert failed"
                    );
                }
                return Err(e);
            }
        }

        Ok(())
    }

    async fn get_run(&self, id: &str) -> Result<Option<Run>> {
        let by_id = [("id", eq(id))];
        let run_ids = [id];

        let (rows, step_runs) = futures::try_join!(
            self.select::<RunRow>(RUNS, &by_id),
            self.step_runs_for(&run_ids),
        )?;

        Ok(rows.into_iter().next().map(|row| assemble_run(row, step_runs)))
    }

    async fn list_runs(&self, workflow_id: &str) -> Result<Vec<Run>> {
        let rows: Vec<RunRow> = self
            .select(
                RUNS,
                &[("workflow_id", eq(workflow_id)), ("order", "started_at.desc".to_string())],
            )
            .await?;

        let ids: Vec<&str> = rows.iter().map(|r| r.id.as_str()).collect();
        let step_runs = self.step_runs_for(&ids).await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let own: Vec<StepRun> =
                    step_runs.iter().filter(|sr| sr.run_id == row.id).cloned().collect();
                assemble_run(row, own)
            })
            .collect())
    }

    async fn update_run(&self, id: &str, patch: &RunPatch) -> Result<()> {
        self.patch(RUNS, &[("id", eq(id))], patch, format!("run {id}")).await
    }

    async fn update_step_run(
        &self,
        run_id: &str,
        step_id: &str,
        patch: &StepRunPatch,
    ) -> Result<()> {
        self.patch(
            STEP_RUNS,
            &[("run_id", eq(run_id)), ("step_id", eq(step_id))],
            patch,
            format!("step {step_id} of run {run_id}"),
        )
        .await
    }

    async fn insert_email(&self, email: &SentEmail) -> Result<()> {
        self.insert(EMAILS, email).await
    }

    async fn list_emails(&self) -> Result<Vec<SentEmail>> {
        self.select(EMAILS, &[("order", "sent_at.desc".to_string())]).await
    }

    fn backend_name(&self) -> &str {
        "remote"
    }
}
