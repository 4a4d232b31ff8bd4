//! Workflow store.

use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use super::{PersistencePort, Result};
use crate::workflow::{new_id, Plan, Step, Workflow, WorkflowStatus};

/// Creates and reads workflows through a persistence backend.
#[derive(Clone)]
pub struct WorkflowStore {
    port: Arc<dyn PersistencePort>,
}

impl WorkflowStore {
    pub fn new(port: Arc<dyn PersistencePort>) -> Self {
        Self { port }
    }

    /// The backend this store writes to.
    pub fn port(&self) -> &Arc<dyn PersistencePort> {
        &self.port
    }

    /// Turn a plan into a persisted workflow.
    ///
    /// Plan steps map 1:1 onto workflow steps. The step at index `i` gets
    /// `order == i`; nothing is reordered or deduplicated.
    pub async fn create(&self, name: &str, plan: &Plan) -> Result<Workflow> {
        let workflow = Self::build(name, plan);
        self.port.insert_workflow(&workflow).await?;

        info!(workflow_id = %workflow.id, steps = workflow.steps.len(), "Workflow created");
        Ok(workflow)
    }

    fn build(name: &str, plan: &Plan) -> Workflow {
        let id = new_id();
        let steps = plan
            .steps
            .iter()
            .enumerate()
            .map(|(i, planned)| Step {
                id: new_id(),
                workflow_id: id.clone(),
                order: i as u32,
                step_type: planned.step_type,
                title: planned.title.clone(),
                description: planned.description.clone(),
                config: serde_json::json!({ "prompt": planned.prompt }),
            })
            .collect();

        Workflow {
            id,
            name: name.trim().to_string(),
            description: plan.summary.clone(),
            status: WorkflowStatus::Active,
            created_at: Utc::now(),
            steps,
        }
    }

    pub async fn get_by_id(&self, id: &str) -> Result<Option<Workflow>> {
        self.port.get_workflow(id).await
    }

    /// All workflows, newest first.
    pub async fn list_all(&self) -> Result<Vec<Workflow>> {
        self.port.list_workflows().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LocalStore;
    use crate::workflow::{PlannedStep, StepType};

    fn store() -> WorkflowStore {
        WorkflowStore::new(Arc::new(LocalStore::in_memory()))
    }

    fn plan() -> Plan {
        Plan {
            summary: "Launch an ebook".to_string(),
            steps: vec![
                PlannedStep::new("Tease", StepType::GenerateContent).with_prompt("Write a teaser"),
                PlannedStep::new("Pause", StepType::Wait),
                PlannedStep::new("Tease", StepType::GenerateContent).with_prompt("Write a teaser"),
                PlannedStep::new("Mail", StepType::SendEmail).with_prompt("Announce it"),
            ],
        }
    }

    #[tokio::test]
    async fn test_create_preserves_plan_order() {
        let store = store();
        let plan = plan();

        let workflow = store.create("Ebook launch", &plan).await.unwrap();

        assert_eq!(workflow.steps.len(), plan.steps.len());
        for (i, (step, planned)) in workflow.steps.iter().zip(&plan.steps).enumerate() {
            assert_eq!(step.order, i as u32);
            assert_eq!(step.title, planned.title);
            assert_eq!(step.step_type, planned.step_type);
            assert_eq!(step.prompt(), planned.prompt);
            assert_eq!(step.workflow_id, workflow.id);
        }
    }

    #[tokio::test]
    async fn test_duplicate_steps_are_kept() {
        let store = store();
        let workflow = store.create("Ebook launch", &plan()).await.unwrap();
        let teasers = workflow.steps.iter().filter(|s| s.title == "Tease").count();
        assert_eq!(teasers, 2);
    }

    #[tokio::test]
    async fn test_get_by_id_roundtrip() {
        let store = store();
        let workflow = store.create("  Ebook launch ", &plan()).await.unwrap();
        assert_eq!(workflow.name, "Ebook launch");
        assert_eq!(workflow.description, "Launch an ebook");

        let loaded = store.get_by_id(&workflow.id).await.unwrap();
        assert_eq!(loaded, Some(workflow));
        assert!(store.get_by_id("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_all() {
        let store = store();
        store.create("One", &plan()).await.unwrap();
        store.create("Two", &Plan::default()).await.unwrap();

        let all = store.list_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.iter().any(|w| w.name == "Two" && w.steps.is_empty()));
    }
}
