//! End-to-end plan -> workflow -> run tests through the library API.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flowpilot::ai::{AIManager, AIProvider, GenerateOptions};
use flowpilot::core::{Config, ExecutorSettings, FailurePolicy};
use flowpilot::store::{open_stores, LocalStore, PersistencePort, RunStore, WorkflowStore};
use flowpilot::workflow::{
    new_id, render, ExecutorError, PlanGenerator, Run, RunExecutor, RunSnapshot, RunStatus,
    RunViewer, StepRun, StepRunStatus,
};

fn demo_planner() -> PlanGenerator {
    PlanGenerator::new(Arc::new(AIManager::demo())).with_demo_delay(Duration::ZERO)
}

fn memory_stores() -> (WorkflowStore, RunStore) {
    let port: Arc<dyn PersistencePort> = Arc::new(LocalStore::in_memory());
    (WorkflowStore::new(Arc::clone(&port)), RunStore::new(port))
}

/// Model that plans three content steps and fails on the second one.
struct Flaky;

#[async_trait]
impl AIProvider for Flaky {
    async fn generate(&self, prompt: &str, options: GenerateOptions) -> anyhow::Result<String> {
        if options.json_mode {
            return Ok(r#"```json
{"summary": "Three posts", "steps": [
  {"title": "Post one", "type": "generate_content", "prompt": "first"},
  {"title": "Post two", "type": "generate_content", "prompt": "second"},
  {"title": "Post three", "type": "generate_content", "prompt": "third"}
]}
```"#
                .to_string());
        }
        if prompt.starts_with("second") {
            anyhow::bail!("quota exceeded");
        }
        Ok(format!("wrote {prompt}"))
    }

    fn name(&self) -> &str {
        "flaky"
    }

    async fn is_available(&self) -> bool {
        true
    }
}

// ============================================================================
// Demo Mode Tests
// ============================================================================

#[tokio::test]
async fn test_demo_plan_runs_to_completion() {
    let planner = demo_planner();
    let (workflows, runs) = memory_stores();

    let plan = planner.generate_plan("Launch my ebook").await.unwrap();
    let workflow = workflows.create("Ebook launch", &plan).await.unwrap();
    assert_eq!(workflow.steps.len(), 4);

    let executor = RunExecutor::new(workflows.clone(), runs.clone(), planner)
        .with_settings(ExecutorSettings::immediate());
    let handle = executor.start(&workflow.id).await.unwrap();
    let run_id = handle.run_id().to_string();
    assert_eq!(handle.join().await.unwrap(), RunStatus::Completed);

    let run = runs.get_run_by_id(&run_id).await.unwrap().unwrap();
    assert!(run.finished_at.is_some());
    assert!(run.step_runs.iter().all(|sr| sr.status == StepRunStatus::Completed));
    assert!(run.step_runs.iter().all(|sr| sr.started_at.is_some() && sr.finished_at.is_some()));

    let outputs: Vec<&str> =
        run.step_runs.iter().map(|sr| sr.output.as_deref().unwrap_or_default()).collect();
    assert!(outputs[0].starts_with("[Demo] Generated content for:"));
    assert_eq!(outputs[1], "Waited successfully.");
    assert!(outputs[2].starts_with("Email sent to subscribers@example.com: "));
    assert_eq!(outputs[3], "CRM updated successfully.");

    let emails = runs.list_emails().await.unwrap();
    assert_eq!(emails.len(), 1);
    assert_eq!(emails[0].step_id.as_deref(), Some(run.step_runs[2].step_id.as_str()));
}

#[tokio::test]
async fn test_viewer_follows_run_to_the_end() {
    let planner = demo_planner();
    let (workflows, runs) = memory_stores();
    let plan = planner.generate_plan("Launch").await.unwrap();
    let workflow = workflows.create("Launch", &plan).await.unwrap();

    let settings = ExecutorSettings { step_delay_ms: 10, ..ExecutorSettings::immediate() };
    let executor =
        RunExecutor::new(workflows.clone(), runs.clone(), planner).with_settings(settings);
    let run = runs.create_run(&workflow.id).await.unwrap();

    let mut viewer = RunViewer::new(workflows, runs, run.id.clone())
        .with_poll_interval(Duration::from_millis(500));
    let handle = executor.spawn(&run.id);

    let mut renders = Vec::new();
    let last = tokio::time::timeout(
        Duration::from_secs(10),
        viewer.follow(|snapshot| renders.push(render(snapshot))),
    )
    .await
    .expect("run finishes")
    .unwrap();

    assert_eq!(handle.join().await.unwrap(), RunStatus::Completed);
    assert!(
        matches!(last, RunSnapshot::Ready { ref run, .. } if run.status == RunStatus::Completed)
    );
    assert!(renders.len() >= 2);
    assert!(renders.last().unwrap().contains("[completed] Update CRM Contacts"));
}

#[tokio::test]
async fn test_broken_run_is_closed_and_viewer_returns() {
    let port: Arc<dyn PersistencePort> = Arc::new(LocalStore::in_memory());
    let workflows = WorkflowStore::new(Arc::clone(&port));
    let runs = RunStore::new(Arc::clone(&port));
    let planner = demo_planner();
    let plan = planner.generate_plan("Launch").await.unwrap();
    let workflow = workflows.create("Launch", &plan).await.unwrap();

    // Step run pointing at a step the workflow does not have
    let run_id = new_id();
    let run = Run {
        id: run_id.clone(),
        workflow_id: workflow.id.clone(),
        status: RunStatus::Running,
        started_at: chrono::Utc::now(),
        finished_at: None,
        step_runs: vec![StepRun {
            id: new_id(),
            run_id: run_id.clone(),
            step_id: "ghost".to_string(),
            step_order: 0,
            status: StepRunStatus::Pending,
            output: None,
            started_at: None,
            finished_at: None,
        }],
    };
    port.insert_run(&run).await.unwrap();

    let settings = ExecutorSettings { step_delay_ms: 10, ..ExecutorSettings::immediate() };
    let executor =
        RunExecutor::new(workflows.clone(), runs.clone(), planner).with_settings(settings);
    let mut viewer = RunViewer::new(workflows, runs.clone(), run_id.clone())
        .with_poll_interval(Duration::from_millis(100));
    let handle = executor.spawn(&run_id);

    let last = tokio::time::timeout(Duration::from_secs(5), viewer.follow(|_| {}))
        .await
        .expect("viewer stops once the run is closed")
        .unwrap();
    assert!(matches!(last, RunSnapshot::Ready { ref run, .. } if run.status == RunStatus::Failed));

    let err = handle.join().await.unwrap_err();
    assert!(matches!(err, ExecutorError::MissingStep(ref step) if step == "ghost"));

    let stored = runs.get_run_by_id(&run_id).await.unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Failed);
    assert!(stored.finished_at.is_some());
}

// ============================================================================
// Model-backed Tests
// ============================================================================

#[tokio::test]
async fn test_step_failure_fails_run_and_stops() {
    let planner = PlanGenerator::new(Arc::new(AIManager::with_providers(vec![Box::new(Flaky)])));
    let (workflows, runs) = memory_stores();

    let plan = planner.generate_plan("Write three posts").await.unwrap();
    assert_eq!(plan.summary, "Three posts");
    let workflow = workflows.create("Posts", &plan).await.unwrap();

    let executor = RunExecutor::new(workflows, runs.clone(), planner)
        .with_settings(ExecutorSettings::immediate());
    let handle = executor.start(&workflow.id).await.unwrap();
    let run_id = handle.run_id().to_string();
    assert_eq!(handle.join().await.unwrap(), RunStatus::Failed);

    let run = runs.get_run_by_id(&run_id).await.unwrap().unwrap();
    let statuses: Vec<StepRunStatus> = run.step_runs.iter().map(|sr| sr.status).collect();
    assert_eq!(
        statuses,
        vec![StepRunStatus::Completed, StepRunStatus::Failed, StepRunStatus::Pending]
    );
    assert_eq!(run.step_runs[0].output.as_deref(), Some("wrote first"));
    assert!(run.step_runs[1].output.as_deref().unwrap().contains("quota exceeded"));
}

#[tokio::test]
async fn test_absorb_policy_keeps_going() {
    let planner = PlanGenerator::new(Arc::new(AIManager::with_providers(vec![Box::new(Flaky)])));
    let (workflows, runs) = memory_stores();
    let plan = planner.generate_plan("Write three posts").await.unwrap();
    let workflow = workflows.create("Posts", &plan).await.unwrap();

    let settings =
        ExecutorSettings { failure_policy: FailurePolicy::Absorb, ..ExecutorSettings::immediate() };
    let executor = RunExecutor::new(workflows, runs.clone(), planner).with_settings(settings);
    let handle = executor.start(&workflow.id).await.unwrap();
    let run_id = handle.run_id().to_string();
    assert_eq!(handle.join().await.unwrap(), RunStatus::Completed);

    let run = runs.get_run_by_id(&run_id).await.unwrap().unwrap();
    assert_eq!(run.step_runs[1].output.as_deref(), Some("Error executing step."));
    assert_eq!(run.step_runs[2].output.as_deref(), Some("wrote third"));
}

// ============================================================================
// Persistence Tests
// ============================================================================

#[tokio::test]
async fn test_runs_survive_reopening_the_store() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.storage.path = Some(dir.path().join("store.json"));

    let planner = demo_planner();
    let (workflow_id, run_id) = {
        let (workflows, runs) = open_stores(&config).unwrap();
        let plan = planner.generate_plan("Launch").await.unwrap();
        let workflow = workflows.create("Launch", &plan).await.unwrap();

        let executor = RunExecutor::new(workflows, runs, planner.clone())
            .with_settings(ExecutorSettings::immediate());
        let handle = executor.start(&workflow.id).await.unwrap();
        let run_id = handle.run_id().to_string();
        handle.join().await.unwrap();
        (workflow.id, run_id)
    };

    let (workflows, runs) = open_stores(&config).unwrap();
    let workflow = workflows.get_by_id(&workflow_id).await.unwrap().unwrap();
    assert_eq!(workflow.steps[0].title, "Generate Teaser Post");

    let run = runs.get_run_by_id(&run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(runs.list_runs(&workflow_id).await.unwrap().len(), 1);
}
