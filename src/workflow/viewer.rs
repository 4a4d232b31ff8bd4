//! Live view of a single run.
//!
//! The viewer re-fetches the run whenever the run store publishes a change
//! for it, and on a fixed poll interval otherwise. Polling is what picks up
//! writes made by other processes against a shared backend.

use std::fmt::Write as _;
use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tracing::debug;

use super::model::{Run, Workflow};
use crate::store::{Result, RunEvent, RunStore, WorkflowStore};

/// What the viewer currently knows about the run.
#[derive(Debug, Clone, PartialEq)]
pub enum RunSnapshot {
    /// The run or its workflow cannot be read yet
    Loading,
    Ready { workflow: Workflow, run: Run },
}

impl RunSnapshot {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ready { run, .. } if run.status.is_terminal())
    }

    pub fn run(&self) -> Option<&Run> {
        match self {
            Self::Ready { run, .. } => Some(run),
            Self::Loading => None,
        }
    }
}

/// Watches one run through the run store.
pub struct RunViewer {
    workflows: WorkflowStore,
    runs: RunStore,
    run_id: String,
    events: Option<broadcast::Receiver<RunEvent>>,
    poll_interval: Duration,
    fetched: bool,
}

impl RunViewer {
    pub fn new(workflows: WorkflowStore, runs: RunStore, run_id: impl Into<String>) -> Self {
        let events = Some(runs.events().subscribe());
        Self {
            workflows,
            runs,
            run_id: run_id.into(),
            events,
            poll_interval: Duration::from_secs(1),
            fetched: false,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Fetch the current state without waiting.
    pub async fn snapshot(&self) -> Result<RunSnapshot> {
        let Some(run) = self.runs.get_run_by_id(&self.run_id).await? else {
            return Ok(RunSnapshot::Loading);
        };
        let Some(workflow) = self.workflows.get_by_id(&run.workflow_id).await? else {
            return Ok(RunSnapshot::Loading);
        };
        Ok(RunSnapshot::Ready { workflow, run })
    }

    /// Wait for a change to the run, or the poll interval, then fetch.
    ///
    /// The first call returns immediately.
    pub async fn next_snapshot(&mut self) -> Result<RunSnapshot> {
        if self.fetched {
            self.wait_for_change().await;
        }
        self.fetched = true;
        self.snapshot().await
    }

    async fn wait_for_change(&mut self) {
        let deadline = tokio::time::sleep(self.poll_interval);
        tokio::pin!(deadline);

        loop {
            let Some(events) = self.events.as_mut() else {
                deadline.as_mut().await;
                return;
            };

            let closed = tokio::select! {
                () = &mut deadline => return,
                received = events.recv() => match received {
                    Ok(event) if event.run_id() == self.run_id => return,
                    Ok(_) => false,
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Viewer lagged behind run events");
                        return;
                    }
                    Err(RecvError::Closed) => true,
                },
            };

            if closed {
                debug!("Run event channel closed, polling only");
                self.events = None;
            }
        }
    }

    /// Call `on_snapshot` for every snapshot until the run is terminal.
    pub async fn follow<F>(&mut self, mut on_snapshot: F) -> Result<RunSnapshot>
    where
        F: FnMut(&RunSnapshot),
    {
        loop {
            let snapshot = self.next_snapshot().await?;
            on_snapshot(&snapshot);
            if snapshot.is_terminal() {
                return Ok(snapshot);
            }
        }
    }
}

/// Render a snapshot as a status table followed by the step log.
pub fn render(snapshot: &RunSnapshot) -> String {
    let (workflow, run) = match snapshot {
        RunSnapshot::Loading => return "Loading run...\n".to_string(),
        RunSnapshot::Ready { workflow, run } => (workflow, run),
    };

    let mut out = String::new();
    let (done, total) = run.progress();
    let _ = writeln!(out, "{}", workflow.name);
    let _ = writeln!(out, "Run {}  [{}]  {}/{} steps", run.id, run.status, done, total);
    let _ = writeln!(out);
    let _ = writeln!(out, "  {:<3} {:<32} {:<18} {}", "#", "STEP", "TYPE", "STATUS");

    for step_run in &run.step_runs {
        let (title, kind) = workflow
            .step(&step_run.step_id)
            .map(|s| (s.title.as_str(), s.step_type.as_str()))
            .unwrap_or(("(unknown step)", "-"));
        let _ = writeln!(
            out,
            "  {:<3} {:<32} {:<18} {}",
            step_run.step_order + 1,
            truncate(title, 32),
            kind,
            step_run.status
        );
    }

    let logged: Vec<_> = run.step_runs.iter().filter(|sr| sr.output.is_some()).collect();
    if !logged.is_empty() {
        let _ = writeln!(out);
        for step_run in logged {
            let title =
                workflow.step(&step_run.step_id).map_or("(unknown step)", |s| s.title.as_str());
            let output = step_run.output.as_deref().unwrap_or_default();
            let _ = writeln!(out, "[{}] {}: {}", step_run.status, title, output);
        }
    }

    out
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let mut t: String = s.chars().take(max.saturating_sub(3)).collect();
        t.push_str("...");
        t
    }
}
