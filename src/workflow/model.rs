//! Workflow, run, and plan data types.
//!
//! These types are shared by the planner, the stores, and the executor.
//! Statuses only ever move forward: a step run that reached `completed`
//! or `failed` never goes back to `pending`.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of work a step performs.
///
/// Unknown type strings fall back to [`StepType::GenerateContent`], which is
/// also the executor's catch-all branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", from = "String")]
pub enum StepType {
    /// Ask the model for a piece of content
    GenerateContent,
    /// Draft an email with the model and log it as sent
    SendEmail,
    /// Pause the workflow
    Wait,
    /// Acknowledge a CRM update
    UpdateCrm,
}

impl StepType {
    /// Parse a type string, tolerating the loose spellings models produce.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().replace(['-', ' '], "_").as_str() {
            "send_email" | "email" => Self::SendEmail,
            "wait" | "delay" => Self::Wait,
            "update_crm" | "crm" => Self::UpdateCrm,
            _ => Self::GenerateContent,
        }
    }

    /// Wire name of the type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GenerateContent => "generate_content",
            Self::SendEmail => "send_email",
            Self::Wait => "wait",
            Self::UpdateCrm => "update_crm",
        }
    }
}

impl From<String> for StepType {
    fn from(s: String) -> Self {
        Self::parse(&s)
    }
}

impl Default for StepType {
    fn default() -> Self {
        Self::GenerateContent
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A step proposed by the planner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedStep {
    pub title: String,
    #[serde(rename = "type", default)]
    pub step_type: StepType,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub prompt: String,
}

impl PlannedStep {
    pub fn new(title: impl Into<String>, step_type: StepType) -> Self {
        Self {
            title: title.into(),
            step_type,
            description: String::new(),
            prompt: String::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }
}

/// An ephemeral plan for a goal. Never persisted on its own.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub steps: Vec<PlannedStep>,
}

/// Workflow lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Active,
    Archived,
}

impl Default for WorkflowStatus {
    fn default() -> Self {
        Self::Active
    }
}

/// One typed unit of work within a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub workflow_id: String,
    /// Execution position, unique within the workflow
    pub order: u32,
    #[serde(rename = "type")]
    pub step_type: StepType,
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Free-form configuration, the planner's prompt lives under `prompt`
    #[serde(default)]
    pub config: serde_json::Value,
}

impl Step {
    /// Prompt template stored in the step configuration.
    pub fn prompt(&self) -> &str {
        self.config.get("prompt").and_then(|p| p.as_str()).unwrap_or("")
    }

    /// Look up a string value in the step configuration.
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(|v| v.as_str())
    }
}

/// A persisted, named, ordered list of steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: WorkflowStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl Workflow {
    /// Find a step by id.
    pub fn step(&self, step_id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    /// Sort steps by their `order` column.
    pub fn sort_steps(&mut self) {
        self.steps.sort_by_key(|s| s.order);
    }
}

/// Status of a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Whether the run can no longer make progress.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepRunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl StepRunStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Forward-only transition check.
    pub fn can_transition_to(&self, next: Self) -> bool {
        match (self, next) {
            (Self::Pending, Self::Running) => true,
            (Self::Running, Self::Completed | Self::Failed) => true,
            (a, b) => *a == b,
        }
    }
}

impl fmt::Display for StepRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-run status record for one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRun {
    pub id: String,
    pub run_id: String,
    pub step_id: String,
    /// Copy of the step's order, used to sort rows coming back from a backend
    pub step_order: u32,
    pub status: StepRunStatus,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

/// One execution attempt of a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub workflow_id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub step_runs: Vec<StepRun>,
}

impl Run {
    /// First pending step run in step order.
    pub fn next_pending(&self) -> Option<&StepRun> {
        self.step_runs
            .iter()
            .filter(|sr| sr.status == StepRunStatus::Pending)
            .min_by_key(|sr| sr.step_order)
    }

    pub fn step_run(&self, step_id: &str) -> Option<&StepRun> {
        self.step_runs.iter().find(|sr| sr.step_id == step_id)
    }

    pub fn all_completed(&self) -> bool {
        self.step_runs.iter().all(|sr| sr.status == StepRunStatus::Completed)
    }

    /// Progress as (finished, total).
    pub fn progress(&self) -> (usize, usize) {
        let done = self.step_runs.iter().filter(|sr| sr.status.is_finished()).count();
        (done, self.step_runs.len())
    }

    pub fn sort_step_runs(&mut self) {
        self.step_runs.sort_by_key(|sr| sr.step_order);
    }
}

/// Partial update for a run. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<RunStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunPatch {
    pub fn finish(status: RunStatus) -> Self {
        Self { status: Some(status), finished_at: Some(Utc::now()) }
    }

    pub fn apply(&self, run: &mut Run) {
        if let Some(status) = self.status {
            run.status = status;
        }
        if let Some(finished_at) = self.finished_at {
            run.finished_at = Some(finished_at);
        }
    }
}

/// Partial update for a step run. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StepRunPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<StepRunStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepRunPatch {
    pub fn start() -> Self {
        Self {
            status: Some(StepRunStatus::Running),
            started_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    pub fn finish(status: StepRunStatus, output: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            output: Some(output.into()),
            finished_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    pub fn apply(&self, step_run: &mut StepRun) {
        if let Some(status) = self.status {
            step_run.status = status;
        }
        if let Some(ref output) = self.output {
            step_run.output = Some(output.clone());
        }
        if let Some(started_at) = self.started_at {
            step_run.started_at = Some(started_at);
        }
        if let Some(finished_at) = self.finished_at {
            step_run.finished_at = Some(finished_at);
        }
    }
}

/// A logged email produced by a `send_email` step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentEmail {
    pub id: String,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub step_id: Option<String>,
    pub recipient: String,
    pub subject: String,
    pub body: String,
    pub sent_at: DateTime<Utc>,
}

/// Generate a fresh record id.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_type_parse_tolerates_loose_names() {
        assert_eq!(StepType::parse("send_email"), StepType::SendEmail);
        assert_eq!(StepType::parse("Send Email"), StepType::SendEmail);
        assert_eq!(StepType::parse("update-crm"), StepType::UpdateCrm);
        assert_eq!(StepType::parse("wait"), StepType::Wait);
        assert_eq!(StepType::parse("write_blog_post"), StepType::GenerateContent);
    }

    #[test]
    fn test_planned_step_deserializes_unknown_type() {
        let step: PlannedStep =
            serde_json::from_str(r#"{"title":"Tweet","type":"social_post"}"#).unwrap();
        assert_eq!(step.step_type, StepType::GenerateContent);
        assert!(step.prompt.is_empty());
    }

    #[test]
    fn test_step_type_serializes_snake_case() {
        let json = serde_json::to_string(&StepType::UpdateCrm).unwrap();
        assert_eq!(json, "\"update_crm\"");
    }

    #[test]
    fn test_step_run_status_transitions() {
        use StepRunStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Pending));
        assert!(!Failed.can_transition_to(Running));
    }

    #[test]
    fn test_next_pending_uses_step_order() {
        let make = |order: u32, status| StepRun {
            id: format!("sr{order}"),
            run_id: "r".to_string(),
            step_id: format!("s{order}"),
            step_order: order,
            status,
            output: None,
            started_at: None,
            finished_at: None,
        };
        let run = Run {
            id: "r".to_string(),
            workflow_id: "w".to_string(),
            status: RunStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            step_runs: vec![
                make(2, StepRunStatus::Pending),
                make(0, StepRunStatus::Completed),
                make(1, StepRunStatus::Pending),
            ],
        };

        assert_eq!(run.next_pending().map(|sr| sr.step_order), Some(1));
        assert_eq!(run.progress(), (1, 3));
        assert!(!run.all_completed());
    }

    #[test]
    fn test_patch_leaves_unset_fields() {
        let mut sr = StepRun {
            id: "sr".to_string(),
            run_id: "r".to_string(),
            step_id: "s".to_string(),
            step_order: 0,
            status: StepRunStatus::Running,
            output: None,
            started_at: Some(Utc::now()),
            finished_at: None,
        };
        let started = sr.started_at;

        StepRunPatch::finish(StepRunStatus::Completed, "done").apply(&mut sr);

        assert_eq!(sr.status, StepRunStatus::Completed);
        assert_eq!(sr.output.as_deref(), Some("done"));
        assert_eq!(sr.started_at, started);
        assert!(sr.finished_at.is_some());
    }
}
