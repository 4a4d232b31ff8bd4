//! Plan generation and step content.
//!
//! Turns a free-text goal into a [`Plan`] with a single model call, and
//! produces the text for content and email steps while a run executes.
//!
//! Plans are not reproducible: the same goal can yield a different plan on
//! every call. Only the demo plan, used when no model is configured, is fixed.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::model::{Plan, PlannedStep, StepType};
use crate::ai::{parse_json, AIManager, GenerateOptions};

/// Errors from plan and step content generation.
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("goal must not be empty")]
    EmptyGoal,

    #[error("generation failed: {0}")]
    Generation(String),

    #[error("invalid model response: {0}")]
    InvalidResponse(String),
}

/// Subject and body drafted for a `send_email` step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailDraft {
    pub subject: String,
    pub body: String,
}

/// Plan generator backed by the AI provider chain.
#[derive(Debug, Clone)]
pub struct PlanGenerator {
    ai: Arc<AIManager>,
    demo_delay: Duration,
}

impl PlanGenerator {
    /// Create a new plan generator.
    pub fn new(ai: Arc<AIManager>) -> Self {
        Self { ai, demo_delay: Duration::from_millis(1500) }
    }

    /// Set the artificial delay of demo answers.
    pub fn with_demo_delay(mut self, delay: Duration) -> Self {
        self.demo_delay = delay;
        self
    }

    /// Whether answers come from the built-in demo data.
    pub fn is_demo(&self) -> bool {
        !self.ai.is_available()
    }

    /// Generate a plan for a goal.
    ///
    /// Without a model this returns [`PlanGenerator::fallback_plan`] after the
    /// demo delay. Failures are not retried; callers report them and let the
    /// user resubmit.
    pub async fn generate_plan(&self, goal: &str) -> Result<Plan, PlanError> {
        let goal = goal.trim();
        if goal.is_empty() {
            return Err(PlanError::EmptyGoal);
        }

        if self.is_demo() {
            warn!("No AI provider configured, returning demo plan");
            tokio::time::sleep(self.demo_delay).await;
            return Ok(Self::fallback_plan());
        }

        let raw = self
            .ai
            .generate(&build_plan_prompt(goal), GenerateOptions::json())
            .await
            .map_err(|e| PlanError::Generation(e.to_string()))?;
        debug!(chars = raw.len(), "Plan response received");

        parse_plan(&raw)
    }

    /// Generate the text of a content step.
    pub async fn generate_step_content(
        &self,
        prompt: &str,
        context: Option<&Value>,
    ) -> Result<String, PlanError> {
        if self.is_demo() {
            tokio::time::sleep(self.demo_delay).await;
            return Ok(format!("[Demo] Generated content for: {}", prompt.trim()));
        }

        let mut full = prompt.trim().to_string();
        if let Some(context) = context.filter(|c| !c.is_null()) {
            let context = serde_json::to_string_pretty(context)
                .map_err(|e| PlanError::Generation(e.to_string()))?;
            full.push_str("\n\nContext:\n");
            full.push_str(&context);
        }

        self.ai
            .generate(&full, GenerateOptions::text())
            .await
            .map_err(|e| PlanError::Generation(e.to_string()))
    }

    /// Draft an email subject and body from a step prompt.
    pub async fn draft_email(&self, prompt: &str) -> Result<EmailDraft, PlanError> {
        if self.is_demo() {
            tokio::time::sleep(self.demo_delay).await;
            return Ok(EmailDraft {
                subject: "It's here: our launch is live!".to_string(),
                body: format!(
                    "Hi there,\n\nThe wait is over. {}\n\nThanks for being part of the journey!",
                    prompt.trim()
                ),
            });
        }

        let request = format!(
            r#"Draft a marketing email from these instructions:
{}

Return JSON only, shaped as {{"subject": "...", "body": "..."}}."#,
            prompt.trim()
        );

        let raw = self
            .ai
            .generate(&request, GenerateOptions::json())
            .await
            .map_err(|e| PlanError::Generation(e.to_string()))?;

        parse_json(&raw).map_err(|e| PlanError::InvalidResponse(e.to_string()))
    }

    /// The fixed plan returned in demo mode.
    pub fn fallback_plan() -> Plan {
        Plan {
            summary: "A simplified launch campaign to build awareness and drive early sales."
                .to_string(),
            steps: vec![
                PlannedStep::new("Generate Teaser Post", StepType::GenerateContent)
                    .with_description("Create an engaging social post to build anticipation.")
                    .with_prompt(
                        "Write a short, exciting teaser post announcing an upcoming launch. \
                         Keep it under 280 characters.",
                    ),
                PlannedStep::new("Wait for Engagement", StepType::Wait)
                    .with_description("Give the audience time to react before launching."),
                PlannedStep::new("Send Launch Email", StepType::SendEmail)
                    .with_description("Email subscribers with the launch announcement.")
                    .with_prompt(
                        "Write a launch announcement email for subscribers with a clear call to action.",
                    ),
                PlannedStep::new("Update CRM Contacts", StepType::UpdateCrm)
                    .with_description("Tag engaged contacts as launch leads.")
                    .with_prompt("Tag contacts who engaged with the launch as warm leads."),
            ],
        }
    }
}

fn build_plan_prompt(goal: &str) -> String {
    format!(
        r#"You are a workflow copilot for independent creators.
Break the user's goal into a short sequence of automatable steps.

Goal: {goal}

Allowed step types:
- generate_content: write copy (posts, captions, scripts)
- send_email: email the audience
- wait: pause before the next step
- update_crm: tag or update contacts

Return JSON only, shaped as:
{{"summary": "one sentence", "steps": [{{"title": "...", "type": "generate_content", "description": "...", "prompt": "instructions for the model"}}]}}"#
    )
}

/// Parse a plan out of a model response.
///
/// A bare array is accepted as the step list.
fn parse_plan(raw: &str) -> Result<Plan, PlanError> {
    let value: Value = parse_json(raw).map_err(|e| PlanError::InvalidResponse(e.to_string()))?;

    let plan = match value {
        Value::Array(_) => Plan {
            summary: String::new(),
            steps: serde_json::from_value(value)
                .map_err(|e| PlanError::InvalidResponse(e.to_string()))?,
        },
        Value::Object(_) => serde_json::from_value(value)
            .map_err(|e| PlanError::InvalidResponse(e.to_string()))?,
        _ => return Err(PlanError::InvalidResponse("expected an object or array".to_string())),
    };

    Ok(plan)
}
