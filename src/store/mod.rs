//! Workflow and run persistence.
//!
//! Storage is reached through the [`PersistencePort`] trait. Two backends exist:
//!
//! - [`LocalStore`] - a JSON document on disk (or in memory for tests)
//! - [`RemoteStore`] - a hosted PostgREST-style relational backend
//!
//! The backend is picked once, when the stores are opened, and the services on
//! top ([`WorkflowStore`], [`RunStore`]) never branch on which one is in use.

mod events;
mod local;
mod remote;
mod runs;
mod workflows;

pub use events::{RunEvent, RunEvents};
pub use local::LocalStore;
pub use remote::RemoteStore;
pub use runs::RunStore;
pub use workflows::WorkflowStore;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::core::Config;
use crate::workflow::{Run, RunPatch, SentEmail, StepRunPatch, Workflow};

/// Errors from storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("authentication rejected by backend")]
    Unauthorized,

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Backend-agnostic storage interface.
///
/// Updates are unconditional partial merges: the last writer wins. Callers that
/// need stronger guarantees serialize access themselves (see the run executor).
#[async_trait]
pub trait PersistencePort: Send + Sync {
    /// Persist a workflow together with its steps.
    async fn insert_workflow(&self, workflow: &Workflow) -> Result<()>;

    /// Get workflow by id, steps sorted by order.
    async fn get_workflow(&self, id: &str) -> Result<Option<Workflow>>;

    /// List all workflows, newest first.
    async fn list_workflows(&self) -> Result<Vec<Workflow>>;

    /// Persist a run together with all of its step runs.
    async fn insert_run(&self, run: &Run) -> Result<()>;

    /// Get run by id, step runs sorted by step order.
    async fn get_run(&self, id: &str) -> Result<Option<Run>>;

    /// List the runs of a workflow, newest first.
    async fn list_runs(&self, workflow_id: &str) -> Result<Vec<Run>>;

    /// Merge a partial update into a run.
    async fn update_run(&self, id: &str, patch: &RunPatch) -> Result<()>;

    /// Merge a partial update into the step run of `step_id` within `run_id`.
    async fn update_step_run(&self, run_id: &str, step_id: &str, patch: &StepRunPatch)
        -> Result<()>;

    /// Append to the sent email log.
    async fn insert_email(&self, email: &SentEmail) -> Result<()>;

    /// List logged emails, newest first.
    async fn list_emails(&self) -> Result<Vec<SentEmail>>;

    /// Short backend name for logs and status output.
    fn backend_name(&self) -> &str;
}

/// Open the persistence backend described by the configuration.
///
/// Uses the hosted backend when both its URL and key are available, otherwise
/// the local JSON store. The choice is not revisited later.
pub fn open_from_config(config: &Config) -> anyhow::Result<Arc<dyn PersistencePort>> {
    if let Some((url, key)) = config.backend.resolve() {
        tracing::info!(url = %url, "Using hosted backend");
        return Ok(Arc::new(RemoteStore::new(url, key)));
    }

    let path = config
        .storage
        .store_path()
        .ok_or_else(|| anyhow::anyhow!("Could not determine data directory for local store"))?;
    tracing::info!(path = %path.display(), "Using local store");
    Ok(Arc::new(LocalStore::open(path)?))
}

/// Open both stores over the configured backend.
pub fn open_stores(config: &Config) -> anyhow::Result<(WorkflowStore, RunStore)> {
    let port = open_from_config(config)?;
    Ok((WorkflowStore::new(Arc::clone(&port)), RunStore::new(port)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial(backend_env)]
    fn test_open_from_config_uses_local_without_backend() {
        std::env::remove_var("FLOWPILOT_BACKEND_URL");
        std::env::remove_var("FLOWPILOT_BACKEND_KEY");

        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage.path = Some(dir.path().join("store.json"));

        let port = open_from_config(&config).unwrap();
        assert_eq!(port.backend_name(), "local");
    }

    #[test]
    #[serial(backend_env)]
    fn test_open_from_config_uses_remote_with_credentials() {
        std::env::remove_var("FLOWPILOT_BACKEND_URL");
        std::env::remove_var("FLOWPILOT_BACKEND_KEY");

        let mut config = Config::default();
        config.backend.url = Some("https://example.supabase.co".to_string());
        config.backend.key = Some("anon".to_string());

        let port = open_from_config(&config).unwrap();
        assert_eq!(port.backend_name(), "remote");
    }
}
