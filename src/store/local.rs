//! Local JSON store.
//!
//! Keeps every collection in one JSON document guarded by a mutex. Each
//! mutation rewrites the file, so a run and its step runs land in a single
//! write. Without a path the store lives in memory only.
//!
//! The file is re-read when its modification stamp changes, so a second
//! process (`flowpilot watch` next to `flowpilot run`) sees progress.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{PersistencePort, Result, StoreError};
use crate::workflow::{Run, RunPatch, SentEmail, StepRunPatch, Workflow};

/// Current document version.
const STORE_VERSION: u32 = 1;

/// On-disk document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreDocument {
    /// Version for future migrations
    #[serde(default)]
    version: u32,
    #[serde(default)]
    workflows: Vec<Workflow>,
    #[serde(default)]
    runs: Vec<Run>,
    #[serde(default)]
    sent_emails: Vec<SentEmail>,
}

/// Modification time and length of the backing file.
type Stamp = Option<(SystemTime, u64)>;

fn stamp(path: &Path) -> Stamp {
    let meta = fs::metadata(path).ok()?;
    Some((meta.modified().ok()?, meta.len()))
}

#[derive(Debug, Default)]
struct Cached {
    doc: StoreDocument,
    stamp: Stamp,
}

/// JSON file backed store.
#[derive(Debug)]
pub struct LocalStore {
    path: Option<PathBuf>,
    state: Mutex<Cached>,
}

impl LocalStore {
    /// Open a store file, starting empty if it does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let doc = Self::load(&path)?;
        let stamp = stamp(&path);
        Ok(Self { path: Some(path), state: Mutex::new(Cached { doc, stamp }) })
    }

    /// A store that is never written to disk.
    pub fn in_memory() -> Self {
        let doc = StoreDocument { version: STORE_VERSION, ..Default::default() };
        Self { path: None, state: Mutex::new(Cached { doc, stamp: None }) }
    }

    fn load(path: &Path) -> Result<StoreDocument> {
        if !path.exists() {
            return Ok(StoreDocument { version: STORE_VERSION, ..Default::default() });
        }

        let content = fs::read_to_string(path)?;
        if content.trim().is_empty() {
            return Ok(StoreDocument { version: STORE_VERSION, ..Default::default() });
        }
        Ok(serde_json::from_str(&content)?)
    }

    fn save(&self, doc: &StoreDocument) -> Result<()> {
        let Some(ref path) = self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Write then rename so readers never see a half-written file
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(doc)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Reload the document if another writer changed the file.
    fn refresh(&self, cached: &mut Cached) {
        let Some(ref path) = self.path else {
            return;
        };

        let current = stamp(path);
        if current.is_none() || current == cached.stamp {
            return;
        }

        match Self::load(path) {
            Ok(doc) => {
                debug!(path = %path.display(), "Store file changed, reloaded");
                cached.doc = doc;
                cached.stamp = current;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Store file changed but is unreadable");
            }
        }
    }

    fn read<T>(&self, f: impl FnOnce(&StoreDocument) -> T) -> T {
        let mut cached = self.state.lock();
        self.refresh(&mut cached);
        f(&cached.doc)
    }

    /// Apply a mutation and persist it. Nothing is kept if the mutation fails.
    fn mutate<T>(&self, f: impl FnOnce(&mut StoreDocument) -> Result<T>) -> Result<T> {
        let mut cached = self.state.lock();
        self.refresh(&mut cached);

        let mut next = cached.doc.clone();
        let value = f(&mut next)?;
        self.save(&next)?;

        cached.doc = next;
        cached.stamp = self.path.as_deref().and_then(stamp);
        Ok(value)
    }
}

#[async_trait]
impl PersistencePort for LocalStore {
    async fn insert_workflow(&self, workflow: &Workflow) -> Result<()> {
        self.mutate(|doc| {
            doc.workflows.push(workflow.clone());
            Ok(())
        })
    }

    async fn get_workflow(&self, id: &str) -> Result<Option<Workflow>> {
        Ok(self.read(|doc| doc.workflows.iter().find(|w| w.id == id).cloned()).map(|mut w| {
            w.sort_steps();
            w
        }))
    }

    async fn list_workflows(&self) -> Result<Vec<Workflow>> {
        let mut workflows = self.read(|doc| doc.workflows.clone());
        workflows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        for w in &mut workflows {
            w.sort_steps();
        }
        Ok(workflows)
    }

    async fn insert_run(&self, run: &Run) -> Result<()> {
        self.mutate(|doc| {
            doc.runs.push(run.clone());
            Ok(())
        })
    }

    async fn get_run(&self, id: &str) -> Result<Option<Run>> {
        Ok(self.read(|doc| doc.runs.iter().find(|r| r.id == id).cloned()).map(|mut r| {
            r.sort_step_runs();
            r
        }))
    }

    async fn list_runs(&self, workflow_id: &str) -> Result<Vec<Run>> {
        let mut runs: Vec<Run> = self.read(|doc| {
            doc.runs.iter().filter(|r| r.workflow_id == workflow_id).cloned().collect()
        });
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(runs)
    }

    async fn update_run(&self, id: &str, patch: &RunPatch) -> Result<()> {
        self.mutate(|doc| {
            let run = doc
                .runs
                .iter_mut()
                .find(|r| r.id == id)
                .ok_or_else(|| StoreError::NotFound(format!("run {id}")))?;
            patch.apply(run);
            Ok(())
        })
    }

    async fn update_step_run(
        &self,
        run_id: &str,
        step_id: &str,
        patch: &StepRunPatch,
    ) -> Result<()> {
        self.mutate(|doc| {
            let step_run = doc
                .runs
                .iter_mut()
                .find(|r| r.id == run_id)
                .and_then(|r| r.step_runs.iter_mut().find(|sr| sr.step_id == step_id))
                .ok_or_else(|| StoreError::NotFound(format!("step {step_id} of run {run_id}")))?;
            patch.apply(step_run);
            Ok(())
        })
    }

    async fn insert_email(&self, email: &SentEmail) -> Result<()> {
        self.mutate(|doc| {
            doc.sent_emails.push(email.clone());
            Ok(())
        })
    }

    async fn list_emails(&self) -> Result<Vec<SentEmail>> {
        let mut emails = self.read(|doc| doc.sent_emails.clone());
        emails.sort_by(|a, b| b.sent_at.cmp(&a.sent_at));
        Ok(emails)
    }

    fn backend_name(&self) -> &str {
        "local"
    }
}
