//! Change notifications for runs.

use tokio::sync::broadcast;
use tracing::debug;

use crate::workflow::{RunStatus, StepRunStatus};

/// A change to a run or one of its step runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    Created { run_id: String },
    RunUpdated { run_id: String, status: Option<RunStatus> },
    StepRunUpdated { run_id: String, step_id: String, status: Option<StepRunStatus> },
}

impl RunEvent {
    pub fn run_id(&self) -> &str {
        match self {
            Self::Created { run_id }
            | Self::RunUpdated { run_id, .. }
            | Self::StepRunUpdated { run_id, .. } => run_id,
        }
    }
}

/// Broadcast channel for run events.
///
/// Publishing never fails: with no subscribers the event is dropped.
#[derive(Debug, Clone)]
pub struct RunEvents {
    tx: broadcast::Sender<RunEvent>,
}

impl RunEvents {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    /// Create a new subscription to events.
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.tx.subscribe()
    }

    /// Publish an event to current subscribers.
    pub fn publish(&self, event: RunEvent) {
        if self.tx.receiver_count() == 0 {
            return;
        }
        if let Ok(n) = self.tx.send(event) {
            debug!(receivers = n, "Run event published");
        }
    }
}

impl Default for RunEvents {
    fn default() -> Self {
        Self::new()
    }
}
