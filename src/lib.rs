//! # Flowpilot
//!
//! Workflow copilot for creators - describe a goal, get an AI-drafted plan,
//! save it as a workflow and run it step by step.
//!
//! ## Features
//!
//! - **Planning**: One model call turns a goal into ordered, typed steps
//! - **Demo Mode**: Works without any API key using a built-in launch plan
//! - **Runs**: Sequential execution with per-step status and output
//! - **Storage**: Local JSON file or a hosted PostgREST-style backend
//!
//! ## Quick Start
//!
//! ```bash
//! # Draft a plan and save it as a workflow
//! flowpilot create "Launch my ebook" --name "Ebook launch" --yes
//!
//! # Run it and follow progress
//! flowpilot run <workflow-id>
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
// Allow common patterns that are intentional in this codebase
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::similar_names)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::manual_let_else)]
#![allow(clippy::derivable_impls)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::significant_drop_tightening)]
#![allow(clippy::map_unwrap_or)]
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::redundant_closure_for_method_calls)]
#![allow(clippy::cast_possible_truncation)]

pub mod ai;
pub mod core;
pub mod store;
pub mod workflow;

// Re-export commonly used types
pub use ai::{AIManager, AIProvider, GenerateOptions};
pub use core::{Config, ExecutorSettings, FailurePolicy};
pub use store::{open_stores, PersistencePort, RunStore, StoreError, WorkflowStore};
pub use workflow::{
    Plan, PlanGenerator, Run, RunExecutor, RunStatus, RunViewer, StepRunStatus, StepType, Workflow,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "flowpilot";
