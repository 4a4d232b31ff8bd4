//! Core configuration for Flowpilot.

mod config;

pub use config::{
    AiConfig, BackendConfig, Config, ExecutorSettings, FailurePolicy, OllamaConfig, StorageConfig,
};
