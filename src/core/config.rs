//! Configuration management for Flowpilot.
//!
//! Handles loading and saving configuration from TOML files. Credentials for
//! the model providers and the hosted backend may also come from the environment.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// AI settings
    pub ai: AiConfig,

    /// Hosted relational backend
    pub backend: BackendConfig,

    /// Local storage settings
    pub storage: StorageConfig,

    /// Run executor settings
    pub executor: ExecutorSettings,
}

/// AI integration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AiConfig {
    /// Whether AI features are enabled
    pub enabled: bool,

    /// Preferred AI provider (gemini, claude, ollama)
    pub provider: String,

    /// Model to use with the preferred provider
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Ollama-specific settings
    pub ollama: OllamaConfig,
}

/// Ollama configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OllamaConfig {
    /// Ollama server URL
    pub base_url: String,

    /// Model to use
    pub model: String,
}

/// Hosted backend settings.
///
/// Both `url` and `key` must be present for the remote store to be used.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Project URL, e.g. `https://xyz.supabase.co`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Anonymous or service API key
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl BackendConfig {
    /// Resolve credentials, letting the environment override the file.
    pub fn resolve(&self) -> Option<(String, String)> {
        let url = std::env::var("FLOWPILOT_BACKEND_URL").ok().or_else(|| self.url.clone());
        let key = std::env::var("FLOWPILOT_BACKEND_KEY").ok().or_else(|| self.key.clone());

        match (url, key) {
            (Some(url), Some(key)) if !url.trim().is_empty() && !key.trim().is_empty() => {
                Some((url.trim_end_matches('/').to_string(), key))
            }
            _ => None,
        }
    }
}

/// Local storage settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path of the JSON store file (defaults to the data directory)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl StorageConfig {
    /// Resolved store file path.
    pub fn store_path(&self) -> Option<PathBuf> {
        self.path.clone().or_else(|| Config::data_dir().map(|d| d.join("store.json")))
    }
}

/// What to do when a step fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Mark the step and the run as failed
    FailRun,
    /// Complete the step with a generic error output and keep going
    Absorb,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self::FailRun
    }
}

/// Run executor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSettings {
    /// Pause between steps, in milliseconds
    pub step_delay_ms: u64,

    /// Artificial delay of demo-mode answers, in milliseconds
    pub demo_delay_ms: u64,

    /// How often the run viewer re-fetches without a change event
    pub poll_interval_ms: u64,

    /// Step failure handling
    pub failure_policy: FailurePolicy,
}

impl ExecutorSettings {
    pub fn step_delay(&self) -> Duration {
        Duration::from_millis(self.step_delay_ms)
    }

    pub fn demo_delay(&self) -> Duration {
        Duration::from_millis(self.demo_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(50))
    }

    /// Settings without artificial delays.
    pub fn immediate() -> Self {
        Self { step_delay_ms: 0, demo_delay_ms: 0, poll_interval_ms: 50, ..Self::default() }
    }
}

impl Config {
    /// Load configuration from file.
    ///
    /// Looks for `.flowpilot.toml` in the current directory, then the global
    /// config directory, and falls back to defaults.
    pub fn load() -> anyhow::Result<Self> {
        // Try local config first
        let local_config = PathBuf::from(".flowpilot.toml");
        if local_config.exists() {
            return Self::load_from_file(&local_config);
        }

        // Try global config
        if let Some(global_config) = Self::config_path() {
            if global_config.exists() {
                return Self::load_from_file(&global_config);
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Get the global config file path.
    pub fn config_path() -> Option<PathBuf> {
        Self::config_dir().map(|d| d.join("config.toml"))
    }

    /// Get the config directory path.
    pub fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("flowpilot"))
    }

    /// Get the data directory path.
    pub fn data_dir() -> Option<PathBuf> {
        dirs::data_dir().map(|d| d.join("flowpilot"))
    }
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            provider: "gemini".to_string(),
            model: None,
            ollama: OllamaConfig::default(),
        }
    }
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self { base_url: "http://localhost:11434".to_string(), model: "llama3.2".to_string() }
    }
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            step_delay_ms: 800,
            demo_delay_ms: 1500,
            poll_interval_ms: 1000,
            failure_policy: FailurePolicy::FailRun,
        }
    }
}
