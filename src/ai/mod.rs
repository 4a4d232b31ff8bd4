//! AI integration module.
//!
//! Provides generative text completion for the planner and the step executor.
//!
//! ## Providers
//!
//! - Gemini (`GEMINI_API_KEY`)
//! - Claude (`ANTHROPIC_API_KEY`)
//! - Ollama (local, only when selected in config)
//!
//! When no provider is configured the manager is empty and callers fall back
//! to their demo behaviour instead of failing.

mod claude;
mod gemini;
pub mod json;
mod ollama;

pub use claude::ClaudeProvider;
pub use gemini::GeminiProvider;
pub use json::{extract_json, parse_json};
pub use ollama::OllamaProvider;

use async_trait::async_trait;

use crate::core::AiConfig;

/// Options for a single completion request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GenerateOptions {
    /// Ask the provider to answer with JSON only
    pub json_mode: bool,
}

impl GenerateOptions {
    pub fn text() -> Self {
        Self { json_mode: false }
    }

    pub fn json() -> Self {
        Self { json_mode: true }
    }
}

/// Trait for AI providers.
#[async_trait]
pub trait AIProvider: Send + Sync {
    /// Complete a prompt.
    async fn generate(&self, prompt: &str, options: GenerateOptions) -> anyhow::Result<String>;

    /// Get the provider name.
    fn name(&self) -> &str;

    /// Check if the provider is available.
    async fn is_available(&self) -> bool;
}

/// AI error types.
#[derive(Debug, thiserror::Error)]
pub enum AIError {
    #[error("Provider not available: {0}")]
    ProviderNotAvailable(String),

    #[error("API error: {0}")]
    ApiError(String),

    #[error("Rate limited, retry after {0}s")]
    RateLimited(u64),

    #[error("No response from AI")]
    NoResponse,

    #[error("Invalid JSON in response: {0}")]
    InvalidJson(String),
}

/// AI provider manager with fallback support.
///
/// Providers are tried in order. The chain is fixed at construction time and
/// never re-probed mid-session.
pub struct AIManager {
    providers: Vec<Box<dyn AIProvider>>,
}

impl AIManager {
    /// Build the provider chain from configuration and credentials in the environment.
    ///
    /// The configured provider goes first, other providers with credentials follow
    /// as fallbacks. Ollama is only used when explicitly selected.
    pub fn from_config(config: &AiConfig) -> Self {
        if !config.enabled {
            return Self::demo();
        }

        let mut providers: Vec<Box<dyn AIProvider>> = Vec::new();

        match config.provider.as_str() {
            "ollama" => {
                let mut ollama = OllamaProvider::new()
                    .with_base_url(&config.ollama.base_url)
                    .with_model(&config.ollama.model);
                if let Some(ref model) = config.model {
                    ollama = ollama.with_model(model);
                }
                providers.push(Box::new(ollama));
            }
            "claude" => {
                if let Some(claude) = ClaudeProvider::from_env() {
                    providers.push(Box::new(match config.model {
                        Some(ref model) => claude.with_model(model),
                        None => claude,
                    }));
                }
            }
            _ => {
                if let Some(gemini) = GeminiProvider::from_env() {
                    providers.push(Box::new(match config.model {
                        Some(ref model) => gemini.with_model(model),
                        None => gemini,
                    }));
                }
            }
        }

        // Fallbacks use their default models
        if config.provider != "gemini" {
            if let Some(gemini) = GeminiProvider::from_env() {
                providers.push(Box::new(gemini));
            }
        }
        if config.provider != "claude" {
            if let Some(claude) = ClaudeProvider::from_env() {
                providers.push(Box::new(claude));
            }
        }

        if providers.is_empty() {
            tracing::warn!("No AI credentials configured, running in demo mode");
        }

        Self { providers }
    }

    /// A manager without providers. Every caller takes its demo path.
    pub fn demo() -> Self {
        Self { providers: Vec::new() }
    }

    /// Create with an explicit provider chain.
    pub fn with_providers(providers: Vec<Box<dyn AIProvider>>) -> Self {
        Self { providers }
    }

    /// Check if any AI provider is available.
    pub fn is_available(&self) -> bool {
        !self.providers.is_empty()
    }

    /// Get the active provider name.
    pub fn active_provider(&self) -> Option<&str> {
        self.providers.first().map(|p| p.name())
    }

    /// Probe every provider in the chain, in order.
    pub async fn provider_status(&self) -> Vec<(String, bool)> {
        let mut status = Vec::with_capacity(self.providers.len());
        for provider in &self.providers {
            status.push((provider.name().to_string(), provider.is_available().await));
        }
        status
    }

    /// Complete a prompt with the first provider that answers.
    pub async fn generate(&self, prompt: &str, options: GenerateOptions) -> anyhow::Result<String> {
        let mut last_error = None;

        for provider in &self.providers {
            match provider.generate(prompt, options).await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    tracing::warn!(provider = provider.name(), error = %e, "Provider failed, trying next");
                    last_error = Some(e);
                }
            }
        }

        // Surface the last failure rather than a generic one
        Err(last_error.unwrap_or_else(|| {
            AIError::ProviderNotAvailable("No AI provider available".to_string()).into()
        }))
    }
}

impl Default for AIManager {
    fn default() -> Self {
        Self::demo()
    }
}

impl std::fmt::Debug for AIManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AIManager")
            .field("providers", &self.providers.iter().map(|p| p.name()).collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Failing;

    #[async_trait]
    impl AIProvider for Failing {
        async fn generate(&self, _prompt: &str, _options: GenerateOptions) -> anyhow::Result<String> {
            Err(AIError::RateLimited(30).into())
        }

        fn name(&self) -> &str {
            "failing"
        }

        async fn is_available(&self) -> bool {
            true
        }
    }

    struct Echo;

    #[async_trait]
    impl AIProvider for Echo {
        async fn generate(&self, prompt: &str, options: GenerateOptions) -> anyhow::Result<String> {
            Ok(format!("{}:{prompt}", if options.json_mode { "json" } else { "text" }))
        }

        fn name(&self) -> &str {
            "echo"
        }

        async fn is_available(&self) -> bool {
            true
        }
    }

    #[test]
    fn test_demo_manager_has_no_provider() {
        let manager = AIManager::demo();
        assert!(!manager.is_available());
        assert_eq!(manager.active_provider(), None);
    }

    #[test]
    fn test_disabled_config_is_demo() {
        let config = AiConfig { enabled: false, ..Default::default() };
        assert!(!AIManager::from_config(&config).is_available());
    }

    #[tokio::test]
    async fn test_manager_falls_back_to_next_provider() {
        let manager = AIManager::with_providers(vec![Box::new(Failing), Box::new(Echo)]);
        assert_eq!(manager.active_provider(), Some("failing"));

        let out = manager.generate("hi", GenerateOptions::json()).await.unwrap();
        assert_eq!(out, "json:hi");
    }

    struct Offline;

    #[async_trait]
    impl AIProvider for Offline {
        async fn generate(&self, _prompt: &str, _options: GenerateOptions) -> anyhow::Result<String> {
            anyhow::bail!("connection refused")
        }

        fn name(&self) -> &str {
            "offline"
        }

        async fn is_available(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn test_provider_status_probes_chain_in_order() {
        let manager = AIManager::with_providers(vec![Box::new(Offline), Box::new(Echo)]);
        assert_eq!(manager.active_provider(), Some("offline"));

        let status = manager.provider_status().await;
        assert_eq!(status, vec![("offline".to_string(), false), ("echo".to_string(), true)]);
        assert!(AIManager::demo().provider_status().await.is_empty());
    }

    #[tokio::test]
    async fn test_last_provider_error_is_returned() {
        let manager = AIManager::with_providers(vec![Box::new(Failing)]);
        let err = manager.generate("hi", GenerateOptions::text()).await.unwrap_err();
        assert!(err.to_string().contains("Rate limited"));
    }

    #[tokio::test]
    async fn test_empty_manager_errors() {
        let manager = AIManager::demo();
        let err = manager.generate("hi", GenerateOptions::text()).await.unwrap_err();
        assert!(err.to_string().contains("No AI provider"));
    }
}
