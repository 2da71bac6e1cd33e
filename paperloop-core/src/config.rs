//! Configuration system for paperloop.
//!
//! Uses `figment` for layered configuration: defaults -> config file -> environment -> CLI args.
//! Configuration is loaded from `~/.config/paperloop/config.toml` and/or
//! `.paperloop/config.toml` in the workspace directory.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::retry::RetryPolicy;
use crate::types::MAX_RESULTS_LIMIT;

/// Top-level configuration for paperloop.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PaperloopConfig {
    pub llm: LlmConfig,
    pub arxiv: ArxivConfig,
    pub workflow: WorkflowConfig,
    pub retry: RetryConfig,
    pub gateway: GatewayConfig,
}

/// Configuration for the LLM provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Provider name. Only OpenAI-compatible endpoints are supported.
    pub provider: String,
    /// Model identifier (e.g., "gpt-4o-mini").
    pub model: String,
    /// Environment variable name containing the API key.
    pub api_key_env: String,
    /// Inline API key. Never written back to disk.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    /// Optional base URL override for the API endpoint.
    pub base_url: Option<String>,
    /// Sampling temperature for every research call.
    pub temperature: f32,
    /// Token limit for paper analysis, continuation, and follow-up queries.
    pub max_tokens: u32,
    /// Token limit for the final report.
    pub synthesis_max_tokens: u32,
    /// Ask the endpoint for a JSON object response.
    pub json_output: bool,
    /// Per-request timeout.
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            api_key: None,
            base_url: None,
            temperature: 0.1,
            max_tokens: 2000,
            synthesis_max_tokens: 3000,
            json_output: true,
            timeout_secs: 120,
        }
    }
}

/// Configuration for the arXiv fetcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArxivConfig {
    /// Query endpoint of the arXiv export API.
    pub base_url: String,
    /// User-Agent sent with every request.
    pub user_agent: String,
    /// Minimum spacing between any two outbound requests in this process.
    pub min_interval_ms: u64,
    /// Retries after a 429 or 503 before giving up.
    pub max_retries: u32,
    /// Backoff base; retry `n` (0-based) waits `backoff_base_ms * 2^n`.
    pub backoff_base_ms: u64,
    /// Whole-request timeout.
    pub timeout_secs: u64,
    /// TCP connect timeout.
    pub connect_timeout_secs: u64,
}

impl Default for ArxivConfig {
    fn default() -> Self {
        Self {
            base_url: "https://export.arxiv.org/api/query".to_string(),
            user_agent: format!(
                "paperloop/{} (+https://github.com/DevJadhav/paperloop)",
                env!("CARGO_PKG_VERSION")
            ),
            min_interval_ms: 3_000,
            max_retries: 3,
            backoff_base_ms: 5_000,
            timeout_secs: 60,
            connect_timeout_secs: 10,
        }
    }
}

/// Configuration for the research loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Iteration cap used when a caller does not supply one.
    pub default_max_iterations: u32,
    /// Largest iteration cap a caller may request.
    pub max_iterations_cap: u32,
    /// Results requested from the paper index per round.
    pub papers_per_search: u32,
    /// Papers handed to the model per round.
    pub papers_to_analyze: usize,
    /// Directory holding instance checkpoints. Defaults to the platform data dir.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,
    /// How often `wait` re-reads an instance's checkpoint.
    pub status_poll_ms: u64,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            default_max_iterations: 3,
            max_iterations_cap: 10,
            papers_per_search: 30,
            papers_to_analyze: 15,
            state_dir: None,
            status_poll_ms: 500,
        }
    }
}

impl WorkflowConfig {
    /// Resolve where checkpoints live.
    ///
    /// Explicit `state_dir` wins, then the platform data dir, then the workspace.
    pub fn resolve_state_dir(&self, workspace: &Path) -> PathBuf {
        if let Some(dir) = &self.state_dir {
            return dir.clone();
        }
        directories::ProjectDirs::from("dev", "paperloop", "paperloop")
            .map(|d| d.data_dir().join("runs"))
            .unwrap_or_else(|| workspace.join(".paperloop").join("runs"))
    }
}

/// Retry budgets for workflow steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Budget for paper-index fetches.
    pub network: RetryPolicy,
    /// Budget for model calls.
    pub llm: RetryPolicy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            network: RetryPolicy::network(),
            llm: RetryPolicy::llm(),
        }
    }
}

/// Configuration for the REST gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
        }
    }
}

impl PaperloopConfig {
    /// Reject settings the engine cannot honor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let wf = &self.workflow;
        if wf.max_iterations_cap == 0 {
            return Err(invalid("workflow.max_iterations_cap must be at least 1"));
        }
        if !(1..=wf.max_iterations_cap).contains(&wf.default_max_iterations) {
            return Err(invalid(format!(
                "workflow.default_max_iterations must be between 1 and {}",
                wf.max_iterations_cap
            )));
        }
        if !(1..=MAX_RESULTS_LIMIT).contains(&wf.papers_per_search) {
            return Err(invalid(format!(
                "workflow.papers_per_search must be between 1 and {}",
                MAX_RESULTS_LIMIT
            )));
        }
        if wf.papers_to_analyze == 0 {
            return Err(invalid("workflow.papers_to_analyze must be at least 1"));
        }
        for (name, policy) in [("network", &self.retry.network), ("llm", &self.retry.llm)] {
            if policy.max_attempts == 0 {
                return Err(invalid(format!(
                    "retry.{}.max_attempts must be at least 1",
                    name
                )));
            }
            if policy.backoff_coefficient < 1.0 {
                return Err(invalid(format!(
                    "retry.{}.backoff_coefficient must be >= 1.0",
                    name
                )));
            }
        }
        if self.arxiv.base_url.trim().is_empty() {
            return Err(invalid("arxiv.base_url cannot be empty"));
        }
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        message: message.into(),
    }
}

/// Load configuration with layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `PAPERLOOP_`)
/// 3. Workspace-local config (`.paperloop/config.toml`)
/// 4. User config (`~/.config/paperloop/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&PaperloopConfig>,
) -> Result<PaperloopConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(PaperloopConfig::default()));

    if let Some(config_dir) = directories::ProjectDirs::from("dev", "paperloop", "paperloop") {
        let user_config = config_dir.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(".paperloop").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // PAPERLOOP_LLM__MODEL, PAPERLOOP_WORKFLOW__PAPERS_PER_SEARCH, etc.
    figment = figment.merge(Env::prefixed("PAPERLOOP_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(Box::new)
}
