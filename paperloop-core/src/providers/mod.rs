//! LLM provider implementations.
//!
//! Use `create_provider()` to instantiate the provider named in config.

pub mod openai_compat;

use crate::brain::LlmProvider;
use crate::config::LlmConfig;
use crate::error::LlmError;
use std::sync::Arc;

pub use openai_compat::OpenAiCompatibleProvider;

/// Create an LLM provider based on the configuration.
///
/// "openai", "azure", "ollama", "vllm", and "local" all speak the chat
/// completions protocol; anything else is rejected.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    match config.provider.as_str() {
        "openai" | "azure" | "ollama" | "vllm" | "local" => {
            Ok(Arc::new(OpenAiCompatibleProvider::new(config)?))
        }
        other => Err(LlmError::ApiRequest {
            message: format!(
                "Unsupported provider '{}'; use an OpenAI-compatible endpoint",
                other
            ),
        }),
    }
}
