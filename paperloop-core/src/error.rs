//! Error types for the paperloop core library.
//!
//! Uses `thiserror` for public API error types with structured variants
//! covering paper fetching, LLM calls, model-output extraction, workflow
//! execution, checkpoints, and configuration.

use crate::types::InstanceStatus;
use std::path::PathBuf;
use uuid::Uuid;

/// Top-level error type for the paperloop core library.
#[derive(Debug, thiserror::Error)]
pub enum PaperloopError {
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from the paper-index fetcher.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("Upstream unavailable after {attempts} attempts (last status {status})")]
    UpstreamUnavailable { attempts: u32, status: u16 },

    #[error("Upstream rejected request with HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("Malformed response: {message}")]
    MalformedResponse { message: String },
}

impl FetchError {
    pub fn invalid(message: impl Into<String>) -> Self {
        FetchError::InvalidArgument {
            message: message.into(),
        }
    }

    /// Whether an enclosing retry policy may re-issue the call.
    ///
    /// Caller misuse is never retried.
    pub fn is_transient(&self) -> bool {
        !matches!(self, FetchError::InvalidArgument { .. })
    }
}

/// Errors from LLM provider interactions.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("API request failed: {message}")]
    ApiRequest { message: String },

    #[error("API response parse error: {message}")]
    ResponseParse { message: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Provider connection failed: {message}")]
    Connection { message: String },
}

impl LlmError {
    /// Authentication failures need operator action; everything else may clear up.
    pub fn is_transient(&self) -> bool {
        !matches!(self, LlmError::AuthFailed { .. })
    }
}

/// Model output that does not have the expected structured shape.
///
/// Always recovered at the extraction boundary with a documented default.
#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error("Could not parse model output as JSON: {message}")]
    ParseFailure { message: String },
}

/// Errors from the research workflow engine and its control surface.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("Step '{step}' failed after {attempts} attempt(s): {message}")]
    StepFailed {
        step: String,
        attempts: u32,
        message: String,
    },

    #[error("Instance not found: {id}")]
    InstanceNotFound { id: Uuid },

    #[error("Instance {id} was terminated")]
    Terminated { id: Uuid },

    #[error("Instance {id} already finished ({status})")]
    AlreadyFinished { id: Uuid, status: InstanceStatus },

    #[error("Instance {id} failed: {message}")]
    Failed { id: Uuid, message: String },

    #[error("Timed out after {timeout_secs}s waiting for instance {id}")]
    WaitTimeout { id: Uuid, timeout_secs: u64 },

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
}

/// Errors from the durable checkpoint store.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("Failed to write checkpoint {path}: {message}")]
    Write { path: PathBuf, message: String },

    #[error("Failed to read checkpoint {path}: {message}")]
    Read { path: PathBuf, message: String },

    #[error("Checkpoint store unavailable: {message}")]
    Unavailable { message: String },

    #[error("Journal entry '{key}' could not be encoded: {message}")]
    Encode { key: String, message: String },
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },
}

/// Result type alias for paperloop operations.
pub type Result<T> = std::result::Result<T, PaperloopError>;
