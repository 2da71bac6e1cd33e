//! # Paperloop Core
//!
//! Core library for the paperloop literature-review agent.
//! Provides the iterative research loop, its durable checkpoints, the LLM
//! interface, configuration, retry policies, and the control surface that
//! starts and observes research instances.

pub mod brain;
pub mod config;
pub mod error;
pub mod gateway;
pub mod persistence;
pub mod providers;
pub mod research;
pub mod retry;
pub mod runtime;
pub mod types;

// Re-export commonly used types at the crate root.
pub use brain::{CompletionRequest, CompletionResponse, LlmProvider, Message, MockLlmProvider};
pub use config::{PaperloopConfig, load_config};
pub use error::{
    CheckpointError, FetchError, LlmError, PaperloopError, Result, WorkflowError,
};
pub use research::{
    CheckpointStore, FileCheckpointStore, IterativeResearchLoop, LlmResearchModel,
    MemoryCheckpointStore, PaperResearchRound, PaperSource, ResearchModel,
};
pub use retry::RetryPolicy;
pub use runtime::{ResearchRuntime, StatusReport, Termination, terminate_instance};
pub use types::{
    FinalResult, Finding, InstanceStatus, PaperRef, SearchRequest, SortBy, SortOrder,
    WorkflowState,
};
