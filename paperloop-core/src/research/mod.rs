//! The research engine: one round per query, the iterative loop around it,
//! and the checkpoints that make both resumable.

pub mod checkpoint;
pub mod extract;
pub mod model;
pub mod prompts;
pub mod round;
pub mod workflow;

pub use checkpoint::{
    CheckpointStore, FileCheckpointStore, InstanceCheckpoint, InstanceLease, MemoryCheckpointStore,
    StepJournal, StepRunner,
};
pub use model::{LlmResearchModel, PaperSource, ResearchModel, ScriptedPaperSource};
pub use round::PaperResearchRound;
pub use workflow::{IterationOutcome, IterativeResearchLoop, LoopState};
