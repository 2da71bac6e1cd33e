//! The iterative research loop.
//!
//! Each iteration runs one round, asks whether to continue, and picks a
//! follow-up query. The loop then re-enters itself with a freshly built
//! [`WorkflowState`]: the checkpoint for the new generation carries only that
//! state and an empty step journal, so the durable record stays bounded no
//! matter how many iterations run.
//!
//! ```text
//! Start ──cap reached──────────────────────────────────┐
//!   │                                                  ▼
//!   └─▶ RoundInProgress ─▶ DecidingContinuation ──no─▶ Synthesizing ─▶ Done
//!                                │                     ▲
//!                               yes                    │
//!                                ▼                     │
//!                        GeneratingNextQuery ──none────┘
//!                                │
//!                          query ▼
//!                         (re-enter at Start)
//! ```

use crate::config::PaperloopConfig;
use crate::error::WorkflowError;
use crate::research::checkpoint::{CheckpointStore, InstanceCheckpoint, StepRunner};
use crate::research::extract::first_query;
use crate::research::model::{PaperSource, ResearchModel};
use crate::research::round::PaperResearchRound;
use crate::retry::{RetryPolicy, with_policy};
use crate::types::{FinalResult, WorkflowState};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub const DECIDE_STEP: &str = "decide";
pub const NEXT_QUERY_STEP: &str = "next_query";
pub const SYNTHESIZE_STEP: &str = "synthesize";

/// Failed re-entry commits tolerated before the instance fails.
const DEFAULT_MAX_COMMIT_ATTEMPTS: u32 = 3;

/// Phases of one loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Start,
    RoundInProgress,
    DecidingContinuation,
    GeneratingNextQuery,
    Synthesizing,
    Done,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoopState::Start => "start",
            LoopState::RoundInProgress => "round_in_progress",
            LoopState::DecidingContinuation => "deciding_continuation",
            LoopState::GeneratingNextQuery => "generating_next_query",
            LoopState::Synthesizing => "synthesizing",
            LoopState::Done => "done",
        };
        write!(f, "{}", name)
    }
}

/// How an iteration ended.
#[derive(Debug, Clone, PartialEq)]
pub enum IterationOutcome {
    /// Re-enter with this state.
    Continue(WorkflowState),
    Finished(FinalResult),
}

/// The research state machine.
pub struct IterativeResearchLoop {
    round: PaperResearchRound,
    model: Arc<dyn ResearchModel>,
    store: Arc<dyn CheckpointStore>,
    llm: RetryPolicy,
    max_commit_attempts: u32,
}

impl IterativeResearchLoop {
    pub fn new(
        source: Arc<dyn PaperSource>,
        model: Arc<dyn ResearchModel>,
        store: Arc<dyn CheckpointStore>,
        config: &PaperloopConfig,
    ) -> Self {
        Self {
            round: PaperResearchRound::new(source, model.clone(), config),
            model,
            store,
            llm: config.retry.llm.clone(),
            max_commit_attempts: DEFAULT_MAX_COMMIT_ATTEMPTS,
        }
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    /// Drive an instance from its checkpoint until it finishes.
    ///
    /// On success `checkpoint.state` holds the final state with every finding.
    /// On error it reflects the last durable generation.
    pub async fn drive(
        &self,
        checkpoint: &mut InstanceCheckpoint,
        cancel: &CancellationToken,
    ) -> Result<FinalResult, WorkflowError> {
        let mut failed_commits = 0u32;
        loop {
            match self.run_iteration(checkpoint, cancel).await? {
                IterationOutcome::Finished(result) => return Ok(result),
                IterationOutcome::Continue(state) => {
                    let next = checkpoint.continue_as_new(state);
                    match self.store.save(&next) {
                        Ok(()) => {
                            tracing::info!(
                                instance = %next.id,
                                generation = next.generation,
                                iteration = next.state.current_iteration,
                                query = %next.state.current_query,
                                "Re-entered with compacted state"
                            );
                            *checkpoint = next;
                            failed_commits = 0;
                        }
                        Err(e) => {
                            failed_commits += 1;
                            if failed_commits >= self.max_commit_attempts {
                                tracing::error!(
                                    instance = %checkpoint.id,
                                    attempts = failed_commits,
                                    error = %e,
                                    "Giving up on re-entry commit"
                                );
                                return Err(e.into());
                            }
                            tracing::warn!(
                                instance = %checkpoint.id,
                                attempt = failed_commits,
                                error = %e,
                                "Re-entry commit failed, replaying iteration from last checkpoint"
                            );
                            if let Some(durable) = self.store.load(checkpoint.id)? {
                                *checkpoint = durable;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Run a single iteration of the state machine from `Start`.
    ///
    /// Every external call goes through the checkpoint's step journal, so
    /// replaying an interrupted iteration issues only the calls that never
    /// completed.
    pub async fn run_iteration(
        &self,
        checkpoint: &mut InstanceCheckpoint,
        cancel: &CancellationToken,
    ) -> Result<IterationOutcome, WorkflowError> {
        let id = checkpoint.id;
        let mut state = checkpoint.state.clone();
        let mut steps = StepRunner::new(self.store.as_ref(), checkpoint);
        let mut phase = LoopState::Start;
        let mut output = None;

        while phase != LoopState::Done {
            self.check_cancelled(id, cancel)?;
            tracing::info!(
                instance = %id,
                iteration = state.current_iteration,
                state = %phase,
                "Loop transition"
            );

            phase = match phase {
                LoopState::Start => {
                    if state.at_cap() {
                        LoopState::Synthesizing
                    } else {
                        state.current_iteration += 1;
                        LoopState::RoundInProgress
                    }
                }
                LoopState::RoundInProgress => {
                    let finding = self
                        .round
                        .run(&mut steps, &state.topic, &state.current_query)
                        .await?;
                    state.findings.push(finding);
                    LoopState::DecidingContinuation
                }
                LoopState::DecidingContinuation => {
                    if self.decide(&mut steps, &state).await? {
                        LoopState::GeneratingNextQuery
                    } else {
                        LoopState::Synthesizing
                    }
                }
                LoopState::GeneratingNextQuery => match self.follow_up(&mut steps, &state).await? {
                    Some(query) => {
                        return Ok(IterationOutcome::Continue(WorkflowState {
                            topic: state.topic,
                            max_iterations: state.max_iterations,
                            current_iteration: state.current_iteration,
                            findings: state.findings,
                            current_query: query,
                        }));
                    }
                    None => LoopState::Synthesizing,
                },
                LoopState::Synthesizing => {
                    let report = self.synthesize(&mut steps, &state).await?;
                    output = Some(FinalResult {
                        topic: state.topic.clone(),
                        iterations: state.current_iteration,
                        report,
                        findings_count: state.findings.len(),
                    });
                    LoopState::Done
                }
                LoopState::Done => LoopState::Done,
            };
        }

        tracing::info!(instance = %id, iterations = state.current_iteration, "Research complete");
        checkpoint.state = state;
        output
            .map(IterationOutcome::Finished)
            .ok_or_else(|| WorkflowError::Failed {
                id,
                message: "loop finished without a result".to_string(),
            })
    }

    fn check_cancelled(&self, id: Uuid, cancel: &CancellationToken) -> Result<(), WorkflowError> {
        if cancel.is_cancelled() || self.store.termination_requested(id) {
            tracing::info!(instance = %id, "Termination observed at step boundary");
            return Err(WorkflowError::Terminated { id });
        }
        Ok(())
    }

    async fn decide(
        &self,
        steps: &mut StepRunner<'_>,
        state: &WorkflowState,
    ) -> Result<bool, WorkflowError> {
        if state.at_cap() {
            tracing::debug!(iteration = state.current_iteration, "Iteration cap reached, stopping");
            return Ok(false);
        }
        let model = self.model.as_ref();
        let llm = &self.llm;
        steps
            .step(DECIDE_STEP, || async move {
                with_policy(llm, DECIDE_STEP, move || {
                    model.should_continue(
                        &state.topic,
                        &state.findings,
                        state.current_iteration,
                        state.max_iterations,
                    )
                })
                .await
                .map_err(|failure| failure.into_step_error(DECIDE_STEP))
            })
            .await
    }

    async fn follow_up(
        &self,
        steps: &mut StepRunner<'_>,
        state: &WorkflowState,
    ) -> Result<Option<String>, WorkflowError> {
        let model = self.model.as_ref();
        let llm = &self.llm;
        let queries: Vec<String> = steps
            .step(NEXT_QUERY_STEP, || async move {
                with_policy(llm, NEXT_QUERY_STEP, move || {
                    model.next_queries(&state.topic, &state.findings, state.current_iteration)
                })
                .await
                .map_err(|failure| failure.into_step_error(NEXT_QUERY_STEP))
            })
            .await?;

        let chosen = first_query(queries);
        match &chosen {
            Some(query) => tracing::info!(query = %query, "Next query selected"),
            None => tracing::info!("No follow-up queries, synthesizing"),
        }
        Ok(chosen)
    }

    async fn synthesize(
        &self,
        steps: &mut StepRunner<'_>,
        state: &WorkflowState,
    ) -> Result<String, WorkflowError> {
        let model = self.model.as_ref();
        let llm = &self.llm;
        steps
            .step(SYNTHESIZE_STEP, || async move {
                with_policy(llm, SYNTHESIZE_STEP, move || {
                    model.synthesize(&state.topic, &state.findings)
                })
                .await
                .map_err(|failure| failure.into_step_error(SYNTHESIZE_STEP))
            })
            .await
    }
}
