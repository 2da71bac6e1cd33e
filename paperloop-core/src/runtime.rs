//! Control surface for research instances.
//!
//! [`ResearchRuntime`] starts instances as Tokio tasks, reports their status
//! from the checkpoint store, waits for results, and forwards termination
//! requests. Status is always read back from the store, so a second process
//! pointed at the same state directory sees the same instances.
//!
//! A runtime drives an instance only while it holds the instance's lease.
//! Resuming an instance that another process is driving is a no-op; waiting
//! on it just observes that process's progress through the store.

use crate::config::WorkflowConfig;
use crate::error::WorkflowError;
use crate::research::checkpoint::{CheckpointStore, InstanceCheckpoint, InstanceLease};
use crate::research::workflow::IterativeResearchLoop;
use crate::types::{FinalResult, InstanceStatus, WorkflowState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// What an operator sees about one instance.
///
/// `iterations` and `report` appear only once the instance has completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub instance_id: Uuid,
    pub topic: String,
    pub status: InstanceStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iterations: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&InstanceCheckpoint> for StatusReport {
    fn from(cp: &InstanceCheckpoint) -> Self {
        let completed = cp.output.as_ref().filter(|_| cp.status == InstanceStatus::Completed);
        Self {
            instance_id: cp.id,
            topic: cp.state.topic.clone(),
            status: cp.status,
            created_at: cp.created_at,
            updated_at: cp.updated_at,
            iterations: completed.map(|o| o.iterations),
            report: completed.map(|o| o.report.clone()),
            error: cp.error.clone().filter(|_| cp.status == InstanceStatus::Failed),
        }
    }
}

/// What a termination request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// A driver holds the instance; it stops at its next step boundary.
    Requested,
    /// Nobody was driving the instance, so it was marked terminated directly.
    Recorded,
}

/// Stop an instance using only the checkpoint store.
///
/// If another driver holds the lease, a durable termination request is left
/// for it. Otherwise the checkpoint is marked `terminated` under the lease.
/// Finished instances are rejected with [`WorkflowError::AlreadyFinished`].
pub fn terminate_instance(
    store: &dyn CheckpointStore,
    id: Uuid,
) -> Result<Termination, WorkflowError> {
    ensure_unfinished(&load_checkpoint(store, id)?)?;

    let Some(_lease) = store.try_lease(id)? else {
        store.request_termination(id)?;
        tracing::info!(instance = %id, "Termination requested");
        return Ok(Termination::Requested);
    };
    // Re-read under the lease: the previous driver may have just finished.
    let mut cp = load_checkpoint(store, id)?;
    ensure_unfinished(&cp)?;
    cp.status = InstanceStatus::Terminated;
    cp.touch();
    store.save(&cp)?;
    tracing::info!(instance = %id, "Idle instance recorded as terminated");
    Ok(Termination::Recorded)
}

fn load_checkpoint(store: &dyn CheckpointStore, id: Uuid) -> Result<InstanceCheckpoint, WorkflowError> {
    store.load(id)?.ok_or(WorkflowError::InstanceNotFound { id })
}

fn ensure_unfinished(cp: &InstanceCheckpoint) -> Result<(), WorkflowError> {
    if cp.status.is_terminal() {
        return Err(WorkflowError::AlreadyFinished {
            id: cp.id,
            status: cp.status,
        });
    }
    Ok(())
}

/// Starts, observes, and stops research instances.
pub struct ResearchRuntime {
    engine: Arc<IterativeResearchLoop>,
    store: Arc<dyn CheckpointStore>,
    config: WorkflowConfig,
    running: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
}

impl ResearchRuntime {
    pub fn new(engine: IterativeResearchLoop, config: WorkflowConfig) -> Self {
        let store = engine.store().clone();
        Self {
            engine: Arc::new(engine),
            store,
            config,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    /// Start a new instance. Must be called from within a Tokio runtime.
    ///
    /// The topic is trimmed; `max_iterations` defaults from config and is
    /// clamped to `1..=max_iterations_cap`.
    pub fn start(&self, topic: &str, max_iterations: Option<u32>) -> Result<Uuid, WorkflowError> {
        let topic = topic.trim();
        if topic.is_empty() {
            return Err(WorkflowError::InvalidArgument {
                message: "topic cannot be empty".to_string(),
            });
        }
        let cap = self.config.max_iterations_cap.max(1);
        let max_iterations = max_iterations
            .unwrap_or(self.config.default_max_iterations)
            .clamp(1, cap);

        let checkpoint = InstanceCheckpoint::new(WorkflowState::new(topic, max_iterations));
        let id = checkpoint.id;
        // Lease before the first write so no other process can pick it up.
        let lease = self.store.try_lease(id)?.ok_or_else(|| WorkflowError::Failed {
            id,
            message: "new instance is already leased".to_string(),
        })?;
        self.store.save(&checkpoint)?;
        tracing::info!(instance = %id, topic, max_iterations, "Research instance started");
        self.spawn(checkpoint, lease);
        Ok(id)
    }

    fn spawn(&self, mut checkpoint: InstanceCheckpoint, lease: InstanceLease) {
        let id = checkpoint.id;
        let cancel = CancellationToken::new();
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, cancel.clone());

        let engine = self.engine.clone();
        let store = self.store.clone();
        let running = self.running.clone();
        tokio::spawn(async move {
            checkpoint.status = InstanceStatus::Running;
            checkpoint.touch();
            if let Err(e) = store.save(&checkpoint) {
                tracing::warn!(instance = %id, error = %e, "Failed to record running status");
            }

            match engine.drive(&mut checkpoint, &cancel).await {
                Ok(result) => {
                    tracing::info!(
                        instance = %id,
                        iterations = result.iterations,
                        findings = result.findings_count,
                        "Research instance completed"
                    );
                    checkpoint.status = InstanceStatus::Completed;
                    checkpoint.output = Some(result);
                }
                Err(WorkflowError::Terminated { .. }) => {
                    tracing::info!(instance = %id, "Research instance terminated");
                    checkpoint.status = InstanceStatus::Terminated;
                }
                Err(e) => {
                    tracing::error!(instance = %id, error = %e, "Research instance failed");
                    checkpoint.status = InstanceStatus::Failed;
                    checkpoint.error = Some(e.to_string());
                }
            }
            checkpoint.touch();
            if let Err(e) = store.save(&checkpoint) {
                tracing::error!(instance = %id, error = %e, "Failed to record final status");
            }
            running
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id);
            drop(lease);
        });
    }

    fn checkpoint(&self, id: Uuid) -> Result<InstanceCheckpoint, WorkflowError> {
        load_checkpoint(self.store.as_ref(), id)
    }

    pub fn get_status(&self, id: Uuid) -> Result<StatusReport, WorkflowError> {
        Ok(StatusReport::from(&self.checkpoint(id)?))
    }

    /// All stored instances, oldest first.
    pub fn list(&self) -> Result<Vec<StatusReport>, WorkflowError> {
        Ok(self.store.list()?.iter().map(StatusReport::from).collect())
    }

    /// Wait up to `timeout` for the instance to reach a terminal status.
    pub async fn wait(&self, id: Uuid, timeout: Duration) -> Result<FinalResult, WorkflowError> {
        match tokio::time::timeout(timeout, self.poll_until_terminal(id)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(WorkflowError::WaitTimeout {
                id,
                timeout_secs: timeout.as_secs(),
            }),
        }
    }

    async fn poll_until_terminal(&self, id: Uuid) -> Result<FinalResult, WorkflowError> {
        let interval = Duration::from_millis(self.config.status_poll_ms.max(1));
        loop {
            let cp = self.checkpoint(id)?;
            match cp.status {
                InstanceStatus::Completed => {
                    return cp.output.ok_or_else(|| WorkflowError::Failed {
                        id,
                        message: "completed without a result".to_string(),
                    });
                }
                InstanceStatus::Failed => {
                    return Err(WorkflowError::Failed {
                        id,
                        message: cp.error.unwrap_or_default(),
                    });
                }
                InstanceStatus::Terminated => return Err(WorkflowError::Terminated { id }),
                InstanceStatus::Pending | InstanceStatus::Running => {
                    tokio::time::sleep(interval).await;
                }
            }
        }
    }

    /// Ask an instance to stop.
    ///
    /// A driven instance records `terminated` at its next step boundary; an
    /// idle one is marked `terminated` immediately. See [`terminate_instance`].
    pub fn terminate(&self, id: Uuid) -> Result<Termination, WorkflowError> {
        let outcome = terminate_instance(self.store.as_ref(), id)?;
        if let Some(token) = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
        {
            token.cancel();
        }
        Ok(outcome)
    }

    /// Restart every stored instance that never reached a terminal status.
    ///
    /// Each resumes from its last checkpoint; steps already journaled for the
    /// current iteration are replayed rather than re-issued.
    pub fn resume_incomplete(&self) -> Result<Vec<Uuid>, WorkflowError> {
        let mut resumed = Vec::new();
        for cp in self.store.list()? {
            let id = cp.id;
            match self.resume_checkpoint(cp) {
                Ok(true) => resumed.push(id),
                Ok(false) => {}
                Err(e) => tracing::warn!(instance = %id, error = %e, "Could not resume instance"),
            }
        }
        Ok(resumed)
    }

    /// Restart one instance.
    ///
    /// `Ok(false)` if it is finished or some driver, here or in another
    /// process, already holds it.
    pub fn resume(&self, id: Uuid) -> Result<bool, WorkflowError> {
        let cp = self.checkpoint(id)?;
        self.resume_checkpoint(cp)
    }

    fn resume_checkpoint(&self, cp: InstanceCheckpoint) -> Result<bool, WorkflowError> {
        if cp.status.is_terminal() || self.is_running(cp.id) {
            return Ok(false);
        }
        let Some(lease) = self.store.try_lease(cp.id)? else {
            tracing::info!(instance = %cp.id, "Instance is held by another driver, not resuming");
            return Ok(false);
        };
        // The listed copy may predate the previous holder's last write.
        let cp = self.checkpoint(cp.id)?;
        if cp.status.is_terminal() {
            return Ok(false);
        }
        tracing::info!(
            instance = %cp.id,
            iteration = cp.state.current_iteration,
            generation = cp.generation,
            "Resuming research instance"
        );
        self.spawn(cp, lease);
        Ok(true)
    }

    pub fn is_running(&self, id: Uuid) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brain::MockLlmProvider;
    use crate::config::{LlmConfig, PaperloopConfig};
    use crate::research::checkpoint::MemoryCheckpointStore;
    use crate::research::model::{LlmResearchModel, ScriptedPaperSource};

    fn runtime(mock: Arc<MockLlmProvider>) -> (ResearchRuntime, Arc<MemoryCheckpointStore>) {
        let store = Arc::new(MemoryCheckpointStore::new());
        let mut config = PaperloopConfig::default();
        config.workflow.status_poll_ms = 5;
        let model = Arc::new(LlmResearchModel::new(mock, &LlmConfig::default()));
        let engine = IterativeResearchLoop::new(
            Arc::new(ScriptedPaperSource::new()),
            model,
            store.clone(),
            &config,
        );
        (ResearchRuntime::new(engine, config.workflow), store)
    }

    #[tokio::test]
    async fn test_start_rejects_blank_topic() {
        let (rt, _) = runtime(Arc::new(MockLlmProvider::new()));
        let err = rt.start("   ", None).unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidArgument { .. }));
    }

    #[tokio::test]
    async fn test_start_trims_and_clamps() {
        let (rt, store) = runtime(Arc::new(MockLlmProvider::new()));
        let id = rt.start("  diffusion  ", Some(50)).unwrap();
        let cp = store.load(id).unwrap().unwrap();
        assert_eq!(cp.state.topic, "diffusion");
        assert_eq!(cp.state.max_iterations, 10);

        let id = rt.start("diffusion", Some(0)).unwrap();
        assert_eq!(store.load(id).unwrap().unwrap().state.max_iterations, 1);

        let id = rt.start("diffusion", None).unwrap();
        assert_eq!(store.load(id).unwrap().unwrap().state.max_iterations, 3);
    }

    #[tokio::test]
    async fn test_run_to_completion_and_status() {
        // One round with no papers, cap of 1, then synthesis.
        let mock = Arc::new(MockLlmProvider::new());
        mock.queue_text(r#"{"report": "Nothing published yet."}"#);
        let (rt, _) = runtime(mock);
        let id = rt.start("obscure topic", Some(1)).unwrap();

        let result = rt.wait(id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(result.iterations, 1);
        assert_eq!(result.findings_count, 1);
        assert_eq!(result.report, "Nothing published yet.");

        let status = rt.get_status(id).unwrap();
        assert_eq!(status.status, InstanceStatus::Completed);
        assert_eq!(status.iterations, Some(1));
        assert_eq!(status.report.as_deref(), Some("Nothing published yet."));
        assert!(!rt.is_running(id));
    }

    #[tokio::test]
    async fn test_unknown_instance() {
        let (rt, _) = runtime(Arc::new(MockLlmProvider::new()));
        let id = Uuid::new_v4();
        assert!(matches!(
            rt.get_status(id),
            Err(WorkflowError::InstanceNotFound { .. })
        ));
        assert!(matches!(
            rt.terminate(id),
            Err(WorkflowError::InstanceNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_terminate_before_first_step() {
        let (rt, _) = runtime(Arc::new(MockLlmProvider::new()));
        let id = rt.start("topic", Some(2)).unwrap();
        // The spawned task has not been polled yet, but it already holds the lease.
        assert_eq!(rt.terminate(id).unwrap(), Termination::Requested);

        let err = rt.wait(id, Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Terminated { .. }));
        assert_eq!(rt.get_status(id).unwrap().status, InstanceStatus::Terminated);
    }

    #[tokio::test]
    async fn test_terminate_idle_instance_records_terminated() {
        let mock = Arc::new(MockLlmProvider::new());
        let (rt, store) = runtime(mock.clone());
        let cp = InstanceCheckpoint::new(WorkflowState::new("never driven", 2));
        store.save(&cp).unwrap();

        assert_eq!(rt.terminate(cp.id).unwrap(), Termination::Recorded);
        assert_eq!(rt.get_status(cp.id).unwrap().status, InstanceStatus::Terminated);
        assert!(matches!(
            rt.wait(cp.id, Duration::from_secs(1)).await,
            Err(WorkflowError::Terminated { .. })
        ));
        assert!(!rt.resume(cp.id).unwrap());
        assert_eq!(mock.call_count(), 0);
    }

    #[tokio::test]
    async fn test_terminate_finished_instance_is_rejected() {
        let (rt, store) = runtime(Arc::new(MockLlmProvider::new()));
        let mut done = InstanceCheckpoint::new(WorkflowState::new("done", 1));
        done.status = InstanceStatus::Completed;
        store.save(&done).unwrap();

        let err = rt.terminate(done.id).unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::AlreadyFinished {
                status: InstanceStatus::Completed,
                ..
            }
        ));
        assert!(!store.termination_requested(done.id));
        assert_eq!(store.load(done.id).unwrap().unwrap().status, InstanceStatus::Completed);
    }

    #[tokio::test]
    async fn test_resume_skips_instance_leased_elsewhere() {
        let (rt, store) = runtime(Arc::new(MockLlmProvider::new()));
        let cp = InstanceCheckpoint::new(WorkflowState::new("held", 0));
        store.save(&cp).unwrap();

        let lease = store.try_lease(cp.id).unwrap();
        assert!(lease.is_some());
        assert!(!rt.resume(cp.id).unwrap());
        assert!(rt.resume_incomplete().unwrap().is_empty());
        assert_eq!(rt.terminate(cp.id).unwrap(), Termination::Requested);
        assert!(store.termination_requested(cp.id));

        drop(lease);
        assert!(rt.resume(cp.id).unwrap());
        assert!(matches!(
            rt.wait(cp.id, Duration::from_secs(5)).await,
            Err(WorkflowError::Terminated { .. })
        ));
    }

    #[tokio::test]
    async fn test_wait_times_out_on_stuck_instance() {
        let (rt, store) = runtime(Arc::new(MockLlmProvider::new()));
        // A pending checkpoint nobody is driving.
        let cp = InstanceCheckpoint::new(WorkflowState::new("stuck", 1));
        store.save(&cp).unwrap();

        let err = rt.wait(cp.id, Duration::from_millis(30)).await.unwrap_err();
        assert!(matches!(err, WorkflowError::WaitTimeout { .. }));
        let status = rt.get_status(cp.id).unwrap();
        assert_eq!(status.status, InstanceStatus::Pending);
        assert!(status.report.is_none());
    }

    #[tokio::test]
    async fn test_resume_incomplete_skips_terminal() {
        let mock = Arc::new(MockLlmProvider::new());
        mock.queue_text(r#"{"report": "resumed"}"#);
        let (rt, store) = runtime(mock);

        let pending = InstanceCheckpoint::new(WorkflowState::new("pending", 0));
        store.save(&pending).unwrap();
        let mut done = InstanceCheckpoint::new(WorkflowState::new("done", 1));
        done.status = InstanceStatus::Completed;
        store.save(&done).unwrap();

        let resumed = rt.resume_incomplete().unwrap();
        assert_eq!(resumed, vec![pending.id]);
        let result = rt.wait(pending.id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(result.report, "resumed");
        assert_eq!(result.iterations, 0);
    }

    #[tokio::test]
    async fn test_resume_single_instance() {
        let mock = Arc::new(MockLlmProvider::new());
        mock.queue_text(r#"{"report": "picked up"}"#);
        let (rt, store) = runtime(mock);

        let pending = InstanceCheckpoint::new(WorkflowState::new("pending", 0));
        store.save(&pending).unwrap();
        let other = InstanceCheckpoint::new(WorkflowState::new("left alone", 0));
        store.save(&other).unwrap();

        assert!(rt.resume(pending.id).unwrap());
        let result = rt.wait(pending.id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(result.report, "picked up");

        // Finished instances are not restarted.
        assert!(!rt.resume(pending.id).unwrap());
        assert_eq!(store.load(other.id).unwrap().unwrap().status, InstanceStatus::Pending);
        assert!(matches!(
            rt.resume(Uuid::new_v4()),
            Err(WorkflowError::InstanceNotFound { .. })
        ));
    }

    #[test]
    fn test_status_report_hides_failed_error_when_running() {
        let mut cp = InstanceCheckpoint::new(WorkflowState::new("t", 1));
        cp.status = InstanceStatus::Running;
        cp.error = Some("stale".into());
        let report = StatusReport::from(&cp);
        assert!(report.error.is_none());
        let json = serde_json::to_value(&report).unwrap();
        assert!(json.get("report").is_none());
        assert_eq!(json["status"], "running");
    }
}
