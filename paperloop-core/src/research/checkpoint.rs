//! Durable checkpoints for research instances.
//!
//! An instance is one JSON document: its lifecycle status, the compacted
//! `WorkflowState` for the current iteration, and a step journal holding the
//! result of every external call already completed in that iteration. A step
//! consults the journal before calling out, so resuming after a crash replays
//! recorded results instead of re-issuing calls.
//!
//! Re-entry swaps in a fresh state with an empty journal in a single write.
//!
//! Only the holder of an instance's [`InstanceLease`] may drive it or write
//! its checkpoint, so no two drivers ever run steps of one instance at once.

use crate::error::{CheckpointError, WorkflowError};
use crate::persistence;
use crate::types::{FinalResult, InstanceStatus, WorkflowState};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::sync::atomic::{AtomicUsize, Ordering};
use uuid::Uuid;

/// Recorded step results for the current iteration, keyed by step name.
pub type StepJournal = BTreeMap<String, serde_json::Value>;

/// The persisted form of one research instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceCheckpoint {
    pub id: Uuid,
    pub status: InstanceStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Number of re-entries so far.
    #[serde(default)]
    pub generation: u32,
    pub state: WorkflowState,
    #[serde(default)]
    pub journal: StepJournal,
    #[serde(default)]
    pub output: Option<FinalResult>,
    #[serde(default)]
    pub error: Option<String>,
}

impl InstanceCheckpoint {
    pub fn new(state: WorkflowState) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            status: InstanceStatus::Pending,
            created_at: now,
            updated_at: now,
            generation: 0,
            state,
            journal: StepJournal::new(),
            output: None,
            error: None,
        }
    }

    /// The checkpoint that replaces this one at a re-entry boundary.
    pub fn continue_as_new(&self, state: WorkflowState) -> Self {
        Self {
            id: self.id,
            status: self.status,
            created_at: self.created_at,
            updated_at: Utc::now(),
            generation: self.generation + 1,
            state,
            journal: StepJournal::new(),
            output: None,
            error: None,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Exclusive right to drive one instance. Released on drop.
#[derive(Debug)]
pub struct InstanceLease {
    id: Uuid,
    holder: LeaseHolder,
}

#[derive(Debug)]
enum LeaseHolder {
    /// Advisory lock on `<id>.lock`; the OS drops it if the process dies.
    File(std::fs::File),
    Memory(Arc<Mutex<HashSet<Uuid>>>),
}

impl InstanceLease {
    pub fn instance_id(&self) -> Uuid {
        self.id
    }
}

impl Drop for InstanceLease {
    fn drop(&mut self) {
        match &self.holder {
            LeaseHolder::File(file) => {
                if let Err(e) = fs2::FileExt::unlock(file) {
                    tracing::debug!(instance = %self.id, error = %e, "Lease unlock failed, closing handle");
                }
            }
            LeaseHolder::Memory(held) => {
                held.lock().unwrap_or_else(PoisonError::into_inner).remove(&self.id);
            }
        }
        tracing::debug!(instance = %self.id, "Lease released");
    }
}

/// Storage for instance checkpoints.
///
/// `save` must be atomic: after it returns an error, `load` still yields the
/// previously saved document.
pub trait CheckpointStore: Send + Sync {
    fn save(&self, checkpoint: &InstanceCheckpoint) -> Result<(), CheckpointError>;

    fn load(&self, id: Uuid) -> Result<Option<InstanceCheckpoint>, CheckpointError>;

    fn list(&self) -> Result<Vec<InstanceCheckpoint>, CheckpointError>;

    /// Ask the instance to stop at its next step boundary.
    fn request_termination(&self, id: Uuid) -> Result<(), CheckpointError>;

    fn termination_requested(&self, id: Uuid) -> bool;

    /// Take the exclusive lease on an instance.
    ///
    /// `Ok(None)` while any other driver holds it, in this process or another.
    fn try_lease(&self, id: Uuid) -> Result<Option<InstanceLease>, CheckpointError>;
}

/// One JSON file per instance under a directory, plus `.terminate` and
/// `.lock` siblings.
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn document_path(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    fn marker_path(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.terminate", id))
    }

    fn lock_path(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.lock", id))
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn save(&self, checkpoint: &InstanceCheckpoint) -> Result<(), CheckpointError> {
        let path = self.document_path(checkpoint.id);
        persistence::atomic_write_json(&path, checkpoint).map_err(|e| CheckpointError::Write {
            path: path.clone(),
            message: e.to_string(),
        })?;
        tracing::debug!(
            instance = %checkpoint.id,
            generation = checkpoint.generation,
            steps = checkpoint.journal.len(),
            "Checkpoint written"
        );
        Ok(())
    }

    fn load(&self, id: Uuid) -> Result<Option<InstanceCheckpoint>, CheckpointError> {
        let path = self.document_path(id);
        persistence::load_json(&path).map_err(|e| CheckpointError::Read {
            path,
            message: e.to_string(),
        })
    }

    fn list(&self) -> Result<Vec<InstanceCheckpoint>, CheckpointError> {
        let paths = persistence::list_json_files(&self.dir).map_err(|e| CheckpointError::Read {
            path: self.dir.clone(),
            message: e.to_string(),
        })?;
        let mut checkpoints = Vec::with_capacity(paths.len());
        for path in paths {
            match persistence::load_json::<InstanceCheckpoint>(&path) {
                Ok(Some(cp)) => checkpoints.push(cp),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable checkpoint")
                }
            }
        }
        checkpoints.sort_by_key(|cp| cp.created_at);
        Ok(checkpoints)
    }

    fn request_termination(&self, id: Uuid) -> Result<(), CheckpointError> {
        let path = self.marker_path(id);
        persistence::touch(&path).map_err(|e| CheckpointError::Write {
            path,
            message: e.to_string(),
        })
    }

    fn termination_requested(&self, id: Uuid) -> bool {
        self.marker_path(id).exists()
    }

    fn try_lease(&self, id: Uuid) -> Result<Option<InstanceLease>, CheckpointError> {
        let path = self.lock_path(id);
        let file = persistence::try_lock_file(&path).map_err(|e| CheckpointError::Write {
            path: path.clone(),
            message: e.to_string(),
        })?;
        Ok(file.map(|file| InstanceLease {
            id,
            holder: LeaseHolder::File(file),
        }))
    }
}

/// In-memory store for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    documents: Mutex<HashMap<Uuid, InstanceCheckpoint>>,
    terminations: Mutex<HashSet<Uuid>>,
    leases: Arc<Mutex<HashSet<Uuid>>>,
    passing_saves: AtomicUsize,
    failing_saves: AtomicUsize,
    saves: AtomicUsize,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` saves fail without changing stored state.
    pub fn fail_next_saves(&self, count: usize) {
        self.fail_saves_after(0, count);
    }

    /// Let `skip` saves through, then fail the following `count`.
    pub fn fail_saves_after(&self, skip: usize, count: usize) {
        self.passing_saves.store(skip, Ordering::SeqCst);
        self.failing_saves.store(count, Ordering::SeqCst);
    }

    /// Successful saves so far.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn save(&self, checkpoint: &InstanceCheckpoint) -> Result<(), CheckpointError> {
        let passing = self
            .passing_saves
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        let failing = passing.is_err()
            && self
                .failing_saves
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
        if failing {
            return Err(CheckpointError::Unavailable {
                message: "injected save failure".to_string(),
            });
        }
        self.documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(checkpoint.id, checkpoint.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn load(&self, id: Uuid) -> Result<Option<InstanceCheckpoint>, CheckpointError> {
        Ok(self
            .documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned())
    }

    fn list(&self) -> Result<Vec<InstanceCheckpoint>, CheckpointError> {
        let mut all: Vec<_> = self
            .documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        all.sort_by_key(|cp| cp.created_at);
        Ok(all)
    }

    fn request_termination(&self, id: Uuid) -> Result<(), CheckpointError> {
        self.terminations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id);
        Ok(())
    }

    fn termination_requested(&self, id: Uuid) -> bool {
        self.terminations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&id)
    }

    fn try_lease(&self, id: Uuid) -> Result<Option<InstanceLease>, CheckpointError> {
        let acquired = self
            .leases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id);
        Ok(acquired.then(|| InstanceLease {
            id,
            holder: LeaseHolder::Memory(self.leases.clone()),
        }))
    }
}

/// Runs journaled steps against one instance's checkpoint.
pub struct StepRunner<'a> {
    store: &'a dyn CheckpointStore,
    checkpoint: &'a mut InstanceCheckpoint,
}

impl<'a> StepRunner<'a> {
    pub fn new(store: &'a dyn CheckpointStore, checkpoint: &'a mut InstanceCheckpoint) -> Self {
        Self { store, checkpoint }
    }

    pub fn instance_id(&self) -> Uuid {
        self.checkpoint.id
    }

    /// Return the recorded result for `key`, or run `op` and record its result.
    ///
    /// The result is durable before it is returned. A failing `op` records nothing.
    pub async fn step<T, F, Fut>(&mut self, key: &str, op: F) -> Result<T, WorkflowError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, WorkflowError>>,
    {
        if let Some(recorded) = self.checkpoint.journal.get(key) {
            match serde_json::from_value::<T>(recorded.clone()) {
                Ok(value) => {
                    tracing::debug!(instance = %self.checkpoint.id, step = key, "Replaying recorded step");
                    return Ok(value);
                }
                Err(e) => {
                    tracing::warn!(
                        instance = %self.checkpoint.id,
                        step = key,
                        error = %e,
                        "Recorded step does not decode, re-running"
                    );
                }
            }
        }

        let value = op().await?;
        let encoded = serde_json::to_value(&value).map_err(|e| CheckpointError::Encode {
            key: key.to_string(),
            message: e.to_string(),
        })?;
        self.checkpoint.journal.insert(key.to_string(), encoded);
        self.checkpoint.touch();
        if let Err(e) = self.store.save(self.checkpoint) {
            self.checkpoint.journal.remove(key);
            return Err(e.into());
        }
        Ok(value)
    }
}
