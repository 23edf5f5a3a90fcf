//! Checkpoint ledger and crash recovery.
//!
//! Each worker appends step descriptors and durable commit refs to its
//! item's checkpoint while executing. The ledger is consulted only after a
//! worker is found unresponsive: zero commits means a clean retry, one or
//! more means the next worker must build on the recorded work instead of
//! redoing it. The checkpoint is deleted once the item completes.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::DispatchResult;

/// Lifecycle of a checkpoint file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    /// A worker is (or was) actively appending to this ledger.
    Running,
    /// Recovery has read the ledger; the next worker resumes from it.
    Recovering,
}

/// Per-item progress ledger, append-only while a worker runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub item_id: String,
    /// Step descriptors completed, in order.
    pub steps_completed: Vec<String>,
    /// Refs of durable commits made so far.
    pub commits: Vec<String>,
    /// Index of the next step to execute.
    pub current_step: usize,
    pub status: CheckpointStatus,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(item_id: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            steps_completed: Vec::new(),
            commits: Vec::new(),
            current_step: 0,
            status: CheckpointStatus::Running,
            updated_at: Utc::now(),
        }
    }

    pub fn has_durable_work(&self) -> bool {
        !self.commits.is_empty()
    }
}

/// How to restart an item whose worker died.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryPlan {
    /// No durable work was recorded; retry from scratch.
    CleanRetry,
    /// Durable commits exist; the next worker continues from `from_step`.
    Resume {
        from_step: usize,
        commits: Vec<String>,
    },
}

impl RecoveryPlan {
    /// Decide from the last recorded checkpoint, if any.
    pub fn from_checkpoint(checkpoint: Option<&Checkpoint>) -> Self {
        match checkpoint {
            Some(cp) if cp.has_durable_work() => Self::Resume {
                from_step: cp.current_step,
                commits: cp.commits.clone(),
            },
            _ => Self::CleanRetry,
        }
    }

    /// Instruction injected into the next worker's brief. Clean retries
    /// need none.
    pub fn instruction(&self) -> Option<String> {
        match self {
            Self::CleanRetry => None,
            Self::Resume { from_step, commits } => Some(format!(
                "resume from step {from_step}: do not redo steps 1..{from_step}; the \
                 following commits already exist and must be built on, not replaced: {}",
                commits.join(", ")
            )),
        }
    }
}

/// One JSON file per item under the checkpoint directory.
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Path of the ledger file for an item. Handed to subprocess workers
    /// so they can append while executing.
    pub fn path_for(&self, item_id: &str) -> PathBuf {
        self.dir.join(format!("{item_id}.json"))
    }

    fn save(&self, checkpoint: &Checkpoint) -> DispatchResult<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(&checkpoint.item_id);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(checkpoint)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Create a fresh running ledger for an item, replacing any stale one.
    pub fn begin(&self, item_id: &str) -> DispatchResult<Checkpoint> {
        let checkpoint = Checkpoint::new(item_id);
        self.save(&checkpoint)?;
        debug!(item = item_id, "Checkpoint opened");
        Ok(checkpoint)
    }

    pub fn load(&self, item_id: &str) -> DispatchResult<Option<Checkpoint>> {
        let path = self.path_for(item_id);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(&path)?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    /// Append a completed step descriptor and advance the step cursor.
    pub fn append_step(&self, item_id: &str, step: &str) -> DispatchResult<Checkpoint> {
        let mut checkpoint = self
            .load(item_id)?
            .unwrap_or_else(|| Checkpoint::new(item_id));
        checkpoint.steps_completed.push(step.to_string());
        checkpoint.current_step = checkpoint.steps_completed.len();
        checkpoint.updated_at = Utc::now();
        self.save(&checkpoint)?;
        Ok(checkpoint)
    }

    /// Append a durable commit ref.
    pub fn append_commit(&self, item_id: &str, commit: &str) -> DispatchResult<Checkpoint> {
        let mut checkpoint = self
            .load(item_id)?
            .unwrap_or_else(|| Checkpoint::new(item_id));
        checkpoint.commits.push(commit.to_string());
        checkpoint.updated_at = Utc::now();
        self.save(&checkpoint)?;
        Ok(checkpoint)
    }

    /// Fold a finished worker's reported steps and commits into the ledger.
    pub fn absorb_report(
        &self,
        item_id: &str,
        steps: &[String],
        commits: &[String],
    ) -> DispatchResult<Checkpoint> {
        let mut checkpoint = self
            .load(item_id)?
            .unwrap_or_else(|| Checkpoint::new(item_id));
        for step in steps {
            if !checkpoint.steps_completed.contains(step) {
                checkpoint.steps_completed.push(step.clone());
            }
        }
        for commit in commits {
            if !checkpoint.commits.contains(commit) {
                checkpoint.commits.push(commit.clone());
            }
        }
        checkpoint.current_step = checkpoint.steps_completed.len();
        checkpoint.updated_at = Utc::now();
        self.save(&checkpoint)?;
        Ok(checkpoint)
    }

    /// Plan recovery for an unresponsive worker and mark the ledger.
    pub fn plan_recovery(&self, item_id: &str) -> DispatchResult<RecoveryPlan> {
        let checkpoint = self.load(item_id)?;
        let plan = RecoveryPlan::from_checkpoint(checkpoint.as_ref());
        if let Some(mut cp) = checkpoint {
            if plan != RecoveryPlan::CleanRetry {
                cp.status = CheckpointStatus::Recovering;
                cp.updated_at = Utc::now();
                self.save(&cp)?;
            } else {
                // Clean retry restarts from scratch; drop the stale ledger.
                self.delete(item_id)?;
            }
        }
        Ok(plan)
    }

    /// Remove the ledger — the item reached Completed.
    pub fn delete(&self, item_id: &str) -> DispatchResult<()> {
        let path = self.path_for(item_id);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }
}
