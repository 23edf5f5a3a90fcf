//! Version-control commit interface.
//!
//! The orchestrator only needs two operations from version control: a
//! non-destructive trial merge of a worker's change set against the current
//! baseline, and a real commit once validation passes. The git-backed
//! implementation lives in the drover crate.

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// A worker's output: a branch plus the files it touched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    /// Branch holding the worker's commits.
    pub branch: String,
    /// Files the change set touches.
    #[serde(default)]
    pub files: Vec<String>,
}

impl ChangeSet {
    pub fn new(branch: impl Into<String>) -> Self {
        Self {
            branch: branch.into(),
            files: Vec::new(),
        }
    }

    pub fn with_files<I, S>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.files = files.into_iter().map(Into::into).collect();
        self
    }
}

/// Result of a trial merge probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "result", content = "detail")]
pub enum MergeProbe {
    /// The change set merges cleanly onto the baseline.
    Clean,
    /// The merge conflicts; the textual diff is attached for the resolver.
    Conflict { diff: String },
}

impl MergeProbe {
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Clean)
    }
}

/// Commit mechanics, as seen by the validation pipeline.
pub trait CommitInterface: Send + Sync {
    /// Probe whether `change` merges onto the current baseline without
    /// mutating it.
    fn trial_merge(&self, change: &ChangeSet) -> Result<MergeProbe>;

    /// Merge the change set for real and return the resulting ref.
    fn commit(&self, change: &ChangeSet, message: &str) -> Result<String>;
}
