//! Error taxonomy for the dispatch library.
//!
//! Every recoverable failure in the orchestration engine maps onto one of
//! these variants so the control loop can route it: validation failures and
//! worker crashes retry locally, merge conflicts go to the tiered resolver,
//! cycles block only the affected subgraph, lock contention skips to the
//! next candidate, and escalations surface a durable review record without
//! stopping the loop.

use thiserror::Error;

/// Result alias used throughout the dispatch crate.
pub type DispatchResult<T> = Result<T, DispatchError>;

/// Errors produced by the orchestration engine.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// A validation gate failed for a work item.
    #[error("validation failed at gate '{gate}': {detail}")]
    ValidationFailure { gate: String, detail: String },

    /// Gate 3 detected a merge conflict against the baseline.
    #[error("merge conflict detected:\n{diff}")]
    MergeConflict { diff: String },

    /// A worker died or stopped responding mid-task.
    #[error("worker crashed: {0}")]
    WorkerCrash(String),

    /// The dependency graph contains a cycle through the listed items.
    #[error("dependency cycle detected: {}", path.join(" -> "))]
    CycleDetected { path: Vec<String> },

    /// Another slot already holds the lock for this item.
    #[error("lock contention on work item '{item}'")]
    LockContention { item: String },

    /// Automatic resolution is exhausted; a human must look at this item.
    #[error("manual escalation required for work item '{item}': {reason}")]
    EscalationRequired { item: String, reason: String },

    /// An illegal queue transition was attempted.
    #[error("illegal transition for '{item}': {from} -> {to}")]
    IllegalTransition {
        item: String,
        from: String,
        to: String,
    },

    /// Dispatch was attempted before every dependency closed.
    #[error("dependencies still open for '{item}': {missing:?}")]
    DependenciesOpen { item: String, missing: Vec<String> },

    /// A work item id was not found in the record store.
    #[error("unknown work item '{0}'")]
    UnknownItem(String),

    /// The record store could not be read or written.
    #[error("store error: {0}")]
    Store(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl DispatchError {
    /// Whether the dispatcher should simply try the next candidate.
    pub fn is_skippable(&self) -> bool {
        matches!(self, Self::LockContention { .. })
    }

    /// Whether this error leaves the item eligible for an automatic retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ValidationFailure { .. } | Self::WorkerCrash(_) | Self::Io(_)
        )
    }
}
