//! Issue-tracker interface.
//!
//! The orchestrator is read-mostly against an external tracker; the trait
//! here is the seam. The production implementation shells out to the `bd`
//! CLI (see the drover crate); tests supply hand-rolled mocks.

use std::collections::BTreeSet;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::work::{WorkItem, WorkKind};

/// An issue as the tracker reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedIssue {
    pub id: String,
    pub title: String,
    pub status: String,
    pub priority: Option<i64>,
    #[serde(rename = "type")]
    pub issue_type: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Files the issue declares it will touch, when the tracker knows.
    #[serde(default)]
    pub resources: Vec<String>,
}

impl TrackedIssue {
    /// Convert into a fresh work item. Sequence is assigned by the store.
    pub fn into_work_item(self) -> WorkItem {
        let kind = self
            .issue_type
            .as_deref()
            .map(WorkKind::parse_tag)
            .unwrap_or(WorkKind::Unknown);
        let mut item = WorkItem::new(self.id, self.title, kind)
            .with_priority(self.priority.unwrap_or(0));
        item.dependencies = self.dependencies.into_iter().collect::<BTreeSet<_>>();
        item.predicted_resources = self.resources.into_iter().collect::<BTreeSet<_>>();
        item
    }
}

/// One edge of a dependency tree: `from` depends on `to`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub from: String,
    pub to: String,
}

/// A dependency cycle as a path of issue ids.
pub type CyclePath = Vec<String>;

/// Read/write surface of the external issue tracker.
///
/// Implementations must be cheap to call once per heartbeat; the failsafe
/// wrapper in [`super::GraphClient`] handles unavailability.
pub trait IssueTracker: Send + Sync {
    /// Issues whose dependencies are all closed, ready for dispatch.
    fn list_ready(&self) -> Result<Vec<TrackedIssue>>;

    /// Full dependency tree reachable from `id`.
    fn dependency_tree(&self, id: &str) -> Result<Vec<DependencyEdge>>;

    /// Cycles anywhere in the tracked graph.
    fn cycle_check(&self) -> Result<Vec<CyclePath>>;

    /// Update the tracker-side status of an issue.
    fn update_status(&self, id: &str, status: &str) -> Result<()>;

    /// Close an issue.
    fn close(&self, id: &str, reason: Option<&str>) -> Result<()>;

    /// Create a new issue, returning its id. Used when a worker discovers
    /// follow-on work and when tier-3 conflicts escalate to manual review.
    fn create(&self, title: &str, issue_type: &str, deps: &[String]) -> Result<String>;
}
