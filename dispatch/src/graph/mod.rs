//! Dependency Graph Client — tracker access with graceful degradation.
//!
//! `GraphClient` wraps the issue tracker and the optional intelligence
//! overlay behind a failsafe surface: any tracker failure logs a warning
//! and returns an empty/permissive response, so the orchestrator keeps
//! running with reduced intelligence instead of failing hard.

pub mod analysis;
pub mod intel;
pub mod tracker;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

pub use analysis::DependencyGraph;
pub use intel::{ExecutionTrack, GraphInsights, GraphIntelClient, PriorityRecommendation};
pub use tracker::{CyclePath, DependencyEdge, IssueTracker, TrackedIssue};

/// Failsafe facade over the tracker and the optional overlay.
pub struct GraphClient {
    tracker: Arc<dyn IssueTracker>,
    intel: Option<GraphIntelClient>,
}

impl GraphClient {
    pub fn new(tracker: Arc<dyn IssueTracker>) -> Self {
        Self {
            tracker,
            intel: None,
        }
    }

    pub fn with_intel(mut self, intel: GraphIntelClient) -> Self {
        self.intel = Some(intel);
        self
    }

    pub fn has_intel(&self) -> bool {
        self.intel.is_some()
    }

    /// Ready issues, or empty when the tracker is unreachable.
    pub fn list_ready(&self) -> Vec<TrackedIssue> {
        match self.tracker.list_ready() {
            Ok(issues) => issues,
            Err(e) => {
                warn!(error = %e, "Tracker list_ready failed — proceeding with empty set");
                Vec::new()
            }
        }
    }

    /// Dependency tree for an item, or empty on failure.
    pub fn dependency_tree(&self, id: &str) -> Vec<DependencyEdge> {
        match self.tracker.dependency_tree(id) {
            Ok(edges) => edges,
            Err(e) => {
                warn!(id, error = %e, "Tracker dependency_tree failed");
                Vec::new()
            }
        }
    }

    /// Cycles the tracker knows about, or empty on failure. Callers that
    /// need certainty also run the local petgraph check over loaded items.
    pub fn cycle_check(&self) -> Vec<CyclePath> {
        match self.tracker.cycle_check() {
            Ok(cycles) => cycles,
            Err(e) => {
                warn!(error = %e, "Tracker cycle_check failed — relying on local analysis");
                Vec::new()
            }
        }
    }

    /// Best-effort status push; failures only warn.
    pub fn update_status(&self, id: &str, status: &str) {
        if let Err(e) = self.tracker.update_status(id, status) {
            warn!(id, status, error = %e, "Tracker update_status failed");
        }
    }

    /// Best-effort close; failures only warn.
    pub fn close(&self, id: &str, reason: Option<&str>) {
        if let Err(e) = self.tracker.close(id, reason) {
            warn!(id, error = %e, "Tracker close failed");
        }
    }

    /// Best-effort issue creation; returns the new id when the tracker
    /// cooperates.
    pub fn create(&self, title: &str, issue_type: &str, deps: &[String]) -> Option<String> {
        match self.tracker.create(title, issue_type, deps) {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(title, error = %e, "Tracker create failed");
                None
            }
        }
    }

    /// Unblock-count ranking from the overlay, keyed by item id. Empty when
    /// the overlay is absent or unreachable — the scheduler then falls back
    /// to priority-then-insertion-order.
    pub async fn ranking_hints(&self) -> HashMap<String, usize> {
        let Some(intel) = &self.intel else {
            return HashMap::new();
        };
        intel
            .priority_recommendations()
            .await
            .into_iter()
            .map(|rec| (rec.id, rec.unblock_count))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{anyhow, Result};

    /// Tracker that fails every call.
    struct DownTracker;

    impl IssueTracker for DownTracker {
        fn list_ready(&self) -> Result<Vec<TrackedIssue>> {
            Err(anyhow!("connection refused"))
        }
        fn dependency_tree(&self, _id: &str) -> Result<Vec<DependencyEdge>> {
            Err(anyhow!("connection refused"))
        }
        fn cycle_check(&self) -> Result<Vec<CyclePath>> {
            Err(anyhow!("connection refused"))
        }
        fn update_status(&self, _id: &str, _status: &str) -> Result<()> {
            Err(anyhow!("connection refused"))
        }
        fn close(&self, _id: &str, _reason: Option<&str>) -> Result<()> {
            Err(anyhow!("connection refused"))
        }
        fn create(&self, _title: &str, _issue_type: &str, _deps: &[String]) -> Result<String> {
            Err(anyhow!("connection refused"))
        }
    }

    #[test]
    fn test_down_tracker_degrades_to_empty() {
        let client = GraphClient::new(Arc::new(DownTracker));
        assert!(client.list_ready().is_empty());
        assert!(client.dependency_tree("x").is_empty());
        assert!(client.cycle_check().is_empty());
        assert!(client.create("t", "test", &[]).is_none());
        // These must not panic or propagate.
        client.update_status("x", "in_progress");
        client.close("x", Some("done"));
    }

    #[tokio::test]
    async fn test_no_intel_means_no_hints() {
        let client = GraphClient::new(Arc::new(DownTracker));
        assert!(!client.has_intel());
        assert!(client.ranking_hints().await.is_empty());
    }
}
