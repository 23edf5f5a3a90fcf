//! Conflict Resolver — escalating three-tier strategy for merge conflicts.
//!
//! Invoked when the merge gate fails. The tier is keyed by the item's
//! `conflict_attempt` counter, which only ever increases:
//!
//! - tier 1, conflict-aware retry: capture the diff, attach it to the
//!   item's context, requeue; the next worker reconciles both change sets.
//! - tier 2, serialization: when an in-flight item shares the conflicted
//!   resource, block behind it instead of retrying blindly.
//! - tier 3, manual escalation: the conflict is against committed history;
//!   record it for human review and keep the loop moving.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::DispatchResult;
use crate::work::WorkItem;

/// What the orchestrator should do with a conflicted item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action", content = "detail")]
pub enum ConflictAction {
    /// Requeue to ready with the conflict context attached.
    RetryWithContext,
    /// Block behind the named in-flight item; requeue when it completes.
    Serialize { behind: String },
    /// Out of automatic options: durable review record, item fails.
    Escalate,
}

/// Decision for one conflict event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictResolution {
    pub item_id: String,
    /// Tier the item has now reached (1..=3).
    pub tier: u8,
    pub action: ConflictAction,
    /// Context note to attach for the next worker, when retrying.
    pub note: Option<String>,
}

/// Durable record of a conflict no tier could resolve automatically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManualReviewRecord {
    pub id: String,
    pub item_id: String,
    pub title: String,
    pub diff: String,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

impl ManualReviewRecord {
    pub fn new(item: &WorkItem, diff: &str, reason: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            item_id: item.id.clone(),
            title: format!("manual review: {}", item.title),
            diff: diff.to_string(),
            reason: reason.to_string(),
            created_at: Utc::now(),
        }
    }
}

/// The resolver: a pure decision function over the conflict state.
pub struct ConflictResolver;

impl ConflictResolver {
    /// Decide the next tier for `item` given the conflict `diff` and the
    /// currently in-flight items. `item.conflict_attempt` is the number of
    /// tiers already consumed; the returned resolution's `tier` is always
    /// exactly one judgment further along.
    pub fn resolve(
        item: &WorkItem,
        diff: &str,
        in_progress: &[WorkItem],
    ) -> ConflictResolution {
        match item.conflict_attempt {
            0 => ConflictResolution {
                item_id: item.id.clone(),
                tier: 1,
                action: ConflictAction::RetryWithContext,
                note: Some(Self::retry_note(item, diff)),
            },
            1 => {
                // A live blocker explains the conflict only if it predicts
                // the same resources this item does.
                if let Some(blocker) = in_progress
                    .iter()
                    .find(|active| active.id != item.id && active.shares_resources(item))
                {
                    info!(
                        item = %item.id,
                        behind = %blocker.id,
                        "Serializing conflicted item behind in-flight blocker"
                    );
                    ConflictResolution {
                        item_id: item.id.clone(),
                        tier: 2,
                        action: ConflictAction::Serialize {
                            behind: blocker.id.clone(),
                        },
                        note: Some(format!(
                            "serialized behind {} after repeated merge conflict",
                            blocker.id
                        )),
                    }
                } else {
                    // Nothing in flight explains it: the conflict is against
                    // already-committed history.
                    Self::escalation(item, 3)
                }
            }
            _ => Self::escalation(item, 3),
        }
    }

    fn escalation(item: &WorkItem, tier: u8) -> ConflictResolution {
        warn!(item = %item.id, "Conflict escalated to manual review");
        ConflictResolution {
            item_id: item.id.clone(),
            tier,
            action: ConflictAction::Escalate,
            note: None,
        }
    }

    fn retry_note(item: &WorkItem, diff: &str) -> String {
        format!(
            "merge conflict on attempt {}: reconcile BOTH change sets — do not overwrite \
             the baseline changes. Conflict diff:\n{diff}",
            item.attempt
        )
    }
}

/// Durable queue of manual-review records, one JSON file per record.
pub struct ReviewQueue {
    dir: PathBuf,
}

impl ReviewQueue {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Persist a record; the file name carries the item id for operators.
    pub fn push(&self, record: &ManualReviewRecord) -> DispatchResult<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(format!("{}-{}.json", record.item_id, record.id));
        std::fs::write(&path, serde_json::to_vec_pretty(record)?)?;
        Ok(path)
    }

    /// All pending review records, oldest first.
    pub fn pending(&self) -> DispatchResult<Vec<ManualReviewRecord>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut records = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                let bytes = std::fs::read(&path)?;
                match serde_json::from_slice::<ManualReviewRecord>(&bytes) {
                    Ok(record) => records.push(record),
                    Err(e) => warn!(path = %path.display(), error = %e, "Unreadable review record"),
                }
            }
        }
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::work::{WorkKind, WorkStatus};

    fn conflicted(id: &str, tier: u8, resources: &[&str]) -> WorkItem {
        let mut item = WorkItem::new(id, id.to_uppercase(), WorkKind::DataLayer)
            .with_resources(resources.iter().copied());
        item.conflict_attempt = tier;
        item.attempt = 1;
        item
    }

    fn active(id: &str, resources: &[&str]) -> WorkItem {
        let mut item = WorkItem::new(id, id.to_uppercase(), WorkKind::DataLayer)
            .with_resources(resources.iter().copied());
        item.status = WorkStatus::InProgress;
        item
    }

    #[test]
    fn test_tier_one_attaches_diff_and_retries() {
        let item = conflicted("e", 0, &["shared.go"]);
        let resolution = ConflictResolver::resolve(&item, "<<<<<<< ours", &[]);
        assert_eq!(resolution.tier, 1);
        assert_eq!(resolution.action, ConflictAction::RetryWithContext);
        let note = resolution.note.unwrap();
        assert!(note.contains("<<<<<<< ours"));
        assert!(note.contains("reconcile BOTH"));
    }

    #[test]
    fn test_tier_two_serializes_behind_live_blocker() {
        let item = conflicted("e", 1, &["shared.go"]);
        let blocker = active("f", &["shared.go"]);
        let resolution = ConflictResolver::resolve(&item, "diff", &[blocker]);
        assert_eq!(resolution.tier, 2);
        assert_eq!(
            resolution.action,
            ConflictAction::Serialize {
                behind: "f".into()
            }
        );
    }

    #[test]
    fn test_tier_two_without_blocker_escalates() {
        let item = conflicted("e", 1, &["shared.go"]);
        let unrelated = active("g", &["other.rs"]);
        let resolution = ConflictResolver::resolve(&item, "diff", &[unrelated]);
        assert_eq!(resolution.tier, 3);
        assert_eq!(resolution.action, ConflictAction::Escalate);
    }

    #[test]
    fn test_tier_three_always_escalates() {
        let item = conflicted("e", 2, &["shared.go"]);
        let blocker = active("f", &["shared.go"]);
        // Even with a plausible blocker, tier 2 was already spent.
        let resolution = ConflictResolver::resolve(&item, "diff", &[blocker]);
        assert_eq!(resolution.action, ConflictAction::Escalate);
        assert_eq!(resolution.tier, 3);
    }

    #[test]
    fn test_review_queue_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let queue = ReviewQueue::new(dir.path().join("review"));
        assert!(queue.pending().unwrap().is_empty());

        let item = conflicted("e", 2, &[]);
        let record = ManualReviewRecord::new(&item, "the diff", "conflict tier exhausted");
        let path = queue.push(&record).unwrap();
        assert!(path.exists());

        let pending = queue.pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].item_id, "e");
        assert_eq!(pending[0].diff, "the diff");
    }
}
