//! Core types for the work queue
//!
//! A WorkItem is one node of the dependency graph: a discrete,
//! independently-completable unit of work. Its status places it in exactly
//! one of the five conceptual queues at any time.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Highest conflict tier; at this value an item never re-enters Ready
/// automatically.
pub const CONFLICT_TIER_CAP: u8 = 3;

/// Capability tag describing the kind of worker an item needs.
///
/// Unknown tags deserialize to `Unknown`, which routes to the default
/// capability instead of string-matching heuristics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkKind {
    DataLayer,
    InterfaceLayer,
    PresentationLayer,
    Test,
    Integration,
    #[serde(other)]
    Unknown,
}

impl WorkKind {
    /// Parse a free-form tag from the issue tracker.
    pub fn parse_tag(tag: &str) -> Self {
        match tag {
            "data-layer" => Self::DataLayer,
            "interface-layer" => Self::InterfaceLayer,
            "presentation-layer" => Self::PresentationLayer,
            "test" => Self::Test,
            "integration" => Self::Integration,
            _ => Self::Unknown,
        }
    }

    /// Capability name used when building the worker request.
    pub fn capability(&self) -> &'static str {
        match self {
            Self::DataLayer => "data-layer",
            Self::InterfaceLayer => "interface-layer",
            Self::PresentationLayer => "presentation-layer",
            Self::Test => "test",
            Self::Integration => "integration",
            Self::Unknown => "general",
        }
    }
}

impl fmt::Display for WorkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.capability())
    }
}

/// The five queue partitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "detail")]
pub enum WorkStatus {
    /// Dispatchable as soon as capacity frees up.
    Ready,
    /// Bound to exactly one slot and one lock.
    InProgress,
    /// Waiting for another in-flight item to complete.
    Blocked { on: String },
    /// All validation gates passed; result committed.
    Completed,
    /// Out of attempts or escalated — terminal, needs a human.
    Failed,
}

impl WorkStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn is_in_progress(&self) -> bool {
        matches!(self, Self::InProgress)
    }
}

impl fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => write!(f, "ready"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Blocked { on } => write!(f, "blocked(on={on})"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// One dependency-graph node: a discrete unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    /// Opaque stable identifier (issue-tracker id).
    pub id: String,
    /// Human-readable title.
    pub title: String,
    /// Capability tag for worker selection.
    pub kind: WorkKind,
    /// Ids that must be Completed before this item may dispatch.
    pub dependencies: BTreeSet<String>,
    /// Files/regions this item is likely to touch; used for proactive
    /// conflict avoidance, not correctness.
    pub predicted_resources: BTreeSet<String>,
    /// Tracker priority; higher dispatches first in the fallback ranking.
    pub priority: i64,
    /// Insertion order, tiebreaker after priority.
    pub sequence: u64,
    /// Completed dispatch attempts.
    pub attempt: u32,
    /// Queue partition.
    pub status: WorkStatus,
    /// Conflict-resolution tier reached so far (0..=3, monotonic).
    pub conflict_attempt: u8,
    /// Most recent failure summary, if any.
    pub last_failure: Option<String>,
    /// Notes attached for the next worker: conflict diffs, resume
    /// instructions, serialization hints.
    pub context_notes: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkItem {
    /// Create a fresh Ready item. `sequence` is assigned by the store.
    pub fn new(id: impl Into<String>, title: impl Into<String>, kind: WorkKind) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: title.into(),
            kind,
            dependencies: BTreeSet::new(),
            predicted_resources: BTreeSet::new(),
            priority: 0,
            sequence: 0,
            attempt: 0,
            status: WorkStatus::Ready,
            conflict_attempt: 0,
            last_failure: None,
            context_notes: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_resources<I, S>(mut self, resources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.predicted_resources = resources.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Whether this item's predicted resources intersect another's.
    pub fn shares_resources(&self, other: &WorkItem) -> bool {
        self.predicted_resources
            .intersection(&other.predicted_resources)
            .next()
            .is_some()
    }

    /// Whether the conflict tier cap removes this item from automatic
    /// dispatch.
    pub fn conflict_exhausted(&self) -> bool {
        self.conflict_attempt >= CONFLICT_TIER_CAP
    }

    /// Attach a context note for the next worker, touching `updated_at`.
    pub fn push_note(&mut self, note: impl Into<String>) {
        self.context_notes.push(note.into());
        self.updated_at = Utc::now();
    }
}

/// Mutual-exclusion marker for one in-progress item.
///
/// Created on dispatch, released unconditionally on completion, failure or
/// recovery — before any retry/escalation logic runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lock {
    pub item_id: String,
    pub slot_index: usize,
    pub acquired_at: DateTime<Utc>,
}

impl Lock {
    pub fn new(item_id: impl Into<String>, slot_index: usize) -> Self {
        Self {
            item_id: item_id.into(),
            slot_index,
            acquired_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_parse_known_and_unknown() {
        assert_eq!(WorkKind::parse_tag("data-layer"), WorkKind::DataLayer);
        assert_eq!(WorkKind::parse_tag("test"), WorkKind::Test);
        assert_eq!(WorkKind::parse_tag("frobnicator"), WorkKind::Unknown);
        assert_eq!(WorkKind::Unknown.capability(), "general");
    }

    #[test]
    fn test_kind_unknown_tag_deserializes() {
        let kind: WorkKind = serde_json::from_str("\"something-new\"").unwrap();
        assert_eq!(kind, WorkKind::Unknown);
    }

    #[test]
    fn test_status_terminal() {
        assert!(WorkStatus::Completed.is_terminal());
        assert!(WorkStatus::Failed.is_terminal());
        assert!(!WorkStatus::Ready.is_terminal());
        assert!(!WorkStatus::Blocked { on: "x".into() }.is_terminal());
    }

    #[test]
    fn test_shares_resources() {
        let a = WorkItem::new("a", "A", WorkKind::DataLayer).with_resources(["src/db.rs"]);
        let b = WorkItem::new("b", "B", WorkKind::DataLayer).with_resources(["src/db.rs"]);
        let c = WorkItem::new("c", "C", WorkKind::Test).with_resources(["tests/api.rs"]);
        assert!(a.shares_resources(&b));
        assert!(!a.shares_resources(&c));
    }

    #[test]
    fn test_conflict_cap() {
        let mut item = WorkItem::new("x", "X", WorkKind::Integration);
        assert!(!item.conflict_exhausted());
        item.conflict_attempt = CONFLICT_TIER_CAP;
        assert!(item.conflict_exhausted());
    }

    #[test]
    fn test_item_serde_roundtrip() {
        let item = WorkItem::new("w-1", "Wire up config", WorkKind::InterfaceLayer)
            .with_dependencies(["w-0"])
            .with_resources(["src/config.rs"])
            .with_priority(2);
        let json = serde_json::to_string(&item).unwrap();
        let restored: WorkItem = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.id, "w-1");
        assert!(restored.dependencies.contains("w-0"));
        assert_eq!(restored.priority, 2);
        assert_eq!(restored.status, WorkStatus::Ready);
    }
}
