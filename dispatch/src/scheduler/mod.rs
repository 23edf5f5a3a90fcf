//! Scheduler — picks the next work item for a free slot.
//!
//! Pure decision logic, no side effects: the orchestrator feeds it the
//! ready set, the in-flight set, ranking hints and the cycle membership,
//! and acts on the returned selection. Ranking prefers the overlay's
//! unblock-counts when present and falls back to priority then insertion
//! order. Candidates that would collide with an in-flight item's predicted
//! resources are passed over for this tick, not rejected permanently.

use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::retry::RetryPolicy;
use crate::work::WorkItem;

/// Why a ready candidate was not chosen this tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Predicted resources intersect an in-flight item's.
    ResourceOverlap { with: String },
    /// The item sits on a dependency cycle; dispatch is fatal for its
    /// subgraph until the cycle is broken upstream.
    CycleMember,
    /// Conflict tier cap reached; manual intervention required.
    ConflictExhausted,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ResourceOverlap { with } => write!(f, "resource overlap with {with}"),
            Self::CycleMember => write!(f, "member of a dependency cycle"),
            Self::ConflictExhausted => write!(f, "conflict tier exhausted"),
        }
    }
}

/// Outcome of one selection pass.
#[derive(Debug, Default)]
pub struct Selection {
    /// The item to dispatch, if any candidate survived the filters.
    pub chosen: Option<WorkItem>,
    /// Candidates passed over this tick, with reasons.
    pub skipped: Vec<(String, SkipReason)>,
    /// Items whose attempt budget is spent; the caller must force them to
    /// Failed rather than dispatch them again.
    pub out_of_attempts: Vec<String>,
}

/// The dispatcher: ranking plus filters, consulted whenever a slot frees.
pub struct Dispatcher {
    retry: RetryPolicy,
}

impl Dispatcher {
    pub fn new(retry: RetryPolicy) -> Self {
        Self { retry }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Rank ready items: overlay unblock-count first when hints exist,
    /// then priority descending, then insertion order.
    fn rank(&self, ready: &[WorkItem], hints: &HashMap<String, usize>) -> Vec<WorkItem> {
        let mut ranked = ready.to_vec();
        ranked.sort_by(|a, b| {
            let ha = hints.get(&a.id).copied().unwrap_or(0);
            let hb = hints.get(&b.id).copied().unwrap_or(0);
            hb.cmp(&ha)
                .then(b.priority.cmp(&a.priority))
                .then(a.sequence.cmp(&b.sequence))
        });
        ranked
    }

    /// Pick the highest-value dispatchable item.
    ///
    /// The resource filter looks only at `InProgress` items; blocked items
    /// are not conflict sources. Actual conflicts are still caught by the
    /// merge gate — this filter is advisory.
    pub fn select(
        &self,
        ready: &[WorkItem],
        in_progress: &[WorkItem],
        hints: &HashMap<String, usize>,
        cycle_members: &HashSet<String>,
    ) -> Selection {
        let mut selection = Selection::default();

        for candidate in self.rank(ready, hints) {
            if self.retry.exhausted(candidate.attempt) {
                selection.out_of_attempts.push(candidate.id.clone());
                continue;
            }
            if candidate.conflict_exhausted() {
                selection
                    .skipped
                    .push((candidate.id.clone(), SkipReason::ConflictExhausted));
                continue;
            }
            if cycle_members.contains(&candidate.id) {
                selection
                    .skipped
                    .push((candidate.id.clone(), SkipReason::CycleMember));
                continue;
            }
            if let Some(colliding) = in_progress
                .iter()
                .find(|active| candidate.shares_resources(active))
            {
                selection.skipped.push((
                    candidate.id.clone(),
                    SkipReason::ResourceOverlap {
                        with: colliding.id.clone(),
                    },
                ));
                continue;
            }

            selection.chosen = Some(candidate);
            break;
        }

        selection
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::work::{WorkKind, WorkStatus, CONFLICT_TIER_CAP};

    fn item(id: &str, seq: u64, priority: i64) -> WorkItem {
        let mut item = WorkItem::new(id, id.to_uppercase(), WorkKind::DataLayer)
            .with_priority(priority);
        item.sequence = seq;
        item
    }

    #[test]
    fn test_fallback_ranking_priority_then_sequence() {
        let dispatcher = Dispatcher::default();
        let ready = vec![item("a", 0, 1), item("b", 1, 5), item("c", 2, 5)];
        let selection = dispatcher.select(&ready, &[], &HashMap::new(), &HashSet::new());
        // b and c share priority; b was inserted first.
        assert_eq!(selection.chosen.unwrap().id, "b");
    }

    #[test]
    fn test_hints_override_priority() {
        let dispatcher = Dispatcher::default();
        let ready = vec![item("a", 0, 9), item("b", 1, 0)];
        let hints = HashMap::from([("b".to_string(), 4usize)]);
        let selection = dispatcher.select(&ready, &[], &hints, &HashSet::new());
        assert_eq!(selection.chosen.unwrap().id, "b");
    }

    #[test]
    fn test_resource_overlap_skips_to_next_candidate() {
        let dispatcher = Dispatcher::default();
        let mut active = item("running", 0, 0);
        active.status = WorkStatus::InProgress;
        active.predicted_resources = ["shared.go".to_string()].into();

        let mut c = item("c", 1, 5);
        c.predicted_resources = ["shared.go".to_string()].into();
        let mut d = item("d", 2, 1);
        d.predicted_resources = ["other.go".to_string()].into();

        let selection =
            dispatcher.select(&[c, d], &[active], &HashMap::new(), &HashSet::new());
        assert_eq!(selection.chosen.unwrap().id, "d");
        assert_eq!(selection.skipped.len(), 1);
        assert!(matches!(
            selection.skipped[0].1,
            SkipReason::ResourceOverlap { .. }
        ));
    }

    #[test]
    fn test_cycle_members_blocked_without_halting_others() {
        let dispatcher = Dispatcher::default();
        let ready = vec![item("cyclic", 0, 9), item("free", 1, 0)];
        let cycles = HashSet::from(["cyclic".to_string()]);
        let selection = dispatcher.select(&ready, &[], &HashMap::new(), &cycles);
        assert_eq!(selection.chosen.unwrap().id, "free");
        assert_eq!(selection.skipped[0], ("cyclic".into(), SkipReason::CycleMember));
    }

    #[test]
    fn test_out_of_attempts_reported_not_dispatched() {
        let dispatcher = Dispatcher::new(RetryPolicy {
            max_attempts: 2,
            ..RetryPolicy::default()
        });
        let mut spent = item("spent", 0, 9);
        spent.attempt = 2;
        let ready = vec![spent, item("fresh", 1, 0)];
        let selection = dispatcher.select(&ready, &[], &HashMap::new(), &HashSet::new());
        assert_eq!(selection.out_of_attempts, vec!["spent".to_string()]);
        assert_eq!(selection.chosen.unwrap().id, "fresh");
    }

    #[test]
    fn test_conflict_exhausted_never_chosen() {
        let dispatcher = Dispatcher::default();
        let mut stuck = item("stuck", 0, 9);
        stuck.conflict_attempt = CONFLICT_TIER_CAP;
        let selection = dispatcher.select(&[stuck], &[], &HashMap::new(), &HashSet::new());
        assert!(selection.chosen.is_none());
        assert_eq!(
            selection.skipped[0],
            ("stuck".into(), SkipReason::ConflictExhausted)
        );
    }

    #[test]
    fn test_empty_ready_set() {
        let dispatcher = Dispatcher::default();
        let selection = dispatcher.select(&[], &[], &HashMap::new(), &HashSet::new());
        assert!(selection.chosen.is_none());
        assert!(selection.skipped.is_empty());
    }
}
