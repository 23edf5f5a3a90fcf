//! Work Record Store — the single atomically-mutated state behind the queue.
//!
//! Every status transition, lock acquire/release and slot binding goes
//! through one read-modify-write under the store's lock, so two dispatch
//! attempts can never bind the same item to two slots. The whole store is
//! serialized to a JSON document after each mutation; on startup any item
//! persisted as in-progress is requeued to ready with its lock cleared,
//! which is the same path used for an external interrupt.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{DispatchError, DispatchResult};
use crate::work::types::{Lock, WorkItem, WorkStatus, CONFLICT_TIER_CAP};

/// Counts per queue partition, for heartbeat reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub ready: usize,
    pub in_progress: usize,
    pub blocked: usize,
    pub completed: usize,
    pub failed: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.ready + self.in_progress + self.blocked + self.completed + self.failed
    }

    /// Whether nothing remains to drive: no ready, blocked or in-flight work.
    pub fn drained(&self) -> bool {
        self.ready == 0 && self.in_progress == 0 && self.blocked == 0
    }
}

/// On-disk shape of the store.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreSnapshot {
    records: Vec<WorkItem>,
    locks: Vec<Lock>,
    completion_order: Vec<String>,
    next_sequence: u64,
}

struct StoreInner {
    records: HashMap<String, WorkItem>,
    locks: HashMap<String, Lock>,
    /// Ids in the order they completed, consulted by the regression sampler.
    completion_order: Vec<String>,
    next_sequence: u64,
}

/// Durable state for every work item: status, attempts, locks.
pub struct WorkRecordStore {
    inner: RwLock<StoreInner>,
    path: Option<PathBuf>,
}

impl WorkRecordStore {
    /// In-memory store (tests, dry runs).
    pub fn in_memory() -> Self {
        Self {
            inner: RwLock::new(StoreInner {
                records: HashMap::new(),
                locks: HashMap::new(),
                completion_order: Vec::new(),
                next_sequence: 0,
            }),
            path: None,
        }
    }

    /// Open the store at `path`, creating it if missing.
    ///
    /// Items persisted as in-progress by a previous process are requeued to
    /// ready — the previous run was interrupted, so their workers are gone.
    pub fn open(path: impl AsRef<Path>) -> DispatchResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut snapshot = if path.exists() {
            let bytes = std::fs::read(&path)?;
            serde_json::from_slice::<StoreSnapshot>(&bytes)?
        } else {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            StoreSnapshot::default()
        };

        let mut requeued = 0usize;
        for item in &mut snapshot.records {
            if item.status.is_in_progress() {
                item.status = WorkStatus::Ready;
                item.push_note("requeued after interrupted run");
                requeued += 1;
            }
        }
        if requeued > 0 {
            snapshot.locks.clear();
            info!(requeued, "Requeued in-progress items from previous run");
        }

        let store = Self {
            inner: RwLock::new(StoreInner {
                records: snapshot
                    .records
                    .into_iter()
                    .map(|r| (r.id.clone(), r))
                    .collect(),
                locks: snapshot
                    .locks
                    .into_iter()
                    .map(|l| (l.item_id.clone(), l))
                    .collect(),
                completion_order: snapshot.completion_order,
                next_sequence: snapshot.next_sequence,
            }),
            path: Some(path),
        };
        if requeued > 0 {
            store.persist_now()?;
        }
        Ok(store)
    }

    fn persist(&self, inner: &StoreInner) -> DispatchResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut records: Vec<WorkItem> = inner.records.values().cloned().collect();
        records.sort_by_key(|r| r.sequence);
        let snapshot = StoreSnapshot {
            records,
            locks: inner.locks.values().cloned().collect(),
            completion_order: inner.completion_order.clone(),
            next_sequence: inner.next_sequence,
        };
        let bytes = serde_json::to_vec_pretty(&snapshot)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, &bytes)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    fn persist_now(&self) -> DispatchResult<()> {
        let inner = self.read()?;
        self.persist(&inner)
    }

    fn read(&self) -> DispatchResult<std::sync::RwLockReadGuard<'_, StoreInner>> {
        self.inner
            .read()
            .map_err(|_| DispatchError::Store("record store lock poisoned".into()))
    }

    fn write(&self) -> DispatchResult<std::sync::RwLockWriteGuard<'_, StoreInner>> {
        self.inner
            .write()
            .map_err(|_| DispatchError::Store("record store lock poisoned".into()))
    }

    /// Insert a new item if its id is not already tracked.
    ///
    /// Returns true when the item was inserted. Sequence numbers record
    /// insertion order for the fallback ranking.
    pub fn insert(&self, mut item: WorkItem) -> DispatchResult<bool> {
        let mut inner = self.write()?;
        if inner.records.contains_key(&item.id) {
            return Ok(false);
        }
        item.sequence = inner.next_sequence;
        inner.next_sequence += 1;
        debug!(id = %item.id, seq = item.sequence, "Tracking work item");
        inner.records.insert(item.id.clone(), item);
        self.persist(&inner)?;
        Ok(true)
    }

    pub fn get(&self, id: &str) -> DispatchResult<Option<WorkItem>> {
        Ok(self.read()?.records.get(id).cloned())
    }

    /// All items currently in the ready partition, in insertion order.
    pub fn ready_items(&self) -> DispatchResult<Vec<WorkItem>> {
        let inner = self.read()?;
        let mut items: Vec<WorkItem> = inner
            .records
            .values()
            .filter(|r| r.status == WorkStatus::Ready)
            .cloned()
            .collect();
        items.sort_by_key(|r| r.sequence);
        Ok(items)
    }

    /// Every tracked item, in insertion order.
    pub fn all_items(&self) -> DispatchResult<Vec<WorkItem>> {
        let inner = self.read()?;
        let mut items: Vec<WorkItem> = inner.records.values().cloned().collect();
        items.sort_by_key(|r| r.sequence);
        Ok(items)
    }

    pub fn in_progress_items(&self) -> DispatchResult<Vec<WorkItem>> {
        let inner = self.read()?;
        Ok(inner
            .records
            .values()
            .filter(|r| r.status.is_in_progress())
            .cloned()
            .collect())
    }

    pub fn counts(&self) -> DispatchResult<StatusCounts> {
        let inner = self.read()?;
        let mut counts = StatusCounts::default();
        for record in inner.records.values() {
            match record.status {
                WorkStatus::Ready => counts.ready += 1,
                WorkStatus::InProgress => counts.in_progress += 1,
                WorkStatus::Blocked { .. } => counts.blocked += 1,
                WorkStatus::Completed => counts.completed += 1,
                WorkStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    /// Ids of completed items, oldest first.
    pub fn completed_ids_in_order(&self) -> DispatchResult<Vec<String>> {
        Ok(self.read()?.completion_order.clone())
    }

    pub fn lock_holder(&self, id: &str) -> DispatchResult<Option<Lock>> {
        Ok(self.read()?.locks.get(id).cloned())
    }

    /// Ready → InProgress: acquire the lock and bind the slot, atomically.
    ///
    /// Guards: the item must exist, be ready, be unlocked, have every
    /// dependency completed, and be below the conflict tier cap. The
    /// attempt counter increments here — one increment per dispatch.
    pub fn begin_dispatch(&self, id: &str, slot_index: usize) -> DispatchResult<WorkItem> {
        let mut inner = self.write()?;

        if inner.locks.contains_key(id) {
            return Err(DispatchError::LockContention { item: id.into() });
        }

        // Dependency guard reads sibling records, so check before the
        // mutable borrow of the item itself.
        let missing: Vec<String> = {
            let item = inner
                .records
                .get(id)
                .ok_or_else(|| DispatchError::UnknownItem(id.into()))?;

            if item.status != WorkStatus::Ready {
                return Err(DispatchError::IllegalTransition {
                    item: id.into(),
                    from: item.status.to_string(),
                    to: "in_progress".into(),
                });
            }
            if item.conflict_exhausted() {
                return Err(DispatchError::EscalationRequired {
                    item: id.into(),
                    reason: format!("conflict tier {CONFLICT_TIER_CAP} reached"),
                });
            }

            item.dependencies
                .iter()
                .filter(|dep| {
                    inner
                        .records
                        .get(*dep)
                        .map(|d| d.status != WorkStatus::Completed)
                        .unwrap_or(true)
                })
                .cloned()
                .collect()
        };
        if !missing.is_empty() {
            return Err(DispatchError::DependenciesOpen {
                item: id.into(),
                missing,
            });
        }

        inner.locks.insert(id.to_string(), Lock::new(id, slot_index));
        let item = inner
            .records
            .get_mut(id)
            .ok_or_else(|| DispatchError::UnknownItem(id.into()))?;
        item.status = WorkStatus::InProgress;
        item.attempt += 1;
        item.updated_at = Utc::now();
        let dispatched = item.clone();
        debug!(id, slot = slot_index, attempt = dispatched.attempt, "Dispatched");
        self.persist(&inner)?;
        Ok(dispatched)
    }

    /// InProgress → Completed. Releases the lock, records completion order,
    /// and returns the ids of blocked items this completion unblocks.
    pub fn complete(&self, id: &str) -> DispatchResult<Vec<String>> {
        let mut inner = self.write()?;
        inner.locks.remove(id);

        {
            let item = inner
                .records
                .get_mut(id)
                .ok_or_else(|| DispatchError::UnknownItem(id.into()))?;
            if !item.status.is_in_progress() {
                return Err(DispatchError::IllegalTransition {
                    item: id.into(),
                    from: item.status.to_string(),
                    to: "completed".into(),
                });
            }
            item.status = WorkStatus::Completed;
            item.last_failure = None;
            item.updated_at = Utc::now();
        }
        inner.completion_order.push(id.to_string());

        let unblocked: Vec<String> = inner
            .records
            .values_mut()
            .filter_map(|record| {
                let waiting =
                    matches!(&record.status, WorkStatus::Blocked { on } if on == id);
                if waiting {
                    record.status = WorkStatus::Ready;
                    record.updated_at = Utc::now();
                    Some(record.id.clone())
                } else {
                    None
                }
            })
            .collect();

        if !unblocked.is_empty() {
            info!(id, ?unblocked, "Completion released blocked items");
        }
        self.persist(&inner)?;
        Ok(unblocked)
    }

    /// InProgress → Ready. Releases the lock first, then attaches the note.
    ///
    /// Used for validation retries, worker-crash recovery and external
    /// interrupts alike.
    pub fn requeue(&self, id: &str, note: Option<&str>) -> DispatchResult<()> {
        let mut inner = self.write()?;
        inner.locks.remove(id);
        let item = inner
            .records
            .get_mut(id)
            .ok_or_else(|| DispatchError::UnknownItem(id.into()))?;
        if !item.status.is_in_progress() {
            return Err(DispatchError::IllegalTransition {
                item: id.into(),
                from: item.status.to_string(),
                to: "ready".into(),
            });
        }
        item.status = WorkStatus::Ready;
        if let Some(note) = note {
            item.push_note(note);
        }
        item.updated_at = Utc::now();
        self.persist(&inner)?;
        Ok(())
    }

    /// InProgress → Blocked on another in-flight item (conflict tier 2).
    pub fn block_on(&self, id: &str, blocker: &str) -> DispatchResult<()> {
        let mut inner = self.write()?;
        inner.locks.remove(id);
        let item = inner
            .records
            .get_mut(id)
            .ok_or_else(|| DispatchError::UnknownItem(id.into()))?;
        if !item.status.is_in_progress() {
            return Err(DispatchError::IllegalTransition {
                item: id.into(),
                from: item.status.to_string(),
                to: format!("blocked(on={blocker})"),
            });
        }
        item.status = WorkStatus::Blocked { on: blocker.into() };
        item.updated_at = Utc::now();
        self.persist(&inner)?;
        Ok(())
    }

    /// Terminal failure, from any non-terminal state. Releases the lock.
    pub fn fail(&self, id: &str, reason: &str) -> DispatchResult<()> {
        let mut inner = self.write()?;
        inner.locks.remove(id);
        let item = inner
            .records
            .get_mut(id)
            .ok_or_else(|| DispatchError::UnknownItem(id.into()))?;
        if item.status.is_terminal() {
            return Err(DispatchError::IllegalTransition {
                item: id.into(),
                from: item.status.to_string(),
                to: "failed".into(),
            });
        }
        warn!(id, reason, "Work item failed");
        item.status = WorkStatus::Failed;
        item.last_failure = Some(reason.into());
        item.updated_at = Utc::now();
        self.persist(&inner)?;
        Ok(())
    }

    /// Record the failure summary without changing status.
    pub fn record_failure_note(&self, id: &str, summary: &str) -> DispatchResult<()> {
        let mut inner = self.write()?;
        let item = inner
            .records
            .get_mut(id)
            .ok_or_else(|| DispatchError::UnknownItem(id.into()))?;
        item.last_failure = Some(summary.into());
        item.updated_at = Utc::now();
        self.persist(&inner)?;
        Ok(())
    }

    /// Raise the conflict tier. Tiers only go up, capped at the maximum.
    pub fn raise_conflict_tier(&self, id: &str) -> DispatchResult<u8> {
        let mut inner = self.write()?;
        let item = inner
            .records
            .get_mut(id)
            .ok_or_else(|| DispatchError::UnknownItem(id.into()))?;
        if item.conflict_attempt < CONFLICT_TIER_CAP {
            item.conflict_attempt += 1;
            item.updated_at = Utc::now();
        }
        let tier = item.conflict_attempt;
        self.persist(&inner)?;
        Ok(tier)
    }

    /// Attach a context note for the next worker.
    pub fn attach_note(&self, id: &str, note: &str) -> DispatchResult<()> {
        let mut inner = self.write()?;
        let item = inner
            .records
            .get_mut(id)
            .ok_or_else(|| DispatchError::UnknownItem(id.into()))?;
        item.push_note(note);
        self.persist(&inner)?;
        Ok(())
    }

    /// Blocked → Ready for every item waiting on `blocker`.
    ///
    /// Completion releases waiters on its own; this path is for blockers
    /// that reached a terminal state some other way (failed, escalated),
    /// so their waiters do not sit blocked forever.
    pub fn release_blocked_on(&self, blocker: &str, note: &str) -> DispatchResult<Vec<String>> {
        let mut inner = self.write()?;
        let released: Vec<String> = inner
            .records
            .values_mut()
            .filter_map(|record| {
                let waiting =
                    matches!(&record.status, WorkStatus::Blocked { on } if on == blocker);
                if waiting {
                    record.status = WorkStatus::Ready;
                    record.push_note(note);
                    Some(record.id.clone())
                } else {
                    None
                }
            })
            .collect();
        if !released.is_empty() {
            self.persist(&inner)?;
        }
        Ok(released)
    }

    /// Requeue every in-progress item and clear its lock.
    ///
    /// This is the cancellation path: after it runs, the next invocation
    /// resumes cleanly with no orphaned state. Returns the requeued ids.
    pub fn requeue_all_in_flight(&self, note: &str) -> DispatchResult<Vec<String>> {
        let mut inner = self.write()?;
        let ids: Vec<String> = inner
            .records
            .values()
            .filter(|r| r.status.is_in_progress())
            .map(|r| r.id.clone())
            .collect();
        for id in &ids {
            inner.locks.remove(id);
            if let Some(item) = inner.records.get_mut(id) {
                item.status = WorkStatus::Ready;
                item.push_note(note);
            }
        }
        if !ids.is_empty() {
            info!(count = ids.len(), "Requeued all in-flight items");
            self.persist(&inner)?;
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::work::types::WorkKind;

    fn store_with(items: Vec<WorkItem>) -> WorkRecordStore {
        let store = WorkRecordStore::in_memory();
        for item in items {
            store.insert(item).unwrap();
        }
        store
    }

    #[test]
    fn test_insert_assigns_sequence_and_dedupes() {
        let store = WorkRecordStore::in_memory();
        assert!(store
            .insert(WorkItem::new("a", "A", WorkKind::Test))
            .unwrap());
        assert!(!store
            .insert(WorkItem::new("a", "again", WorkKind::Test))
            .unwrap());
        assert!(store
            .insert(WorkItem::new("b", "B", WorkKind::Test))
            .unwrap());
        let ready = store.ready_items().unwrap();
        assert_eq!(ready[0].id, "a");
        assert_eq!(ready[1].id, "b");
        assert!(ready[0].sequence < ready[1].sequence);
    }

    #[test]
    fn test_dispatch_acquires_lock_and_increments_attempt() {
        let store = store_with(vec![WorkItem::new("a", "A", WorkKind::DataLayer)]);
        let dispatched = store.begin_dispatch("a", 0).unwrap();
        assert_eq!(dispatched.status, WorkStatus::InProgress);
        assert_eq!(dispatched.attempt, 1);
        let lock = store.lock_holder("a").unwrap().unwrap();
        assert_eq!(lock.slot_index, 0);
    }

    #[test]
    fn test_double_dispatch_is_lock_contention() {
        let store = store_with(vec![WorkItem::new("a", "A", WorkKind::DataLayer)]);
        store.begin_dispatch("a", 0).unwrap();
        let err = store.begin_dispatch("a", 1).unwrap_err();
        assert!(matches!(err, DispatchError::LockContention { .. }));
    }

    #[test]
    fn test_no_premature_dispatch() {
        let store = store_with(vec![
            WorkItem::new("a", "A", WorkKind::DataLayer),
            WorkItem::new("b", "B", WorkKind::DataLayer).with_dependencies(["a"]),
        ]);
        let err = store.begin_dispatch("b", 0).unwrap_err();
        match err {
            DispatchError::DependenciesOpen { missing, .. } => {
                assert_eq!(missing, vec!["a".to_string()]);
            }
            other => panic!("unexpected: {other}"),
        }

        // After a completes, b becomes dispatchable.
        store.begin_dispatch("a", 0).unwrap();
        store.complete("a").unwrap();
        store.begin_dispatch("b", 0).unwrap();
    }

    #[test]
    fn test_missing_dependency_record_blocks_dispatch() {
        let store = store_with(vec![
            WorkItem::new("b", "B", WorkKind::DataLayer).with_dependencies(["ghost"])
        ]);
        assert!(matches!(
            store.begin_dispatch("b", 0).unwrap_err(),
            DispatchError::DependenciesOpen { .. }
        ));
    }

    #[test]
    fn test_complete_unblocks_waiters() {
        let store = store_with(vec![
            WorkItem::new("a", "A", WorkKind::DataLayer),
            WorkItem::new("b", "B", WorkKind::DataLayer),
        ]);
        store.begin_dispatch("a", 0).unwrap();
        store.begin_dispatch("b", 1).unwrap();
        store.block_on("b", "a").unwrap();
        assert_eq!(
            store.get("b").unwrap().unwrap().status,
            WorkStatus::Blocked { on: "a".into() }
        );

        let unblocked = store.complete("a").unwrap();
        assert_eq!(unblocked, vec!["b".to_string()]);
        assert_eq!(store.get("b").unwrap().unwrap().status, WorkStatus::Ready);
    }

    #[test]
    fn test_requeue_releases_lock_and_attaches_note() {
        let store = store_with(vec![WorkItem::new("a", "A", WorkKind::Test)]);
        store.begin_dispatch("a", 0).unwrap();
        store.requeue("a", Some("unit gate failed")).unwrap();
        let item = store.get("a").unwrap().unwrap();
        assert_eq!(item.status, WorkStatus::Ready);
        assert!(item.context_notes.iter().any(|n| n.contains("unit gate")));
        assert!(store.lock_holder("a").unwrap().is_none());
        // Lock is gone, so dispatch works again and attempts accumulate.
        let again = store.begin_dispatch("a", 1).unwrap();
        assert_eq!(again.attempt, 2);
    }

    #[test]
    fn test_conflict_tier_monotonic_and_capped() {
        let store = store_with(vec![WorkItem::new("a", "A", WorkKind::Test)]);
        assert_eq!(store.raise_conflict_tier("a").unwrap(), 1);
        assert_eq!(store.raise_conflict_tier("a").unwrap(), 2);
        assert_eq!(store.raise_conflict_tier("a").unwrap(), 3);
        assert_eq!(store.raise_conflict_tier("a").unwrap(), 3);

        // At the cap the item never re-enters dispatch automatically.
        assert!(matches!(
            store.begin_dispatch("a", 0).unwrap_err(),
            DispatchError::EscalationRequired { .. }
        ));
    }

    #[test]
    fn test_fail_is_terminal() {
        let store = store_with(vec![WorkItem::new("a", "A", WorkKind::Test)]);
        store.begin_dispatch("a", 0).unwrap();
        store.fail("a", "out of attempts").unwrap();
        assert!(matches!(
            store.fail("a", "again").unwrap_err(),
            DispatchError::IllegalTransition { .. }
        ));
        assert!(matches!(
            store.begin_dispatch("a", 0).unwrap_err(),
            DispatchError::IllegalTransition { .. }
        ));
    }

    #[test]
    fn test_queue_partition_counts() {
        let store = store_with(vec![
            WorkItem::new("a", "A", WorkKind::Test),
            WorkItem::new("b", "B", WorkKind::Test),
            WorkItem::new("c", "C", WorkKind::Test),
        ]);
        store.begin_dispatch("a", 0).unwrap();
        let counts = store.counts().unwrap();
        assert_eq!(counts.ready, 2);
        assert_eq!(counts.in_progress, 1);
        assert_eq!(counts.total(), 3);
        assert!(!counts.drained());
    }

    #[test]
    fn test_requeue_all_in_flight() {
        let store = store_with(vec![
            WorkItem::new("a", "A", WorkKind::Test),
            WorkItem::new("b", "B", WorkKind::Test),
        ]);
        store.begin_dispatch("a", 0).unwrap();
        store.begin_dispatch("b", 1).unwrap();
        let ids = store.requeue_all_in_flight("interrupted").unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(store.counts().unwrap().ready, 2);
        assert!(store.lock_holder("a").unwrap().is_none());
        assert!(store.lock_holder("b").unwrap().is_none());
    }

    #[test]
    fn test_persistence_roundtrip_requeues_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.json");
        {
            let store = WorkRecordStore::open(&path).unwrap();
            store
                .insert(WorkItem::new("a", "A", WorkKind::DataLayer))
                .unwrap();
            store
                .insert(WorkItem::new("b", "B", WorkKind::DataLayer))
                .unwrap();
            store.begin_dispatch("a", 0).unwrap();
        }

        // Simulated crash: reopen and observe "a" back in ready.
        let store = WorkRecordStore::open(&path).unwrap();
        let a = store.get("a").unwrap().unwrap();
        assert_eq!(a.status, WorkStatus::Ready);
        assert_eq!(a.attempt, 1);
        assert!(store.lock_holder("a").unwrap().is_none());
        assert_eq!(store.counts().unwrap().ready, 2);
    }

    #[test]
    fn test_completion_order_is_recorded() {
        let store = store_with(vec![
            WorkItem::new("a", "A", WorkKind::Test),
            WorkItem::new("b", "B", WorkKind::Test),
        ]);
        store.begin_dispatch("b", 0).unwrap();
        store.complete("b").unwrap();
        store.begin_dispatch("a", 0).unwrap();
        store.complete("a").unwrap();
        assert_eq!(
            store.completed_ids_in_order().unwrap(),
            vec!["b".to_string(), "a".to_string()]
        );
    }
}
