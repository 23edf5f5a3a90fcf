//! Full-loop smoke tests with mock tracker, worker and VCS.
//!
//! Exercises the heartbeat cycle end to end: dispatch ordering over a
//! dependency edge, the conflict tiers, crash recovery and the
//! cancellation path — no subprocesses, no git, no network.

use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use dispatch::graph::{CyclePath, DependencyEdge, IssueTracker, TrackedIssue};
use dispatch::{
    ChangeSet, CommitInterface, DispatchError, DispatchResult, GraphClient, MergeProbe,
    WorkRecordStore, WorkerCapability, WorkerReport, WorkerRequest,
};
use drover::{Orchestrator, OrchestratorConfig};

/// Tracker whose ready set is recomputed from closed issues, like `bd`.
struct ScriptedTracker {
    issues: Mutex<Vec<(TrackedIssue, bool)>>,
    closed_order: Mutex<Vec<String>>,
}

impl ScriptedTracker {
    fn new(issues: Vec<TrackedIssue>) -> Self {
        Self {
            issues: Mutex::new(issues.into_iter().map(|i| (i, false)).collect()),
            closed_order: Mutex::new(Vec::new()),
        }
    }

    fn closed(&self) -> Vec<String> {
        self.closed_order.lock().unwrap().clone()
    }
}

impl IssueTracker for ScriptedTracker {
    fn list_ready(&self) -> Result<Vec<TrackedIssue>> {
        let issues = self.issues.lock().unwrap();
        let closed: HashSet<String> = issues
            .iter()
            .filter(|(_, closed)| *closed)
            .map(|(issue, _)| issue.id.clone())
            .collect();
        Ok(issues
            .iter()
            .filter(|(issue, is_closed)| {
                !is_closed && issue.dependencies.iter().all(|dep| closed.contains(dep))
            })
            .map(|(issue, _)| issue.clone())
            .collect())
    }

    fn dependency_tree(&self, _id: &str) -> Result<Vec<DependencyEdge>> {
        Ok(Vec::new())
    }

    fn cycle_check(&self) -> Result<Vec<CyclePath>> {
        Ok(Vec::new())
    }

    fn update_status(&self, _id: &str, _status: &str) -> Result<()> {
        Ok(())
    }

    fn close(&self, id: &str, _reason: Option<&str>) -> Result<()> {
        let mut issues = self.issues.lock().unwrap();
        for (issue, closed) in issues.iter_mut() {
            if issue.id == id {
                *closed = true;
            }
        }
        self.closed_order.lock().unwrap().push(id.to_string());
        Ok(())
    }

    fn create(&self, _title: &str, _issue_type: &str, _deps: &[String]) -> Result<String> {
        Ok("created".into())
    }
}

/// Worker that records every request and answers from a script.
struct RecordingWorker {
    requests: Mutex<Vec<WorkerRequest>>,
    /// Attempt numbers (1-indexed) that should crash.
    crash_attempts: Vec<u32>,
    /// Whether reports carry a change set for the merge gate.
    with_change_set: bool,
}

impl RecordingWorker {
    fn new(with_change_set: bool) -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            crash_attempts: Vec::new(),
            with_change_set,
        }
    }

    fn crashing_on(attempts: &[u32]) -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            crash_attempts: attempts.to_vec(),
            with_change_set: false,
        }
    }

    fn requests(&self) -> Vec<WorkerRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl WorkerCapability for RecordingWorker {
    async fn run(&self, request: WorkerRequest) -> DispatchResult<WorkerReport> {
        self.requests.lock().unwrap().push(request.clone());
        if self.crash_attempts.contains(&request.attempt) {
            return Err(DispatchError::WorkerCrash(format!(
                "{}: scripted crash",
                request.item_id
            )));
        }
        Ok(WorkerReport {
            item_id: request.item_id.clone(),
            change_set: self
                .with_change_set
                .then(|| ChangeSet::new(format!("drover/{}", request.item_id))),
            steps: vec![format!("implemented {}", request.item_id)],
            commits: Vec::new(),
            discovered: Vec::new(),
            summary: "done".into(),
        })
    }
}

/// Worker that never finishes; used to exercise cancellation.
struct HangingWorker;

#[async_trait]
impl WorkerCapability for HangingWorker {
    async fn run(&self, _request: WorkerRequest) -> DispatchResult<WorkerReport> {
        futures_never().await
    }
}

async fn futures_never() -> DispatchResult<WorkerReport> {
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}

/// VCS whose trial-merge answers come from a script; commits always work.
struct ScriptedVcs {
    probes: Mutex<VecDeque<MergeProbe>>,
}

impl ScriptedVcs {
    fn always_clean() -> Self {
        Self {
            probes: Mutex::new(VecDeque::new()),
        }
    }

    fn with_probes(probes: Vec<MergeProbe>) -> Self {
        Self {
            probes: Mutex::new(probes.into()),
        }
    }
}

impl CommitInterface for ScriptedVcs {
    fn trial_merge(&self, _change: &ChangeSet) -> Result<MergeProbe> {
        Ok(self
            .probes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(MergeProbe::Clean))
    }

    fn commit(&self, _change: &ChangeSet, _message: &str) -> Result<String> {
        Ok("abc1234".into())
    }
}

fn issue(id: &str, deps: &[&str], resources: &[&str]) -> TrackedIssue {
    TrackedIssue {
        id: id.into(),
        title: id.to_uppercase(),
        status: "open".into(),
        priority: Some(0),
        issue_type: Some("data-layer".into()),
        dependencies: deps.iter().map(|d| d.to_string()).collect(),
        resources: resources.iter().map(|r| r.to_string()).collect(),
    }
}

fn test_config(dir: &Path) -> OrchestratorConfig {
    OrchestratorConfig {
        pool_size: 2,
        heartbeat_secs: 0,
        max_attempts: 3,
        worker_timeout_secs: 60,
        state_dir: dir.join("state"),
        repo_root: dir.to_path_buf(),
        unit_cmd: None,
        integration_cmd: None,
        quality_cmd: None,
        ..OrchestratorConfig::default()
    }
}

#[tokio::test]
async fn dependency_ordering_completes_both_items() {
    let dir = tempfile::tempdir().unwrap();
    let tracker = Arc::new(ScriptedTracker::new(vec![
        issue("a", &[], &[]),
        issue("b", &["a"], &[]),
    ]));
    let worker = Arc::new(RecordingWorker::new(false));
    let orchestrator = Orchestrator::new(
        test_config(dir.path()),
        GraphClient::new(tracker.clone()),
        worker.clone(),
        Arc::new(ScriptedVcs::always_clean()),
    )
    .unwrap();

    let summary = tokio::time::timeout(Duration::from_secs(30), orchestrator.run())
        .await
        .expect("run must terminate")
        .unwrap();

    assert_eq!(summary.completed, 2);
    assert_eq!(summary.failed, 0);
    // a must have closed before b was even dispatchable.
    assert_eq!(tracker.closed(), vec!["a".to_string(), "b".to_string()]);
    let dispatched: Vec<String> = worker.requests().iter().map(|r| r.item_id.clone()).collect();
    assert_eq!(dispatched, vec!["a".to_string(), "b".to_string()]);
}

#[tokio::test]
async fn conflict_retries_with_context_then_completes() {
    let dir = tempfile::tempdir().unwrap();
    let tracker = Arc::new(ScriptedTracker::new(vec![issue("e", &[], &["api.rs"])]));
    let worker = Arc::new(RecordingWorker::new(true));
    // First probe conflicts; the retry merges cleanly.
    let vcs = Arc::new(ScriptedVcs::with_probes(vec![MergeProbe::Conflict {
        diff: "<<<<<<< ours".into(),
    }]));

    let config = test_config(dir.path());
    let records_path = config.records_path();
    let orchestrator = Orchestrator::new(
        config,
        GraphClient::new(tracker.clone()),
        worker.clone(),
        vcs,
    )
    .unwrap();

    let summary = tokio::time::timeout(Duration::from_secs(30), orchestrator.run())
        .await
        .expect("run must terminate")
        .unwrap();

    assert_eq!(summary.completed, 1);
    assert_eq!(summary.escalated, 0);

    // Two dispatches; the retry brief carries the conflict-aware
    // instruction and the diff.
    let requests = worker.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].attempt, 2);
    assert!(requests[1].brief.contains("reconcile BOTH"));
    assert!(requests[1].brief.contains("<<<<<<< ours"));

    // The tier consumed exactly one escalation step.
    let store = WorkRecordStore::open(&records_path).unwrap();
    let item = store.get("e").unwrap().unwrap();
    assert_eq!(item.conflict_attempt, 1);
    assert_eq!(item.status, dispatch::WorkStatus::Completed);
}

#[tokio::test]
async fn crashed_worker_is_recovered_and_item_retried() {
    let dir = tempfile::tempdir().unwrap();
    let tracker = Arc::new(ScriptedTracker::new(vec![issue("f", &[], &[])]));
    let worker = Arc::new(RecordingWorker::crashing_on(&[1]));

    let orchestrator = Orchestrator::new(
        test_config(dir.path()),
        GraphClient::new(tracker.clone()),
        worker.clone(),
        Arc::new(ScriptedVcs::always_clean()),
    )
    .unwrap();

    let summary = tokio::time::timeout(Duration::from_secs(30), orchestrator.run())
        .await
        .expect("run must terminate")
        .unwrap();

    assert_eq!(summary.recovered, 1);
    assert_eq!(summary.completed, 1);
    assert_eq!(worker.requests().len(), 2);
    // Clean retry: no commits existed, so no resume instruction.
    assert!(worker.requests()[1].brief.contains("clean retry"));
}

#[tokio::test]
async fn repeated_crashes_exhaust_attempts_and_fail_terminally() {
    let dir = tempfile::tempdir().unwrap();
    let tracker = Arc::new(ScriptedTracker::new(vec![issue("g", &[], &[])]));
    let worker = Arc::new(RecordingWorker::crashing_on(&[1, 2, 3]));

    let config = test_config(dir.path());
    let records_path = config.records_path();
    let orchestrator = Orchestrator::new(
        config,
        GraphClient::new(tracker.clone()),
        worker.clone(),
        Arc::new(ScriptedVcs::always_clean()),
    )
    .unwrap();

    let summary = tokio::time::timeout(Duration::from_secs(30), orchestrator.run())
        .await
        .expect("run must terminate")
        .unwrap();

    assert_eq!(summary.completed, 0);
    assert_eq!(summary.failed, 1);
    assert_eq!(worker.requests().len(), 3);

    let store = WorkRecordStore::open(&records_path).unwrap();
    let item = store.get("g").unwrap().unwrap();
    assert_eq!(item.status, dispatch::WorkStatus::Failed);
    assert!(item.last_failure.as_deref().unwrap_or("").contains("crash"));
}

#[tokio::test]
async fn cancellation_requeues_in_flight_items() {
    let dir = tempfile::tempdir().unwrap();
    let tracker = Arc::new(ScriptedTracker::new(vec![issue("h", &[], &[])]));

    let config = test_config(dir.path());
    let records_path = config.records_path();
    let orchestrator = Orchestrator::new(
        config,
        GraphClient::new(tracker.clone()),
        Arc::new(HangingWorker),
        Arc::new(ScriptedVcs::always_clean()),
    )
    .unwrap();

    let cancel = orchestrator.cancellation_token();
    let run = tokio::spawn(orchestrator.run());

    // Give the loop time to dispatch, then interrupt.
    tokio::time::sleep(Duration::from_millis(200)).await;
    cancel.cancel();
    let summary = tokio::time::timeout(Duration::from_secs(30), run)
        .await
        .expect("run must terminate")
        .unwrap()
        .unwrap();
    assert_eq!(summary.completed, 0);

    // The next invocation starts with the item back in ready and no lock.
    let store = WorkRecordStore::open(&records_path).unwrap();
    let item = store.get("h").unwrap().unwrap();
    assert_eq!(item.status, dispatch::WorkStatus::Ready);
    assert!(store.lock_holder("h").unwrap().is_none());
}
