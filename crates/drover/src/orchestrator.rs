//! Orchestration loop: drive the backlog through dispatch → monitor →
//! reconcile → report → sleep until the queue drains.
//!
//! The loop is a single cooperative control task. Workers run as spawned
//! tasks and report back asynchronously; the loop never blocks on one —
//! worker status is a non-blocking poll each tick, and a completion is
//! fetched only once its handle reports finished. Every failure path ends
//! with the record store in a consistent, resumable state.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context as _, Result};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use dispatch::{
    render_guidance, CheckpointStore, ConflictAction, ConflictResolver, Dispatcher, EventBus,
    GraphClient, LearningStore, ManualReviewRecord, OrchestratorEvent, RecoveryPlan, ReviewQueue,
    SlotObservation, ValidationPipeline, ValidationVerdict, WorkItem, WorkRecordStore,
    WorkerCapability, WorkerReport, WorkerRequest, CommitInterface, AgentPool, DispatchError,
};

use crate::config::OrchestratorConfig;

/// Outcome counters for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub completed: usize,
    pub failed: usize,
    pub escalated: usize,
    pub recovered: usize,
    pub discovered: usize,
    pub heartbeats: u64,
}

/// Format the worker brief for one dispatch.
///
/// Sections appear only when they have content: scope constraints from the
/// predicted resources, accumulated context notes (conflict diffs, resume
/// instructions), and the learning store's "avoid these" guidance.
pub fn format_task_brief(item: &WorkItem, guidance: &str) -> String {
    let mut brief = String::new();

    brief.push_str(&format!("# Task: {}\n\n", item.title));
    brief.push_str(&format!(
        "**Item:** {} | **Kind:** {} | **Attempt:** {}\n\n",
        item.id, item.kind, item.attempt
    ));

    if !item.predicted_resources.is_empty() {
        brief.push_str("## Scope\n");
        brief.push_str("Only modify these resources; note anything else in your report:\n");
        for resource in &item.predicted_resources {
            brief.push_str(&format!("- `{resource}`\n"));
        }
        brief.push('\n');
    }

    if !item.context_notes.is_empty() {
        brief.push_str("## Context from previous attempts\n");
        for note in &item.context_notes {
            brief.push_str(&format!("- {note}\n"));
        }
        brief.push('\n');
    }

    if !guidance.is_empty() {
        brief.push_str(guidance);
        brief.push('\n');
    }

    brief.push_str(
        "Report progress as JSON on the last line of stdout: item_id, change_set \
         (branch + files), steps, commits, discovered, summary.\n",
    );

    brief
}

/// The orchestrator: owns every engine component plus the loop state.
pub struct Orchestrator {
    config: OrchestratorConfig,
    store: WorkRecordStore,
    pool: AgentPool,
    dispatcher: Dispatcher,
    graph: GraphClient,
    pipeline: ValidationPipeline,
    learning: LearningStore,
    checkpoints: CheckpointStore,
    reviews: ReviewQueue,
    worker: Arc<dyn WorkerCapability>,
    vcs: Arc<dyn CommitInterface>,
    events: EventBus,
    cancel: CancellationToken,
    summary: RunSummary,
    tick: u64,
}

impl Orchestrator {
    /// Build an orchestrator from config plus the three process-boundary
    /// implementations.
    pub fn new(
        config: OrchestratorConfig,
        graph: GraphClient,
        worker: Arc<dyn WorkerCapability>,
        vcs: Arc<dyn CommitInterface>,
    ) -> Result<Self> {
        let store = WorkRecordStore::open(config.records_path())
            .context("Failed to open work record store")?;
        let learning = LearningStore::open(config.improvements_path())
            .context("Failed to open learning store")?;
        let checkpoints = CheckpointStore::new(config.checkpoints_dir());
        let reviews = ReviewQueue::new(config.review_dir());
        let pipeline = ValidationPipeline::new(&config.repo_root, config.pipeline_config());
        let dispatcher = Dispatcher::new(config.retry_policy());
        let pool = AgentPool::new(config.pool_size);

        Ok(Self {
            config,
            store,
            pool,
            dispatcher,
            graph,
            pipeline,
            learning,
            checkpoints,
            reviews,
            worker,
            vcs,
            events: EventBus::new(),
            cancel: CancellationToken::new(),
            summary: RunSummary::default(),
            tick: 0,
        })
    }

    /// Token an external caller can cancel to interrupt the run cleanly.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<OrchestratorEvent> {
        self.events.subscribe()
    }

    /// Run until the queue drains, the pool idles and nothing new is
    /// dispatchable — or until cancelled.
    pub async fn run(mut self) -> Result<RunSummary> {
        let started = Instant::now();
        info!(
            pool = self.config.pool_size,
            heartbeat_secs = self.config.heartbeat_secs,
            "Orchestrator starting"
        );

        // Consecutive ticks with nothing in flight and nothing dispatched.
        // One quiet tick is not enough to stop: a completion on the previous
        // tick may have made new tracker issues ready that the next
        // dispatch pass will pick up.
        let mut quiet_ticks = 0u32;

        loop {
            if self.cancel.is_cancelled() {
                self.shutdown();
                break;
            }
            self.tick += 1;

            let dispatched = self.dispatch_phase().await;
            self.monitor_phase().await;
            self.reconcile_phase();
            self.report_phase();

            let counts = match self.store.counts() {
                Ok(counts) => counts,
                Err(e) => {
                    error!(error = %e, "Record store unreadable; stopping");
                    break;
                }
            };
            if self.pool.is_idle() && dispatched == 0 && counts.in_progress == 0 {
                quiet_ticks += 1;
            } else {
                quiet_ticks = 0;
            }
            if quiet_ticks >= 2 {
                if counts.drained() {
                    info!("Queue drained and pool idle — run complete");
                } else {
                    // Whatever remains is undispatchable: cycle-bound, out
                    // of conflict tiers, or awaiting manual review.
                    warn!(
                        ready = counts.ready,
                        blocked = counts.blocked,
                        "No dispatchable work remains — stopping with items needing attention"
                    );
                }
                break;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {}
                _ = tokio::time::sleep(self.config.heartbeat()) => {}
            }
        }

        self.summary.heartbeats = self.tick;
        info!(
            completed = self.summary.completed,
            failed = self.summary.failed,
            escalated = self.summary.escalated,
            recovered = self.summary.recovered,
            secs = started.elapsed().as_secs(),
            "Orchestrator finished"
        );
        Ok(self.summary)
    }

    /// Pull newly-ready issues from the tracker into the record store.
    fn sync_from_tracker(&mut self) {
        for issue in self.graph.list_ready() {
            let item = issue.into_work_item();
            match self.store.insert(item) {
                Ok(true) => {}
                Ok(false) => {} // already tracked
                Err(e) => warn!(error = %e, "Failed to track ready issue"),
            }
        }
    }

    /// Ids sitting on a dependency cycle: tracker-reported plus locally
    /// computed over everything we track.
    fn cycle_members(&self) -> HashSet<String> {
        let mut members: HashSet<String> =
            self.graph.cycle_check().into_iter().flatten().collect();
        if let Ok(items) = self.store.all_items() {
            let graph = dispatch::DependencyGraph::from_items(&items);
            members.extend(graph.cycle_members());
        }
        if !members.is_empty() {
            warn!(?members, "Dependency cycles block part of the graph");
        }
        members
    }

    /// Fill free slots with the highest-value dispatchable items.
    ///
    /// Returns the number of workers launched this tick.
    async fn dispatch_phase(&mut self) -> usize {
        self.sync_from_tracker();
        let hints = self.graph.ranking_hints().await;
        let cycles = self.cycle_members();
        let mut dispatched = 0;

        while self.pool.available_slots() > 0 {
            let (ready, in_progress) = match (self.store.ready_items(), self.store.in_progress_items()) {
                (Ok(ready), Ok(in_progress)) => (ready, in_progress),
                _ => return dispatched,
            };
            if ready.is_empty() {
                return dispatched;
            }

            let selection = self.dispatcher.select(&ready, &in_progress, &hints, &cycles);

            for id in &selection.out_of_attempts {
                self.force_fail(id, "attempt budget exhausted");
            }
            for (id, reason) in &selection.skipped {
                debug!(id, %reason, "Candidate passed over this tick");
            }

            let Some(candidate) = selection.chosen else {
                return dispatched;
            };
            let Some(slot) = self.pool.free_slot() else {
                return dispatched;
            };

            match self.store.begin_dispatch(&candidate.id, slot) {
                Ok(item) => {
                    if let Err(e) = self.launch(slot, &item) {
                        warn!(id = %item.id, error = %e, "Launch failed; requeueing");
                        let _ = self.store.requeue(&item.id, Some("worker launch failed"));
                        return dispatched;
                    }
                    dispatched += 1;
                }
                Err(e) if e.is_skippable() => {
                    debug!(id = %candidate.id, error = %e, "Skipping contended item this tick");
                    return dispatched;
                }
                Err(e) => {
                    warn!(id = %candidate.id, error = %e, "Dispatch rejected");
                    return dispatched;
                }
            }
        }
        dispatched
    }

    fn launch(&mut self, slot: usize, item: &WorkItem) -> Result<()> {
        // A surviving checkpoint means this dispatch resumes prior work.
        if self.checkpoints.load(&item.id)?.is_none() {
            self.checkpoints.begin(&item.id)?;
        }

        let guidance = render_guidance(
            &self
                .learning
                .top_relevant(item.kind, self.config.learnings_top_n),
        );
        let request = WorkerRequest {
            item_id: item.id.clone(),
            capability: item.kind.capability().to_string(),
            brief: format_task_brief(item, &guidance),
            attempt: item.attempt,
        };
        self.pool.spawn(slot, self.worker.clone(), request)?;

        self.graph.update_status(&item.id, "in_progress");
        self.events.publish(OrchestratorEvent::Dispatched {
            item_id: item.id.clone(),
            slot_index: slot,
            attempt: item.attempt,
            timestamp: Utc::now(),
        });
        info!(id = %item.id, slot, attempt = item.attempt, "Dispatched work item");
        Ok(())
    }

    /// Consume finished workers: fetch each report and validate it.
    async fn monitor_phase(&mut self) {
        for obs in self.pool.poll_finished() {
            match self.pool.fetch_and_release(obs.slot_index).await {
                Ok(report) => self.handle_completion(&obs, report).await,
                Err(e) => {
                    warn!(id = %obs.item_id, error = %e, "Worker crashed");
                    self.recover_item(&obs.item_id, &e.to_string());
                }
            }
        }
    }

    async fn handle_completion(&mut self, obs: &SlotObservation, report: WorkerReport) {
        let item = match self.store.get(&obs.item_id) {
            Ok(Some(item)) => item,
            _ => {
                error!(id = %obs.item_id, "Finished worker for unknown item");
                return;
            }
        };

        // Fold durable progress into the ledger before anything can fail.
        if let Err(e) =
            self.checkpoints
                .absorb_report(&item.id, &report.steps, &report.commits)
        {
            warn!(id = %item.id, error = %e, "Checkpoint absorb failed");
        }
        self.track_discovered(&report);

        let missing_deps: Vec<String> = item
            .dependencies
            .iter()
            .filter(|dep| {
                !matches!(
                    self.store.get(dep),
                    Ok(Some(d)) if d.status == dispatch::WorkStatus::Completed
                )
            })
            .cloned()
            .collect();
        let completed = self.store.completed_ids_in_order().unwrap_or_default();

        let validation = self
            .pipeline
            .run(&item, &report, &missing_deps, &completed, self.vcs.as_ref())
            .await;
        debug!(summary = %validation.summary(), "Validation finished");

        match validation.verdict.clone() {
            ValidationVerdict::Passed => {
                self.events.publish(OrchestratorEvent::ValidationPassed {
                    item_id: item.id.clone(),
                    timestamp: Utc::now(),
                });
                self.accept(&item, &report);
            }
            ValidationVerdict::Conflict { diff } => self.handle_conflict(&item, &diff),
            ValidationVerdict::Failed { gate, detail } => {
                self.events.publish(OrchestratorEvent::ValidationFailed {
                    item_id: item.id.clone(),
                    gate,
                    timestamp: Utc::now(),
                });
                if let Err(e) = self.learning.record_failure(&detail) {
                    warn!(error = %e, "Learning store update failed");
                }
                let note = format!("validation failed at gate '{gate}': {detail}");
                let _ = self.store.record_failure_note(&item.id, &note);

                if self.dispatcher.retry_policy().allows(item.attempt) {
                    if let Err(e) = self.store.requeue(&item.id, Some(&note)) {
                        error!(id = %item.id, error = %e, "Requeue failed");
                    }
                } else {
                    self.force_fail(&item.id, "attempt budget exhausted");
                }
            }
        }
    }

    /// All gates green: commit the change set and close the item.
    fn accept(&mut self, item: &WorkItem, report: &WorkerReport) {
        let commit = match &report.change_set {
            Some(change) => {
                match self
                    .vcs
                    .commit(change, &format!("drover: merge {} ({})", item.id, item.title))
                {
                    Ok(commit) => Some(commit),
                    Err(e) => {
                        // The trial merge was clean moments ago; treat a
                        // real-merge failure like any validation failure.
                        warn!(id = %item.id, error = %e, "Commit failed after clean probe");
                        let note = format!("commit failed: {e}");
                        let _ = self.learning.record_failure(&note);
                        if self.dispatcher.retry_policy().allows(item.attempt) {
                            let _ = self.store.requeue(&item.id, Some(&note));
                        } else {
                            self.force_fail(&item.id, &note);
                        }
                        return;
                    }
                }
            }
            None => None,
        };

        match self.store.complete(&item.id) {
            Ok(_unblocked) => {
                let _ = self.checkpoints.delete(&item.id);
                self.graph.close(&item.id, Some("completed by drover"));
                self.summary.completed += 1;
                self.events.publish(OrchestratorEvent::ItemCompleted {
                    item_id: item.id.clone(),
                    commit: commit.clone(),
                    timestamp: Utc::now(),
                });
                info!(id = %item.id, commit = commit.as_deref().unwrap_or("-"), "Item completed");
            }
            Err(e) => error!(id = %item.id, error = %e, "Completion transition failed"),
        }
    }

    /// Gate 3 conflict: run the tiered resolver and apply its decision.
    fn handle_conflict(&mut self, item: &WorkItem, diff: &str) {
        let in_progress = self.store.in_progress_items().unwrap_or_default();
        let resolution = ConflictResolver::resolve(item, diff, &in_progress);
        let tier = self.store.raise_conflict_tier(&item.id).unwrap_or(resolution.tier);
        let _ = self
            .learning
            .record_failure(&format!("merge conflict in {}: {diff}", item.id));

        self.events.publish(OrchestratorEvent::ConflictEscalated {
            item_id: item.id.clone(),
            tier,
            timestamp: Utc::now(),
        });

        match resolution.action {
            ConflictAction::RetryWithContext => {
                let note = resolution.note.unwrap_or_else(|| "merge conflict".into());
                if let Err(e) = self.store.requeue(&item.id, Some(&note)) {
                    error!(id = %item.id, error = %e, "Conflict requeue failed");
                }
            }
            ConflictAction::Serialize { behind } => {
                if let Err(e) = self.store.block_on(&item.id, &behind) {
                    error!(id = %item.id, error = %e, "Conflict serialization failed");
                }
            }
            ConflictAction::Escalate => {
                let record =
                    ManualReviewRecord::new(item, diff, "conflict against committed history");
                if let Err(e) = self.reviews.push(&record) {
                    error!(id = %item.id, error = %e, "Review record write failed");
                }
                // Best effort: surface the escalation in the tracker too.
                self.graph
                    .create(&record.title, "manual-review", std::slice::from_ref(&item.id));
                self.force_fail(&item.id, "merge conflict escalated to manual review");
                self.summary.escalated += 1;
            }
        }
    }

    /// Record new work a worker discovered.
    fn track_discovered(&mut self, report: &WorkerReport) {
        for discovered in &report.discovered {
            let id = self
                .graph
                .create(&discovered.title, &discovered.kind, &discovered.dependencies)
                .unwrap_or_else(|| format!("local-{}", uuid_suffix()));
            let item = dispatch::WorkItem::new(
                id.clone(),
                discovered.title.clone(),
                dispatch::WorkKind::parse_tag(&discovered.kind),
            )
            .with_dependencies(discovered.dependencies.iter().cloned());
            match self.store.insert(item) {
                Ok(true) => {
                    self.summary.discovered += 1;
                    info!(id = %id, "Tracking discovered work item");
                }
                Ok(false) => {}
                Err(e) => warn!(error = %e, "Failed to track discovered work"),
            }
        }
    }

    /// Requeue a crashed worker's item according to its checkpoint.
    fn recover_item(&mut self, item_id: &str, why: &str) {
        let item = match self.store.get(item_id) {
            Ok(Some(item)) => item,
            _ => return,
        };
        let _ = self.learning.record_failure(why);

        if self.dispatcher.retry_policy().exhausted(item.attempt) {
            self.force_fail(item_id, &format!("worker crashed, no attempts left: {why}"));
            return;
        }

        let plan = match self.checkpoints.plan_recovery(item_id) {
            Ok(plan) => plan,
            Err(e) => {
                warn!(id = item_id, error = %e, "Checkpoint unreadable; clean retry");
                RecoveryPlan::CleanRetry
            }
        };
        let resumed = plan != RecoveryPlan::CleanRetry;
        let note = plan
            .instruction()
            .unwrap_or_else(|| format!("clean retry after worker crash: {why}"));

        if let Err(e) = self.store.requeue(item_id, Some(&note)) {
            error!(id = item_id, error = %e, "Recovery requeue failed");
            return;
        }
        self.summary.recovered += 1;
        self.events.publish(OrchestratorEvent::WorkerRecovered {
            item_id: item_id.to_string(),
            resumed,
            timestamp: Utc::now(),
        });
        info!(id = item_id, resumed, "Recovered crashed worker");
    }

    /// Stalled-worker detection and blocked-item housekeeping.
    fn reconcile_phase(&mut self) {
        for obs in self.pool.stalled(self.config.worker_timeout()) {
            if let Some(item_id) = self.pool.abort_and_release(obs.slot_index) {
                warn!(id = %item_id, "Worker unresponsive past timeout; recovering");
                self.recover_item(&item_id, "worker unresponsive past timeout");
            }
        }

        // Items blocked behind a blocker that failed (or vanished) would
        // otherwise wait forever.
        let Ok(items) = self.store.all_items() else {
            return;
        };
        for item in items {
            if let dispatch::WorkStatus::Blocked { on } = &item.status {
                let release = match self.store.get(on) {
                    Ok(Some(blocker)) => blocker.status == dispatch::WorkStatus::Failed,
                    Ok(None) => true,
                    Err(_) => false,
                };
                if release {
                    let note = format!("blocker {on} is gone; retrying");
                    match self.store.release_blocked_on(on, &note) {
                        Ok(released) => {
                            if !released.is_empty() {
                                info!(?released, blocker = %on, "Released items behind dead blocker");
                            }
                        }
                        Err(e) => warn!(error = %e, "Failed to release blocked items"),
                    }
                }
            }
        }
    }

    /// Heartbeat log line + event.
    fn report_phase(&mut self) {
        let Ok(counts) = self.store.counts() else {
            return;
        };
        info!(
            tick = self.tick,
            ready = counts.ready,
            in_progress = counts.in_progress,
            blocked = counts.blocked,
            completed = counts.completed,
            failed = counts.failed,
            busy = self.pool.busy_slots(),
            "Heartbeat"
        );
        for (slot, item, running_secs, _) in self.pool.running_status() {
            debug!(slot, id = %item, running_secs, "Worker in flight");
        }
        self.events.publish(OrchestratorEvent::Heartbeat {
            tick: self.tick,
            counts,
            busy_slots: self.pool.busy_slots(),
            timestamp: Utc::now(),
        });
    }

    /// Terminal failure with consistent bookkeeping.
    fn force_fail(&mut self, item_id: &str, reason: &str) {
        match self.store.fail(item_id, reason) {
            Ok(()) => {
                self.summary.failed += 1;
                self.graph.update_status(item_id, "blocked");
                self.events.publish(OrchestratorEvent::ItemFailed {
                    item_id: item_id.to_string(),
                    reason: reason.to_string(),
                    timestamp: Utc::now(),
                });
            }
            Err(DispatchError::IllegalTransition { .. }) => {
                // Already terminal; nothing to do.
            }
            Err(e) => error!(id = item_id, error = %e, "Failure transition failed"),
        }
    }

    /// Interrupt path: abort workers, requeue everything in flight.
    ///
    /// Deliberately the same store path ordinary recovery uses, so the
    /// next invocation resumes cleanly with no orphaned state.
    fn shutdown(&mut self) {
        info!("Cancellation requested — requeueing in-flight work");
        let aborted = self.pool.abort_all();
        for id in &aborted {
            debug!(id = %id, "Aborted worker");
        }
        match self.store.requeue_all_in_flight("interrupted by operator") {
            Ok(ids) => {
                if !ids.is_empty() {
                    info!(count = ids.len(), "In-flight items requeued for next run");
                }
            }
            Err(e) => error!(error = %e, "Failed to requeue in-flight items"),
        }
    }
}

fn uuid_suffix() -> String {
    // Short random suffix for locally-generated ids when the tracker is
    // unavailable.
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    format!("{nanos:x}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatch::{WorkItem, WorkKind};

    #[test]
    fn test_brief_contains_all_sections() {
        let mut item = WorkItem::new("w-1", "Wire pagination", WorkKind::InterfaceLayer)
            .with_resources(["src/api.rs"]);
        item.attempt = 2;
        item.push_note("merge conflict on attempt 1: reconcile BOTH change sets");

        let brief = format_task_brief(&item, "## Known failure patterns — avoid these\n- x\n");
        assert!(brief.contains("# Task: Wire pagination"));
        assert!(brief.contains("**Attempt:** 2"));
        assert!(brief.contains("`src/api.rs`"));
        assert!(brief.contains("reconcile BOTH"));
        assert!(brief.contains("avoid these"));
        assert!(brief.contains("JSON on the last line"));
    }

    #[test]
    fn test_brief_omits_empty_sections() {
        let item = WorkItem::new("w-2", "Bare item", WorkKind::Unknown);
        let brief = format_task_brief(&item, "");
        assert!(!brief.contains("## Scope"));
        assert!(!brief.contains("## Context"));
        assert!(!brief.contains("avoid these"));
    }
}
