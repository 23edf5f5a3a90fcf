//! Validation Pipeline — five sequential gates over a worker completion.
//!
//! Gates run strictly in order with short-circuit on the first hard
//! failure. Commands run under a per-gate timeout in their own process
//! group so a wedged test binary cannot outlive its gate.
//!
//! Gate semantics:
//! 1. unit — the item's own test surface; hard.
//! 2. integration — declared dependencies truly closed (advisory; the
//!    dispatch guard already enforced it) plus the integration command when
//!    one is configured; hard when the command exists and fails.
//! 3. merge — non-destructive trial merge; a conflict diverts to the
//!    conflict resolver instead of the retry path.
//! 4. regression — re-run one sampled previously-completed item; hard,
//!    logged against the sampled item.
//! 5. quality — advisory static checks; never blocks.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::pool::WorkerReport;
use crate::validation::report::{
    GateName, GateOutcome, GateResult, ValidationReport, ValidationVerdict,
};
use crate::vcs::CommitInterface;
use crate::work::WorkItem;

/// Placeholder replaced with the target item id in command templates.
const ITEM_PLACEHOLDER: &str = "{item}";

/// Configuration for the gate pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Command template for an item's test surface (gates 1 and 4).
    /// `{item}` expands to the item id. Empty disables the gate.
    pub unit_cmd: Vec<String>,
    /// Integration check command template. Empty means no integration
    /// tests exist and the gate is soft.
    pub integration_cmd: Vec<String>,
    /// Advisory static-check command. Empty disables the gate.
    pub quality_cmd: Vec<String>,
    /// Maximum time per gate command (seconds).
    pub gate_timeout_secs: u64,
    /// Truncate captured output to this many bytes.
    pub output_max_bytes: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            unit_cmd: Vec::new(),
            integration_cmd: Vec::new(),
            quality_cmd: Vec::new(),
            gate_timeout_secs: 300,
            output_max_bytes: 4096,
        }
    }
}

/// The pipeline runner.
pub struct ValidationPipeline {
    working_dir: PathBuf,
    config: PipelineConfig,
}

impl ValidationPipeline {
    pub fn new(working_dir: impl AsRef<Path>, config: PipelineConfig) -> Self {
        Self {
            working_dir: working_dir.as_ref().to_path_buf(),
            config,
        }
    }

    /// Run all gates for one worker completion.
    ///
    /// `missing_deps` is the set of declared dependencies not yet completed
    /// (normally empty — the dispatch guard enforces it); `completed` is
    /// the completion history for regression sampling.
    pub async fn run(
        &self,
        item: &WorkItem,
        worker_report: &WorkerReport,
        missing_deps: &[String],
        completed: &[String],
        vcs: &dyn CommitInterface,
    ) -> ValidationReport {
        let start = Instant::now();
        let mut report = ValidationReport::new(&item.id, item.attempt);

        // Gate 1: unit verification — hard.
        let unit = self.run_command_gate(GateName::Unit, &self.config.unit_cmd, &item.id).await;
        let unit_failed = unit.is_hard_failure();
        let unit_detail = unit.detail.clone();
        report.add_gate(unit);
        if unit_failed {
            self.skip_remaining(&mut report, &[GateName::Integration, GateName::Merge, GateName::Regression, GateName::Quality]);
            report.verdict = ValidationVerdict::Failed {
                gate: GateName::Unit,
                detail: unit_detail.unwrap_or_default(),
            };
            report.duration_ms = start.elapsed().as_millis() as u64;
            return report;
        }

        // Gate 2: integration verification.
        let integration = self.run_integration_gate(&item.id, missing_deps).await;
        let integration_failed = integration.is_hard_failure();
        let integration_detail = integration.detail.clone();
        report.add_gate(integration);
        if integration_failed {
            self.skip_remaining(&mut report, &[GateName::Merge, GateName::Regression, GateName::Quality]);
            report.verdict = ValidationVerdict::Failed {
                gate: GateName::Integration,
                detail: integration_detail.unwrap_or_default(),
            };
            report.duration_ms = start.elapsed().as_millis() as u64;
            return report;
        }

        // Gate 3: merge detection. A conflict routes to the resolver.
        let (merge, conflict_diff) = self.run_merge_gate(worker_report, vcs);
        let merge_failed = merge.is_hard_failure();
        let merge_detail = merge.detail.clone();
        report.add_gate(merge);
        if let Some(diff) = conflict_diff {
            self.skip_remaining(&mut report, &[GateName::Regression, GateName::Quality]);
            report.verdict = ValidationVerdict::Conflict { diff };
            report.duration_ms = start.elapsed().as_millis() as u64;
            return report;
        }
        if merge_failed {
            self.skip_remaining(&mut report, &[GateName::Regression, GateName::Quality]);
            report.verdict = ValidationVerdict::Failed {
                gate: GateName::Merge,
                detail: merge_detail.unwrap_or_default(),
            };
            report.duration_ms = start.elapsed().as_millis() as u64;
            return report;
        }

        // Gate 4: regression sample — hard, logged against the sampled item.
        let (regression, sampled) = self.run_regression_gate(item, completed).await;
        report.sampled_item = sampled;
        let regression_failed = regression.is_hard_failure();
        let regression_detail = regression.detail.clone();
        report.add_gate(regression);
        if regression_failed {
            if let Some(sampled) = &report.sampled_item {
                warn!(
                    item = %item.id,
                    sampled = %sampled,
                    "Regression sample failed — previously-completed item is broken"
                );
            }
            self.skip_remaining(&mut report, &[GateName::Quality]);
            report.verdict = ValidationVerdict::Failed {
                gate: GateName::Regression,
                detail: regression_detail.unwrap_or_default(),
            };
            report.duration_ms = start.elapsed().as_millis() as u64;
            return report;
        }

        // Gate 5: quality checks — advisory, never blocks.
        let mut quality = self
            .run_command_gate(GateName::Quality, &self.config.quality_cmd, &item.id)
            .await;
        if quality.outcome == GateOutcome::Failed {
            quality.outcome = GateOutcome::Warning;
        }
        report.add_gate(quality);

        report.verdict = ValidationVerdict::Passed;
        report.duration_ms = start.elapsed().as_millis() as u64;
        info!(item = %item.id, ms = report.duration_ms, "Validation passed");
        report
    }

    fn skip_remaining(&self, report: &mut ValidationReport, gates: &[GateName]) {
        for gate in gates {
            report.add_gate(GateResult::skipped(*gate, "short-circuited"));
        }
    }

    /// Expand a command template for the given item id.
    fn expand(template: &[String], item_id: &str) -> Vec<String> {
        template
            .iter()
            .map(|part| part.replace(ITEM_PLACEHOLDER, item_id))
            .collect()
    }

    /// Run a command template as a gate. Empty template: skipped (passes).
    async fn run_command_gate(
        &self,
        gate: GateName,
        template: &[String],
        item_id: &str,
    ) -> GateResult {
        if template.is_empty() {
            return GateResult::skipped(gate, "not configured");
        }
        let argv = Self::expand(template, item_id);
        self.run_argv(gate, &argv).await
    }

    async fn run_argv(&self, gate: GateName, argv: &[String]) -> GateResult {
        let start = Instant::now();
        let mut cmd = tokio::process::Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .current_dir(&self.working_dir)
            .kill_on_drop(true);

        // New process group so a timeout kills the whole tree, test
        // binaries included.
        #[cfg(unix)]
        cmd.process_group(0);

        let timeout = Duration::from_secs(self.config.gate_timeout_secs);
        match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(Ok(output)) => {
                let passed = output.status.success();
                let detail = if passed {
                    None
                } else {
                    let mut text = String::from_utf8_lossy(&output.stderr).into_owned();
                    if text.trim().is_empty() {
                        text = String::from_utf8_lossy(&output.stdout).into_owned();
                    }
                    Some(self.truncate(&text))
                };
                GateResult {
                    gate,
                    outcome: if passed {
                        GateOutcome::Passed
                    } else {
                        GateOutcome::Failed
                    },
                    duration_ms: start.elapsed().as_millis() as u64,
                    exit_code: output.status.code(),
                    detail,
                }
            }
            Ok(Err(e)) => GateResult {
                gate,
                outcome: GateOutcome::Failed,
                duration_ms: start.elapsed().as_millis() as u64,
                exit_code: None,
                detail: Some(format!("failed to execute {}: {e}", argv[0])),
            },
            Err(_) => GateResult {
                gate,
                outcome: GateOutcome::Failed,
                duration_ms: start.elapsed().as_millis() as u64,
                exit_code: None,
                detail: Some(format!(
                    "gate timed out after {}s",
                    self.config.gate_timeout_secs
                )),
            },
        }
    }

    /// Gate 2: the dependency re-check is advisory (the dispatch guard
    /// already enforced it); the integration command is hard when present.
    async fn run_integration_gate(&self, item_id: &str, missing_deps: &[String]) -> GateResult {
        if !missing_deps.is_empty() {
            warn!(
                item = item_id,
                ?missing_deps,
                "Declared dependencies no longer read as completed"
            );
        }

        if self.config.integration_cmd.is_empty() {
            let outcome = if missing_deps.is_empty() {
                return GateResult::skipped(GateName::Integration, "no integration checks");
            } else {
                GateOutcome::Warning
            };
            return GateResult {
                gate: GateName::Integration,
                outcome,
                duration_ms: 0,
                exit_code: None,
                detail: Some(format!("open dependencies: {missing_deps:?}")),
            };
        }

        self.run_command_gate(GateName::Integration, &self.config.integration_cmd, item_id)
            .await
    }

    /// Gate 3: trial merge. Returns the gate result and the conflict diff
    /// when one was found.
    fn run_merge_gate(
        &self,
        worker_report: &WorkerReport,
        vcs: &dyn CommitInterface,
    ) -> (GateResult, Option<String>) {
        let start = Instant::now();
        let Some(change) = &worker_report.change_set else {
            return (
                GateResult::skipped(GateName::Merge, "no change set produced"),
                None,
            );
        };

        match vcs.trial_merge(change) {
            Ok(probe) if probe.is_clean() => (
                GateResult::passed(GateName::Merge, start.elapsed().as_millis() as u64),
                None,
            ),
            Ok(crate::vcs::MergeProbe::Conflict { diff }) => {
                let truncated = self.truncate(&diff);
                (
                    GateResult {
                        gate: GateName::Merge,
                        outcome: GateOutcome::Failed,
                        duration_ms: start.elapsed().as_millis() as u64,
                        exit_code: None,
                        detail: Some(truncated.clone()),
                    },
                    Some(truncated),
                )
            }
            Ok(crate::vcs::MergeProbe::Clean) => unreachable!("covered by guard above"),
            Err(e) => (
                GateResult {
                    gate: GateName::Merge,
                    outcome: GateOutcome::Failed,
                    duration_ms: start.elapsed().as_millis() as u64,
                    exit_code: None,
                    detail: Some(format!("trial merge error: {e}")),
                },
                None,
            ),
        }
    }

    /// Gate 4: pick one completed item and re-run its test surface.
    ///
    /// The pick is a deterministic hash over (validated item, attempt,
    /// history length), so repeated validations of the same item sample
    /// different history entries without an RNG.
    async fn run_regression_gate(
        &self,
        item: &WorkItem,
        completed: &[String],
    ) -> (GateResult, Option<String>) {
        if completed.is_empty() {
            return (
                GateResult::skipped(GateName::Regression, "no completed items yet"),
                None,
            );
        }
        if self.config.unit_cmd.is_empty() {
            return (
                GateResult::skipped(GateName::Regression, "not configured"),
                None,
            );
        }

        let sampled = Self::sample(completed, &item.id, item.attempt).to_string();
        let argv = Self::expand(&self.config.unit_cmd, &sampled);
        let mut result = self.run_argv(GateName::Regression, &argv).await;
        if let Some(detail) = &mut result.detail {
            *detail = format!("sampled item {sampled}: {detail}");
        }
        (result, Some(sampled))
    }

    fn sample<'a>(completed: &'a [String], item_id: &str, attempt: u32) -> &'a str {
        let mut hasher = blake3::Hasher::new();
        hasher.update(item_id.as_bytes());
        hasher.update(&attempt.to_le_bytes());
        hasher.update(&(completed.len() as u64).to_le_bytes());
        let digest = hasher.finalize();
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest.as_bytes()[..8]);
        let index = (u64::from_le_bytes(bytes) as usize) % completed.len();
        &completed[index]
    }

    fn truncate(&self, text: &str) -> String {
        let max = self.config.output_max_bytes;
        if text.len() <= max {
            text.to_string()
        } else {
            let mut cut = max;
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            format!("{}…[truncated]", &text[..cut])
        }
    }
}
