//! Structured results for the validation pipeline.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The five gates, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateName {
    Unit,
    Integration,
    Merge,
    Regression,
    Quality,
}

impl fmt::Display for GateName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unit => write!(f, "unit"),
            Self::Integration => write!(f, "integration"),
            Self::Merge => write!(f, "merge"),
            Self::Regression => write!(f, "regression"),
            Self::Quality => write!(f, "quality"),
        }
    }
}

/// Outcome of a single gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateOutcome {
    Passed,
    Failed,
    /// Ran and found issues, but advisory only.
    Warning,
    /// Not run: not configured, or an earlier gate short-circuited.
    Skipped,
}

/// Result of one gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateResult {
    pub gate: GateName,
    pub outcome: GateOutcome,
    pub duration_ms: u64,
    pub exit_code: Option<i32>,
    /// Captured output excerpt or explanation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl GateResult {
    pub fn passed(gate: GateName, duration_ms: u64) -> Self {
        Self {
            gate,
            outcome: GateOutcome::Passed,
            duration_ms,
            exit_code: Some(0),
            detail: None,
        }
    }

    pub fn skipped(gate: GateName, reason: &str) -> Self {
        Self {
            gate,
            outcome: GateOutcome::Skipped,
            duration_ms: 0,
            exit_code: None,
            detail: Some(reason.to_string()),
        }
    }

    pub fn is_hard_failure(&self) -> bool {
        self.outcome == GateOutcome::Failed
    }
}

/// Final verdict, naming the gate on failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "verdict", content = "detail")]
pub enum ValidationVerdict {
    Passed,
    Failed { gate: GateName, detail: String },
    /// Gate 3 found a merge conflict — routed to the conflict resolver,
    /// not the generic retry path.
    Conflict { diff: String },
}

impl ValidationVerdict {
    pub fn is_pass(&self) -> bool {
        matches!(self, Self::Passed)
    }
}

/// The full pipeline report for one worker completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub item_id: String,
    pub attempt: u32,
    pub gates: Vec<GateResult>,
    pub verdict: ValidationVerdict,
    /// Id of the completed item Gate 4 re-validated, when one was sampled.
    pub sampled_item: Option<String>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl ValidationReport {
    pub fn new(item_id: impl Into<String>, attempt: u32) -> Self {
        Self {
            item_id: item_id.into(),
            attempt,
            gates: Vec::new(),
            verdict: ValidationVerdict::Passed,
            sampled_item: None,
            started_at: Utc::now(),
            duration_ms: 0,
        }
    }

    pub fn add_gate(&mut self, result: GateResult) {
        self.gates.push(result);
    }

    pub fn gate(&self, name: GateName) -> Option<&GateResult> {
        self.gates.iter().find(|g| g.gate == name)
    }

    /// One-line summary for logs and failure notes.
    pub fn summary(&self) -> String {
        let gates: Vec<String> = self
            .gates
            .iter()
            .map(|g| format!("{}={:?}", g.gate, g.outcome))
            .collect();
        format!("item={} verdict={:?} [{}]", self.item_id, self.verdict, gates.join(" "))
    }
}
