//! Orchestrator configuration.
//!
//! Defaults come from `DROVER_*` environment variables, optionally
//! overridden by a TOML file passed on the command line.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use dispatch::{Backoff, PipelineConfig, RetryPolicy};
use serde::Deserialize;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Top-level drover configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Concurrent worker slots.
    pub pool_size: usize,
    /// Sleep between heartbeat ticks (seconds).
    pub heartbeat_secs: u64,
    /// Dispatch attempts per item before it is forced to failed.
    pub max_attempts: u32,
    /// Runtime after which a silent worker counts as crashed (seconds).
    /// Deliberately configurable: "crashed" versus "slow" is a judgment
    /// call that belongs to the operator.
    pub worker_timeout_secs: u64,
    /// Directory for durable state (records, checkpoints, learnings,
    /// review queue, worker briefs).
    pub state_dir: PathBuf,
    /// Repository the workers operate on.
    pub repo_root: PathBuf,
    /// Issue-tracker binary.
    pub tracker_bin: String,
    /// Worker command template; shlex-split, receives the brief by env.
    pub worker_cmd: String,
    /// Optional graph-intelligence overlay base URL.
    pub intel_url: Option<String>,
    /// Gate 1/4 test command (shlex-split, `{item}` expands to the id).
    pub unit_cmd: Option<String>,
    /// Gate 2 integration command.
    pub integration_cmd: Option<String>,
    /// Gate 5 advisory quality command.
    pub quality_cmd: Option<String>,
    /// Per-gate timeout (seconds).
    pub gate_timeout_secs: u64,
    /// Improvement records injected into each worker brief.
    pub learnings_top_n: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            pool_size: env_or("DROVER_POOL_SIZE", 5),
            heartbeat_secs: env_or("DROVER_HEARTBEAT_SECS", 10),
            max_attempts: env_or("DROVER_MAX_ATTEMPTS", 3),
            worker_timeout_secs: env_or("DROVER_WORKER_TIMEOUT_SECS", 900),
            state_dir: std::env::var("DROVER_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".drover")),
            repo_root: std::env::var("DROVER_REPO_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
            tracker_bin: std::env::var("DROVER_TRACKER_BIN").unwrap_or_else(|_| "bd".into()),
            worker_cmd: std::env::var("DROVER_WORKER_CMD")
                .unwrap_or_else(|_| "drover-worker".into()),
            intel_url: std::env::var("DROVER_INTEL_URL").ok(),
            unit_cmd: std::env::var("DROVER_UNIT_CMD").ok(),
            integration_cmd: std::env::var("DROVER_INTEGRATION_CMD").ok(),
            quality_cmd: std::env::var("DROVER_QUALITY_CMD").ok(),
            gate_timeout_secs: env_or("DROVER_GATE_TIMEOUT_SECS", 300),
            learnings_top_n: env_or("DROVER_LEARNINGS_TOP_N", 5),
        }
    }
}

impl OrchestratorConfig {
    /// Load from a TOML file layered over the env defaults.
    pub fn from_toml(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn records_path(&self) -> PathBuf {
        self.state_dir.join("records.json")
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        self.state_dir.join("checkpoints")
    }

    pub fn improvements_path(&self) -> PathBuf {
        self.state_dir.join("improvements.json")
    }

    pub fn review_dir(&self) -> PathBuf {
        self.state_dir.join("review")
    }

    pub fn briefs_dir(&self) -> PathBuf {
        self.state_dir.join("briefs")
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn worker_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, Backoff::Exponential)
    }

    fn split(cmd: &Option<String>) -> Vec<String> {
        cmd.as_deref()
            .and_then(shlex::split)
            .unwrap_or_default()
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            unit_cmd: Self::split(&self.unit_cmd),
            integration_cmd: Self::split(&self.integration_cmd),
            quality_cmd: Self::split(&self.quality_cmd),
            gate_timeout_secs: self.gate_timeout_secs,
            output_max_bytes: 4096,
        }
    }

    /// Worker command argv, shlex-split.
    pub fn worker_argv(&self) -> Result<Vec<String>> {
        let argv = shlex::split(&self.worker_cmd)
            .with_context(|| format!("Unparseable worker command: {}", self.worker_cmd))?;
        anyhow::ensure!(!argv.is_empty(), "Empty worker command");
        Ok(argv)
    }
}
