//! Bridge to the `bd` issue-tracker CLI.
//!
//! The tracker is a binary-only tool, so we shell out and parse its
//! `--json` output. All methods return errors freely; the failsafe
//! wrapping lives in `dispatch::GraphClient`.

use anyhow::{Context, Result};
use std::process::Command;

use dispatch::graph::{CyclePath, DependencyEdge, IssueTracker, TrackedIssue};

/// Shell-out implementation of the tracker interface.
pub struct BdBridge {
    bin: String,
}

impl BdBridge {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    fn run(&self, args: &[&str]) -> Result<Vec<u8>> {
        let output = Command::new(&self.bin)
            .args(args)
            .output()
            .with_context(|| format!("Failed to run `{} {}`. Is bd installed?", self.bin, args.join(" ")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("{} {} failed: {stderr}", self.bin, args.join(" "));
        }
        Ok(output.stdout)
    }
}

impl Default for BdBridge {
    fn default() -> Self {
        Self::new("bd")
    }
}

impl IssueTracker for BdBridge {
    /// `bd list ready --json` — issues with every dependency closed.
    fn list_ready(&self) -> Result<Vec<TrackedIssue>> {
        let stdout = self.run(&["list", "ready", "--json"])?;
        serde_json::from_slice(&stdout).context("Failed to parse bd ready-list output")
    }

    fn dependency_tree(&self, id: &str) -> Result<Vec<DependencyEdge>> {
        let stdout = self.run(&["dep", "tree", id, "--json"])?;
        serde_json::from_slice(&stdout).context("Failed to parse bd dep tree output")
    }

    fn cycle_check(&self) -> Result<Vec<CyclePath>> {
        let stdout = self.run(&["dep", "cycles", "--json"])?;
        serde_json::from_slice(&stdout).context("Failed to parse bd dep cycles output")
    }

    fn update_status(&self, id: &str, status: &str) -> Result<()> {
        self.run(&["update", id, &format!("--status={status}")])?;
        Ok(())
    }

    fn close(&self, id: &str, reason: Option<&str>) -> Result<()> {
        let mut args = vec!["close".to_string(), id.to_string()];
        if let Some(reason) = reason {
            args.push(format!("--reason={reason}"));
        }
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run(&args)?;
        Ok(())
    }

    fn create(&self, title: &str, issue_type: &str, deps: &[String]) -> Result<String> {
        let mut args = vec![
            "create".to_string(),
            format!("--title={title}"),
            format!("--type={issue_type}"),
        ];
        if !deps.is_empty() {
            args.push(format!("--deps={}", deps.join(",")));
        }
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let stdout = self.run(&args)?;
        Ok(String::from_utf8_lossy(&stdout).trim().to_string())
    }
}
