//! Git-backed commit interface.
//!
//! `trial_merge` probes a worker branch against the current baseline with
//! `git merge --no-commit --no-ff` and always aborts afterwards, so the
//! baseline is never mutated by a probe. `commit` performs the real merge
//! and returns the resulting ref. Transient git failures (index locks and
//! the like) retry with exponential backoff.

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Result};
use tracing::{debug, warn};

use dispatch::{Backoff, ChangeSet, CommitInterface, MergeProbe, RetryPolicy};

/// Manages merges of worker change sets into the baseline repository.
pub struct GitCommitBridge {
    repo_root: PathBuf,
    retry: RetryPolicy,
}

impl GitCommitBridge {
    /// Create a bridge for `repo_root`, verifying it is a git repository.
    pub fn new(repo_root: impl AsRef<Path>) -> Result<Self> {
        let repo_root = repo_root.as_ref().to_path_buf();
        let check = Command::new("git")
            .args(["rev-parse", "--git-dir"])
            .current_dir(&repo_root)
            .output()
            .context("Failed to check git repo")?;
        if !check.status.success() {
            bail!("Not a git repository: {}", repo_root.display());
        }
        Ok(Self {
            repo_root,
            retry: RetryPolicy::new(3, Backoff::Exponential),
        })
    }

    fn run_git(&self, args: &[&str]) -> Result<std::process::Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.repo_root)
            .output()
            .with_context(|| format!("Failed to run git {}", args.join(" ")))
    }

    /// Run a git command, retrying transient failures (lock files).
    fn run_git_with_retry(&self, args: &[&str]) -> Result<String> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let output = self.run_git(args)?;
            if output.status.success() {
                return Ok(String::from_utf8_lossy(&output.stdout).trim().to_string());
            }
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            let transient = stderr.contains("index.lock") || stderr.contains("cannot lock ref");
            if transient && self.retry.allows(attempt) {
                std::thread::sleep(self.retry.delay_before(attempt));
                continue;
            }
            bail!("git {} failed: {stderr}", args.join(" "));
        }
    }

    /// Abort an in-flight merge, tolerating "nothing to abort".
    fn abort_merge(&self) {
        match self.run_git(&["merge", "--abort"]) {
            Ok(output) if !output.status.success() => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                if !stderr.contains("There is no merge to abort")
                    && !stderr.contains("MERGE_HEAD missing")
                {
                    warn!("git merge --abort: {stderr}");
                }
            }
            Err(e) => warn!("git merge --abort failed to run: {e}"),
            _ => {}
        }
    }

    /// Textual diff of the conflicted paths during an in-flight merge.
    fn conflict_diff(&self) -> String {
        match self.run_git(&["diff", "--diff-filter=U"]) {
            Ok(output) if output.status.success() => {
                String::from_utf8_lossy(&output.stdout).into_owned()
            }
            _ => String::new(),
        }
    }
}

impl CommitInterface for GitCommitBridge {
    fn trial_merge(&self, change: &ChangeSet) -> Result<MergeProbe> {
        debug!(branch = %change.branch, "Trial merge probe");
        let output = self.run_git(&["merge", "--no-commit", "--no-ff", &change.branch])?;

        if output.status.success() {
            self.abort_merge();
            return Ok(MergeProbe::Clean);
        }

        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let conflicted = stdout.contains("CONFLICT")
            || stderr.contains("CONFLICT")
            || stderr.contains("Automatic merge failed")
            || stdout.contains("Automatic merge failed");

        if conflicted {
            let mut diff = self.conflict_diff();
            if diff.trim().is_empty() {
                diff = format!("{stdout}\n{stderr}");
            }
            self.abort_merge();
            return Ok(MergeProbe::Conflict { diff });
        }

        // Not a conflict: missing branch, dirty tree, etc.
        self.abort_merge();
        bail!("trial merge of {} failed: {stderr}", change.branch)
    }

    fn commit(&self, change: &ChangeSet, message: &str) -> Result<String> {
        self.run_git_with_retry(&["merge", "--no-ff", &change.branch, "-m", message])?;
        let commit = self.run_git_with_retry(&["rev-parse", "--short", "HEAD"])?;
        debug!(branch = %change.branch, commit = %commit, "Merged change set");
        Ok(commit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn git(dir: &Path, args: &[&str]) {
        let output = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .unwrap();
        assert!(
            output.status.success(),
            "git {args:?} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }

    /// Repo with an initial commit on the default branch.
    fn setup_repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        git(dir.path(), &["init", "-b", "main"]);
        git(dir.path(), &["config", "user.email", "test@drover.dev"]);
        git(dir.path(), &["config", "user.name", "Drover Test"]);
        std::fs::write(dir.path().join("shared.txt"), "base\n").unwrap();
        git(dir.path(), &["add", "."]);
        git(dir.path(), &["commit", "-m", "init"]);
        dir
    }

    /// Create `branch` with a change to `file`, then return to main.
    fn branch_with_change(dir: &Path, branch: &str, file: &str, content: &str) {
        git(dir, &["checkout", "-b", branch]);
        std::fs::write(dir.join(file), content).unwrap();
        git(dir, &["add", "."]);
        git(dir, &["commit", "-m", &format!("{branch}: edit {file}")]);
        git(dir, &["checkout", "main"]);
    }

    #[test]
    fn test_clean_trial_merge_leaves_baseline_untouched() {
        let repo = setup_repo();
        branch_with_change(repo.path(), "drover/w-1", "new.txt", "hello\n");

        let bridge = GitCommitBridge::new(repo.path()).unwrap();
        let probe = bridge
            .trial_merge(&ChangeSet::new("drover/w-1"))
            .unwrap();
        assert!(probe.is_clean());

        // The probe must not have materialized the merge.
        assert!(!repo.path().join("new.txt").exists());
    }

    #[test]
    fn test_conflicting_trial_merge_reports_diff() {
        let repo = setup_repo();
        branch_with_change(repo.path(), "drover/w-1", "shared.txt", "theirs\n");
        // Conflicting change on main.
        std::fs::write(repo.path().join("shared.txt"), "ours\n").unwrap();
        git(repo.path(), &["add", "."]);
        git(repo.path(), &["commit", "-m", "main: edit shared"]);

        let bridge = GitCommitBridge::new(repo.path()).unwrap();
        match bridge.trial_merge(&ChangeSet::new("drover/w-1")).unwrap() {
            MergeProbe::Conflict { diff } => {
                assert!(diff.contains("shared.txt") || diff.contains("<<<<<<<"));
            }
            MergeProbe::Clean => panic!("expected a conflict"),
        }

        // Baseline stays clean for the next probe.
        let probe2 = bridge.trial_merge(&ChangeSet::new("drover/w-1")).unwrap();
        assert!(!probe2.is_clean());
    }

    #[test]
    fn test_commit_merges_for_real() {
        let repo = setup_repo();
        branch_with_change(repo.path(), "drover/w-2", "feature.txt", "done\n");

        let bridge = GitCommitBridge::new(repo.path()).unwrap();
        let commit = bridge
            .commit(&ChangeSet::new("drover/w-2"), "drover: merge w-2")
            .unwrap();
        assert!(!commit.is_empty());
        assert!(repo.path().join("feature.txt").exists());
    }

    #[test]
    fn test_missing_branch_is_error_not_conflict() {
        let repo = setup_repo();
        let bridge = GitCommitBridge::new(repo.path()).unwrap();
        assert!(bridge.trial_merge(&ChangeSet::new("drover/ghost")).is_err());
    }

    #[test]
    fn test_non_repo_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(GitCommitBridge::new(dir.path()).is_err());
    }
}
