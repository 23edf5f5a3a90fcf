//! Subprocess worker capability.
//!
//! The implementation capability is an external program: it receives the
//! task brief through a file named in its environment, does its work, and
//! prints a JSON report as the last line of stdout. A non-zero exit,
//! unparseable report or timeout all count as a worker crash — checkpoint
//! recovery decides what happens next, not this bridge.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use dispatch::{DispatchError, DispatchResult, WorkerCapability, WorkerReport, WorkerRequest};

/// Spawns the configured worker command once per request.
pub struct SubprocessWorker {
    argv: Vec<String>,
    workdir: PathBuf,
    briefs_dir: PathBuf,
    timeout: Duration,
}

impl SubprocessWorker {
    pub fn new(
        argv: Vec<String>,
        workdir: impl AsRef<Path>,
        briefs_dir: impl AsRef<Path>,
        timeout: Duration,
    ) -> Self {
        Self {
            argv,
            workdir: workdir.as_ref().to_path_buf(),
            briefs_dir: briefs_dir.as_ref().to_path_buf(),
            timeout,
        }
    }

    fn write_brief(&self, request: &WorkerRequest) -> DispatchResult<PathBuf> {
        std::fs::create_dir_all(&self.briefs_dir)?;
        let path = self
            .briefs_dir
            .join(format!("{}-attempt{}.md", request.item_id, request.attempt));
        std::fs::write(&path, &request.brief)?;
        Ok(path)
    }

    /// The report is the last non-empty stdout line; everything before it
    /// is worker logging.
    fn parse_report(stdout: &[u8], item_id: &str) -> DispatchResult<WorkerReport> {
        let text = String::from_utf8_lossy(stdout);
        let last_line = text
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .ok_or_else(|| {
                DispatchError::WorkerCrash(format!("{item_id}: worker produced no output"))
            })?;
        serde_json::from_str(last_line).map_err(|e| {
            DispatchError::WorkerCrash(format!("{item_id}: unparseable worker report: {e}"))
        })
    }
}

#[async_trait]
impl WorkerCapability for SubprocessWorker {
    async fn run(&self, request: WorkerRequest) -> DispatchResult<WorkerReport> {
        let brief_path = self.write_brief(&request)?;
        debug!(
            item = %request.item_id,
            capability = %request.capability,
            brief = %brief_path.display(),
            "Launching worker subprocess"
        );

        let mut cmd = tokio::process::Command::new(&self.argv[0]);
        cmd.args(&self.argv[1..])
            .current_dir(&self.workdir)
            .env("DROVER_ITEM_ID", &request.item_id)
            .env("DROVER_CAPABILITY", &request.capability)
            .env("DROVER_ATTEMPT", request.attempt.to_string())
            .env("DROVER_BRIEF_FILE", &brief_path)
            .kill_on_drop(true);

        // Own process group: a timeout kills the worker's whole tree.
        #[cfg(unix)]
        cmd.process_group(0);

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(DispatchError::WorkerCrash(format!(
                    "{}: failed to launch worker: {e}",
                    request.item_id
                )))
            }
            Err(_) => {
                warn!(item = %request.item_id, "Worker subprocess timed out");
                return Err(DispatchError::WorkerCrash(format!(
                    "{}: worker timed out after {}s",
                    request.item_id,
                    self.timeout.as_secs()
                )));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DispatchError::WorkerCrash(format!(
                "{}: worker exited with {:?}: {}",
                request.item_id,
                output.status.code(),
                stderr.chars().take(2048).collect::<String>()
            )));
        }

        let mut report = Self::parse_report(&output.stdout, &request.item_id)?;
        if report.item_id.is_empty() {
            report.item_id = request.item_id.clone();
        }
        Ok(report)
    }
}
