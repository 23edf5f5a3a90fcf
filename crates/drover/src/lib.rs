//! Drover — autonomous work orchestrator.
//!
//! Drives a dependency-linked backlog of work items to completion with a
//! bounded pool of workers. The engine (queue state machine, scheduler,
//! validation gates, conflict tiers, learning store, checkpoint recovery)
//! lives in the `dispatch` crate; this crate supplies the process
//! boundaries — the `bd` tracker bridge, the git commit bridge, the
//! subprocess worker — plus the heartbeat loop and the CLI.

pub mod commit_bridge;
pub mod config;
pub mod orchestrator;
pub mod tracker_bridge;
pub mod worker_bridge;

pub use commit_bridge::GitCommitBridge;
pub use config::OrchestratorConfig;
pub use orchestrator::{format_task_brief, Orchestrator, RunSummary};
pub use tracker_bridge::BdBridge;
pub use worker_bridge::SubprocessWorker;
