//! Dispatch — the orchestration engine behind drover.
//!
//! This library holds everything the control loop needs that is not a
//! process boundary:
//!
//! - the work-queue state machine and its durable record store
//! - the bounded scheduler and agent pool
//! - the five-gate validation pipeline
//! - the three-tier conflict resolver
//! - the error-learning store
//! - checkpoint-based crash recovery
//! - the dependency-graph client (tracker trait, optional intelligence
//!   overlay, petgraph analysis)
//!
//! Process boundaries — the `bd` issue-tracker CLI, git, and the worker
//! subprocess — are traits here, implemented in the `drover` crate.

pub mod checkpoint;
pub mod conflict;
pub mod error;
pub mod events;
pub mod graph;
pub mod learning;
pub mod pool;
pub mod retry;
pub mod scheduler;
pub mod validation;
pub mod vcs;
pub mod work;

// Re-export the types the orchestrator loop touches every tick.
pub use checkpoint::{Checkpoint, CheckpointStatus, CheckpointStore, RecoveryPlan};
pub use conflict::{
    ConflictAction, ConflictResolution, ConflictResolver, ManualReviewRecord, ReviewQueue,
};
pub use error::{DispatchError, DispatchResult};
pub use events::{EventBus, OrchestratorEvent};
pub use graph::{
    DependencyGraph, GraphClient, GraphInsights, GraphIntelClient, IssueTracker,
    PriorityRecommendation, TrackedIssue,
};
pub use learning::{render_guidance, FailureCategory, ImprovementRecord, LearningStore, Trend};
pub use pool::{
    AgentPool, DiscoveredWork, SlotObservation, WorkerCapability, WorkerReport, WorkerRequest,
    DEFAULT_POOL_SIZE,
};
pub use retry::{Backoff, RetryPolicy};
pub use scheduler::{Dispatcher, Selection, SkipReason};
pub use validation::{
    GateName, GateOutcome, GateResult, PipelineConfig, ValidationPipeline, ValidationReport,
    ValidationVerdict,
};
pub use vcs::{ChangeSet, CommitInterface, MergeProbe};
pub use work::{Lock, StatusCounts, WorkItem, WorkKind, WorkRecordStore, WorkStatus};
