//! Validation pipeline: sequential gates over every worker completion.

pub mod pipeline;
pub mod report;

pub use pipeline::{PipelineConfig, ValidationPipeline};
pub use report::{GateName, GateOutcome, GateResult, ValidationReport, ValidationVerdict};
