//! Work queue: item types and the durable record store.

pub mod store;
pub mod types;

pub use store::{StatusCounts, WorkRecordStore};
pub use types::{Lock, WorkItem, WorkKind, WorkStatus, CONFLICT_TIER_CAP};
