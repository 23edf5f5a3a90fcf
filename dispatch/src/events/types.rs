//! Lifecycle events published by the orchestrator loop.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::validation::GateName;
use crate::work::StatusCounts;

/// One orchestration lifecycle event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum OrchestratorEvent {
    Dispatched {
        item_id: String,
        slot_index: usize,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },
    ValidationPassed {
        item_id: String,
        timestamp: DateTime<Utc>,
    },
    ValidationFailed {
        item_id: String,
        gate: GateName,
        timestamp: DateTime<Utc>,
    },
    ConflictEscalated {
        item_id: String,
        tier: u8,
        timestamp: DateTime<Utc>,
    },
    ItemCompleted {
        item_id: String,
        commit: Option<String>,
        timestamp: DateTime<Utc>,
    },
    ItemFailed {
        item_id: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    WorkerRecovered {
        item_id: String,
        resumed: bool,
        timestamp: DateTime<Utc>,
    },
    Heartbeat {
        tick: u64,
        counts: StatusCounts,
        busy_slots: usize,
        timestamp: DateTime<Utc>,
    },
}

impl OrchestratorEvent {
    /// Short event-type tag for logs and filters.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Dispatched { .. } => "dispatched",
            Self::ValidationPassed { .. } => "validation_passed",
            Self::ValidationFailed { .. } => "validation_failed",
            Self::ConflictEscalated { .. } => "conflict_escalated",
            Self::ItemCompleted { .. } => "item_completed",
            Self::ItemFailed { .. } => "item_failed",
            Self::WorkerRecovered { .. } => "worker_recovered",
            Self::Heartbeat { .. } => "heartbeat",
        }
    }

    /// Item this event concerns, when it concerns one.
    pub fn item_id(&self) -> Option<&str> {
        match self {
            Self::Dispatched { item_id, .. }
            | Self::ValidationPassed { item_id, .. }
            | Self::ValidationFailed { item_id, .. }
            | Self::ConflictEscalated { item_id, .. }
            | Self::ItemCompleted { item_id, .. }
            | Self::ItemFailed { item_id, .. }
            | Self::WorkerRecovered { item_id, .. } => Some(item_id),
            Self::Heartbeat { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_and_item() {
        let event = OrchestratorEvent::Dispatched {
            item_id: "w-1".into(),
            slot_index: 0,
            attempt: 1,
            timestamp: Utc::now(),
        };
        assert_eq!(event.event_type(), "dispatched");
        assert_eq!(event.item_id(), Some("w-1"));

        let heartbeat = OrchestratorEvent::Heartbeat {
            tick: 3,
            counts: StatusCounts::default(),
            busy_slots: 0,
            timestamp: Utc::now(),
        };
        assert_eq!(heartbeat.item_id(), None);
    }

    #[test]
    fn test_event_serde() {
        let event = OrchestratorEvent::ValidationFailed {
            item_id: "w-2".into(),
            gate: GateName::Unit,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"validation_failed\""));
        let restored: OrchestratorEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.event_type(), "validation_failed");
    }
}
