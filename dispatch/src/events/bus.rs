//! Broadcast event bus.
//!
//! Publishing with no subscribers is not an error — the bus exists for
//! optional observers (dashboards, tests), never for control flow.

use tokio::sync::broadcast;
use tracing::debug;

use super::types::OrchestratorEvent;

const CHANNEL_CAPACITY: usize = 256;

/// Pub/sub fan-out for orchestrator events.
pub struct EventBus {
    sender: broadcast::Sender<OrchestratorEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Publish to all subscribers; silently succeeds with none.
    pub fn publish(&self, event: OrchestratorEvent) {
        let event_type = event.event_type();
        match self.sender.send(event) {
            Ok(receivers) => debug!(event_type, receivers, "Event published"),
            Err(_) => debug!(event_type, "Event published (no receivers)"),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
