//! Orchestration events: typed lifecycle notifications over a broadcast
//! bus.

pub mod bus;
pub mod types;

pub use bus::EventBus;
pub use types::OrchestratorEvent;
