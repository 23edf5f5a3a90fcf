//! Agent Pool — bounded concurrency slots over asynchronous workers.
//!
//! The pool owns the lifecycle of spawned worker tasks: bind on dispatch,
//! non-blocking poll each heartbeat, one awaited fetch once a handle
//! reports finished, unconditional release before any retry logic runs.
//! `available + busy == capacity` holds before and after every event.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{DispatchError, DispatchResult};
use crate::vcs::ChangeSet;

/// Default number of concurrent worker slots.
pub const DEFAULT_POOL_SIZE: usize = 5;

/// Follow-on work a worker discovered while executing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredWork {
    pub title: String,
    /// Capability tag, tracker vocabulary.
    pub kind: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// Everything a worker needs to execute one item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub item_id: String,
    /// Capability name resolved from the item's kind tag.
    pub capability: String,
    /// Task brief: description, injected learnings, recovery/conflict
    /// context.
    pub brief: String,
    pub attempt: u32,
}

/// What a worker hands back when it finishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerReport {
    pub item_id: String,
    /// The produced change set, absent when the worker made no durable
    /// changes.
    #[serde(default)]
    pub change_set: Option<ChangeSet>,
    /// Step descriptors completed, in order.
    #[serde(default)]
    pub steps: Vec<String>,
    /// Refs of durable commits the worker made.
    #[serde(default)]
    pub commits: Vec<String>,
    /// New work items the worker discovered.
    #[serde(default)]
    pub discovered: Vec<DiscoveredWork>,
    #[serde(default)]
    pub summary: String,
}

/// The opaque implementation capability: takes a task brief, produces a
/// report. Spawned onto the runtime by the pool; the join handle is the
/// task handle with a non-blocking `is_finished` poll.
#[async_trait]
pub trait WorkerCapability: Send + Sync {
    async fn run(&self, request: WorkerRequest) -> DispatchResult<WorkerReport>;
}

struct SlotBinding {
    item_id: String,
    handle: JoinHandle<DispatchResult<WorkerReport>>,
    started_at: Instant,
    last_heartbeat: Instant,
}

/// One concurrency unit.
pub struct AgentSlot {
    pub slot_index: usize,
    binding: Option<SlotBinding>,
}

impl AgentSlot {
    pub fn is_busy(&self) -> bool {
        self.binding.is_some()
    }

    pub fn bound_item_id(&self) -> Option<&str> {
        self.binding.as_ref().map(|b| b.item_id.as_str())
    }
}

/// A finished or stalled binding observed during a poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotObservation {
    pub slot_index: usize,
    pub item_id: String,
}

/// Bounded set of worker slots.
pub struct AgentPool {
    slots: Vec<AgentSlot>,
}

impl AgentPool {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: (0..capacity)
                .map(|slot_index| AgentSlot {
                    slot_index,
                    binding: None,
                })
                .collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn busy_slots(&self) -> usize {
        self.slots.iter().filter(|s| s.is_busy()).count()
    }

    pub fn available_slots(&self) -> usize {
        self.capacity() - self.busy_slots()
    }

    pub fn is_idle(&self) -> bool {
        self.busy_slots() == 0
    }

    /// Item ids currently bound to a slot.
    pub fn bound_items(&self) -> Vec<String> {
        self.slots
            .iter()
            .filter_map(|s| s.bound_item_id().map(String::from))
            .collect()
    }

    /// Index of a free slot, if any.
    pub fn free_slot(&self) -> Option<usize> {
        self.slots
            .iter()
            .find(|s| !s.is_busy())
            .map(|s| s.slot_index)
    }

    /// Spawn the worker asynchronously and bind it to `slot_index`.
    ///
    /// Non-blocking: the dispatcher is immediately free to dispatch more
    /// work. Fails if the slot is already bound.
    pub fn spawn(
        &mut self,
        slot_index: usize,
        capability: Arc<dyn WorkerCapability>,
        request: WorkerRequest,
    ) -> DispatchResult<()> {
        let slot = self
            .slots
            .get_mut(slot_index)
            .ok_or_else(|| DispatchError::Store(format!("no such slot {slot_index}")))?;
        if slot.is_busy() {
            return Err(DispatchError::Store(format!(
                "slot {slot_index} already bound to {}",
                slot.bound_item_id().unwrap_or("?")
            )));
        }

        let item_id = request.item_id.clone();
        debug!(slot = slot_index, id = %item_id, "Spawning worker");
        let handle = tokio::spawn(async move { capability.run(request).await });
        let now = Instant::now();
        slot.binding = Some(SlotBinding {
            item_id,
            handle,
            started_at: now,
            last_heartbeat: now,
        });
        Ok(())
    }

    /// (slot, item, seconds running, seconds since last poll heartbeat)
    /// for each busy slot, for heartbeat reporting.
    pub fn running_status(&self) -> Vec<(usize, String, u64, u64)> {
        self.slots
            .iter()
            .filter_map(|slot| {
                let binding = slot.binding.as_ref()?;
                Some((
                    slot.slot_index,
                    binding.item_id.clone(),
                    binding.started_at.elapsed().as_secs(),
                    binding.last_heartbeat.elapsed().as_secs(),
                ))
            })
            .collect()
    }

    /// Non-blocking poll: bindings whose task handle reports finished.
    ///
    /// Running bindings get their heartbeat touched.
    pub fn poll_finished(&mut self) -> Vec<SlotObservation> {
        let mut finished = Vec::new();
        for slot in &mut self.slots {
            if let Some(binding) = &mut slot.binding {
                if binding.handle.is_finished() {
                    finished.push(SlotObservation {
                        slot_index: slot.slot_index,
                        item_id: binding.item_id.clone(),
                    });
                } else {
                    binding.last_heartbeat = Instant::now();
                }
            }
        }
        finished
    }

    /// Bindings running longer than `timeout` — crashed or wedged workers.
    pub fn stalled(&self, timeout: Duration) -> Vec<SlotObservation> {
        self.slots
            .iter()
            .filter_map(|slot| {
                let binding = slot.binding.as_ref()?;
                if !binding.handle.is_finished() && binding.started_at.elapsed() >= timeout {
                    Some(SlotObservation {
                        slot_index: slot.slot_index,
                        item_id: binding.item_id.clone(),
                    })
                } else {
                    None
                }
            })
            .collect()
    }

    /// Fetch the final result of a finished slot and release it.
    ///
    /// Only call after `poll_finished` reported the slot; the await then
    /// resolves immediately. A panicked or aborted task maps to
    /// `WorkerCrash`. The slot is free once this returns, regardless of
    /// the result.
    pub async fn fetch_and_release(
        &mut self,
        slot_index: usize,
    ) -> DispatchResult<WorkerReport> {
        let slot = self
            .slots
            .get_mut(slot_index)
            .ok_or_else(|| DispatchError::Store(format!("no such slot {slot_index}")))?;
        let binding = slot
            .binding
            .take()
            .ok_or_else(|| DispatchError::Store(format!("slot {slot_index} not bound")))?;

        match binding.handle.await {
            Ok(result) => result,
            Err(join_err) => {
                warn!(slot = slot_index, id = %binding.item_id, error = %join_err, "Worker task died");
                Err(DispatchError::WorkerCrash(format!(
                    "{}: {join_err}",
                    binding.item_id
                )))
            }
        }
    }

    /// Abort a wedged worker and free its slot. Returns the item id that
    /// was bound.
    pub fn abort_and_release(&mut self, slot_index: usize) -> Option<String> {
        let slot = self.slots.get_mut(slot_index)?;
        let binding = slot.binding.take()?;
        binding.handle.abort();
        warn!(slot = slot_index, id = %binding.item_id, "Aborted worker");
        Some(binding.item_id)
    }

    /// Abort everything — the cancellation path. Returns released item ids.
    pub fn abort_all(&mut self) -> Vec<String> {
        let mut released = Vec::new();
        for slot in &mut self.slots {
            if let Some(binding) = slot.binding.take() {
                binding.handle.abort();
                released.push(binding.item_id);
            }
        }
        released
    }
}

impl Default for AgentPool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_SIZE)
    }
}
