//! Engine event bus.
//!
//! Execution milestones (completions, escalations, splits, retries) are
//! published on a tokio broadcast channel so observers — progress UIs,
//! audit sinks, tests — can watch a run without being in the dispatch
//! path. Publishing never blocks: a bus with no subscribers drops events,
//! and slow subscribers lag rather than stall the executor.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::routing::ModelId;
use crate::ItemId;

/// A milestone in an engine run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    /// An item finished successfully.
    ItemCompleted {
        /// The completed item.
        id: ItemId,
        /// Model that produced the result, absent for cache hits.
        model: Option<ModelId>,
        /// Whether the result came from the response cache.
        from_cache: bool,
    },
    /// A size-1 item exhausted its budget and was handed to the
    /// escalation queue.
    ItemEscalated {
        /// The escalated item.
        id: ItemId,
        /// Classified kind of the final error.
        error_kind: String,
    },
    /// A failing batch was split into two halves for resubmission.
    BatchSplit {
        /// Size of the batch before the split.
        parent_size: usize,
    },
    /// A transient failure scheduled a backoff retry.
    RetryScheduled {
        /// Attempt number about to run (1-based).
        attempt: u32,
        /// Backoff delay before the attempt, in milliseconds.
        delay_ms: u64,
        /// Classified kind of the error that triggered the retry.
        error_kind: String,
    },
    /// Retry exhaustion substituted the model's configured fallback.
    FallbackSubstituted {
        /// Model the batch was originally routed to.
        from: ModelId,
        /// Fallback model now carrying the batch.
        to: ModelId,
    },
    /// An item was answered from the response cache without dispatch.
    CacheHit {
        /// The item served from cache.
        id: ItemId,
    },
    /// An entry was evicted from the response cache under size pressure.
    CacheEviction {
        /// Bytes freed by the eviction pass.
        bytes_freed: u64,
    },
}

/// Broadcast bus for [`EngineEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    /// Create a bus retaining up to `capacity` undelivered events per
    /// subscriber before lagging.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. A bus with no subscribers silently drops it.
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
