//! Concurrent batch execution with retry, fallback, and split recovery.
//!
//! ## Responsibility
//! Drive planned batches through the upstream service under a global and
//! per-stage concurrency budget, retrying transient failures with backoff,
//! substituting the configured fallback model on retry exhaustion, then
//! recursively binary-splitting failing batches down to size 1 before
//! escalating.
//!
//! ## Guarantees
//! - Conservation: every submitted item ends either succeeded or escalated;
//!   nothing is silently dropped.
//! - Permits are held only while a request is in flight and are released on
//!   every exit path (RAII owned permits), including timeouts and panics of
//!   the awaited future.
//! - Permit granting is first-come first-served (`tokio::sync::Semaphore`
//!   is FIFO), so long-queued batches are never starved.
//! - A success writes exactly one cache entry and one checkpoint record.
//!
//! ## NOT Responsible For
//! - Model selection (batches arrive already routed; only the static
//!   fallback pointer is consulted here).
//! - Cache lookups (the engine short-circuits hits before planning).

pub mod checkpoint;
pub mod retry;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Semaphore};
use tracing::{info_span, warn, Instrument};

use crate::events::{EngineEvent, EventBus};
use crate::planner::{estimate_tokens, Batch};
use crate::routing::{ModelDescriptor, ModelRouter};
use crate::service::{ModelService, ServiceError, ServiceErrorKind};
use crate::{cache::ResponseCache, EngineError, ItemResult, ItemStatus, WorkItem};

pub use checkpoint::CheckpointStore;
pub use retry::{RetryConfig, RetryPolicy};

// ── Configuration ──────────────────────────────────────────────────────

fn default_global_limit() -> usize {
    8
}

fn default_queue_bound() -> usize {
    64
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_escalation_capacity() -> usize {
    1_024
}

/// Concurrency and recovery tunables for the executor.
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ExecutorConfig {
    /// Total in-flight requests across all stages.
    #[serde(default = "default_global_limit")]
    pub global_limit: usize,
    /// Per-stage in-flight bounds; stages absent here run under the global
    /// bound only. Each bound must not exceed `global_limit`.
    #[serde(default)]
    pub stage_limits: HashMap<String, usize>,
    /// Planned-but-undispatched batches held before producers block.
    #[serde(default = "default_queue_bound")]
    pub queue_bound: usize,
    /// Deadline for one upstream request; exceeding it is a transient
    /// failure under the retry policy.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Escalation queue depth before escalating producers block.
    #[serde(default = "default_escalation_capacity")]
    pub escalation_capacity: usize,
    /// Backoff policy for transient failures.
    #[serde(default)]
    pub retry: RetryConfig,
    /// System prompt sent with every dispatch.
    #[serde(default)]
    pub system_prompt: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            global_limit: default_global_limit(),
            stage_limits: HashMap::new(),
            queue_bound: default_queue_bound(),
            request_timeout_ms: default_request_timeout_ms(),
            escalation_capacity: default_escalation_capacity(),
            retry: RetryConfig::default(),
            system_prompt: String::new(),
        }
    }
}

// ── Outcomes ───────────────────────────────────────────────────────────

/// An item that exhausted every recovery path.
#[derive(Debug, Clone)]
pub struct EscalatedItem {
    /// The item, with status [`ItemStatus::Escalated`] and its final error.
    pub item: WorkItem,
    /// Classified kind of the error that ended the item.
    pub error_kind: String,
}

/// Aggregate outcome of executing a set of batches.
#[derive(Debug, Default)]
pub struct ExecutionOutcome {
    /// Items that succeeded, with their outputs.
    pub succeeded: Vec<ItemResult>,
    /// Count of items handed to the escalation queue.
    pub escalated: usize,
    /// Backoff retries performed.
    pub retries: u64,
    /// Binary splits performed.
    pub splits: u64,
    /// Fallback-model substitutions performed.
    pub fallbacks: u64,
}

impl ExecutionOutcome {
    fn absorb(&mut self, other: ExecutionOutcome) {
        self.succeeded.extend(other.succeeded);
        self.escalated += other.escalated;
        self.retries += other.retries;
        self.splits += other.splits;
        self.fallbacks += other.fallbacks;
    }
}

// ── Executor ───────────────────────────────────────────────────────────

/// Bounded-concurrency batch executor.
pub struct ConcurrentExecutor {
    service: Arc<dyn ModelService>,
    router: Arc<ModelRouter>,
    cache: Arc<ResponseCache>,
    checkpoint: Arc<CheckpointStore>,
    events: EventBus,
    policy: RetryPolicy,
    global: Arc<Semaphore>,
    stage_permits: HashMap<String, Arc<Semaphore>>,
    config: ExecutorConfig,
}

impl ConcurrentExecutor {
    /// Build an executor.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Config` when `global_limit` is zero or any
    /// stage bound is zero or exceeds the global bound.
    pub fn new(
        config: ExecutorConfig,
        service: Arc<dyn ModelService>,
        router: Arc<ModelRouter>,
        cache: Arc<ResponseCache>,
        checkpoint: Arc<CheckpointStore>,
        events: EventBus,
    ) -> Result<Self, EngineError> {
        if config.global_limit == 0 {
            return Err(EngineError::Config(
                "executor.global_limit must be at least 1".to_string(),
            ));
        }
        let mut stage_permits = HashMap::new();
        for (stage, &bound) in &config.stage_limits {
            if bound == 0 || bound > config.global_limit {
                return Err(EngineError::Config(format!(
                    "executor.stage_limits.{stage} must be in 1..={}",
                    config.global_limit
                )));
            }
            stage_permits.insert(stage.clone(), Arc::new(Semaphore::new(bound)));
        }
        Ok(Self {
            service,
            router,
            cache,
            checkpoint,
            events,
            policy: RetryPolicy::new(config.retry.clone()),
            global: Arc::new(Semaphore::new(config.global_limit)),
            stage_permits,
            config,
        })
    }

    /// Capacity of the escalation queue this executor expects.
    pub fn escalation_capacity(&self) -> usize {
        self.config.escalation_capacity
    }

    /// Execute `batches`, feeding them through a bounded planned queue to
    /// a fixed pool of `global_limit` batch workers. A full queue with all
    /// workers busy suspends the feeder rather than piling batches up
    /// unboundedly.
    ///
    /// Escalated items are delivered on `escalations`; the caller owns the
    /// receiving side and must drain it.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::ChannelClosed` when the escalation receiver is
    /// dropped while items still need escalating.
    pub async fn run(
        self: &Arc<Self>,
        batches: Vec<Batch>,
        escalations: mpsc::Sender<EscalatedItem>,
    ) -> Result<ExecutionOutcome, EngineError> {
        let (queue_tx, queue_rx) = mpsc::channel::<Batch>(self.config.queue_bound.max(1));

        // Feeder blocks on a full queue: cooperative backpressure, not an
        // abort.
        let feeder = tokio::spawn(async move {
            for batch in batches {
                if queue_tx.send(batch).await.is_err() {
                    break;
                }
            }
        });

        // One batch at a time per worker. More workers than the global
        // permit count could never dispatch anyway.
        let queue_rx = Arc::new(tokio::sync::Mutex::new(queue_rx));
        let mut handles = Vec::new();
        for _ in 0..self.config.global_limit {
            let executor = Arc::clone(self);
            let escalations = escalations.clone();
            let queue = Arc::clone(&queue_rx);
            handles.push(tokio::spawn(async move {
                let mut outcome = ExecutionOutcome::default();
                loop {
                    // Hold the lock only for the recv so siblings can pull
                    // the next batch while this one executes.
                    let next = { queue.lock().await.recv().await };
                    let Some(batch) = next else { break };
                    let sub = executor.execute_batch(batch, &escalations, true).await?;
                    outcome.absorb(sub);
                }
                Ok::<ExecutionOutcome, EngineError>(outcome)
            }));
        }

        feeder
            .await
            .map_err(|e| EngineError::Other(format!("batch feeder task: {e}")))?;

        let mut outcome = ExecutionOutcome::default();
        for handle in handles {
            let worker_outcome = handle
                .await
                .map_err(|e| EngineError::Other(format!("batch worker task: {e}")))??;
            outcome.absorb(worker_outcome);
        }
        Ok(outcome)
    }

    /// Execute one batch to terminal outcomes. `fallback_allowed` is
    /// consumed by the first substitution so a fallback chain cannot loop.
    fn execute_batch<'a>(
        &'a self,
        batch: Batch,
        escalations: &'a mpsc::Sender<EscalatedItem>,
        fallback_allowed: bool,
    ) -> BoxFuture<'a, Result<ExecutionOutcome, EngineError>> {
        Box::pin(async move {
            let span = info_span!(
                "execute_batch",
                model = %batch.model.id,
                batch_size = batch.items.len(),
                stage = batch.items.first().map(|i| i.step.as_str()).unwrap_or("")
            );
            self.execute_batch_inner(batch, escalations, fallback_allowed)
                .instrument(span)
                .await
        })
    }

    async fn execute_batch_inner(
        &self,
        mut batch: Batch,
        escalations: &mpsc::Sender<EscalatedItem>,
        fallback_allowed: bool,
    ) -> Result<ExecutionOutcome, EngineError> {
        let mut outcome = ExecutionOutcome::default();
        let mut parse_retried = false;
        let mut attempt: u32 = 0;
        let started = Instant::now();

        let last_error = loop {
            attempt += 1;
            for item in &mut batch.items {
                item.status = ItemStatus::InFlight;
                item.attempts += 1;
            }

            match self.attempt_once(&batch).await {
                Ok(results) => {
                    crate::metrics::observe_batch_duration(started.elapsed().as_secs_f64());
                    self.finalize_success(&batch, results, &mut outcome);
                    return Ok(outcome);
                }
                Err(error) => {
                    for item in &mut batch.items {
                        item.status = ItemStatus::FailedRetryable;
                        item.last_error = Some(error.to_string());
                    }
                    match error.kind {
                        // Permanent: no retry, no split, straight to the
                        // escalation queue.
                        ServiceErrorKind::Auth => {
                            warn!(error_kind = error.kind.as_str(), "permanent failure");
                            self.escalate_all(batch, &error, escalations, &mut outcome)
                                .await?;
                            return Ok(outcome);
                        }
                        // Response shape mismatch gets exactly one retry
                        // before the batch is treated as failed.
                        ServiceErrorKind::MalformedResponse => {
                            if parse_retried {
                                break error;
                            }
                            parse_retried = true;
                            outcome.retries += 1;
                            crate::metrics::inc_retry();
                            self.events.publish(EngineEvent::RetryScheduled {
                                attempt: attempt + 1,
                                delay_ms: 0,
                                error_kind: error.kind.as_str().to_string(),
                            });
                        }
                        _ if error.retryable() => {
                            if attempt >= self.policy.max_attempts() {
                                break error;
                            }
                            let delay = self.policy.delay_for(attempt);
                            outcome.retries += 1;
                            crate::metrics::inc_retry();
                            self.events.publish(EngineEvent::RetryScheduled {
                                attempt: attempt + 1,
                                delay_ms: delay.as_millis() as u64,
                                error_kind: error.kind.as_str().to_string(),
                            });
                            tokio::time::sleep(delay).await;
                        }
                        _ => break error,
                    }
                }
            }
        };

        // Retry budget exhausted: fallback model once, then split, then
        // escalate at size 1.
        if fallback_allowed {
            if let Some(fallback) = self.router.fallback_for(&batch.model.id) {
                self.events.publish(EngineEvent::FallbackSubstituted {
                    from: batch.model.id.clone(),
                    to: fallback.id.clone(),
                });
                crate::metrics::inc_fallback();
                outcome.fallbacks += 1;
                let mut substituted = batch;
                substituted.model = fallback.clone();
                for item in &mut substituted.items {
                    item.model = Some(fallback.id.clone());
                }
                let sub = self.execute_batch(substituted, escalations, false).await?;
                outcome.absorb(sub);
                return Ok(outcome);
            }
        }

        if batch.items.len() > 1 {
            let parent_size = batch.items.len();
            self.events
                .publish(EngineEvent::BatchSplit { parent_size });
            crate::metrics::inc_split();
            outcome.splits += 1;

            let mid = batch.items.len() / 2;
            let right_items = batch.items.split_off(mid);
            let left = rebatch(batch.items, &batch.model);
            let right = rebatch(right_items, &batch.model);

            let (a, b) = futures::join!(
                self.execute_batch(left, escalations, fallback_allowed),
                self.execute_batch(right, escalations, fallback_allowed)
            );
            outcome.absorb(a?);
            outcome.absorb(b?);
            return Ok(outcome);
        }

        self.escalate_all(batch, &last_error, escalations, &mut outcome)
            .await?;
        Ok(outcome)
    }

    /// One dispatch: acquire permits, invoke under deadline, validate shape.
    async fn attempt_once(&self, batch: &Batch) -> Result<Vec<String>, ServiceError> {
        let stage = batch
            .items
            .first()
            .map(|i| i.step.as_str().to_string())
            .unwrap_or_default();

        // Global first, then stage. Owned permits drop on every exit path.
        let _global = Arc::clone(&self.global)
            .acquire_owned()
            .await
            .map_err(|_| ServiceError::new(ServiceErrorKind::Upstream, "executor shut down"))?;
        let _stage = match self.stage_permits.get(&stage) {
            Some(sem) => Some(Arc::clone(sem).acquire_owned().await.map_err(|_| {
                ServiceError::new(ServiceErrorKind::Upstream, "executor shut down")
            })?),
            None => None,
        };

        crate::metrics::add_in_flight(&stage, 1);
        let payload: Vec<String> = batch.items.iter().map(|i| i.text.clone()).collect();
        let deadline = Duration::from_millis(self.config.request_timeout_ms);

        let result = tokio::time::timeout(
            deadline,
            self.service
                .invoke(&batch.model.id, &self.config.system_prompt, &payload),
        )
        .await;
        crate::metrics::add_in_flight(&stage, -1);

        let results = match result {
            Ok(invoked) => invoked?,
            Err(_elapsed) => {
                return Err(ServiceError::new(
                    ServiceErrorKind::Timeout,
                    format!("request exceeded {}ms deadline", deadline.as_millis()),
                ));
            }
        };

        if results.len() != payload.len() {
            return Err(ServiceError::new(
                ServiceErrorKind::MalformedResponse,
                format!(
                    "expected {} results, received {}",
                    payload.len(),
                    results.len()
                ),
            ));
        }
        Ok(results)
    }

    /// Record a fully successful batch: cache write, checkpoint, events,
    /// metrics. Results correspond to items in submission order.
    fn finalize_success(
        &self,
        batch: &Batch,
        results: Vec<String>,
        outcome: &mut ExecutionOutcome,
    ) {
        for (item, output) in batch.items.iter().zip(results) {
            let fingerprint = item.context.as_ref().map(|c| c.fingerprint).unwrap_or(0);
            let tokens = estimate_tokens(&item.text);
            let cost_usd = (tokens as f64 / 1_000.0) * batch.model.cost_per_1k_tokens;
            self.cache
                .put(&item.text, fingerprint, &batch.model.id, output.clone(), cost_usd);
            self.checkpoint.mark_succeeded(&item.id, &output);
            crate::metrics::inc_item_outcome("succeeded");
            self.events.publish(EngineEvent::ItemCompleted {
                id: item.id.clone(),
                model: Some(batch.model.id.clone()),
                from_cache: false,
            });
            outcome.succeeded.push(ItemResult {
                id: item.id.clone(),
                output,
                from_cache: false,
            });
        }
    }

    /// Hand every item in the batch to the escalation queue.
    async fn escalate_all(
        &self,
        batch: Batch,
        error: &ServiceError,
        escalations: &mpsc::Sender<EscalatedItem>,
        outcome: &mut ExecutionOutcome,
    ) -> Result<(), EngineError> {
        for mut item in batch.items {
            item.status = ItemStatus::Escalated;
            item.last_error = Some(error.to_string());
            crate::metrics::inc_item_outcome("escalated");
            self.events.publish(EngineEvent::ItemEscalated {
                id: item.id.clone(),
                error_kind: error.kind.as_str().to_string(),
            });
            outcome.escalated += 1;
            escalations
                .send(EscalatedItem {
                    item,
                    error_kind: error.kind.as_str().to_string(),
                })
                .await
                .map_err(|_| EngineError::ChannelClosed)?;
        }
        Ok(())
    }
}

/// Rebuild a half-batch with recomputed token and duration estimates.
fn rebatch(items: Vec<WorkItem>, model: &ModelDescriptor) -> Batch {
    let estimated_tokens: u64 = items.iter().map(|i| estimate_tokens(&i.text)).sum();
    let duration_ms = (estimated_tokens as f64 * model.latency_per_token_ms) as u64;
    Batch {
        items,
        model: model.clone(),
        estimated_tokens,
        estimated_duration: Duration::from_millis(duration_ms),
    }
}
