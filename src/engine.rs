//! Engine facade: one call from work items to a conservation-checked report.
//!
//! ## Responsibility
//! Wire the full flow for a run: complexity analysis → routing → cache
//! lookup → checkpoint skip → batch planning → concurrent execution →
//! escalation collection → report.
//!
//! ## Guarantees
//! - `succeeded + escalated == submitted` for every run, where cache hits
//!   and checkpoint skips count as succeeded.
//! - A cache hit short-circuits before planning: zero upstream invocations
//!   for that item.
//! - Analyzer failure history is fed back from every terminal outcome.
//!
//! ## NOT Responsible For
//! - Transport to the upstream service (injected [`ModelService`]).
//! - Text preparation or glossary matching (context arrives pre-computed).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::analyzer::{normalized_key, ComplexityAnalyzer};
use crate::cache::ResponseCache;
use crate::config::EngineConfig;
use crate::events::{EngineEvent, EventBus};
use crate::executor::{CheckpointStore, ConcurrentExecutor, EscalatedItem};
use crate::planner::{estimate_tokens, Batch, BatchPlanner};
use crate::routing::{ModelId, ModelRouter, RoutingLedger};
use crate::service::ModelService;
use crate::{EngineError, ItemResult, ItemStatus, WorkItem};

/// The outcome of one engine run.
#[derive(Debug)]
pub struct RunReport {
    /// Items handed to [`Engine::run`].
    pub submitted: usize,
    /// Items that ended with an output (upstream, cache, or checkpoint).
    pub succeeded: Vec<ItemResult>,
    /// Items that exhausted every recovery path.
    pub escalated: Vec<EscalatedItem>,
    /// Items answered from the response cache.
    pub cache_hits: usize,
    /// Items skipped because a previous run already succeeded them.
    pub checkpoint_skipped: usize,
    /// Backoff retries performed during the run.
    pub retries: u64,
    /// Binary batch splits performed during the run.
    pub splits: u64,
    /// Fallback-model substitutions performed during the run.
    pub fallbacks: u64,
}

impl RunReport {
    /// Whether every submitted item reached a terminal outcome.
    pub fn is_conserved(&self) -> bool {
        self.succeeded.len() + self.escalated.len() == self.submitted
    }
}

/// Cost-aware batch execution engine.
pub struct Engine {
    analyzer: Arc<ComplexityAnalyzer>,
    cache: Arc<ResponseCache>,
    router: Arc<ModelRouter>,
    planner: BatchPlanner,
    executor: Arc<ConcurrentExecutor>,
    checkpoint: Arc<CheckpointStore>,
    events: EventBus,
    escalation_capacity: usize,
}

impl Engine {
    /// Build an engine from a validated config, with an in-memory
    /// checkpoint store.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Config` when the catalog or concurrency
    /// settings are invalid.
    pub fn from_config(
        config: EngineConfig,
        service: Arc<dyn ModelService>,
    ) -> Result<Self, EngineError> {
        Self::with_checkpoint(config, service, CheckpointStore::in_memory())
    }

    /// Build an engine resuming from an existing checkpoint store.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Config` when the catalog or concurrency
    /// settings are invalid.
    pub fn with_checkpoint(
        config: EngineConfig,
        service: Arc<dyn ModelService>,
        checkpoint: CheckpointStore,
    ) -> Result<Self, EngineError> {
        let events = EventBus::default();
        let analyzer = Arc::new(ComplexityAnalyzer::new(config.complexity.clone()));
        let cache = Arc::new(ResponseCache::new(config.cache.clone()).with_events(events.clone()));
        let router = Arc::new(ModelRouter::new(
            config.catalog.clone(),
            config.routing.step_min_tier.clone(),
        )?);
        let planner = BatchPlanner::new(config.batching.clone());
        let checkpoint = Arc::new(checkpoint);
        let escalation_capacity = config.executor.escalation_capacity;

        let executor = Arc::new(ConcurrentExecutor::new(
            config.executor,
            service,
            Arc::clone(&router),
            Arc::clone(&cache),
            Arc::clone(&checkpoint),
            events.clone(),
        )?);

        Ok(Self {
            analyzer,
            cache,
            router,
            planner,
            executor,
            checkpoint,
            events,
            escalation_capacity,
        })
    }

    /// The event bus for this engine's runs.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// The response cache, for stats and manual invalidation.
    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    /// The routing ledger, for cost reporting.
    pub fn ledger(&self) -> Arc<RoutingLedger> {
        self.router.ledger()
    }

    /// The complexity analyzer, for the QA collaborator's
    /// `record_outcome` callback.
    pub fn analyzer(&self) -> &ComplexityAnalyzer {
        &self.analyzer
    }

    /// Process `items` to terminal outcomes.
    ///
    /// # Errors
    ///
    /// Returns an error only for infrastructure failures (task join,
    /// closed channels); per-item failures are reported via the
    /// escalation list, never as an `Err`.
    pub async fn run(&self, items: Vec<WorkItem>) -> Result<RunReport, EngineError> {
        let submitted = items.len();
        let mut succeeded: Vec<ItemResult> = Vec::new();
        let mut cache_hits = 0usize;
        let mut checkpoint_skipped = 0usize;
        let mut texts_by_id: HashMap<String, String> = HashMap::new();
        let mut by_model: HashMap<ModelId, Vec<WorkItem>> = HashMap::new();

        for mut item in items {
            texts_by_id.insert(item.id.as_str().to_string(), item.text.clone());

            let score = self.analyzer.analyze(&item.text, item.context.as_ref());
            let tokens = estimate_tokens(&item.text);
            let decision = self.router.select(
                score.total,
                item.step.as_str(),
                tokens,
                item.model.as_ref(),
            )?;

            let fingerprint = item.context.as_ref().map(|c| c.fingerprint).unwrap_or(0);
            if let Some(output) = self.cache.get(&item.text, fingerprint, &decision.model.id) {
                cache_hits += 1;
                self.events.publish(EngineEvent::CacheHit {
                    id: item.id.clone(),
                });
                self.events.publish(EngineEvent::ItemCompleted {
                    id: item.id.clone(),
                    model: None,
                    from_cache: true,
                });
                succeeded.push(ItemResult {
                    id: item.id.clone(),
                    output,
                    from_cache: true,
                });
                continue;
            }

            // The checkpoint only backs up the cache: consulted after a
            // miss, so a same-process rerun is still reported as a cache
            // hit while a restart with a cold cache resumes from here.
            if let Some(output) = self.checkpoint.output_for(&item.id) {
                checkpoint_skipped += 1;
                succeeded.push(ItemResult {
                    id: item.id.clone(),
                    output,
                    from_cache: true,
                });
                continue;
            }

            item.status = ItemStatus::Planned;
            item.model = Some(decision.model.id.clone());
            by_model.entry(decision.model.id.clone()).or_default().push(item);
        }

        let mut batches: Vec<Batch> = Vec::new();
        for (model_id, pending) in by_model {
            let descriptor = self
                .router
                .catalog()
                .get(&model_id)
                .ok_or_else(|| {
                    EngineError::Config(format!("routed model '{model_id}' not in catalog"))
                })?
                .clone();
            batches.extend(self.planner.plan(pending, &descriptor));
        }

        info!(
            submitted,
            cache_hits,
            checkpoint_skipped,
            batches = batches.len(),
            "run planned"
        );

        let (escalation_tx, mut escalation_rx) =
            mpsc::channel::<EscalatedItem>(self.escalation_capacity);
        let collector = tokio::spawn(async move {
            let mut escalated = Vec::new();
            while let Some(item) = escalation_rx.recv().await {
                escalated.push(item);
            }
            escalated
        });

        let outcome = self.executor.run(batches, escalation_tx).await?;
        // All senders are gone once run returns; the collector drains and
        // finishes.
        let escalated = collector
            .await
            .map_err(|e| EngineError::Other(format!("escalation collector: {e}")))?;

        for result in &outcome.succeeded {
            if let Some(text) = texts_by_id.get(result.id.as_str()) {
                self.analyzer.record_outcome(&normalized_key(text), true);
            }
        }
        for escalated_item in &escalated {
            if let Some(text) = texts_by_id.get(escalated_item.item.id.as_str()) {
                self.analyzer.record_outcome(&normalized_key(text), false);
            }
        }

        // Cache-style degradation: a failed checkpoint write is logged,
        // never fatal to the run.
        if let Err(error) = self.checkpoint.persist() {
            warn!(%error, "checkpoint persist failed");
        }

        succeeded.extend(outcome.succeeded);
        let report = RunReport {
            submitted,
            succeeded,
            escalated,
            cache_hits,
            checkpoint_skipped,
            retries: outcome.retries,
            splits: outcome.splits,
            fallbacks: outcome.fallbacks,
        };
        info!(
            succeeded = report.succeeded.len(),
            escalated = report.escalated.len(),
            retries = report.retries,
            splits = report.splits,
            conserved = report.is_conserved(),
            "run finished"
        );
        Ok(report)
    }
}
