//! Failure recovery: retries, fallback substitution, escalation,
//! conservation under injected failures, and checkpoint resume.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use textbatch::config::{EngineConfig, EngineSection, ObservabilityConfig, RoutingSection};
use textbatch::events::EngineEvent;
use textbatch::executor::{CheckpointStore, ExecutorConfig, RetryConfig};
use textbatch::routing::{ModelCatalog, ModelDescriptor, ModelId, QualityTier};
use textbatch::{Engine, ModelService, ServiceError, ServiceErrorKind, WorkItem};

// ── Test doubles ───────────────────────────────────────────────────────

type Script =
    Box<dyn Fn(usize, &ModelId, &[String]) -> Result<Vec<String>, ServiceError> + Send + Sync>;

/// A service scripted over (call number, model, payload).
struct FlakyService {
    script: Script,
    calls: AtomicUsize,
}

impl FlakyService {
    fn new(script: Script) -> Self {
        Self {
            script,
            calls: AtomicUsize::new(0),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelService for FlakyService {
    async fn invoke(
        &self,
        model: &ModelId,
        _system_prompt: &str,
        payload: &[String],
    ) -> Result<Vec<String>, ServiceError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        (self.script)(call, model, payload)
    }
}

fn echo(model: &ModelId, payload: &[String]) -> Result<Vec<String>, ServiceError> {
    Ok(payload
        .iter()
        .map(|t| format!("[{}] {t}", model.as_str()))
        .collect())
}

// ── Config helpers ─────────────────────────────────────────────────────

fn catalog_with_fallback() -> ModelCatalog {
    ModelCatalog {
        models: vec![
            ModelDescriptor {
                id: ModelId::new("cheap"),
                cost_per_1k_tokens: 0.001,
                tier: QualityTier::Economy,
                max_complexity: 1.0,
                batch_capable: true,
                fallback_to: Some(ModelId::new("premium")),
                context_window: 8_192,
                latency_per_token_ms: 0.1,
            },
            ModelDescriptor {
                id: ModelId::new("premium"),
                cost_per_1k_tokens: 0.015,
                tier: QualityTier::Premium,
                max_complexity: 1.0,
                batch_capable: true,
                fallback_to: None,
                context_window: 8_192,
                latency_per_token_ms: 0.1,
            },
        ],
        baseline: ModelId::new("premium"),
    }
}

fn catalog_without_fallback() -> ModelCatalog {
    let mut catalog = catalog_with_fallback();
    catalog.models[0].fallback_to = None;
    catalog
}

fn config(catalog: ModelCatalog, executor: ExecutorConfig) -> EngineConfig {
    EngineConfig {
        engine: EngineSection {
            name: "recovery-tests".into(),
            version: "1.0".into(),
            description: None,
        },
        executor,
        cache: Default::default(),
        batching: Default::default(),
        complexity: Default::default(),
        catalog,
        routing: RoutingSection::default(),
        observability: ObservabilityConfig::default(),
    }
}

fn fast_executor(max_attempts: u32) -> ExecutorConfig {
    ExecutorConfig {
        retry: RetryConfig {
            max_attempts,
            base_delay_ms: 1,
            max_delay_ms: 5,
            multiplier: 2.0,
            jitter: 0.0,
        },
        ..ExecutorConfig::default()
    }
}

fn items(n: usize) -> Vec<WorkItem> {
    (0..n)
        .map(|i| WorkItem::new(format!("item-{i}"), format!("work item number {i}"), "draft"))
        .collect()
}

// ── Transient retry ────────────────────────────────────────────────────

#[tokio::test]
async fn test_transient_failure_recovers_on_retry() {
    // First call rate-limited, everything after succeeds.
    let service = Arc::new(FlakyService::new(Box::new(|call, model, payload| {
        if call == 0 {
            Err(ServiceError::new(ServiceErrorKind::RateLimit, "slow down"))
        } else {
            echo(model, payload)
        }
    })));
    let engine = Engine::from_config(
        config(catalog_without_fallback(), fast_executor(3)),
        service.clone(),
    )
    .expect("test: engine");

    let mut events = engine.events().subscribe();
    let report = engine.run(items(3)).await.expect("test: run");

    assert_eq!(report.succeeded.len(), 3);
    assert!(report.escalated.is_empty());
    assert_eq!(report.retries, 1);
    assert!(report.is_conserved());

    let mut saw_retry = false;
    while let Ok(event) = events.try_recv() {
        if let EngineEvent::RetryScheduled { error_kind, .. } = event {
            assert_eq!(error_kind, "rate_limit");
            saw_retry = true;
        }
    }
    assert!(saw_retry);
}

// ── Fallback substitution ──────────────────────────────────────────────

#[tokio::test]
async fn test_retry_exhaustion_substitutes_fallback_model() {
    // "cheap" always times out upstream; "premium" works.
    let service = Arc::new(FlakyService::new(Box::new(|_, model, payload| {
        if model.as_str() == "cheap" {
            Err(ServiceError::new(ServiceErrorKind::Upstream, "overloaded"))
        } else {
            echo(model, payload)
        }
    })));
    let engine = Engine::from_config(
        config(catalog_with_fallback(), fast_executor(2)),
        service.clone(),
    )
    .expect("test: engine");

    let mut events = engine.events().subscribe();
    let report = engine.run(items(2)).await.expect("test: run");

    assert_eq!(report.succeeded.len(), 2);
    assert!(report.escalated.is_empty());
    assert_eq!(report.fallbacks, 1);
    assert!(report
        .succeeded
        .iter()
        .all(|r| r.output.starts_with("[premium]")));

    let mut saw_substitution = false;
    while let Ok(event) = events.try_recv() {
        if let EngineEvent::FallbackSubstituted { from, to } = event {
            assert_eq!(from.as_str(), "cheap");
            assert_eq!(to.as_str(), "premium");
            saw_substitution = true;
        }
    }
    assert!(saw_substitution);
}

// ── Escalation ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_persistent_failure_escalates_every_item_exactly_once() {
    let service = Arc::new(FlakyService::new(Box::new(|_, _, _| {
        Err(ServiceError::new(ServiceErrorKind::Upstream, "down"))
    })));
    let engine = Engine::from_config(
        config(catalog_without_fallback(), fast_executor(2)),
        service.clone(),
    )
    .expect("test: engine");

    let report = engine.run(items(4)).await.expect("test: run");

    assert!(report.succeeded.is_empty());
    assert_eq!(report.escalated.len(), 4);
    assert!(report.is_conserved());
    // Recursive splitting reaches size 1 before any escalation: 4 -> 2+2
    // -> four singletons.
    assert_eq!(report.splits, 3);
    for escalated in &report.escalated {
        assert_eq!(escalated.error_kind, "upstream_error");
    }
}

#[tokio::test]
async fn test_auth_failure_escalates_immediately_without_split() {
    let service = Arc::new(FlakyService::new(Box::new(|_, _, _| {
        Err(ServiceError::new(ServiceErrorKind::Auth, "bad key"))
    })));
    let engine = Engine::from_config(
        config(catalog_without_fallback(), fast_executor(3)),
        service.clone(),
    )
    .expect("test: engine");

    let report = engine.run(items(4)).await.expect("test: run");

    assert_eq!(report.escalated.len(), 4);
    assert_eq!(report.splits, 0);
    assert_eq!(report.retries, 0);
    assert_eq!(service.calls(), 1, "no retry for a permanent error");
    assert!(report.is_conserved());
}

#[tokio::test]
async fn test_request_deadline_is_a_transient_failure() {
    struct SlowService;
    #[async_trait]
    impl ModelService for SlowService {
        async fn invoke(
            &self,
            model: &ModelId,
            _system_prompt: &str,
            payload: &[String],
        ) -> Result<Vec<String>, ServiceError> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            echo(model, payload)
        }
    }

    let mut executor = fast_executor(1);
    executor.request_timeout_ms = 20;
    let engine = Engine::from_config(
        config(catalog_without_fallback(), executor),
        Arc::new(SlowService),
    )
    .expect("test: engine");

    let report = engine.run(items(1)).await.expect("test: run");
    assert_eq!(report.escalated.len(), 1);
    assert_eq!(report.escalated[0].error_kind, "timeout");
    assert!(report.is_conserved());
}

// ── Conservation under injected random failures ────────────────────────

#[tokio::test]
async fn test_conservation_holds_under_injected_transient_failures() {
    // Deterministic pseudo-random failure: every call whose number is
    // divisible by 3 fails transiently.
    let service = Arc::new(FlakyService::new(Box::new(|call, model, payload| {
        if call % 3 == 0 {
            Err(ServiceError::new(ServiceErrorKind::Upstream, "flaky"))
        } else {
            echo(model, payload)
        }
    })));
    let mut engine_config = config(catalog_without_fallback(), fast_executor(2));
    // Small batches so the failure pattern lands across many dispatches.
    engine_config.batching.max_batch_size = 4;
    let engine = Engine::from_config(engine_config, service.clone()).expect("test: engine");

    let report = engine.run(items(30)).await.expect("test: run");

    assert_eq!(
        report.succeeded.len() + report.escalated.len(),
        30,
        "succeeded ({}) + escalated ({}) must equal submitted",
        report.succeeded.len(),
        report.escalated.len()
    );
    assert!(report.is_conserved());
}

// ── Checkpoint resume ──────────────────────────────────────────────────

#[tokio::test]
async fn test_restarted_run_skips_checkpointed_items() {
    let dir = tempfile::tempdir().expect("test: tempdir");
    let path = dir.path().join("run.checkpoint");

    let first_service = Arc::new(FlakyService::new(Box::new(|_, model, payload| {
        echo(model, payload)
    })));
    let engine = Engine::with_checkpoint(
        config(catalog_without_fallback(), fast_executor(2)),
        first_service.clone(),
        CheckpointStore::open(&path),
    )
    .expect("test: engine");
    let first = engine.run(items(5)).await.expect("test: first run");
    assert_eq!(first.succeeded.len(), 5);
    assert!(first_service.calls() >= 1);

    // Fresh engine, same checkpoint file: nothing is recomputed.
    let second_service = Arc::new(FlakyService::new(Box::new(|_, _, _| {
        Err(ServiceError::new(ServiceErrorKind::Upstream, "must not be called"))
    })));
    let resumed = Engine::with_checkpoint(
        config(catalog_without_fallback(), fast_executor(2)),
        second_service.clone(),
        CheckpointStore::open(&path),
    )
    .expect("test: engine");
    let second = resumed.run(items(5)).await.expect("test: second run");

    assert_eq!(second.checkpoint_skipped, 5);
    assert_eq!(second.succeeded.len(), 5);
    assert_eq!(second_service.calls(), 0);
    assert!(second.is_conserved());
}
