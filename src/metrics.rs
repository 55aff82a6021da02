//! Prometheus metrics for the batch engine.
//!
//! ## Usage
//!
//! Call [`init_metrics`] once at process startup **before** starting a run.
//! The helper functions (`inc_item_outcome`, `inc_retry`, …) are no-ops if
//! `init_metrics` was never called, so the engine is always safe to run —
//! observability simply degrades gracefully.
//!
//! ## Metrics Exposed
//!
//! | Name | Type | Labels |
//! |------|------|--------|
//! | `engine_items_total` | Counter | `outcome` |
//! | `engine_retries_total` | Counter | — |
//! | `engine_batch_splits_total` | Counter | — |
//! | `engine_fallbacks_total` | Counter | — |
//! | `engine_cache_events_total` | Counter | `event` |
//! | `engine_in_flight` | Gauge | `stage` |
//! | `engine_batch_duration_seconds` | Histogram | — |

use crate::EngineError;
use prometheus::{
    Counter, CounterVec, Encoder, Histogram, HistogramOpts, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::sync::OnceLock;

// ── Internal metrics bundle ────────────────────────────────────────────────

/// All Prometheus metrics for the engine, bundled together so they can be
/// stored in a single [`OnceLock`] and initialised atomically.
pub struct Metrics {
    /// Prometheus registry that owns all metric descriptors.
    pub registry: Registry,
    /// Terminal item outcomes by `outcome` label (succeeded, escalated).
    pub items_total: CounterVec,
    /// Backoff retries performed.
    pub retries_total: Counter,
    /// Binary batch splits performed.
    pub batch_splits_total: Counter,
    /// Fallback-model substitutions performed.
    pub fallbacks_total: Counter,
    /// Cache events by `event` label (hit, miss, eviction).
    pub cache_events_total: CounterVec,
    /// Requests currently in flight per stage.
    pub in_flight: IntGaugeVec,
    /// Wall-clock duration per batch from first dispatch to terminal.
    pub batch_duration: Histogram,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

// ── Initialisation ─────────────────────────────────────────────────────────

/// Initialise all Prometheus metrics and register them with a private
/// registry.
///
/// Must be called once at process startup before any run is started.
/// Calling it a second time is a no-op (returns `Ok(())`).
///
/// # Errors
///
/// Returns [`EngineError::Other`] if metric construction or registry
/// registration fails (e.g., duplicate descriptor names).
pub fn init_metrics() -> Result<(), EngineError> {
    if METRICS.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let items_total = CounterVec::new(
        Opts::new("engine_items_total", "Terminal item outcomes"),
        &["outcome"],
    )
    .map_err(|e| EngineError::Other(format!("metrics init failed: {e}")))?;
    registry
        .register(Box::new(items_total.clone()))
        .map_err(|e| EngineError::Other(format!("metrics registration failed: {e}")))?;

    let retries_total = Counter::new("engine_retries_total", "Backoff retries performed")
        .map_err(|e| EngineError::Other(format!("metrics init failed: {e}")))?;
    registry
        .register(Box::new(retries_total.clone()))
        .map_err(|e| EngineError::Other(format!("metrics registration failed: {e}")))?;

    let batch_splits_total =
        Counter::new("engine_batch_splits_total", "Binary batch splits performed")
            .map_err(|e| EngineError::Other(format!("metrics init failed: {e}")))?;
    registry
        .register(Box::new(batch_splits_total.clone()))
        .map_err(|e| EngineError::Other(format!("metrics registration failed: {e}")))?;

    let fallbacks_total = Counter::new(
        "engine_fallbacks_total",
        "Fallback-model substitutions performed",
    )
    .map_err(|e| EngineError::Other(format!("metrics init failed: {e}")))?;
    registry
        .register(Box::new(fallbacks_total.clone()))
        .map_err(|e| EngineError::Other(format!("metrics registration failed: {e}")))?;

    let cache_events_total = CounterVec::new(
        Opts::new("engine_cache_events_total", "Cache hits, misses, evictions"),
        &["event"],
    )
    .map_err(|e| EngineError::Other(format!("metrics init failed: {e}")))?;
    registry
        .register(Box::new(cache_events_total.clone()))
        .map_err(|e| EngineError::Other(format!("metrics registration failed: {e}")))?;

    let in_flight = IntGaugeVec::new(
        Opts::new("engine_in_flight", "Requests currently in flight per stage"),
        &["stage"],
    )
    .map_err(|e| EngineError::Other(format!("metrics init failed: {e}")))?;
    registry
        .register(Box::new(in_flight.clone()))
        .map_err(|e| EngineError::Other(format!("metrics registration failed: {e}")))?;

    let batch_duration = Histogram::with_opts(HistogramOpts::new(
        "engine_batch_duration_seconds",
        "Batch wall-clock duration from first dispatch to terminal outcome",
    ))
    .map_err(|e| EngineError::Other(format!("metrics init failed: {e}")))?;
    registry
        .register(Box::new(batch_duration.clone()))
        .map_err(|e| EngineError::Other(format!("metrics registration failed: {e}")))?;

    // If another thread raced us, the first one wins — both initializations
    // produce identical metric descriptors, so neither outcome is incorrect.
    let _ = METRICS.set(Metrics {
        registry,
        items_total,
        retries_total,
        batch_splits_total,
        fallbacks_total,
        cache_events_total,
        in_flight,
        batch_duration,
    });

    Ok(())
}

/// Return a reference to the initialised [`Metrics`], or `None` if
/// [`init_metrics`] has not been called yet.
fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

// ── Public helper functions ────────────────────────────────────────────────

/// Count a terminal item outcome (`"succeeded"` or `"escalated"`).
///
/// No-op if metrics have not been initialised.
pub fn inc_item_outcome(outcome: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.items_total.get_metric_with_label_values(&[outcome]) {
            c.inc();
        }
    }
}

/// Count one backoff retry.
///
/// No-op if metrics have not been initialised.
pub fn inc_retry() {
    if let Some(m) = metrics() {
        m.retries_total.inc();
    }
}

/// Count one binary batch split.
///
/// No-op if metrics have not been initialised.
pub fn inc_split() {
    if let Some(m) = metrics() {
        m.batch_splits_total.inc();
    }
}

/// Count one fallback-model substitution.
///
/// No-op if metrics have not been initialised.
pub fn inc_fallback() {
    if let Some(m) = metrics() {
        m.fallbacks_total.inc();
    }
}

/// Count a cache event (`"hit"`, `"miss"`, or `"eviction"`).
///
/// No-op if metrics have not been initialised.
pub fn inc_cache_event(event: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.cache_events_total.get_metric_with_label_values(&[event]) {
            c.inc();
        }
    }
}

/// Adjust the in-flight gauge for a stage by `delta`.
///
/// No-op if metrics have not been initialised.
pub fn add_in_flight(stage: &str, delta: i64) {
    if let Some(m) = metrics() {
        if let Ok(g) = m.in_flight.get_metric_with_label_values(&[stage]) {
            g.add(delta);
        }
    }
}

/// Record one batch's wall-clock duration in seconds.
///
/// No-op if metrics have not been initialised.
pub fn observe_batch_duration(seconds: f64) {
    if let Some(m) = metrics() {
        m.batch_duration.observe(seconds);
    }
}

/// Gather all registered metrics as a raw list of metric families.
///
/// Returns an empty `Vec` if metrics have not been initialised.
pub fn gather() -> Vec<prometheus::proto::MetricFamily> {
    metrics().map_or_else(Vec::new, |m| m.registry.gather())
}

/// Gather and encode all metrics in the Prometheus text exposition format.
///
/// Returns an empty string if metrics have not been initialised or if
/// encoding fails. Observability degrades gracefully rather than panicking.
pub fn gather_metrics() -> String {
    let families = gather();
    if families.is_empty() {
        return String::new();
    }
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
