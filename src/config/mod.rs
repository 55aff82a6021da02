//! Declarative engine configuration.
//!
//! ## Responsibility
//! Parse and validate TOML engine configuration files. Users define the
//! whole engine — concurrency budgets, cache sizing, batch bounds, model
//! catalog, complexity weights — declaratively in one file.
//!
//! ## Guarantees
//! - Deterministic: same TOML input always produces the same `EngineConfig`
//! - Validated: all semantic constraints are checked before a config is accepted
//! - Type-safe: invalid field combinations are caught at parse time via serde
//! - Schema-exportable: JSON Schema output enables IDE autocomplete
//!
//! ## NOT Responsible For
//! - Building the runtime engine from config (that belongs to `engine`)
//! - Talking to the upstream service (that belongs to `service`)
//! - Metrics collection (that belongs to `metrics`)

pub mod loader;
pub mod validation;

use std::collections::HashMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::analyzer::AnalyzerConfig;
use crate::cache::CacheConfig;
use crate::executor::ExecutorConfig;
use crate::planner::PlannerConfig;
use crate::routing::{ModelCatalog, QualityTier};

pub use validation::ConfigError;

// ── Top-level config ─────────────────────────────────────────────────────

/// Root configuration for an engine instance.
///
/// Deserialized from a TOML file and validated before use.
/// Every field has either a required value or a documented default.
///
/// # Example
///
/// ```toml
/// [engine]
/// name = "production"
/// version = "1.0"
///
/// [catalog]
/// baseline = "premium"
///
/// [[catalog.models]]
/// id = "mini"
/// cost_per_1k_tokens = 0.001
/// tier = "economy"
/// max_complexity = 0.5
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct EngineConfig {
    /// Engine identity and version metadata.
    pub engine: EngineSection,
    /// Concurrency budgets, retry policy, queue and escalation bounds.
    #[serde(default)]
    pub executor: ExecutorConfig,
    /// Response cache sizing and TTL.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Batch size bounds and target duration.
    #[serde(default)]
    pub batching: PlannerConfig,
    /// Complexity scoring weights and thresholds.
    #[serde(default)]
    pub complexity: AnalyzerConfig,
    /// The model catalog and baseline for cost comparison.
    pub catalog: ModelCatalog,
    /// Per-step routing floors.
    #[serde(default)]
    pub routing: RoutingSection,
    /// Observability: logging and metrics.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

// ── Engine identity ──────────────────────────────────────────────────────

/// Engine identity and version metadata.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct EngineSection {
    /// Human-readable engine name (e.g., "production", "staging").
    pub name: String,
    /// Semantic version of this configuration (e.g., "1.0").
    pub version: String,
    /// Optional description for documentation purposes.
    pub description: Option<String>,
}

// ── Routing section ──────────────────────────────────────────────────────

/// Per-step routing floors.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RoutingSection {
    /// Minimum quality tier per processing step; steps absent here accept
    /// any tier.
    #[serde(default)]
    pub step_min_tier: HashMap<String, QualityTier>,
}

// ── Observability ────────────────────────────────────────────────────────

/// Log output format.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable console output.
    Pretty,
    /// Newline-delimited JSON for log shippers.
    Json,
}

fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}

/// Logging and metrics settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ObservabilityConfig {
    /// Log output format.
    #[serde(default = "default_log_format")]
    pub log_format: LogFormat,
    /// Port to expose Prometheus metrics on; `None` disables the exporter.
    pub metrics_port: Option<u16>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_format: default_log_format(),
            metrics_port: None,
        }
    }
}

// ── Schema export ────────────────────────────────────────────────────────

/// Export the configuration schema as pretty-printed JSON Schema.
///
/// This enables IDE autocomplete when editing TOML config files.
///
/// # Errors
///
/// Returns `serde_json::Error` if schema serialization fails (should not
/// happen with well-formed derive macros).
pub fn export_schema() -> Result<String, serde_json::Error> {
    let schema = schemars::schema_for!(EngineConfig);
    serde_json::to_string_pretty(&schema)
}
