//! Configuration validation engine.
//!
//! ## Responsibility
//! Validate semantic constraints on a parsed [`EngineConfig`] that cannot
//! be expressed through the type system alone (e.g., range checks,
//! cross-field invariants, catalog referential integrity).
//!
//! ## Guarantees
//! - Every validation rule has at least one test that triggers it
//! - Validation collects *all* errors before returning (no short-circuit)
//! - Error messages include the field path and the invalid value
//!
//! ## NOT Responsible For
//! - Parsing TOML (that belongs to `loader`)
//! - File I/O (that belongs to `loader`)

use super::EngineConfig;

/// Errors arising from configuration parsing, validation, or I/O.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML parsing failed.
    #[error("Parse error in {file}: {source}")]
    Parse {
        /// Path of the file that failed to parse.
        file: String,
        /// Underlying TOML deserialization error.
        #[source]
        source: toml::de::Error,
    },

    /// One or more semantic validation rules failed.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A specific field has an out-of-range or contradictory value.
    #[error("Field '{field}' has invalid value {value}: {reason}")]
    InvalidField {
        /// Dot-separated field path (e.g., "executor.global_limit").
        field: String,
        /// String representation of the invalid value.
        value: String,
        /// Human-readable explanation of the constraint.
        reason: String,
    },

    /// File I/O error.
    #[error("IO error reading {file}: {source}")]
    Io {
        /// Path of the file that could not be read.
        file: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Validate all semantic constraints on an [`EngineConfig`].
///
/// Collects every violation before returning so the caller sees the full
/// scope of issues at once.
///
/// # Returns
///
/// - `Ok(())` if all constraints pass.
/// - `Err(Vec<ConfigError>)` with every violation found.
pub fn validate(config: &EngineConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();

    // ── Engine identity ──────────────────────────────────────────────
    if config.engine.name.trim().is_empty() {
        errors.push(ConfigError::InvalidField {
            field: "engine.name".into(),
            value: String::new(),
            reason: "engine name must not be empty".into(),
        });
    }

    // ── Concurrency budgets ──────────────────────────────────────────
    if config.executor.global_limit == 0 {
        errors.push(ConfigError::InvalidField {
            field: "executor.global_limit".into(),
            value: "0".into(),
            reason: "must be at least 1".into(),
        });
    }

    for (stage, &bound) in &config.executor.stage_limits {
        if bound == 0 {
            errors.push(ConfigError::InvalidField {
                field: format!("executor.stage_limits.{stage}"),
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        } else if bound > config.executor.global_limit {
            errors.push(ConfigError::InvalidField {
                field: format!("executor.stage_limits.{stage}"),
                value: bound.to_string(),
                reason: format!(
                    "must not exceed executor.global_limit ({})",
                    config.executor.global_limit
                ),
            });
        }
    }

    if config.executor.queue_bound == 0 {
        errors.push(ConfigError::InvalidField {
            field: "executor.queue_bound".into(),
            value: "0".into(),
            reason: "must be at least 1".into(),
        });
    }

    if config.executor.escalation_capacity == 0 {
        errors.push(ConfigError::InvalidField {
            field: "executor.escalation_capacity".into(),
            value: "0".into(),
            reason: "must be at least 1".into(),
        });
    }

    // ── Retry settings ───────────────────────────────────────────────
    if config.executor.retry.max_attempts == 0 {
        errors.push(ConfigError::InvalidField {
            field: "executor.retry.max_attempts".into(),
            value: "0".into(),
            reason: "must be at least 1".into(),
        });
    }

    if config.executor.retry.base_delay_ms > config.executor.retry.max_delay_ms {
        errors.push(ConfigError::InvalidField {
            field: "executor.retry.base_delay_ms".into(),
            value: config.executor.retry.base_delay_ms.to_string(),
            reason: "must be \u{2264} max_delay_ms".into(),
        });
    }

    if config.executor.retry.multiplier < 1.0 {
        errors.push(ConfigError::InvalidField {
            field: "executor.retry.multiplier".into(),
            value: config.executor.retry.multiplier.to_string(),
            reason: "must be at least 1.0".into(),
        });
    }

    if !(0.0..=1.0).contains(&config.executor.retry.jitter) {
        errors.push(ConfigError::InvalidField {
            field: "executor.retry.jitter".into(),
            value: config.executor.retry.jitter.to_string(),
            reason: "must be between 0.0 and 1.0".into(),
        });
    }

    // ── Cache sizing ─────────────────────────────────────────────────
    if config.cache.low_water_bytes >= config.cache.max_bytes {
        errors.push(ConfigError::InvalidField {
            field: "cache.low_water_bytes".into(),
            value: config.cache.low_water_bytes.to_string(),
            reason: format!("must be below cache.max_bytes ({})", config.cache.max_bytes),
        });
    }

    // ── Batching bounds ──────────────────────────────────────────────
    if config.batching.min_batch_size == 0 {
        errors.push(ConfigError::InvalidField {
            field: "batching.min_batch_size".into(),
            value: "0".into(),
            reason: "must be at least 1".into(),
        });
    }

    if config.batching.min_batch_size > config.batching.max_batch_size {
        errors.push(ConfigError::InvalidField {
            field: "batching.min_batch_size".into(),
            value: config.batching.min_batch_size.to_string(),
            reason: format!(
                "must be \u{2264} batching.max_batch_size ({})",
                config.batching.max_batch_size
            ),
        });
    }

    if config.batching.length_variance_ratio < 1.0 {
        errors.push(ConfigError::InvalidField {
            field: "batching.length_variance_ratio".into(),
            value: config.batching.length_variance_ratio.to_string(),
            reason: "must be at least 1.0".into(),
        });
    }

    // ── Complexity weights ───────────────────────────────────────────
    let w = &config.complexity.weights;
    for (field, value) in [
        ("length", w.length),
        ("protected_tokens", w.protected_tokens),
        ("special_chars", w.special_chars),
        ("domain_terms", w.domain_terms),
        ("failure_history", w.failure_history),
    ] {
        if !(0.0..=1.0).contains(&value) || value.is_nan() {
            errors.push(ConfigError::InvalidField {
                field: format!("complexity.weights.{field}"),
                value: value.to_string(),
                reason: "must be between 0.0 and 1.0".into(),
            });
        }
    }

    // ── Model catalog ────────────────────────────────────────────────
    if let Err(problems) = config.catalog.validate() {
        for reason in problems {
            errors.push(ConfigError::InvalidField {
                field: "catalog".into(),
                value: String::new(),
                reason,
            });
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineSection, RoutingSection};
    use crate::routing::{ModelCatalog, ModelDescriptor, ModelId, QualityTier};

    fn valid_config() -> EngineConfig {
        EngineConfig {
            engine: EngineSection {
                name: "test".into(),
                version: "1.0".into(),
                description: None,
            },
            executor: Default::default(),
            cache: Default::default(),
            batching: Default::default(),
            complexity: Default::default(),
            catalog: ModelCatalog {
                models: vec![ModelDescriptor {
                    id: ModelId::new("big"),
                    cost_per_1k_tokens: 0.015,
                    tier: QualityTier::Premium,
                    max_complexity: 1.0,
                    batch_capable: true,
                    fallback_to: None,
                    context_window: 8_192,
                    latency_per_token_ms: 20.0,
                }],
                baseline: ModelId::new("big"),
            },
            routing: RoutingSection::default(),
            observability: Default::default(),
        }
    }

    fn field_errors(config: &EngineConfig) -> Vec<String> {
        match validate(config) {
            Ok(()) => Vec::new(),
            Err(errors) => errors
                .iter()
                .map(|e| match e {
                    ConfigError::InvalidField { field, .. } => field.clone(),
                    other => other.to_string(),
                })
                .collect(),
        }
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(validate(&valid_config()).is_ok());
    }

    #[test]
    fn test_empty_engine_name_rejected() {
        let mut config = valid_config();
        config.engine.name = "  ".into();
        assert!(field_errors(&config).contains(&"engine.name".to_string()));
    }

    #[test]
    fn test_zero_global_limit_rejected() {
        let mut config = valid_config();
        config.executor.global_limit = 0;
        assert!(field_errors(&config).contains(&"executor.global_limit".to_string()));
    }

    #[test]
    fn test_stage_limit_above_global_rejected() {
        let mut config = valid_config();
        config.executor.global_limit = 4;
        config.executor.stage_limits.insert("draft".into(), 10);
        assert!(field_errors(&config).contains(&"executor.stage_limits.draft".to_string()));
    }

    #[test]
    fn test_zero_stage_limit_rejected() {
        let mut config = valid_config();
        config.executor.stage_limits.insert("draft".into(), 0);
        assert!(field_errors(&config).contains(&"executor.stage_limits.draft".to_string()));
    }

    #[test]
    fn test_zero_queue_bound_rejected() {
        let mut config = valid_config();
        config.executor.queue_bound = 0;
        assert!(field_errors(&config).contains(&"executor.queue_bound".to_string()));
    }

    #[test]
    fn test_zero_escalation_capacity_rejected() {
        let mut config = valid_config();
        config.executor.escalation_capacity = 0;
        assert!(field_errors(&config).contains(&"executor.escalation_capacity".to_string()));
    }

    #[test]
    fn test_zero_retry_attempts_rejected() {
        let mut config = valid_config();
        config.executor.retry.max_attempts = 0;
        assert!(field_errors(&config).contains(&"executor.retry.max_attempts".to_string()));
    }

    #[test]
    fn test_retry_base_above_max_rejected() {
        let mut config = valid_config();
        config.executor.retry.base_delay_ms = 10_000;
        config.executor.retry.max_delay_ms = 100;
        assert!(field_errors(&config).contains(&"executor.retry.base_delay_ms".to_string()));
    }

    #[test]
    fn test_retry_multiplier_below_one_rejected() {
        let mut config = valid_config();
        config.executor.retry.multiplier = 0.5;
        assert!(field_errors(&config).contains(&"executor.retry.multiplier".to_string()));
    }

    #[test]
    fn test_retry_jitter_out_of_range_rejected() {
        let mut config = valid_config();
        config.executor.retry.jitter = 1.5;
        assert!(field_errors(&config).contains(&"executor.retry.jitter".to_string()));
    }

    #[test]
    fn test_cache_low_water_at_or_above_max_rejected() {
        let mut config = valid_config();
        config.cache.low_water_bytes = config.cache.max_bytes;
        assert!(field_errors(&config).contains(&"cache.low_water_bytes".to_string()));
    }

    #[test]
    fn test_zero_min_batch_size_rejected() {
        let mut config = valid_config();
        config.batching.min_batch_size = 0;
        assert!(field_errors(&config).contains(&"batching.min_batch_size".to_string()));
    }

    #[test]
    fn test_min_batch_above_max_rejected() {
        let mut config = valid_config();
        config.batching.min_batch_size = 64;
        config.batching.max_batch_size = 8;
        assert!(field_errors(&config).contains(&"batching.min_batch_size".to_string()));
    }

    #[test]
    fn test_variance_ratio_below_one_rejected() {
        let mut config = valid_config();
        config.batching.length_variance_ratio = 0.5;
        assert!(field_errors(&config).contains(&"batching.length_variance_ratio".to_string()));
    }

    #[test]
    fn test_complexity_weight_out_of_range_rejected() {
        let mut config = valid_config();
        config.complexity.weights.length = 1.5;
        assert!(field_errors(&config).contains(&"complexity.weights.length".to_string()));
    }

    #[test]
    fn test_catalog_errors_are_surfaced() {
        let mut config = valid_config();
        config.catalog.baseline = ModelId::new("missing");
        assert!(field_errors(&config).contains(&"catalog".to_string()));
    }

    #[test]
    fn test_all_violations_collected_not_just_first() {
        let mut config = valid_config();
        config.engine.name = String::new();
        config.executor.global_limit = 0;
        config.batching.min_batch_size = 0;
        let errors = validate(&config).expect_err("test: invalid config");
        assert!(errors.len() >= 3);
    }
}
