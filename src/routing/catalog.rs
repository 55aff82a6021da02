//! Model catalog types.
//!
//! Describes the models available to the engine: identity, pricing, quality
//! tier, complexity ceiling, batching support, and the static fallback
//! pointer the executor substitutes on transient failure.

use serde::{Deserialize, Serialize};

// ── Default value functions ────────────────────────────────────────────

/// Most models accept batched payloads; opt out per model.
fn default_batch_capable() -> bool {
    true
}

/// Default context window: 8k tokens.
fn default_context_window() -> usize {
    8_192
}

/// Default per-token generation latency estimate: 20 ms.
fn default_latency_per_token_ms() -> f64 {
    20.0
}

/// Identifier of a model in the catalog (e.g. `"gpt-economy"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(transparent)]
pub struct ModelId(
    /// The raw model id string.
    pub String,
);

impl ModelId {
    /// Create a new [`ModelId`] from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Return the model id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ModelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Quality tier of a model. Ordered: `Economy < Standard < Premium`.
///
/// Steps may declare a minimum tier; the router filters below-tier models
/// out before cost comparison.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    schemars::JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum QualityTier {
    /// Cheapest tier; fine for routine items.
    Economy,
    /// Mid tier.
    Standard,
    /// Highest tier; reserved for hard or quality-critical steps.
    Premium,
}

/// Static description of one model the engine can route to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct ModelDescriptor {
    /// Catalog-unique identifier.
    pub id: ModelId,
    /// Cost per 1 000 tokens of input text, in USD.
    pub cost_per_1k_tokens: f64,
    /// Quality tier used for step filtering.
    pub tier: QualityTier,
    /// Highest complexity score this model is trusted with.
    pub max_complexity: f64,
    /// Whether multiple items may share one request. Non-batch-capable
    /// models force batch size 1 in the planner.
    #[serde(default = "default_batch_capable")]
    pub batch_capable: bool,
    /// Model to substitute when this one fails transiently, if any.
    #[serde(default)]
    pub fallback_to: Option<ModelId>,
    /// Context window size in tokens; bounds batch size.
    #[serde(default = "default_context_window")]
    pub context_window: usize,
    /// Approximate generation latency per token, in milliseconds; feeds the
    /// planner's time bound.
    #[serde(default = "default_latency_per_token_ms")]
    pub latency_per_token_ms: f64,
}

/// The set of models available for routing plus the reporting baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct ModelCatalog {
    /// All routable models.
    pub models: Vec<ModelDescriptor>,
    /// Model the cost report compares actual spend against ("what would it
    /// have cost to send everything here").
    pub baseline: ModelId,
}

impl ModelCatalog {
    /// Look up a descriptor by id.
    pub fn get(&self, id: &ModelId) -> Option<&ModelDescriptor> {
        self.models.iter().find(|m| &m.id == id)
    }

    /// The baseline descriptor, if the catalog is valid.
    pub fn baseline_descriptor(&self) -> Option<&ModelDescriptor> {
        self.get(&self.baseline)
    }

    /// Validate catalog invariants, collecting every violation.
    ///
    /// Checked at startup so routing never observes a broken catalog:
    /// non-empty, unique ids, resolvable fallback pointers (no
    /// self-fallback), existing baseline, sane numeric ranges.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.models.is_empty() {
            errors.push("catalog.models: must contain at least one model".to_string());
        }

        for (i, m) in self.models.iter().enumerate() {
            if self.models.iter().filter(|o| o.id == m.id).count() > 1 {
                errors.push(format!("catalog.models[{i}]: duplicate id '{}'", m.id));
            }
            if !(0.0..=1.0).contains(&m.max_complexity) {
                errors.push(format!(
                    "catalog.models[{i}].max_complexity: {} outside [0.0, 1.0]",
                    m.max_complexity
                ));
            }
            if m.cost_per_1k_tokens < 0.0 {
                errors.push(format!(
                    "catalog.models[{i}].cost_per_1k_tokens: must be >= 0"
                ));
            }
            if m.context_window == 0 {
                errors.push(format!("catalog.models[{i}].context_window: must be > 0"));
            }
            if let Some(fb) = &m.fallback_to {
                if fb == &m.id {
                    errors.push(format!(
                        "catalog.models[{i}].fallback_to: model '{}' cannot fall back to itself",
                        m.id
                    ));
                } else if self.get(fb).is_none() {
                    errors.push(format!(
                        "catalog.models[{i}].fallback_to: unknown model '{fb}'"
                    ));
                }
            }
        }

        if !self.models.is_empty() && self.get(&self.baseline).is_none() {
            errors.push(format!("catalog.baseline: unknown model '{}'", self.baseline));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;

    /// Build a standard-tier descriptor for tests.
    pub(crate) fn descriptor(id: &str, cost: f64, max: f64) -> ModelDescriptor {
        ModelDescriptor {
            id: ModelId::new(id),
            cost_per_1k_tokens: cost,
            tier: QualityTier::Standard,
            max_complexity: max,
            batch_capable: true,
            fallback_to: None,
            context_window: 8_192,
            latency_per_token_ms: 20.0,
        }
    }
}
