//! Complexity-based model selection.
//!
//! ## Responsibility
//! Pick the cheapest catalog model whose quality ceiling covers an item's
//! complexity score, honoring per-step minimum tiers and explicit
//! overrides, and record every decision in the [`RoutingLedger`].
//!
//! ## Guarantees
//! - Deterministic: equal inputs always yield the same model, with ties
//!   broken first by cost and then by model id.
//! - Every call to [`ModelRouter::select`] appends exactly one ledger
//!   entry, including overridden and fallback decisions.
//!
//! ## NOT Responsible For
//! - Computing complexity scores (the analyzer does that).
//! - Failure escalation at execution time (the executor consults
//!   [`ModelRouter::fallback_for`] for that).

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use super::catalog::{ModelCatalog, ModelDescriptor, ModelId, QualityTier};
use super::ledger::{LedgerEntry, RoutingLedger};
use crate::EngineError;

/// The outcome of routing one item.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteDecision {
    /// The model selected for the item.
    pub model: ModelDescriptor,
    /// The complexity score the decision was made against.
    pub score: f64,
    /// Estimated tokens for the routed text.
    pub estimated_tokens: u64,
    /// Estimated cost in USD for those tokens at the selected model's rate.
    pub estimated_cost_usd: f64,
    /// True when no model's ceiling covered the score and the
    /// highest-ceiling model was chosen instead.
    pub fallback_used: bool,
    /// True when an explicit override bypassed selection.
    pub overridden: bool,
}

/// Routes items to catalog models by complexity score.
#[derive(Debug)]
pub struct ModelRouter {
    catalog: ModelCatalog,
    step_min_tier: HashMap<String, QualityTier>,
    ledger: Arc<RoutingLedger>,
}

impl ModelRouter {
    /// Create a router over a validated catalog.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Config` when the catalog fails validation.
    pub fn new(
        catalog: ModelCatalog,
        step_min_tier: HashMap<String, QualityTier>,
    ) -> Result<Self, EngineError> {
        if let Err(problems) = catalog.validate() {
            return Err(EngineError::Config(format!(
                "invalid model catalog: {}",
                problems.join("; ")
            )));
        }
        Ok(Self {
            catalog,
            step_min_tier,
            ledger: Arc::new(RoutingLedger::new()),
        })
    }

    /// The ledger recording every decision this router has made.
    pub fn ledger(&self) -> Arc<RoutingLedger> {
        Arc::clone(&self.ledger)
    }

    /// The catalog this router selects from.
    pub fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }

    /// Select a model for an item.
    ///
    /// Candidates are models whose tier is at least the step's minimum and
    /// whose `max_complexity` ceiling covers `score`; of those, the cheapest
    /// wins, ties broken by model id. When no ceiling covers the score the
    /// highest-ceiling model (among tier-eligible ones) is used and the
    /// decision is marked `fallback_used`.
    ///
    /// An explicit `override_model` bypasses selection entirely but the
    /// score is still recorded in the ledger.
    ///
    /// # Arguments
    ///
    /// * `score` - Complexity score in `[0.0, 1.0]`.
    /// * `step` - Processing step name, looked up in the per-step minimum
    ///   tier map.
    /// * `estimated_tokens` - Token estimate for the text being routed.
    /// * `override_model` - Optional explicit model id to force.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Config` when an override names a model not in
    /// the catalog, or when the step's minimum tier excludes every model.
    pub fn select(
        &self,
        score: f64,
        step: &str,
        estimated_tokens: u64,
        override_model: Option<&ModelId>,
    ) -> Result<RouteDecision, EngineError> {
        if let Some(id) = override_model {
            let model = self.catalog.get(id).ok_or_else(|| {
                EngineError::Config(format!("override model '{id}' not in catalog"))
            })?;
            let decision = self.finish(model.clone(), score, estimated_tokens, false, true);
            debug!(
                model = %decision.model.id,
                score,
                overridden = true,
                "routing decision"
            );
            return Ok(decision);
        }

        let min_tier = self
            .step_min_tier
            .get(step)
            .copied()
            .unwrap_or(QualityTier::Economy);

        let eligible: Vec<&ModelDescriptor> = self
            .catalog
            .models
            .iter()
            .filter(|m| m.tier >= min_tier)
            .collect();

        if eligible.is_empty() {
            return Err(EngineError::Config(format!(
                "no catalog model satisfies minimum tier {min_tier:?} for step '{step}'"
            )));
        }

        let covering = eligible
            .iter()
            .filter(|m| m.max_complexity >= score)
            .min_by(|a, b| {
                a.cost_per_1k_tokens
                    .partial_cmp(&b.cost_per_1k_tokens)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.id.as_str().cmp(b.id.as_str()))
            });

        let (model, fallback_used) = match covering {
            Some(m) => ((*m).clone(), false),
            None => {
                // No ceiling covers the score: take the most capable model.
                let best = eligible
                    .iter()
                    .max_by(|a, b| {
                        a.max_complexity
                            .partial_cmp(&b.max_complexity)
                            .unwrap_or(std::cmp::Ordering::Equal)
                            .then_with(|| b.id.as_str().cmp(a.id.as_str()))
                    })
                    .ok_or_else(|| {
                        EngineError::Config("model catalog unexpectedly empty".to_string())
                    })?;
                ((*best).clone(), true)
            }
        };

        let decision = self.finish(model, score, estimated_tokens, fallback_used, false);
        debug!(
            model = %decision.model.id,
            score,
            fallback_used,
            cost_usd = decision.estimated_cost_usd,
            "routing decision"
        );
        Ok(decision)
    }

    /// The configured execution-time fallback for a model, if any.
    pub fn fallback_for(&self, id: &ModelId) -> Option<&ModelDescriptor> {
        self.catalog
            .get(id)
            .and_then(|m| m.fallback_to.as_ref())
            .and_then(|fid| self.catalog.get(fid))
    }

    fn finish(
        &self,
        model: ModelDescriptor,
        score: f64,
        estimated_tokens: u64,
        fallback_used: bool,
        overridden: bool,
    ) -> RouteDecision {
        self.ledger.append(LedgerEntry {
            model: model.id.clone(),
            score,
            cost_per_1k_tokens: model.cost_per_1k_tokens,
            estimated_tokens,
            fallback_used,
            overridden,
        });
        let estimated_cost_usd =
            (estimated_tokens as f64 / 1_000.0) * model.cost_per_1k_tokens;
        RouteDecision {
            model,
            score,
            estimated_tokens,
            estimated_cost_usd,
            fallback_used,
            overridden,
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::catalog::tests_support::descriptor;

    fn catalog() -> ModelCatalog {
        let mut cheap = descriptor("mini", 0.001, 0.5);
        cheap.tier = QualityTier::Economy;
        cheap.fallback_to = Some(ModelId::new("standard"));
        let mut mid = descriptor("standard", 0.005, 0.8);
        mid.tier = QualityTier::Standard;
        mid.fallback_to = Some(ModelId::new("premium"));
        let mut big = descriptor("premium", 0.015, 1.0);
        big.tier = QualityTier::Premium;
        ModelCatalog {
            models: vec![cheap, mid, big],
            baseline: ModelId::new("premium"),
        }
    }

    fn router() -> ModelRouter {
        ModelRouter::new(catalog(), HashMap::new()).expect("test: valid catalog")
    }

    #[test]
    fn test_low_score_routes_to_cheapest_covering_model() {
        let r = router();
        let d = r.select(0.1, "draft", 100, None).expect("test: select");
        assert_eq!(d.model.id.as_str(), "mini");
        assert!(!d.fallback_used);
        assert!(!d.overridden);
    }

    #[test]
    fn test_mid_score_skips_models_below_ceiling() {
        let r = router();
        let d = r.select(0.6, "draft", 100, None).expect("test: select");
        assert_eq!(d.model.id.as_str(), "standard");
    }

    #[test]
    fn test_score_at_ceiling_boundary_is_covered() {
        let r = router();
        let d = r.select(0.5, "draft", 100, None).expect("test: select");
        assert_eq!(d.model.id.as_str(), "mini");
    }

    #[test]
    fn test_uncoverable_score_falls_back_to_most_capable() {
        let mut cat = catalog();
        // Cap every ceiling below 1.0 so a max-complexity item has no cover.
        for m in &mut cat.models {
            m.max_complexity = m.max_complexity.min(0.9);
        }
        let r = ModelRouter::new(cat, HashMap::new()).expect("test: valid catalog");
        let d = r.select(0.95, "draft", 100, None).expect("test: select");
        assert_eq!(d.model.id.as_str(), "premium");
        assert!(d.fallback_used);
    }

    #[test]
    fn test_step_minimum_tier_filters_cheap_models() {
        let mut tiers = HashMap::new();
        tiers.insert("legal_review".to_string(), QualityTier::Standard);
        let r = ModelRouter::new(catalog(), tiers).expect("test: valid catalog");
        let d = r
            .select(0.1, "legal_review", 100, None)
            .expect("test: select");
        assert_eq!(d.model.id.as_str(), "standard");
    }

    #[test]
    fn test_minimum_tier_excluding_all_models_is_an_error() {
        let mut cat = catalog();
        cat.models.retain(|m| m.tier == QualityTier::Economy);
        cat.baseline = ModelId::new("mini");
        cat.models[0].fallback_to = None;
        let mut tiers = HashMap::new();
        tiers.insert("review".to_string(), QualityTier::Premium);
        let r = ModelRouter::new(cat, tiers).expect("test: valid catalog");
        assert!(r.select(0.1, "review", 100, None).is_err());
    }

    #[test]
    fn test_override_bypasses_selection_but_records_score() {
        let r = router();
        let id = ModelId::new("premium");
        let d = r.select(0.1, "draft", 100, Some(&id)).expect("test: select");
        assert_eq!(d.model.id.as_str(), "premium");
        assert!(d.overridden);
        let snap = r.ledger().snapshot();
        assert_eq!(snap.len(), 1);
        assert!((snap[0].score - 0.1).abs() < f64::EPSILON);
        assert!(snap[0].overridden);
    }

    #[test]
    fn test_override_with_unknown_model_is_an_error() {
        let r = router();
        let id = ModelId::new("nonexistent");
        assert!(r.select(0.1, "draft", 100, Some(&id)).is_err());
    }

    #[test]
    fn test_selection_is_deterministic_across_calls() {
        let r = router();
        let a = r.select(0.42, "draft", 100, None).expect("test: select");
        let b = r.select(0.42, "draft", 100, None).expect("test: select");
        assert_eq!(a.model.id, b.model.id);
    }

    #[test]
    fn test_cost_tie_breaks_by_model_id() {
        let mut a = descriptor("alpha", 0.003, 1.0);
        a.tier = QualityTier::Standard;
        let mut b = descriptor("beta", 0.003, 1.0);
        b.tier = QualityTier::Standard;
        let cat = ModelCatalog {
            models: vec![b, a],
            baseline: ModelId::new("alpha"),
        };
        let r = ModelRouter::new(cat, HashMap::new()).expect("test: valid catalog");
        let d = r.select(0.5, "draft", 100, None).expect("test: select");
        assert_eq!(d.model.id.as_str(), "alpha");
    }

    #[test]
    fn test_every_decision_lands_in_the_ledger() {
        let r = router();
        for i in 0..5 {
            let _ = r.select(0.1 * i as f64, "draft", 200, None);
        }
        assert_eq!(r.ledger().len(), 5);
    }

    #[test]
    fn test_fallback_for_follows_catalog_chain() {
        let r = router();
        let f = r
            .fallback_for(&ModelId::new("mini"))
            .expect("test: mini has fallback");
        assert_eq!(f.id.as_str(), "standard");
        assert!(r.fallback_for(&ModelId::new("premium")).is_none());
    }

    #[test]
    fn test_estimated_cost_scales_with_tokens_and_rate() {
        let r = router();
        let d = r.select(0.9, "draft", 2_000, None).expect("test: select");
        // premium at $0.015/1k over 2k tokens.
        assert!((d.estimated_cost_usd - 0.03).abs() < 1e-9);
    }

    #[test]
    fn test_invalid_catalog_is_rejected_at_construction() {
        let cat = ModelCatalog {
            models: vec![],
            baseline: ModelId::new("x"),
        };
        assert!(ModelRouter::new(cat, HashMap::new()).is_err());
    }
}
