//! Append-only routing ledger and cost comparison.
//!
//! Every routing decision is appended here (model, score, cost rate, token
//! estimate, flags) so a run can later report what its routing saved versus
//! sending everything to the fixed baseline model.
//!
//! Costs aggregate as micro-dollars (1 USD = 1 000 000 micro-dollars) to
//! avoid floating-point drift in long-running aggregations.

use std::sync::RwLock;

use super::catalog::ModelId;

/// One recorded routing decision.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerEntry {
    /// Model that was selected (or forced by override/fallback).
    pub model: ModelId,
    /// Complexity score that drove — or was recorded alongside — the
    /// decision.
    pub score: f64,
    /// The selected model's cost per 1 000 tokens at decision time, USD.
    pub cost_per_1k_tokens: f64,
    /// Estimated token count of the item(s) routed.
    pub estimated_tokens: u64,
    /// True when no model's ceiling covered the score and the
    /// highest-ceiling model was used instead.
    pub fallback_used: bool,
    /// True when an explicit override bypassed selection.
    pub overridden: bool,
}

/// Append-only record of routing decisions.
///
/// Entries are never mutated or removed. Readers take a point-in-time
/// snapshot; writers append under a short write lock.
#[derive(Debug, Default)]
pub struct RoutingLedger {
    entries: RwLock<Vec<LedgerEntry>>,
}

impl RoutingLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one decision. Lock poisoning is tolerated by skipping the
    /// append rather than panicking.
    pub fn append(&self, entry: LedgerEntry) {
        if let Ok(mut entries) = self.entries.write() {
            entries.push(entry);
        }
    }

    /// Number of recorded decisions.
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    /// Whether no decision has been recorded yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Point-in-time copy of all entries.
    pub fn snapshot(&self) -> Vec<LedgerEntry> {
        self.entries.read().map(|e| e.clone()).unwrap_or_default()
    }

    /// Compare recorded spend against sending every token to the baseline
    /// model at `baseline_cost_per_1k` USD.
    pub fn cost_report(&self, baseline_cost_per_1k: f64) -> CostReport {
        let entries = self.snapshot();
        let baseline_rate_micro = usd_to_micro(baseline_cost_per_1k);

        let mut actual_micro: u128 = 0;
        let mut baseline_micro: u128 = 0;
        let mut total_tokens: u64 = 0;
        let mut fallback_decisions: u64 = 0;
        let mut overridden_decisions: u64 = 0;

        for e in &entries {
            let rate_micro = usd_to_micro(e.cost_per_1k_tokens);
            actual_micro += (e.estimated_tokens as u128 * rate_micro as u128) / 1_000;
            baseline_micro += (e.estimated_tokens as u128 * baseline_rate_micro as u128) / 1_000;
            total_tokens += e.estimated_tokens;
            if e.fallback_used {
                fallback_decisions += 1;
            }
            if e.overridden {
                overridden_decisions += 1;
            }
        }

        let savings_micro = baseline_micro.saturating_sub(actual_micro);

        CostReport {
            decisions: entries.len() as u64,
            fallback_decisions,
            overridden_decisions,
            total_tokens,
            actual_cost_usd: micro_to_usd(actual_micro),
            baseline_cost_usd: micro_to_usd(baseline_micro),
            savings_usd: micro_to_usd(savings_micro),
            savings_percent: if baseline_micro > 0 {
                (savings_micro as f64 / baseline_micro as f64) * 100.0
            } else {
                0.0
            },
        }
    }
}

/// Cost comparison of actual routing versus the all-baseline hypothetical.
#[derive(Debug, Clone, PartialEq)]
pub struct CostReport {
    /// Total routing decisions recorded.
    pub decisions: u64,
    /// Decisions where no ceiling covered the score.
    pub fallback_decisions: u64,
    /// Decisions forced by explicit override.
    pub overridden_decisions: u64,
    /// Sum of estimated tokens across all decisions.
    pub total_tokens: u64,
    /// Estimated actual spend in USD.
    pub actual_cost_usd: f64,
    /// Hypothetical all-baseline spend in USD.
    pub baseline_cost_usd: f64,
    /// `baseline - actual`, floored at zero.
    pub savings_usd: f64,
    /// Savings as a percentage of the baseline.
    pub savings_percent: f64,
}

// ── Helpers ────────────────────────────────────────────────────────────

/// Convert a USD rate to micro-dollars.
fn usd_to_micro(usd: f64) -> u64 {
    (usd.max(0.0) * 1_000_000.0) as u64
}

/// Convert micro-dollars to USD.
fn micro_to_usd(micro: u128) -> f64 {
    micro as f64 / 1_000_000.0
}

// ── Tests ──────────────────────────────────────────────────────────────
