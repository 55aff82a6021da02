//! Work-item complexity scoring.
//!
//! ## Responsibility
//! Analyse a work item's text (plus optional glossary context) and produce a
//! difficulty estimate in `0.0..=1.0` that drives model routing: cheap models
//! for easy items, premium models for hard ones.
//!
//! ## Guarantees
//! - The score is always in `[0.0, 1.0]` and never errors — degenerate or
//!   empty input yields the minimum score.
//! - Monotone: increasing any single sub-factor while holding the others
//!   fixed never decreases the score.
//! - Deterministic for a given (text, context, failure-table) state.
//!
//! ## NOT Responsible For
//! - Computing glossary matches or protected tokens (collaborators supply
//!   those; the analyzer only consumes density signals)
//! - Mapping scores to models (that belongs to `routing`)
//!
//! ## Signals
//!
//! | Signal | Source |
//! |--------|--------|
//! | length | word count, saturating past the long-text threshold |
//! | protected tokens | configurable marker density per word |
//! | special characters | non-alphanumeric, non-whitespace char density |
//! | domain terms | glossary match count per word |
//! | failure history | rolling per-key success/failure table |
//!
//! Each signal is normalized to `[0, 1]` and combined as a weighted sum with
//! the weights themselves normalized to 1.0, so the total stays in range.

use crate::DomainContext;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

// ── Default value functions ────────────────────────────────────────────

/// Default weight for the length signal.
fn default_weight_length() -> f64 {
    0.3
}

/// Default weight for the protected-token density signal.
fn default_weight_protected() -> f64 {
    0.2
}

/// Default weight for the special-character density signal.
fn default_weight_special_chars() -> f64 {
    0.15
}

/// Default weight for the domain-term density signal.
fn default_weight_domain_terms() -> f64 {
    0.15
}

/// Default weight for the historical failure-rate signal.
fn default_weight_failure_history() -> f64 {
    0.2
}

/// Default word count past which the length signal saturates at 1.0.
fn default_long_text_threshold() -> usize {
    500
}

/// Default marker the text-preparation collaborator uses for protected
/// substrings.
fn default_protected_marker() -> String {
    "\u{27e6}".to_string() // ⟦
}

// ── Configuration ──────────────────────────────────────────────────────

/// Relative weights for the five complexity signals.
///
/// The weights need not sum to 1.0 in configuration — the analyzer
/// normalizes them at use. A zero total falls back to equal weighting.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, schemars::JsonSchema)]
pub struct ComplexityWeights {
    /// Weight of the saturating length signal.
    #[serde(default = "default_weight_length")]
    pub length: f64,
    /// Weight of the protected-token density signal.
    #[serde(default = "default_weight_protected")]
    pub protected_tokens: f64,
    /// Weight of the special-character density signal.
    #[serde(default = "default_weight_special_chars")]
    pub special_chars: f64,
    /// Weight of the domain-term density signal.
    #[serde(default = "default_weight_domain_terms")]
    pub domain_terms: f64,
    /// Weight of the historical failure-rate signal.
    #[serde(default = "default_weight_failure_history")]
    pub failure_history: f64,
}

impl Default for ComplexityWeights {
    fn default() -> Self {
        Self {
            length: default_weight_length(),
            protected_tokens: default_weight_protected(),
            special_chars: default_weight_special_chars(),
            domain_terms: default_weight_domain_terms(),
            failure_history: default_weight_failure_history(),
        }
    }
}

impl ComplexityWeights {
    /// Sum of all weights; used for normalization.
    fn total(&self) -> f64 {
        self.length
            + self.protected_tokens
            + self.special_chars
            + self.domain_terms
            + self.failure_history
    }
}

/// Analyzer tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, schemars::JsonSchema)]
pub struct AnalyzerConfig {
    /// Signal weights, normalized to 1.0 at use.
    #[serde(default)]
    pub weights: ComplexityWeights,
    /// Word count past which the length signal saturates.
    #[serde(default = "default_long_text_threshold")]
    pub long_text_threshold: usize,
    /// Marker string the text-preparation collaborator wraps protected
    /// substrings with. Only the opening marker is counted.
    #[serde(default = "default_protected_marker")]
    pub protected_marker: String,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            weights: ComplexityWeights::default(),
            long_text_threshold: default_long_text_threshold(),
            protected_marker: default_protected_marker(),
        }
    }
}

// ── Score ──────────────────────────────────────────────────────────────

/// Per-signal breakdown of a complexity analysis.
///
/// Sub-metric fields hold the raw normalized signal in `[0, 1]` *before*
/// weighting; `total` is the weighted, clamped sum.
#[derive(Debug, Clone, PartialEq)]
pub struct ComplexityScore {
    /// Saturating length signal.
    pub length: f64,
    /// Protected-token density signal.
    pub protected_density: f64,
    /// Special-character density signal.
    pub special_char_density: f64,
    /// Domain-term density signal.
    pub domain_term_density: f64,
    /// Historical failure rate for similar text.
    pub failure_rate: f64,
    /// Final weighted score in `[0.0, 1.0]`.
    pub total: f64,
}

// ── Analyzer ───────────────────────────────────────────────────────────

/// Rolling success/failure counts for one normalized text key.
#[derive(Debug, Default, Clone, Copy)]
struct OutcomeRecord {
    successes: u64,
    failures: u64,
}

/// Work-item complexity analyzer.
///
/// Cheap to share behind an `Arc`. The rolling failure table is the only
/// mutable state; it is updated by the QA collaborator through
/// [`ComplexityAnalyzer::record_outcome`] and read lock-free during
/// analysis.
#[derive(Debug)]
pub struct ComplexityAnalyzer {
    config: AnalyzerConfig,
    /// Rolling outcome table keyed by [`normalized_key`].
    failure_table: DashMap<String, OutcomeRecord>,
}

impl ComplexityAnalyzer {
    /// Create an analyzer with the given configuration.
    pub fn new(config: AnalyzerConfig) -> Self {
        Self {
            config,
            failure_table: DashMap::new(),
        }
    }

    /// Score a work item's text for complexity.
    ///
    /// # Arguments
    ///
    /// * `text` — The item text (already protected by the collaborator).
    /// * `context` — Optional glossary context carrying the term-hit count.
    ///
    /// # Returns
    ///
    /// A [`ComplexityScore`] with the per-signal breakdown and the weighted
    /// total in `[0.0, 1.0]`.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn analyze(&self, text: &str, context: Option<&DomainContext>) -> ComplexityScore {
        let words = text.split_whitespace().count();

        let length = self.length_signal(words);
        let protected_density = self.protected_signal(text, words);
        let special_char_density = Self::special_char_signal(text);
        let domain_term_density = Self::domain_term_signal(context, words);
        let failure_rate = self.failure_signal(text);

        let w = &self.config.weights;
        let total_weight = w.total();
        let total = if total_weight > 0.0 {
            (w.length * length
                + w.protected_tokens * protected_density
                + w.special_chars * special_char_density
                + w.domain_terms * domain_term_density
                + w.failure_history * failure_rate)
                / total_weight
        } else {
            // Degenerate all-zero weights: fall back to an equal-weight mean.
            (length + protected_density + special_char_density + domain_term_density + failure_rate)
                / 5.0
        };

        ComplexityScore {
            length,
            protected_density,
            special_char_density,
            domain_term_density,
            failure_rate,
            total: total.clamp(0.0, 1.0),
        }
    }

    /// Record a processing outcome for the failure-history signal.
    ///
    /// Called back by the QA collaborator after it judges a result. The key
    /// should come from [`normalized_key`] so lookups during analysis match.
    pub fn record_outcome(&self, normalized_key: &str, success: bool) {
        let mut entry = self
            .failure_table
            .entry(normalized_key.to_string())
            .or_default();
        if success {
            entry.successes += 1;
        } else {
            entry.failures += 1;
        }
    }

    /// Number of keys currently tracked in the failure table.
    pub fn tracked_keys(&self) -> usize {
        self.failure_table.len()
    }

    // ── Individual signals ─────────────────────────────────────────────

    /// Word count scaled against the long-text threshold, saturating at 1.0.
    fn length_signal(&self, words: usize) -> f64 {
        let threshold = self.config.long_text_threshold.max(1);
        (words as f64 / threshold as f64).min(1.0)
    }

    /// Protected-marker occurrences per word, saturating at 1.0.
    fn protected_signal(&self, text: &str, words: usize) -> f64 {
        if words == 0 || self.config.protected_marker.is_empty() {
            return 0.0;
        }
        let count = text.matches(&self.config.protected_marker).count();
        (count as f64 / words as f64).min(1.0)
    }

    /// Fraction of characters that are neither alphanumeric nor whitespace.
    fn special_char_signal(text: &str) -> f64 {
        let total = text.chars().count();
        if total == 0 {
            return 0.0;
        }
        let special = text
            .chars()
            .filter(|c| !c.is_alphanumeric() && !c.is_whitespace())
            .count();
        special as f64 / total as f64
    }

    /// Glossary term hits per word, saturating at 1.0.
    fn domain_term_signal(context: Option<&DomainContext>, words: usize) -> f64 {
        match context {
            Some(ctx) if words > 0 => (ctx.term_hits as f64 / words as f64).min(1.0),
            _ => 0.0,
        }
    }

    /// Observed failure rate for this text's normalized key, 0.0 if unseen.
    fn failure_signal(&self, text: &str) -> f64 {
        let key = normalized_key(text);
        match self.failure_table.get(&key) {
            Some(record) => {
                let total = record.successes + record.failures;
                if total == 0 {
                    0.0
                } else {
                    record.failures as f64 / total as f64
                }
            }
            None => 0.0,
        }
    }
}

impl Default for ComplexityAnalyzer {
    fn default() -> Self {
        Self::new(AnalyzerConfig::default())
    }
}

/// Normalize text into the failure-table key: lowercased with whitespace
/// collapsed, so trivial formatting differences share history.
pub fn normalized_key(text: &str) -> String {
    text.split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

// ── Tests ──────────────────────────────────────────────────────────────
