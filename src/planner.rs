//! Batch planning.
//!
//! ## Responsibility
//! Group pending items routed to the same model into batches sized by the
//! model's context window and a target wall-clock duration, clustering
//! similar-length items so short ones are not padded out to the longest
//! item in the batch.
//!
//! ## Guarantees
//! - Deterministic: identical inputs (items, order, model) always produce
//!   identical batches (stable sort, integer bounds).
//! - Every input item appears in exactly one output batch.
//! - Non-batch-capable models always get size-1 batches.
//!
//! ## NOT Responsible For
//! - Choosing the model (the router decides before planning).
//! - Dispatch, retry, or splitting (the executor owns those).

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::routing::ModelDescriptor;
use crate::WorkItem;

// ── Configuration ──────────────────────────────────────────────────────

fn default_min_batch_size() -> usize {
    1
}

fn default_max_batch_size() -> usize {
    32
}

fn default_target_batch_duration_ms() -> u64 {
    30_000
}

fn default_context_safety_buffer() -> usize {
    1_024
}

fn default_length_variance_ratio() -> f64 {
    2.0
}

/// Tunables for batch construction.
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct PlannerConfig {
    /// Smallest batch the planner will emit (floor for the computed size).
    #[serde(default = "default_min_batch_size")]
    pub min_batch_size: usize,
    /// Largest batch the planner will emit (ceiling for the computed size).
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// Target wall-clock duration for one batch, used for the time bound.
    #[serde(default = "default_target_batch_duration_ms")]
    pub target_batch_duration_ms: u64,
    /// Tokens held back from the context window for prompt framing.
    #[serde(default = "default_context_safety_buffer")]
    pub context_safety_buffer: usize,
    /// An item may join a batch while its token estimate is at most this
    /// multiple of the batch's shortest item.
    #[serde(default = "default_length_variance_ratio")]
    pub length_variance_ratio: f64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            min_batch_size: default_min_batch_size(),
            max_batch_size: default_max_batch_size(),
            target_batch_duration_ms: default_target_batch_duration_ms(),
            context_safety_buffer: default_context_safety_buffer(),
            length_variance_ratio: default_length_variance_ratio(),
        }
    }
}

// ── Batch ──────────────────────────────────────────────────────────────

/// A group of items planned for one dispatch to one model.
#[derive(Debug, Clone)]
pub struct Batch {
    /// The items in this batch, ascending by token estimate.
    pub items: Vec<WorkItem>,
    /// The model all items in the batch are routed to.
    pub model: ModelDescriptor,
    /// Sum of per-item token estimates.
    pub estimated_tokens: u64,
    /// Predicted wall-clock duration at the model's per-token latency.
    pub estimated_duration: Duration,
}

impl Batch {
    /// Number of items in the batch.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the batch holds no items.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Estimate the token count of a text: roughly one token per four
/// characters, never less than one.
pub fn estimate_tokens(text: &str) -> u64 {
    ((text.chars().count() as u64) / 4).max(1)
}

// ── Planner ────────────────────────────────────────────────────────────

/// Groups same-model items into cost-efficient batches.
#[derive(Debug, Clone)]
pub struct BatchPlanner {
    config: PlannerConfig,
}

impl BatchPlanner {
    /// Create a planner with the given tunables.
    pub fn new(config: PlannerConfig) -> Self {
        Self { config }
    }

    /// Plan `items` into batches for dispatch to `model`.
    ///
    /// Items are stably sorted by token estimate, then greedily grouped:
    /// an item joins the current batch while its estimate stays within the
    /// variance window of the batch's shortest item and the batch stays
    /// under both the time bound and the context bound. Bounds are clamped
    /// to `[min_batch_size, max_batch_size]`.
    pub fn plan(&self, items: Vec<WorkItem>, model: &ModelDescriptor) -> Vec<Batch> {
        if items.is_empty() {
            return Vec::new();
        }

        let mut sorted: Vec<(u64, WorkItem)> = items
            .into_iter()
            .map(|item| (estimate_tokens(&item.text), item))
            .collect();
        sorted.sort_by_key(|(tokens, _)| *tokens);

        if !model.batch_capable {
            return sorted
                .into_iter()
                .map(|(tokens, item)| self.finish(vec![item], tokens, model))
                .collect();
        }

        let mut batches = Vec::new();
        let mut current: Vec<WorkItem> = Vec::new();
        let mut current_tokens: u64 = 0;
        let mut anchor_tokens: u64 = 0;

        for (tokens, item) in sorted {
            if current.is_empty() {
                anchor_tokens = tokens;
                current_tokens = tokens;
                current.push(item);
                continue;
            }

            let within_variance =
                (tokens as f64) <= (anchor_tokens as f64) * self.config.length_variance_ratio;
            let candidate_len = current.len() + 1;
            let candidate_avg = (current_tokens + tokens) / candidate_len as u64;
            let fits = candidate_len <= self.size_bound(candidate_avg.max(1), model);

            if within_variance && fits {
                current_tokens += tokens;
                current.push(item);
            } else {
                batches.push(self.finish(
                    std::mem::take(&mut current),
                    current_tokens,
                    model,
                ));
                anchor_tokens = tokens;
                current_tokens = tokens;
                current.push(item);
            }
        }
        if !current.is_empty() {
            batches.push(self.finish(current, current_tokens, model));
        }

        debug!(
            batch_count = batches.len(),
            model = %model.id,
            "planned batches"
        );
        batches
    }

    /// The batch-size cap for a given average token estimate:
    /// `min(time_bound, context_bound)` clamped to the configured range.
    fn size_bound(&self, avg_tokens: u64, model: &ModelDescriptor) -> usize {
        let per_item_ms = (avg_tokens as f64 * model.latency_per_token_ms).max(1.0);
        let time_bound = (self.config.target_batch_duration_ms as f64 / per_item_ms) as usize;

        let usable_context = model
            .context_window
            .saturating_sub(self.config.context_safety_buffer);
        let context_bound = usable_context / avg_tokens.max(1) as usize;

        time_bound
            .min(context_bound)
            .clamp(self.config.min_batch_size.max(1), self.config.max_batch_size)
    }

    fn finish(&self, items: Vec<WorkItem>, tokens: u64, model: &ModelDescriptor) -> Batch {
        let duration_ms = (tokens as f64 * model.latency_per_token_ms) as u64;
        Batch {
            items,
            model: model.clone(),
            estimated_tokens: tokens,
            estimated_duration: Duration::from_millis(duration_ms),
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::catalog::tests_support::descriptor;
    use crate::WorkItem;

    fn item(id: &str, chars: usize) -> WorkItem {
        WorkItem::new(id, "x".repeat(chars), "draft")
    }

    fn model() -> crate::routing::ModelDescriptor {
        descriptor("m", 0.001, 1.0)
    }

    #[test]
    fn test_estimate_tokens_floors_at_one() {
        assert_eq!(estimate_tokens(""), 1);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens(&"x".repeat(400)), 100);
    }

    #[test]
    fn test_empty_input_plans_no_batches() {
        let planner = BatchPlanner::new(PlannerConfig::default());
        assert!(planner.plan(Vec::new(), &model()).is_empty());
    }

    #[test]
    fn test_every_item_lands_in_exactly_one_batch() {
        let planner = BatchPlanner::new(PlannerConfig::default());
        let items: Vec<WorkItem> = (0..25).map(|i| item(&format!("i{i}"), 40 * (i + 1))).collect();
        let batches = planner.plan(items, &model());
        let total: usize = batches.iter().map(Batch::len).sum();
        assert_eq!(total, 25);
    }

    #[test]
    fn test_non_batch_capable_model_forces_singletons() {
        let mut m = model();
        m.batch_capable = false;
        let planner = BatchPlanner::new(PlannerConfig::default());
        let batches = planner.plan(vec![item("a", 40), item("b", 40), item("c", 40)], &m);
        assert_eq!(batches.len(), 3);
        assert!(batches.iter().all(|b| b.len() == 1));
    }

    #[test]
    fn test_similar_lengths_group_together() {
        let planner = BatchPlanner::new(PlannerConfig::default());
        let items = vec![
            item("short1", 40),
            item("short2", 44),
            item("short3", 48),
        ];
        let batches = planner.plan(items, &model());
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 3);
    }

    #[test]
    fn test_variance_window_separates_long_outlier() {
        let planner = BatchPlanner::new(PlannerConfig {
            length_variance_ratio: 2.0,
            ..PlannerConfig::default()
        });
        // 10-token items plus a 100-token outlier (> 2x the anchor).
        let items = vec![item("a", 40), item("b", 40), item("huge", 400)];
        let batches = planner.plan(items, &model());
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 2);
        assert_eq!(batches[1].len(), 1);
        assert_eq!(batches[1].items[0].id.as_str(), "huge");
    }

    #[test]
    fn test_max_batch_size_caps_group() {
        let planner = BatchPlanner::new(PlannerConfig {
            max_batch_size: 4,
            ..PlannerConfig::default()
        });
        let items: Vec<WorkItem> = (0..10).map(|i| item(&format!("i{i}"), 40)).collect();
        let batches = planner.plan(items, &model());
        assert!(batches.iter().all(|b| b.len() <= 4));
        let total: usize = batches.iter().map(Batch::len).sum();
        assert_eq!(total, 10);
    }

    #[test]
    fn test_context_bound_limits_batch_size() {
        let mut m = model();
        // 500 usable tokens after the buffer, 100-token items: 5 per batch.
        m.context_window = 1_524;
        let planner = BatchPlanner::new(PlannerConfig {
            context_safety_buffer: 1_024,
            max_batch_size: 100,
            ..PlannerConfig::default()
        });
        let items: Vec<WorkItem> = (0..12).map(|i| item(&format!("i{i}"), 400)).collect();
        let batches = planner.plan(items, &m);
        assert!(batches.iter().all(|b| b.len() <= 5));
    }

    #[test]
    fn test_time_bound_limits_batch_size() {
        let mut m = model();
        m.latency_per_token_ms = 10.0;
        // 100-token items at 10 ms/token = 1 000 ms each; 3 000 ms target
        // allows 3 per batch.
        let planner = BatchPlanner::new(PlannerConfig {
            target_batch_duration_ms: 3_000,
            max_batch_size: 100,
            ..PlannerConfig::default()
        });
        let items: Vec<WorkItem> = (0..9).map(|i| item(&format!("i{i}"), 400)).collect();
        let batches = planner.plan(items, &m);
        assert!(batches.iter().all(|b| b.len() <= 3));
    }

    #[test]
    fn test_planning_is_deterministic() {
        let planner = BatchPlanner::new(PlannerConfig::default());
        let items: Vec<WorkItem> = (0..20)
            .map(|i| item(&format!("i{i}"), 30 + (i * 37) % 500))
            .collect();
        let a = planner.plan(items.clone(), &model());
        let b = planner.plan(items, &model());
        assert_eq!(a.len(), b.len());
        for (ba, bb) in a.iter().zip(b.iter()) {
            let ids_a: Vec<_> = ba.items.iter().map(|i| i.id.as_str()).collect();
            let ids_b: Vec<_> = bb.items.iter().map(|i| i.id.as_str()).collect();
            assert_eq!(ids_a, ids_b);
        }
    }

    #[test]
    fn test_estimated_duration_tracks_tokens_and_latency() {
        let planner = BatchPlanner::new(PlannerConfig::default());
        let batches = planner.plan(vec![item("a", 400)], &model());
        // 100 tokens at 20 ms/token.
        assert_eq!(batches[0].estimated_tokens, 100);
        assert_eq!(batches[0].estimated_duration, Duration::from_millis(2_000));
    }
}
