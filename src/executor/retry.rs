//! Exponential backoff policy for transient service failures.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.2
}

/// Retry tunables.
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    /// Maximum attempts per batch before fallback/split/escalation.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Ceiling on any single backoff delay.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Growth factor between consecutive delays.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Random jitter fraction applied to each delay, in `[0.0, 1.0]`.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

/// Computes backoff delays from a [`RetryConfig`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    /// Create a policy from tunables.
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Maximum attempts per batch.
    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// The delay to sleep before retrying after `attempt` failures
    /// (1-based). Exponential in the attempt number, capped at
    /// `max_delay_ms`, with symmetric random jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32);
        let raw = self.config.base_delay_ms as f64 * self.config.multiplier.powi(exp as i32);
        let capped = raw.min(self.config.max_delay_ms as f64);

        let jitter = self.config.jitter.clamp(0.0, 1.0);
        let jittered = if jitter > 0.0 {
            let factor = rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter);
            capped * factor
        } else {
            capped
        };

        Duration::from_millis(jittered.max(0.0) as u64)
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
