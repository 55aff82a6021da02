//! Response caching layer.
//!
//! ## Responsibility
//! Durable keyed store of prior model results. The key is a deterministic
//! hash of (normalized text, glossary fingerprint, model id, prompt
//! version), so changing any component automatically invalidates. Entries
//! expire lazily by TTL on read and are evicted least-recently-accessed
//! first when the byte ceiling is exceeded.
//!
//! ## Guarantees
//! - `put` then `get` with identical components returns the stored value;
//!   changing any one component is a miss.
//! - Entries older than the TTL are misses even absent size pressure.
//! - Total size never stays above the ceiling after a write: eviction runs
//!   down to a low-water target (hysteresis) ordered by last access.
//! - Concurrent reads and writes are safe; a write race on the same key
//!   resolves last-writer-wins.
//!
//! ## NOT Responsible For
//! - Deciding *what* to cache (the executor writes exactly one entry per
//!   succeeded item; failures never write)

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::analyzer::normalized_key;
use crate::events::{EngineEvent, EventBus};
use crate::routing::ModelId;

// ── Default value functions ────────────────────────────────────────────

/// Default entry time-to-live: 24 hours.
fn default_ttl_s() -> u64 {
    86_400
}

/// Default cache size ceiling: 64 MiB.
fn default_max_bytes() -> u64 {
    64 * 1024 * 1024
}

/// Default low-water target after eviction: 48 MiB.
fn default_low_water_bytes() -> u64 {
    48 * 1024 * 1024
}

// ── Configuration ──────────────────────────────────────────────────────

/// Cache tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, schemars::JsonSchema)]
pub struct CacheConfig {
    /// Entry time-to-live in seconds. Checked lazily on read.
    #[serde(default = "default_ttl_s")]
    pub ttl_s: u64,
    /// Total size ceiling in bytes. Writes that would exceed it trigger
    /// LRU eviction.
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,
    /// Eviction target in bytes; must be below `max_bytes`. The gap
    /// provides hysteresis so eviction does not run on every write.
    #[serde(default = "default_low_water_bytes")]
    pub low_water_bytes: u64,
    /// Optional prompt/style-guide version mixed into every key.
    ///
    /// Bump this when prompts change to avoid serving stale results.
    /// Defaults to the empty string.
    #[serde(default)]
    pub prompt_version: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_s: default_ttl_s(),
            max_bytes: default_max_bytes(),
            low_water_bytes: default_low_water_bytes(),
            prompt_version: String::new(),
        }
    }
}

// ── Entry ──────────────────────────────────────────────────────────────

/// One cached result plus the metadata eviction and reporting need.
struct CacheEntry {
    value: String,
    created_at: Instant,
    /// Logical access clock value; larger = more recently accessed.
    last_accessed: AtomicU64,
    size_bytes: u64,
    /// What this result cost to produce, in micro-dollars. Added to the
    /// savings counter every time a hit avoids recomputing it.
    cost_micro: u64,
}

// ── Cache ──────────────────────────────────────────────────────────────

/// Concurrent response cache with TTL and size-bounded LRU eviction.
///
/// Recency is tracked with a logical clock (one tick per access) rather
/// than wall time, so LRU ordering is exact even for accesses within the
/// same millisecond.
pub struct ResponseCache {
    config: CacheConfig,
    store: DashMap<String, CacheEntry>,
    /// Monotonic access clock.
    clock: AtomicU64,
    size_bytes: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    saved_micro: AtomicU64,
    /// Serializes eviction passes; individual reads/writes stay lock-free.
    evict_lock: Mutex<()>,
    /// Where eviction passes are announced, when attached.
    events: Option<EventBus>,
}

impl ResponseCache {
    /// Create a cache with the given configuration.
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            store: DashMap::new(),
            clock: AtomicU64::new(0),
            size_bytes: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            saved_micro: AtomicU64::new(0),
            evict_lock: Mutex::new(()),
            events: None,
        }
    }

    /// Attach an event bus; eviction passes publish
    /// [`EngineEvent::CacheEviction`] with the bytes they freed.
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Look up a prior result for (text, glossary fingerprint, model).
    ///
    /// Expired entries are removed and reported as misses. A hit refreshes
    /// the entry's recency and credits its cost to the savings counter.
    pub fn get(&self, text: &str, context_fingerprint: u64, model: &ModelId) -> Option<String> {
        let key = self.key_for(text, context_fingerprint, model);
        let ttl = Duration::from_secs(self.config.ttl_s);

        if let Some(entry) = self.store.get(&key) {
            if entry.created_at.elapsed() < ttl {
                let tick = self.clock.fetch_add(1, Ordering::Relaxed) + 1;
                entry.last_accessed.store(tick, Ordering::Relaxed);
                self.hits.fetch_add(1, Ordering::Relaxed);
                self.saved_micro.fetch_add(entry.cost_micro, Ordering::Relaxed);
                crate::metrics::inc_cache_event("hit");
                debug!(key = %key, "cache hit");
                return Some(entry.value.clone());
            }
            // Expired — drop the read guard before removing.
            drop(entry);
            if let Some((_, old)) = self.store.remove(&key) {
                self.size_bytes.fetch_sub(old.size_bytes, Ordering::Relaxed);
            }
            debug!(key = %key, "cache entry expired");
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        crate::metrics::inc_cache_event("miss");
        None
    }

    /// Store a result for (text, glossary fingerprint, model).
    ///
    /// `cost_usd` is what producing this result cost; it is credited to the
    /// savings counter on every later hit. Racing writes on the same key
    /// resolve last-writer-wins.
    pub fn put(
        &self,
        text: &str,
        context_fingerprint: u64,
        model: &ModelId,
        value: impl Into<String>,
        cost_usd: f64,
    ) {
        let key = self.key_for(text, context_fingerprint, model);
        let value = value.into();
        let size = (key.len() + value.len()) as u64;
        let tick = self.clock.fetch_add(1, Ordering::Relaxed) + 1;

        let entry = CacheEntry {
            value,
            created_at: Instant::now(),
            last_accessed: AtomicU64::new(tick),
            size_bytes: size,
            cost_micro: f64_to_micro(cost_usd),
        };

        if let Some(old) = self.store.insert(key.clone(), entry) {
            self.size_bytes.fetch_sub(old.size_bytes, Ordering::Relaxed);
        }
        self.size_bytes.fetch_add(size, Ordering::Relaxed);
        debug!(key = %key, size_bytes = size, "cached result");

        if self.size_bytes.load(Ordering::Relaxed) > self.config.max_bytes {
            self.evict_to_low_water();
        }
    }

    /// Remove the entry for (text, glossary fingerprint, model), if any.
    pub fn remove(&self, text: &str, context_fingerprint: u64, model: &ModelId) {
        let key = self.key_for(text, context_fingerprint, model);
        if let Some((_, old)) = self.store.remove(&key) {
            self.size_bytes.fetch_sub(old.size_bytes, Ordering::Relaxed);
        }
    }

    /// Drop every entry and reset the size accounting (counters survive).
    pub fn clear(&self) {
        self.store.clear();
        self.size_bytes.store(0, Ordering::Relaxed);
    }

    /// Point-in-time statistics for cost-savings reporting.
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            entries: self.store.len(),
            size_bytes: self.size_bytes.load(Ordering::Relaxed),
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            hit_rate: if lookups > 0 {
                hits as f64 / lookups as f64
            } else {
                0.0
            },
            saved_usd: micro_to_f64(self.saved_micro.load(Ordering::Relaxed)),
        }
    }

    // ── Internals ──────────────────────────────────────────────────────

    /// Deterministic key over all invalidation components.
    fn key_for(&self, text: &str, context_fingerprint: u64, model: &ModelId) -> String {
        use std::collections::hash_map::DefaultHasher;

        let mut hasher = DefaultHasher::new();
        normalized_key(text).hash(&mut hasher);
        context_fingerprint.hash(&mut hasher);
        model.as_str().hash(&mut hasher);
        self.config.prompt_version.hash(&mut hasher);
        format!("resp:{:016x}", hasher.finish())
    }

    /// Evict least-recently-accessed entries until usage falls to the
    /// low-water target. Only one eviction pass runs at a time.
    fn evict_to_low_water(&self) {
        let Ok(_guard) = self.evict_lock.lock() else {
            return; // poisoned lock: skip eviction rather than panic
        };

        // Re-check under the lock: a concurrent pass may have done the work.
        if self.size_bytes.load(Ordering::Relaxed) <= self.config.max_bytes {
            return;
        }

        let mut candidates: Vec<(String, u64, u64)> = self
            .store
            .iter()
            .map(|e| {
                (
                    e.key().clone(),
                    e.value().last_accessed.load(Ordering::Relaxed),
                    e.value().size_bytes,
                )
            })
            .collect();
        candidates.sort_by_key(|(_, accessed, _)| *accessed);

        let target = self.config.low_water_bytes.min(self.config.max_bytes);
        let mut bytes_freed = 0u64;
        for (key, _, _) in candidates {
            if self.size_bytes.load(Ordering::Relaxed) <= target {
                break;
            }
            if let Some((_, old)) = self.store.remove(&key) {
                self.size_bytes.fetch_sub(old.size_bytes, Ordering::Relaxed);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                bytes_freed += old.size_bytes;
                crate::metrics::inc_cache_event("eviction");
                debug!(key = %key, "evicted LRU entry");
            }
        }

        if bytes_freed > 0 {
            if let Some(bus) = &self.events {
                bus.publish(EngineEvent::CacheEviction { bytes_freed });
            }
        }
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl std::fmt::Debug for ResponseCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCache")
            .field("config", &self.config)
            .field("entries", &self.store.len())
            .finish()
    }
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheStats {
    /// Number of live entries.
    pub entries: usize,
    /// Current total size in bytes.
    pub size_bytes: u64,
    /// Lookups that returned a value.
    pub hits: u64,
    /// Lookups that found nothing (or only an expired entry).
    pub misses: u64,
    /// Entries removed by LRU eviction.
    pub evictions: u64,
    /// `hits / (hits + misses)`, 0.0 before any lookup.
    pub hit_rate: f64,
    /// Estimated spend avoided by serving hits instead of re-invoking.
    pub saved_usd: f64,
}

// ── Helpers ────────────────────────────────────────────────────────────

/// Convert USD to micro-dollars (1 USD = 1 000 000 micro-dollars).
///
/// Fixed-point storage avoids floating-point drift in long-running
/// aggregations.
fn f64_to_micro(usd: f64) -> u64 {
    (usd.max(0.0) * 1_000_000.0) as u64
}

/// Convert micro-dollars back to USD.
fn micro_to_f64(micro: u64) -> f64 {
    micro as f64 / 1_000_000.0
}

// ── Tests ──────────────────────────────────────────────────────────────
