//! # Model routing intelligence.
//!
//! ## Responsibility
//! Map a complexity score and target step to the cheapest model that can
//! handle the work. Easy items go to economy models; items beyond every
//! model's ceiling go to the highest-ceiling model with a fallback flag.
//! Every decision lands in an append-only ledger for cost reporting against
//! a fixed baseline model.
//!
//! ## Guarantees
//! - Deterministic: identical (score, step, catalog) always yields the same
//!   model — ties break on model id.
//! - Thread-safe: the ledger uses interior locking; selection itself is a
//!   pure read over the catalog.
//! - Auditable: overrides bypass selection but still record the score.
//!
//! ## NOT Responsible For
//! - Computing complexity scores (that belongs to `analyzer`)
//! - Invoking models or handling their failures (that belongs to `executor`;
//!   the router only *resolves* static fallback pointers)

pub mod catalog;
pub mod ledger;
pub mod router;

// Re-exports for convenience
pub use catalog::{ModelCatalog, ModelDescriptor, ModelId, QualityTier};
pub use ledger::{CostReport, LedgerEntry, RoutingLedger};
pub use router::{ModelRouter, RouteDecision};
