//! Upstream model service abstraction.
//!
//! ## Responsibility
//! Define the narrow seam between the engine and the external LLM service:
//! a single `invoke` call that takes a model id, a system prompt, and an
//! ordered batch payload, and returns one result per payload item or a
//! *classified* error. Transport, authentication, and framing belong to the
//! collaborator implementing the trait.
//!
//! ## Guarantees
//! - Results correspond to payload items in submission order; the executor
//!   validates the count and treats a mismatch as a parse failure.
//! - Every error carries a [`ServiceErrorKind`] with a `retryable` flag so
//!   the executor can apply the correct recovery policy without string
//!   matching.
//!
//! ## NOT Responsible For
//! - Retry, backoff, or splitting (that belongs to `executor`)
//! - Prompt construction or text protection (external collaborators)

use crate::routing::ModelId;
use async_trait::async_trait;
use thiserror::Error;

/// Classification of an upstream service failure.
///
/// Mirrors the wire-level failure modes of LLM APIs. The executor keys its
/// recovery policy off this enum alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceErrorKind {
    /// The request exceeded its deadline.
    Timeout,
    /// The service rejected the request due to rate limiting.
    RateLimit,
    /// The service reported an internal/5xx-equivalent failure.
    Upstream,
    /// The response arrived but could not be interpreted
    /// (e.g. wrong item count for a batch).
    MalformedResponse,
    /// Authentication or authorization failed. Never retryable.
    Auth,
    /// The request never reached the service (DNS, connect, TLS).
    Network,
}

impl ServiceErrorKind {
    /// Whether failures of this kind are worth retrying with backoff.
    ///
    /// Malformed responses are handled separately (one retry, then
    /// batch-split) and report `false` here.
    pub fn retryable(self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::RateLimit | Self::Upstream | Self::Network
        )
    }

    /// Short stable name used in logs and metrics labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::RateLimit => "rate_limit",
            Self::Upstream => "upstream_error",
            Self::MalformedResponse => "malformed_response",
            Self::Auth => "auth_error",
            Self::Network => "network_error",
        }
    }
}

/// A classified failure returned by a [`ModelService`] implementation.
#[derive(Debug, Clone, Error)]
#[error("{} ({})", message, kind.as_str())]
pub struct ServiceError {
    /// Failure classification driving the executor's recovery policy.
    pub kind: ServiceErrorKind,
    /// Human-readable detail for logs. Never contains item text.
    pub message: String,
}

impl ServiceError {
    /// Create a new classified error.
    pub fn new(kind: ServiceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Whether the executor should retry this failure with backoff.
    pub fn retryable(&self) -> bool {
        self.kind.retryable()
    }
}

/// Trait for upstream language-model services.
///
/// Implementations must be thread-safe (Send + Sync) for use across tasks.
/// The trait is object-safe to allow dynamic dispatch via
/// `Arc<dyn ModelService>`.
#[async_trait]
pub trait ModelService: Send + Sync {
    /// Process an ordered batch of payload texts with the given model.
    ///
    /// Returns exactly one result string per payload item, in submission
    /// order. A count mismatch is treated by the executor as a
    /// [`ServiceErrorKind::MalformedResponse`]-class failure.
    async fn invoke(
        &self,
        model: &ModelId,
        system_prompt: &str,
        payload: &[String],
    ) -> Result<Vec<String>, ServiceError>;
}

// ============================================================================
// Echo Service (Testing)
// ============================================================================

/// Dummy echo service for tests and demos.
///
/// Returns each payload item prefixed with the model id, after a simulated
/// latency. Useful for engine smoke tests without real API dependencies.
pub struct EchoService {
    /// Simulated per-call latency in milliseconds.
    pub delay_ms: u64,
}

impl EchoService {
    /// Create an echo service with the default 10ms simulated latency.
    pub fn new() -> Self {
        Self { delay_ms: 10 }
    }

    /// Create an echo service with a custom simulated latency.
    pub fn with_delay(delay_ms: u64) -> Self {
        Self { delay_ms }
    }
}

impl Default for EchoService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModelService for EchoService {
    async fn invoke(
        &self,
        model: &ModelId,
        _system_prompt: &str,
        payload: &[String],
    ) -> Result<Vec<String>, ServiceError> {
        tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
        Ok(payload
            .iter()
            .map(|text| format!("[{}] {text}", model.as_str()))
            .collect())
    }
}
