//! Streaming multi-stage processing.
//!
//! ## Responsibility
//! Wire named stages into a lazy, single-pass pipeline where stage N+1
//! starts consuming before stage N finishes producing, bounded by an
//! inter-stage buffer.
//!
//! ## Guarantees
//! - The source is pulled lazily and exactly once; the stream is not
//!   restartable.
//! - Each result carries its original source index; there is no ordering
//!   guarantee across the stream, callers re-sort by index if they need
//!   submission order.
//! - A stage error is forwarded as an `Err` element, never silently
//!   dropped, and does not stop sibling items.
//! - Dropping the output stream winds down only that call's workers;
//!   concurrent streams over the same pipeline are unaffected.
//!
//! ## NOT Responsible For
//! - Retry or escalation (stages fail items individually; recovery lives
//!   in the executor).

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use crate::EngineError;

/// One transformation step in a pipeline.
#[async_trait]
pub trait PipelineStage<T>: Send + Sync {
    /// Transform one item. An error fails only this item.
    async fn process(&self, item: T) -> Result<T, EngineError>;
}

/// An item's failure inside a named stage.
#[derive(Debug)]
pub struct StageFailure {
    /// The stage that failed the item.
    pub stage: String,
    /// The underlying error.
    pub error: EngineError,
}

/// A pipeline result tagged with the item's source position.
#[derive(Debug)]
pub struct Indexed<T> {
    /// Zero-based position of the item in the source sequence.
    pub index: usize,
    /// The item after all stages, or the first stage failure it hit.
    pub result: Result<T, StageFailure>,
}

struct StageSpec<T> {
    name: String,
    stage: Arc<dyn PipelineStage<T>>,
    concurrency: usize,
}

/// A reusable chain of concurrent stages.
pub struct StreamingPipeline<T> {
    stages: Vec<StageSpec<T>>,
    buffer: usize,
}

impl<T: Send + 'static> StreamingPipeline<T> {
    /// Create a pipeline whose inter-stage channels hold up to `buffer`
    /// items before upstream workers block.
    pub fn new(buffer: usize) -> Self {
        Self {
            stages: Vec::new(),
            buffer: buffer.max(1),
        }
    }

    /// Append a stage running `concurrency` workers.
    pub fn add_stage(
        mut self,
        name: impl Into<String>,
        stage: Arc<dyn PipelineStage<T>>,
        concurrency: usize,
    ) -> Self {
        self.stages.push(StageSpec {
            name: name.into(),
            stage,
            concurrency: concurrency.max(1),
        });
        self
    }

    /// Number of configured stages.
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Run `source` through every stage, returning a lazy stream of
    /// indexed results. Items may complete out of submission order.
    pub fn process_stream<I>(&self, source: I) -> ReceiverStream<Indexed<T>>
    where
        I: IntoIterator<Item = T> + Send + 'static,
        I::IntoIter: Send,
    {
        let (feed_tx, mut upstream) = mpsc::channel::<Indexed<T>>(self.buffer);

        // Lazy feeder: pulls the source only as buffer space frees up, and
        // stops pulling once the consumer is gone.
        tokio::spawn(async move {
            for (index, item) in source.into_iter().enumerate() {
                let sent = feed_tx
                    .send(Indexed {
                        index,
                        result: Ok(item),
                    })
                    .await;
                if sent.is_err() {
                    break;
                }
            }
        });

        for spec in &self.stages {
            let (tx, rx) = mpsc::channel::<Indexed<T>>(self.buffer);
            let shared_rx = Arc::new(Mutex::new(upstream));

            for worker in 0..spec.concurrency {
                let rx = Arc::clone(&shared_rx);
                let tx = tx.clone();
                let stage = Arc::clone(&spec.stage);
                let name = spec.name.clone();
                tokio::spawn(async move {
                    loop {
                        // Hold the receiver lock only while pulling, so
                        // siblings process concurrently.
                        let next = { rx.lock().await.recv().await };
                        let Some(incoming) = next else { break };

                        let outgoing = match incoming.result {
                            Ok(item) => {
                                let result = match stage.process(item).await {
                                    Ok(out) => Ok(out),
                                    Err(error) => Err(StageFailure {
                                        stage: name.clone(),
                                        error,
                                    }),
                                };
                                Indexed {
                                    index: incoming.index,
                                    result,
                                }
                            }
                            // Already failed upstream: pass through.
                            Err(_) => incoming,
                        };

                        if tx.send(outgoing).await.is_err() {
                            break;
                        }
                    }
                    debug!(stage = %name, worker, "pipeline worker finished");
                });
            }
            upstream = rx;
        }

        ReceiverStream::new(upstream)
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
