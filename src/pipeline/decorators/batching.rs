//! Size/time-window batching.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::message::{
    Message, MessageKind, ProcessingContext, ProcessingError, ProcessingResult,
};
use crate::pipeline::{MessageDecorator, Next, Pipeline};

/// Batching configuration.
#[derive(Debug, Clone)]
pub struct BatchingOptions {
    /// Flush when the accumulator reaches this size.
    pub max_batch_size: usize,
    /// Flush when this much time has passed since the first accumulated
    /// message.
    pub batch_timeout: Duration,
    /// Retry failed messages individually after a batch flush.
    pub fallback_to_single: bool,
}

impl Default for BatchingOptions {
    fn default() -> Self {
        Self {
            max_batch_size: 10,
            batch_timeout: Duration::from_millis(100),
            fallback_to_single: true,
        }
    }
}

struct PendingItem {
    message: Arc<dyn Message>,
    kind: MessageKind,
    cancellation: CancellationToken,
    responder: oneshot::Sender<ProcessingResult>,
}

#[derive(Default)]
struct Accumulator {
    items: Vec<PendingItem>,
    /// Bumped on every flush so a pending timer can tell whether its
    /// batch already flushed by size.
    epoch: u64,
}

/// Accumulates messages and dispatches each flushed batch through the
/// chain suffix after this decorator, so every message retains its own
/// retry/breaker guarantees downstream.
pub struct BatchingDecorator {
    options: BatchingOptions,
    inner: Arc<Pipeline>,
    accumulator: Arc<Mutex<Accumulator>>,
}

impl BatchingDecorator {
    pub(crate) fn new(options: BatchingOptions, inner: Arc<Pipeline>) -> Self {
        Self {
            options,
            inner,
            accumulator: Arc::new(Mutex::new(Accumulator::default())),
        }
    }

    fn take_batch(accumulator: &Mutex<Accumulator>) -> Vec<PendingItem> {
        let mut guard = accumulator.lock().expect("batch lock poisoned");
        guard.epoch += 1;
        std::mem::take(&mut guard.items)
    }

    async fn flush(options: &BatchingOptions, inner: &Arc<Pipeline>, batch: Vec<PendingItem>) {
        if batch.is_empty() {
            return;
        }
        debug!(batch_size = batch.len(), "Flushing batch");

        // Dispatch each message through the inner chain concurrently.
        let runs = batch.into_iter().map(|item| async move {
            let mut ctx = ProcessingContext::with_cancellation(
                Arc::clone(&item.message),
                item.kind,
                item.cancellation.clone(),
            );
            let mut result = inner.execute(&mut ctx).await;

            if result.is_err() && options.fallback_to_single {
                // Individual retry with a fresh context.
                warn!(
                    message_type = %item.message.message_type(),
                    "Batch dispatch failed; retrying singly"
                );
                let mut retry_ctx = ProcessingContext::with_cancellation(
                    Arc::clone(&item.message),
                    item.kind,
                    item.cancellation,
                );
                result = inner.execute(&mut retry_ctx).await;
            }

            // The producer may have given up waiting; that is fine.
            let _ = item.responder.send(result);
        });
        join_all(runs).await;
    }
}

#[async_trait]
impl MessageDecorator for BatchingDecorator {
    fn name(&self) -> &'static str {
        "batching"
    }

    async fn process(&self, ctx: &mut ProcessingContext, _next: Next<'_>) -> ProcessingResult {
        let (responder, receiver) = oneshot::channel();

        let flush_now = {
            let mut accumulator = self.accumulator.lock().expect("batch lock poisoned");
            accumulator.items.push(PendingItem {
                message: Arc::clone(ctx.message()),
                kind: ctx.kind(),
                cancellation: ctx.cancellation().clone(),
                responder,
            });

            if accumulator.items.len() >= self.options.max_batch_size {
                true
            } else {
                if accumulator.items.len() == 1 {
                    // First message of a window: arm the timeout flush.
                    let armed_epoch = accumulator.epoch;
                    let accumulator = Arc::clone(&self.accumulator);
                    let inner = Arc::clone(&self.inner);
                    let options = self.options.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(options.batch_timeout).await;
                        let batch = {
                            let guard = accumulator.lock().expect("batch lock poisoned");
                            if guard.epoch != armed_epoch {
                                // Already flushed by size.
                                return;
                            }
                            drop(guard);
                            Self::take_batch(&accumulator)
                        };
                        Self::flush(&options, &inner, batch).await;
                    });
                }
                false
            }
        };

        if flush_now {
            let batch = Self::take_batch(&self.accumulator);
            Self::flush(&self.options, &self.inner, batch).await;
        }

        match receiver.await {
            Ok(result) => result,
            Err(_) => Err(ProcessingError::fatal(
                "batch flusher dropped without settling the message",
            )),
        }
    }
}
