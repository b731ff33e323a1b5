//! Idempotent processing via fingerprint caching.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::interfaces::{CachedFailure, IdempotencyStatus, IdempotencyStore};
use crate::message::{Message, ProcessingContext, ProcessingError, ProcessingResult};
use crate::pipeline::{MessageDecorator, Next};

/// How the fingerprint key is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FingerprintStrategy {
    /// Message id alone.
    #[default]
    MessageId,
    /// SHA-256 over the canonical payload.
    ContentHash,
    /// Message type, id, and content hash combined.
    Composite,
}

/// Which failures are worth caching.
///
/// Only deterministic domain failures are ever eligible; transient and
/// cancelled outcomes are never cached regardless of policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailureCachePolicy {
    /// Cache no failures.
    #[default]
    None,
    /// Cache deterministic domain failures (validation, not-found,
    /// unauthorized, business-rule).
    Deterministic,
}

/// Idempotency configuration.
#[derive(Debug, Clone)]
pub struct IdempotencyOptions {
    pub strategy: FingerprintStrategy,
    pub failure_policy: FailureCachePolicy,
    /// TTL for cached successful responses.
    pub success_ttl: Duration,
    /// TTL for cached deterministic failures.
    pub failure_ttl: Duration,
    /// TTL for the processing lock itself.
    pub processing_ttl: Duration,
    /// Bound on waiting for another worker's in-flight result.
    pub max_wait: Duration,
    /// Poll interval while waiting.
    pub poll_interval: Duration,
}

impl Default for IdempotencyOptions {
    fn default() -> Self {
        Self {
            strategy: FingerprintStrategy::default(),
            failure_policy: FailureCachePolicy::default(),
            success_ttl: Duration::from_secs(3600),
            failure_ttl: Duration::from_secs(300),
            processing_ttl: Duration::from_secs(60),
            max_wait: Duration::from_secs(5),
            poll_interval: Duration::from_millis(50),
        }
    }
}

/// Replays cached results for logically-equivalent invocations and
/// guarantees at-most-one concurrent build per fingerprint.
pub struct IdempotencyDecorator {
    store: Arc<dyn IdempotencyStore>,
    options: IdempotencyOptions,
}

impl IdempotencyDecorator {
    pub fn new(store: Arc<dyn IdempotencyStore>, options: IdempotencyOptions) -> Self {
        Self { store, options }
    }

    /// Fingerprint for a message under the configured strategy.
    fn fingerprint(&self, message: &dyn Message) -> String {
        match self.options.strategy {
            FingerprintStrategy::MessageId => {
                format!("{}:{}", message.message_type(), message.message_id())
            }
            FingerprintStrategy::ContentHash => match Self::content_hash(message) {
                Some(hash) => format!("{}:{}", message.message_type(), hash),
                None => {
                    warn!(
                        message_type = %message.message_type(),
                        "No canonical payload; falling back to message id"
                    );
                    format!("{}:{}", message.message_type(), message.message_id())
                }
            },
            FingerprintStrategy::Composite => {
                let content = Self::content_hash(message).unwrap_or_default();
                format!(
                    "{}:{}:{}",
                    message.message_type(),
                    message.message_id(),
                    content
                )
            }
        }
    }

    /// SHA-256 over the canonical JSON payload. `serde_json` maps sort
    /// keys, so equal payloads hash equally.
    fn content_hash(message: &dyn Message) -> Option<String> {
        let value = message.canonical_payload()?;
        let canonical = serde_json::to_string(&value).ok()?;
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        Some(hex::encode(hasher.finalize()))
    }

    fn should_cache_failure(&self, error: &ProcessingError) -> bool {
        match self.options.failure_policy {
            FailureCachePolicy::None => false,
            FailureCachePolicy::Deterministic => error.is_deterministic(),
        }
    }
}

#[async_trait]
impl MessageDecorator for IdempotencyDecorator {
    fn name(&self) -> &'static str {
        "idempotency"
    }

    async fn process(&self, ctx: &mut ProcessingContext, next: Next<'_>) -> ProcessingResult {
        let key = self.fingerprint(ctx.message().as_ref());
        let wait_started = Instant::now();

        loop {
            match self.store.get(&key).await {
                Ok(Some(record)) => match record.status {
                    IdempotencyStatus::Success => {
                        debug!(key = %key, "Replaying cached response");
                        return Ok(record.payload);
                    }
                    IdempotencyStatus::Failure => {
                        debug!(key = %key, "Replaying cached failure");
                        let failure = record.failure.unwrap_or_else(|| CachedFailure {
                            kind: "fatal".to_string(),
                            message: "cached failure record was empty".to_string(),
                            retry_after: None,
                        });
                        return Err(failure.to_error());
                    }
                    IdempotencyStatus::Processing => {
                        // Another worker is building the result; wait for
                        // it within the configured bound.
                        if wait_started.elapsed() >= self.options.max_wait {
                            return Err(ProcessingError::transient(format!(
                                "timed out waiting for in-flight result of '{}'",
                                key
                            )));
                        }
                        tokio::select! {
                            _ = ctx.cancellation().cancelled() => {
                                return Err(ProcessingError::Cancelled)
                            }
                            _ = tokio::time::sleep(self.options.poll_interval) => continue,
                        }
                    }
                },
                Ok(None) => {
                    match self.store.try_begin(&key, self.options.processing_ttl).await {
                        Ok(true) => break,
                        // Lost the race; re-observe the entry.
                        Ok(false) => continue,
                        Err(e) => {
                            return Err(ProcessingError::transient_with_source(
                                "idempotency store unavailable",
                                Box::new(e),
                            ))
                        }
                    }
                }
                Err(e) => {
                    return Err(ProcessingError::transient_with_source(
                        "idempotency store unavailable",
                        Box::new(e),
                    ))
                }
            }
        }

        // We hold the processing lock; run the inner chain and settle.
        let outcome = next.run(ctx).await;
        match &outcome {
            Ok(payload) => {
                if let Err(e) = self
                    .store
                    .store_success(&key, payload.clone(), self.options.success_ttl)
                    .await
                {
                    warn!(key = %key, error = %e, "Failed to cache success");
                }
            }
            Err(error) if self.should_cache_failure(error) => {
                if let Err(e) = self
                    .store
                    .store_failure(&key, CachedFailure::from_error(error), self.options.failure_ttl)
                    .await
                {
                    warn!(key = %key, error = %e, "Failed to cache failure");
                }
            }
            Err(_) => {
                // Transient, cancelled, or uncached by policy: release
                // the lock so a later invocation can rebuild.
                if let Err(e) = self.store.remove(&key).await {
                    warn!(key = %key, error = %e, "Failed to release processing lock");
                }
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use chrono::Utc;
    use uuid::Uuid;

    use super::*;
    use crate::pipeline::tests::{context_for, counting_terminal, failing_terminal};
    use crate::pipeline::PipelineBuilder;
    use crate::storage::InMemoryIdempotencyStore;
    use crate::message::MessageKind;

    #[derive(Debug, Clone)]
    struct Charge {
        id: Uuid,
        amount: u64,
    }

    impl Message for Charge {
        fn message_id(&self) -> Uuid {
            self.id
        }
        fn timestamp(&self) -> chrono::DateTime<Utc> {
            Utc::now()
        }
        fn message_type(&self) -> &'static str {
            "Charge"
        }
        fn canonical_payload(&self) -> Option<serde_json::Value> {
            Some(serde_json::json!({ "amount": self.amount }))
        }
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    impl crate::message::Command for Charge {}

    fn decorator(
        store: Arc<InMemoryIdempotencyStore>,
        strategy: FingerprintStrategy,
        failure_policy: FailureCachePolicy,
    ) -> Arc<IdempotencyDecorator> {
        Arc::new(IdempotencyDecorator::new(
            store,
            IdempotencyOptions {
                strategy,
                failure_policy,
                poll_interval: Duration::from_millis(5),
                max_wait: Duration::from_millis(200),
                ..Default::default()
            },
        ))
    }

    #[tokio::test]
    async fn test_replay_returns_cached_result_without_reinvoking() {
        let store = Arc::new(InMemoryIdempotencyStore::new());
        let calls = Arc::new(AtomicU32::new(0));
        let pipeline = PipelineBuilder::new(counting_terminal(calls.clone()))
            .with_decorator(decorator(
                store,
                FingerprintStrategy::MessageId,
                FailureCachePolicy::None,
            ))
            .build();

        let charge = Charge {
            id: Uuid::new_v4(),
            amount: 100,
        };
        let mut ctx = context_for(Arc::new(charge.clone()), MessageKind::Command);
        pipeline.execute(&mut ctx).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Same message id: cached response, handler not re-invoked.
        let mut ctx = context_for(Arc::new(charge), MessageKind::Command);
        pipeline.execute(&mut ctx).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_content_hash_matches_equal_payloads() {
        let store = Arc::new(InMemoryIdempotencyStore::new());
        let calls = Arc::new(AtomicU32::new(0));
        let pipeline = PipelineBuilder::new(counting_terminal(calls.clone()))
            .with_decorator(decorator(
                store,
                FingerprintStrategy::ContentHash,
                FailureCachePolicy::None,
            ))
            .build();

        // Different ids, identical payloads: one build.
        let first = Charge {
            id: Uuid::new_v4(),
            amount: 500,
        };
        let second = Charge {
            id: Uuid::new_v4(),
            amount: 500,
        };
        let mut ctx = context_for(Arc::new(first), MessageKind::Command);
        pipeline.execute(&mut ctx).await.unwrap();
        let mut ctx = context_for(Arc::new(second), MessageKind::Command);
        pipeline.execute(&mut ctx).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // A different payload is a different fingerprint.
        let third = Charge {
            id: Uuid::new_v4(),
            amount: 750,
        };
        let mut ctx = context_for(Arc::new(third), MessageKind::Command);
        pipeline.execute(&mut ctx).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_deterministic_failure_cached_by_policy() {
        let store = Arc::new(InMemoryIdempotencyStore::new());
        let calls = Arc::new(AtomicU32::new(0));
        let pipeline = PipelineBuilder::new(failing_terminal(calls.clone(), || {
            ProcessingError::BusinessRule("insufficient funds".into())
        }))
        .with_decorator(decorator(
            store,
            FingerprintStrategy::MessageId,
            FailureCachePolicy::Deterministic,
        ))
        .build();

        let charge = Charge {
            id: Uuid::new_v4(),
            amount: 100,
        };
        let mut ctx = context_for(Arc::new(charge.clone()), MessageKind::Command);
        assert!(pipeline.execute(&mut ctx).await.is_err());

        let mut ctx = context_for(Arc::new(charge), MessageKind::Command);
        let error = pipeline.execute(&mut ctx).await.unwrap_err();
        assert!(matches!(error, ProcessingError::BusinessRule(_)));
        // Second failure came from the cache.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_never_cached() {
        let store = Arc::new(InMemoryIdempotencyStore::new());
        let calls = Arc::new(AtomicU32::new(0));
        let pipeline = PipelineBuilder::new(failing_terminal(calls.clone(), || {
            ProcessingError::transient("timeout expired")
        }))
        .with_decorator(decorator(
            store,
            FingerprintStrategy::MessageId,
            FailureCachePolicy::Deterministic,
        ))
        .build();

        let charge = Charge {
            id: Uuid::new_v4(),
            amount: 100,
        };
        let mut ctx = context_for(Arc::new(charge.clone()), MessageKind::Command);
        assert!(pipeline.execute(&mut ctx).await.is_err());
        let mut ctx = context_for(Arc::new(charge), MessageKind::Command);
        assert!(pipeline.execute(&mut ctx).await.is_err());
        // Both invocations reached the terminal.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
