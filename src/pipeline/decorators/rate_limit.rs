//! Token-bucket rate limiting.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::debug;

use crate::message::{Message, ProcessingContext, ProcessingError, ProcessingResult};
use crate::pipeline::{MessageDecorator, Next};

/// Behavior when the bucket has too few tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RateLimitMode {
    /// Fail with a retry-after hint equal to the refill delay.
    #[default]
    Reject,
    /// Wait for tokens, up to `max_queue_wait`.
    Queue,
}

/// Selector producing the bucket key for a message; one bucket exists
/// per distinct key.
pub type RateLimitKeySelector = Arc<dyn Fn(&dyn Message) -> String + Send + Sync>;

/// Token bucket configuration.
#[derive(Clone)]
pub struct RateLimitOptions {
    /// Bucket capacity in tokens.
    pub capacity: f64,
    /// Tokens replenished per second.
    pub refill_per_second: f64,
    /// Tokens one message consumes.
    pub permits_per_message: f64,
    pub mode: RateLimitMode,
    /// Queue-mode wait bound.
    pub max_queue_wait: Duration,
    /// Optional per-key scoping.
    pub key_selector: Option<RateLimitKeySelector>,
}

impl Default for RateLimitOptions {
    fn default() -> Self {
        Self {
            capacity: 100.0,
            refill_per_second: 10.0,
            permits_per_message: 1.0,
            mode: RateLimitMode::default(),
            max_queue_wait: Duration::from_secs(5),
            key_selector: None,
        }
    }
}

impl std::fmt::Debug for RateLimitOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitOptions")
            .field("capacity", &self.capacity)
            .field("refill_per_second", &self.refill_per_second)
            .field("permits_per_message", &self.permits_per_message)
            .field("mode", &self.mode)
            .field("max_queue_wait", &self.max_queue_wait)
            .field("scoped", &self.key_selector.is_some())
            .finish()
    }
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

enum Acquire {
    Granted,
    /// Delay until enough tokens accumulate.
    Insufficient(Duration),
}

/// Token-bucket limiter: refills lazily on each acquire, rejects or
/// queues on insufficient tokens.
pub struct RateLimitDecorator {
    options: RateLimitOptions,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimitDecorator {
    pub fn new(options: RateLimitOptions) -> Self {
        Self {
            options,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    fn bucket_key(&self, message: &dyn Message) -> String {
        match &self.options.key_selector {
            Some(selector) => selector(message),
            None => String::new(),
        }
    }

    fn try_acquire(&self, key: &str) -> Acquire {
        let mut buckets = self.buckets.lock().expect("bucket lock poisoned");
        let now = Instant::now();
        let bucket = buckets.entry(key.to_string()).or_insert_with(|| Bucket {
            tokens: self.options.capacity,
            last_refill: now,
        });

        // Lazy refill since the last acquire.
        let elapsed = now.saturating_duration_since(bucket.last_refill);
        bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * self.options.refill_per_second)
            .min(self.options.capacity);
        bucket.last_refill = now;

        let permits = self.options.permits_per_message;
        if bucket.tokens >= permits {
            bucket.tokens -= permits;
            return Acquire::Granted;
        }

        let missing = permits - bucket.tokens;
        let delay = Duration::from_secs_f64(missing / self.options.refill_per_second.max(f64::MIN_POSITIVE));
        Acquire::Insufficient(delay)
    }
}

#[async_trait]
impl MessageDecorator for RateLimitDecorator {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    async fn process(&self, ctx: &mut ProcessingContext, next: Next<'_>) -> ProcessingResult {
        let key = self.bucket_key(ctx.message().as_ref());
        let queue_deadline = Instant::now() + self.options.max_queue_wait;

        loop {
            match self.try_acquire(&key) {
                Acquire::Granted => break,
                Acquire::Insufficient(delay) => match self.options.mode {
                    RateLimitMode::Reject => {
                        debug!(
                            message_type = %ctx.message().message_type(),
                            retry_after_ms = delay.as_millis() as u64,
                            "Rate limited"
                        );
                        return Err(ProcessingError::RateLimited { retry_after: delay });
                    }
                    RateLimitMode::Queue => {
                        if Instant::now() + delay > queue_deadline {
                            return Err(ProcessingError::RateLimited { retry_after: delay });
                        }
                        tokio::select! {
                            _ = ctx.cancellation().cancelled() => {
                                return Err(ProcessingError::Cancelled)
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                },
            }
        }

        next.run(ctx).await
    }
}
