//! Transient-failure retry around the inner chain.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::message::{ProcessingContext, ProcessingError, ProcessingResult};
use crate::pipeline::{MessageDecorator, Next};
use crate::resilience::backoff_delay;

/// Retry configuration.
#[derive(Debug, Clone)]
pub struct RetryOptions {
    /// Total attempts including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: f64,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            jitter: 0.25,
        }
    }
}

/// Re-invokes the inner chain on transient failures with capped
/// exponential backoff. Non-transient failures surface immediately;
/// cancellation is never retried.
pub struct RetryDecorator {
    options: RetryOptions,
}

impl RetryDecorator {
    pub fn new(options: RetryOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl MessageDecorator for RetryDecorator {
    fn name(&self) -> &'static str {
        "retry"
    }

    async fn process(&self, ctx: &mut ProcessingContext, next: Next<'_>) -> ProcessingResult {
        loop {
            let outcome = next.run(ctx).await;
            let error = match outcome {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if !error.is_transient() || ctx.attempt >= self.options.max_attempts {
                return Err(error);
            }

            let delay = backoff_delay(
                self.options.base_delay,
                self.options.max_delay,
                self.options.jitter,
                ctx.attempt,
            );
            debug!(
                message_type = %ctx.message().message_type(),
                attempt = ctx.attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Transient failure, retrying"
            );
            tokio::select! {
                _ = ctx.cancellation().cancelled() => return Err(ProcessingError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            ctx.attempt += 1;
        }
    }
}
