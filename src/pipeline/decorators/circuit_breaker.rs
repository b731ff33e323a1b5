//! Per-operation circuit breaker.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::message::{ProcessingContext, ProcessingError, ProcessingResult};
use crate::pipeline::{MessageDecorator, Next};

/// Breaker configuration.
#[derive(Debug, Clone)]
pub struct CircuitBreakerOptions {
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,
    /// How long an open breaker rejects before the half-open trial.
    pub break_duration: Duration,
}

impl Default for CircuitBreakerOptions {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            break_duration: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Default)]
struct BreakerEntry {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    half_open: bool,
}

/// Opens per message type after sustained failures; while open, rejects
/// immediately with a retry-after hint equal to the remaining break
/// duration, then admits one half-open trial.
pub struct CircuitBreakerDecorator {
    options: CircuitBreakerOptions,
    entries: Mutex<HashMap<String, BreakerEntry>>,
}

impl CircuitBreakerDecorator {
    pub fn new(options: CircuitBreakerOptions) -> Self {
        Self {
            options,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Remaining break duration if the breaker rejects this call.
    fn rejects(&self, operation: &str) -> Option<Duration> {
        let mut entries = self.entries.lock().expect("breaker lock poisoned");
        let entry = entries.entry(operation.to_string()).or_default();
        let opened_at = entry.opened_at?;

        let elapsed = opened_at.elapsed();
        if elapsed >= self.options.break_duration {
            if entry.half_open {
                // A trial is already in flight.
                return Some(Duration::from_millis(1));
            }
            entry.half_open = true;
            return None;
        }
        Some(self.options.break_duration - elapsed)
    }

    fn on_success(&self, operation: &str) {
        let mut entries = self.entries.lock().expect("breaker lock poisoned");
        if let Some(entry) = entries.get_mut(operation) {
            if entry.opened_at.is_some() {
                debug!(operation = %operation, "Circuit closed after trial success");
            }
            *entry = BreakerEntry::default();
        }
    }

    fn on_failure(&self, operation: &str) {
        let mut entries = self.entries.lock().expect("breaker lock poisoned");
        let entry = entries.entry(operation.to_string()).or_default();

        if entry.half_open {
            entry.opened_at = Some(Instant::now());
            entry.half_open = false;
            warn!(operation = %operation, "Circuit reopened after trial failure");
            return;
        }

        entry.consecutive_failures += 1;
        if entry.opened_at.is_none()
            && entry.consecutive_failures >= self.options.failure_threshold
        {
            entry.opened_at = Some(Instant::now());
            warn!(
                operation = %operation,
                failures = entry.consecutive_failures,
                "Circuit opened"
            );
        }
    }
}

#[async_trait]
impl MessageDecorator for CircuitBreakerDecorator {
    fn name(&self) -> &'static str {
        "circuit_breaker"
    }

    async fn process(&self, ctx: &mut ProcessingContext, next: Next<'_>) -> ProcessingResult {
        let operation = ctx.message().message_type().to_string();

        if let Some(retry_after) = self.rejects(&operation) {
            return Err(ProcessingError::CircuitOpen {
                operation,
                retry_after,
            });
        }

        match next.run(ctx).await {
            Ok(value) => {
                self.on_success(&operation);
                Ok(value)
            }
            Err(ProcessingError::Cancelled) => {
                // Cancellation says nothing about operation health.
                Err(ProcessingError::Cancelled)
            }
            Err(error) => {
                self.on_failure(&operation);
                Err(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::pipeline::tests::{command_context, flaky_terminal};
    use crate::pipeline::PipelineBuilder;

    #[tokio::test(start_paused = true)]
    async fn test_breaker_sequence_open_trial_close() {
        let calls = Arc::new(AtomicU32::new(0));
        let pipeline = PipelineBuilder::new(flaky_terminal(calls.clone(), 5, true))
            .with_decorator(Arc::new(CircuitBreakerDecorator::new(
                CircuitBreakerOptions {
                    failure_threshold: 5,
                    break_duration: Duration::from_secs(30),
                },
            )))
            .build();

        for _ in 0..5 {
            let mut ctx = command_context();
            assert!(pipeline.execute(&mut ctx).await.is_err());
        }

        // Open: rejected immediately with a non-zero retry-after, and
        // the inner chain is not invoked.
        let mut ctx = command_context();
        let error = pipeline.execute(&mut ctx).await.unwrap_err();
        match error {
            ProcessingError::CircuitOpen { retry_after, .. } => {
                assert!(retry_after > Duration::ZERO)
            }
            other => panic!("expected CircuitOpen, got {}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 5);

        // After the break elapses the trial is admitted and succeeds
        // (the terminal recovered after 5 failures), closing the circuit.
        tokio::time::advance(Duration::from_secs(31)).await;
        let mut ctx = command_context();
        assert!(pipeline.execute(&mut ctx).await.is_ok());

        let mut ctx = command_context();
        assert!(pipeline.execute(&mut ctx).await.is_ok());
    }
}
