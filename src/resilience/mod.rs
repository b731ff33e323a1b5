//! Connection resilience: retry with backoff, circuit breaking, and
//! transient-failure classification.
//!
//! `ResiliencePolicy` wraps an async operation in the full protocol:
//! breaker pre-check, invocation, health recording, classification,
//! exponential backoff with jitter, and breaker state transitions.

mod classify;
mod health;

pub use classify::{is_transient_error, StorageFailure, TRANSIENT_DB_ERROR_CODES};
pub use health::{HealthMonitor, HealthReport};

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::time::Instant as TokioInstant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Result type for resilient executions.
pub type Result<T> = std::result::Result<T, ResilienceError>;

/// Boxed error produced by wrapped operations.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors surfaced by [`ResiliencePolicy::execute`].
#[derive(Debug, thiserror::Error)]
pub enum ResilienceError {
    #[error("Circuit open for '{operation}', retry after {retry_after:?}")]
    CircuitOpen {
        operation: String,
        retry_after: Duration,
    },

    #[error("Operation '{operation}' failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: BoxError,
    },

    #[error("Operation '{operation}' failed: {source}")]
    Operation {
        operation: String,
        #[source]
        source: BoxError,
    },

    #[error("Operation cancelled")]
    Cancelled,
}

impl ResilienceError {
    /// Remaining break duration, when the breaker rejected the call.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::CircuitOpen { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}

/// Configuration for retry and breaker behavior.
#[derive(Debug, Clone)]
pub struct ResilienceOptions {
    /// Maximum retry attempts after the initial one.
    pub max_retries: u32,
    /// Base delay for the first retry (before jitter).
    pub base_delay: Duration,
    /// Delay cap (before jitter).
    pub max_delay: Duration,
    /// Jitter factor in [0, 1]; delay is scaled by a value in
    /// [1-jitter, 1+jitter].
    pub jitter: f64,
    /// Consecutive failures within the window that open the breaker.
    pub failure_threshold: u32,
    /// How long an open breaker rejects calls before a half-open trial.
    pub break_duration: Duration,
    /// Rolling window retained by the health monitor.
    pub health_window: Duration,
}

impl Default for ResilienceOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            jitter: 0.25,
            failure_threshold: 5,
            break_duration: Duration::from_secs(30),
            health_window: Duration::from_secs(300),
        }
    }
}

impl ResilienceOptions {
    /// Delay for a 1-indexed attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        backoff_delay(self.base_delay, self.max_delay, self.jitter, attempt)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt <= self.max_retries
    }
}

/// Backoff delay for a 1-indexed attempt: `min(base * 2^(attempt-1), max)`
/// scaled by deterministic hash-based jitter in [1-jitter, 1+jitter].
pub fn backoff_delay(base: Duration, max: Duration, jitter: f64, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(20);
    let base_ms = base.as_millis() as u64;
    let exponential_ms = base_ms.saturating_mul(1u64 << exponent);
    let capped_ms = exponential_ms.min(max.as_millis() as u64);

    // Hash-based jitter: entropy from the clock, no RNG dependency.
    let jittered_ms = if jitter > 0.0 {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0) as u64;
        let hash = now.wrapping_mul(31).wrapping_add(attempt as u64 * 17);
        let jitter_pct = ((hash % 1000) as f64 / 1000.0) * 2.0 - 1.0;
        let jitter_factor = 1.0 + (jitter_pct * jitter);
        (capped_ms as f64 * jitter_factor) as u64
    } else {
        capped_ms
    };

    Duration::from_millis(jittered_ms)
}

// Breaker timing uses the tokio clock so tests can pause and advance it.
#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    opened_at: Option<TokioInstant>,
    half_open: bool,
}

/// Retry + circuit-breaker wrapper around async operations.
///
/// Breaker state is per operation name. The policy shares a
/// [`HealthMonitor`] so callers can observe rolling failure rates.
pub struct ResiliencePolicy {
    options: ResilienceOptions,
    health: Arc<HealthMonitor>,
    breakers: Mutex<HashMap<String, BreakerState>>,
}

impl ResiliencePolicy {
    pub fn new(options: ResilienceOptions) -> Self {
        let health = Arc::new(HealthMonitor::new(options.health_window));
        Self {
            options,
            health,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn health(&self) -> Arc<HealthMonitor> {
        Arc::clone(&self.health)
    }

    pub fn options(&self) -> &ResilienceOptions {
        &self.options
    }

    /// Execute `operation` under retry + breaker semantics.
    ///
    /// The closure is re-invoked for each attempt. Failures classified as
    /// transient are retried up to `max_retries` with capped exponential
    /// backoff; everything else surfaces immediately. Cancellation is
    /// never treated as transient.
    pub async fn execute<T, F, Fut>(
        &self,
        operation: &str,
        cancellation: &CancellationToken,
        mut f: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, BoxError>>,
    {
        if let Some(retry_after) = self.breaker_rejects(operation) {
            self.health.note_breaker_open(operation, true);
            return Err(ResilienceError::CircuitOpen {
                operation: operation.to_string(),
                retry_after,
            });
        }

        let mut attempt: u32 = 1;
        loop {
            if cancellation.is_cancelled() {
                return Err(ResilienceError::Cancelled);
            }

            let started = Instant::now();
            let outcome = tokio::select! {
                _ = cancellation.cancelled() => return Err(ResilienceError::Cancelled),
                outcome = f() => outcome,
            };

            match outcome {
                Ok(value) => {
                    self.health.record_success(operation, started.elapsed());
                    self.on_success(operation);
                    return Ok(value);
                }
                Err(error) => {
                    self.health
                        .record_failure(operation, started.elapsed(), &error.to_string());
                    let opened = self.on_failure(operation);
                    if opened {
                        warn!(operation = %operation, "Circuit breaker opened");
                    }

                    if !is_transient_error(error.as_ref()) {
                        return Err(ResilienceError::Operation {
                            operation: operation.to_string(),
                            source: error,
                        });
                    }
                    if !self.options.should_retry(attempt) {
                        return Err(ResilienceError::RetriesExhausted {
                            operation: operation.to_string(),
                            attempts: attempt,
                            source: error,
                        });
                    }

                    let delay = self.options.delay_for_attempt(attempt);
                    debug!(
                        operation = %operation,
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Transient failure, backing off"
                    );
                    tokio::select! {
                        _ = cancellation.cancelled() => return Err(ResilienceError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Remaining break duration if the breaker rejects this call.
    fn breaker_rejects(&self, operation: &str) -> Option<Duration> {
        let mut breakers = self.breakers.lock().expect("breaker lock poisoned");
        let state = breakers.entry(operation.to_string()).or_default();
        let opened_at = state.opened_at?;

        let elapsed = opened_at.elapsed();
        if elapsed >= self.options.break_duration {
            // Half-open: admit exactly one trial call.
            if state.half_open {
                return Some(Duration::from_millis(1));
            }
            state.half_open = true;
            return None;
        }
        Some(self.options.break_duration - elapsed)
    }

    fn on_success(&self, operation: &str) {
        let mut breakers = self.breakers.lock().expect("breaker lock poisoned");
        if let Some(state) = breakers.get_mut(operation) {
            if state.opened_at.is_some() {
                debug!(operation = %operation, "Circuit breaker closed after trial success");
            }
            *state = BreakerState::default();
        }
        self.health.note_breaker_open(operation, false);
    }

    /// Record a failure; returns true when this failure opened the breaker.
    fn on_failure(&self, operation: &str) -> bool {
        let mut breakers = self.breakers.lock().expect("breaker lock poisoned");
        let state = breakers.entry(operation.to_string()).or_default();

        if state.half_open {
            // Trial failed: reopen for a full break duration.
            state.opened_at = Some(TokioInstant::now());
            state.half_open = false;
            self.health.note_breaker_open(operation, true);
            return true;
        }

        state.consecutive_failures += 1;
        if state.opened_at.is_none() && state.consecutive_failures >= self.options.failure_threshold
        {
            state.opened_at = Some(TokioInstant::now());
            self.health.note_breaker_open(operation, true);
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests;
