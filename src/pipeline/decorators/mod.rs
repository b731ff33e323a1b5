//! Pipeline decorators, one cross-cutting concern each.
//!
//! - `ValidationDecorator`: marker-interface gate
//! - `IdempotencyDecorator`: fingerprint cache with processing locks
//! - `BatchingDecorator`: size/time-window accumulation
//! - `RateLimitDecorator`: token bucket, per-key when configured
//! - `RetryDecorator`: transient-failure retry with backoff
//! - `CircuitBreakerDecorator`: per-operation failure gate
//! - `TransactionDecorator`: unit-of-work scope around dispatch
//! - `ErrorHandlingDecorator`: classification, context, logging
//! - `TelemetryDecorator`: spans and timing

mod batching;
mod circuit_breaker;
mod error_handling;
mod idempotency;
mod rate_limit;
mod retry;
mod telemetry;
mod transaction;
mod validation;

pub use batching::{BatchingDecorator, BatchingOptions};
pub use circuit_breaker::{CircuitBreakerDecorator, CircuitBreakerOptions};
pub use error_handling::ErrorHandlingDecorator;
pub use idempotency::{
    FailureCachePolicy, FingerprintStrategy, IdempotencyDecorator, IdempotencyOptions,
};
pub use rate_limit::{RateLimitDecorator, RateLimitMode, RateLimitOptions};
pub use retry::{RetryDecorator, RetryOptions};
pub use telemetry::TelemetryDecorator;
pub use transaction::TransactionDecorator;
pub use validation::{ValidationDecorator, ValidationOptions};
