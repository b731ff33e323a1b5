//! Runtime configuration.
//!
//! Aggregates configuration for the pipeline, transport, sagas, and
//! resilience policy into a single struct loadable from a YAML file
//! and `HERO_MESSAGING`-prefixed environment variables.

use std::time::Duration;

use serde::Deserialize;

use crate::pipeline::decorators::{
    BatchingOptions, CircuitBreakerOptions, FailureCachePolicy, FingerprintStrategy,
    IdempotencyOptions, RateLimitMode, RateLimitOptions, RetryOptions,
};
use crate::resilience::ResilienceOptions;
use crate::sagas::TimeoutMonitorOptions;
use crate::transport::OverflowPolicy;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "hero-messaging.yaml";
/// Environment variable for the configuration file path.
pub const CONFIG_ENV_VAR: &str = "HERO_MESSAGING_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "HERO_MESSAGING";
/// Environment variable for logging configuration (tracing env-filter).
pub const LOG_ENV_VAR: &str = "HERO_MESSAGING_LOG";

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration load failed: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Configuration parse failed: {0}")]
    Parse(String),
}

/// Top-level runtime configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub pipeline: PipelineConfig,
    pub transport: TransportConfig,
    pub saga: SagaConfig,
    pub resilience: ResilienceConfig,
}

impl RuntimeConfig {
    /// Load from the default file (when present) and the environment.
    ///
    /// Environment variables override file values, e.g.
    /// `HERO_MESSAGING__PIPELINE__RETRY__MAX_ATTEMPTS=5`.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var(CONFIG_ENV_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.into());
        Self::load_from(&path)
    }

    /// Load from a specific YAML file (when present) and the environment.
    pub fn load_from(path: &str) -> Result<Self, ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Parse configuration from an in-memory YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}

/// Pipeline decorator configuration. Durations are carried as integer
/// milliseconds/seconds for environment-variable friendliness and
/// converted into the decorator option structs on wiring.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub idempotency: IdempotencyConfig,
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub batching: BatchingConfig,
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    pub enabled: bool,
    /// One of "message-id", "content-hash", "composite".
    pub strategy: String,
    /// Cache deterministic failures as well as successes.
    pub cache_failures: bool,
    pub success_ttl_secs: u64,
    pub failure_ttl_secs: u64,
    pub processing_ttl_secs: u64,
    pub max_wait_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            strategy: "message-id".to_string(),
            cache_failures: false,
            success_ttl_secs: 3600,
            failure_ttl_secs: 300,
            processing_ttl_secs: 60,
            max_wait_ms: 5000,
            poll_interval_ms: 50,
        }
    }
}

impl IdempotencyConfig {
    pub fn options(&self) -> IdempotencyOptions {
        IdempotencyOptions {
            strategy: match self.strategy.as_str() {
                "content-hash" => FingerprintStrategy::ContentHash,
                "composite" => FingerprintStrategy::Composite,
                _ => FingerprintStrategy::MessageId,
            },
            failure_policy: if self.cache_failures {
                FailureCachePolicy::Deterministic
            } else {
                FailureCachePolicy::None
            },
            success_ttl: Duration::from_secs(self.success_ttl_secs),
            failure_ttl: Duration::from_secs(self.failure_ttl_secs),
            processing_ttl: Duration::from_secs(self.processing_ttl_secs),
            max_wait: Duration::from_millis(self.max_wait_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub enabled: bool,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 10_000,
            jitter: 0.25,
        }
    }
}

impl RetryConfig {
    pub fn options(&self) -> RetryOptions {
        RetryOptions {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter: self.jitter,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,
    pub failure_threshold: u32,
    pub break_duration_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            break_duration_secs: 30,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn options(&self) -> CircuitBreakerOptions {
        CircuitBreakerOptions {
            failure_threshold: self.failure_threshold,
            break_duration: Duration::from_secs(self.break_duration_secs),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatchingConfig {
    /// Batching is opt-in.
    pub enabled: bool,
    pub max_batch_size: usize,
    pub batch_timeout_ms: u64,
    pub fallback_to_single: bool,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_batch_size: 10,
            batch_timeout_ms: 100,
            fallback_to_single: true,
        }
    }
}

impl BatchingConfig {
    pub fn options(&self) -> BatchingOptions {
        BatchingOptions {
            max_batch_size: self.max_batch_size,
            batch_timeout: Duration::from_millis(self.batch_timeout_ms),
            fallback_to_single: self.fallback_to_single,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Rate limiting is opt-in.
    pub enabled: bool,
    pub capacity: f64,
    pub refill_per_second: f64,
    pub permits_per_message: f64,
    /// One of "reject", "queue".
    pub mode: String,
    pub max_queue_wait_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            capacity: 100.0,
            refill_per_second: 10.0,
            permits_per_message: 1.0,
            mode: "reject".to_string(),
            max_queue_wait_ms: 5000,
        }
    }
}

impl RateLimitConfig {
    pub fn options(&self) -> RateLimitOptions {
        RateLimitOptions {
            capacity: self.capacity,
            refill_per_second: self.refill_per_second,
            permits_per_message: self.permits_per_message,
            mode: match self.mode.as_str() {
                "queue" => RateLimitMode::Queue,
                _ => RateLimitMode::Reject,
            },
            max_queue_wait: Duration::from_millis(self.max_queue_wait_ms),
            key_selector: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub name: String,
    pub default_queue_capacity: usize,
    pub default_overflow: OverflowPolicy,
    pub simulated_latency_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            name: "memory".to_string(),
            default_queue_capacity: 1024,
            default_overflow: OverflowPolicy::Wait,
            simulated_latency_ms: 0,
        }
    }
}

impl TransportConfig {
    pub fn simulated_latency(&self) -> Option<Duration> {
        (self.simulated_latency_ms > 0).then(|| Duration::from_millis(self.simulated_latency_ms))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SagaConfig {
    pub timeout_check_interval_secs: u64,
    pub default_timeout_secs: u64,
    pub stop_compensation_on_first_error: bool,
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            timeout_check_interval_secs: 30,
            default_timeout_secs: 600,
            stop_compensation_on_first_error: false,
        }
    }
}

impl SagaConfig {
    pub fn timeout_options(&self) -> TimeoutMonitorOptions {
        TimeoutMonitorOptions {
            check_interval: Duration::from_secs(self.timeout_check_interval_secs),
            default_timeout: Duration::from_secs(self.default_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: f64,
    pub failure_threshold: u32,
    pub break_duration_secs: u64,
    pub health_window_secs: u64,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 100,
            max_delay_ms: 30_000,
            jitter: 0.25,
            failure_threshold: 5,
            break_duration_secs: 30,
            health_window_secs: 300,
        }
    }
}

impl ResilienceConfig {
    pub fn options(&self) -> ResilienceOptions {
        ResilienceOptions {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter: self.jitter,
            failure_threshold: self.failure_threshold,
            break_duration: Duration::from_secs(self.break_duration_secs),
            health_window: Duration::from_secs(self.health_window_secs),
        }
    }
}
