//! Idempotency store contract.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::message::{ProcessingError, ResponseValue};

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, IdempotencyError>;

/// Errors raised by idempotency stores.
#[derive(Debug, thiserror::Error)]
pub enum IdempotencyError {
    #[error("Idempotency storage failure: {0}")]
    Storage(String),
}

/// Status of a fingerprint entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdempotencyStatus {
    /// A cached successful response is available.
    Success,
    /// A cached deterministic failure is available.
    Failure,
    /// Another worker holds the build lock for this fingerprint.
    Processing,
}

/// Cacheable failure record. Reconstructed into a [`ProcessingError`]
/// when replayed; transient failures are never stored.
#[derive(Debug, Clone)]
pub struct CachedFailure {
    pub kind: String,
    pub message: String,
    pub retry_after: Option<Duration>,
}

impl CachedFailure {
    pub fn from_error(error: &ProcessingError) -> Self {
        Self {
            kind: error.kind_name().to_string(),
            message: error.to_string(),
            retry_after: error.retry_after(),
        }
    }

    /// Rebuild the failure for replay to a caller.
    pub fn to_error(&self) -> ProcessingError {
        match self.kind.as_str() {
            "validation" => ProcessingError::Validation(self.message.clone()),
            "not_found" => ProcessingError::NotFound(self.message.clone()),
            "unauthorized" => ProcessingError::Unauthorized(self.message.clone()),
            "business_rule" => ProcessingError::BusinessRule(self.message.clone()),
            _ => ProcessingError::fatal(self.message.clone()),
        }
    }
}

/// One stored fingerprint entry.
#[derive(Debug, Clone)]
pub struct IdempotencyRecord {
    pub status: IdempotencyStatus,
    pub payload: Option<ResponseValue>,
    pub failure: Option<CachedFailure>,
    pub stored_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Store guaranteeing at-most-one concurrent build per fingerprint.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Fetch the entry for a fingerprint, if present and unexpired.
    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>>;

    /// Attempt to install the processing lock for a fingerprint.
    ///
    /// Returns `false` when a live entry (cached result or another
    /// worker's lock) already exists.
    async fn try_begin(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Replace the entry with a cached success.
    async fn store_success(
        &self,
        key: &str,
        payload: Option<ResponseValue>,
        ttl: Duration,
    ) -> Result<()>;

    /// Replace the entry with a cached deterministic failure.
    async fn store_failure(&self, key: &str, failure: CachedFailure, ttl: Duration) -> Result<()>;

    /// Drop the entry (releases a processing lock after an uncacheable
    /// outcome).
    async fn remove(&self, key: &str) -> Result<()>;

    /// Whether any live entry exists for the fingerprint.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Purge expired entries, returning how many were removed.
    async fn cleanup_expired(&self) -> Result<usize>;
}
