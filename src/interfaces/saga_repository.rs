//! Saga persistence contract.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::sagas::SagaInstance;

/// Result type for repository operations.
pub type Result<T> = std::result::Result<T, SagaRepositoryError>;

/// Errors raised by saga repositories.
#[derive(Debug, thiserror::Error)]
pub enum SagaRepositoryError {
    #[error("Saga '{correlation_id}' already exists")]
    AlreadyExists { correlation_id: String },

    #[error("Saga '{correlation_id}' not found")]
    NotFound { correlation_id: String },

    #[error("Concurrency conflict on saga '{correlation_id}': expected version {expected}, found {actual}")]
    Concurrency {
        correlation_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("Storage failure: {0}")]
    Storage(String),
}

impl SagaRepositoryError {
    /// Version-mismatch conflicts are non-fatal for background scanners.
    pub fn is_concurrency(&self) -> bool {
        matches!(self, Self::Concurrency { .. })
    }
}

/// Persistence for saga instances of one data type.
///
/// Implementations must provide optimistic concurrency: `update` compares
/// the instance's version against the stored one and raises
/// [`SagaRepositoryError::Concurrency`] on mismatch, bumping the version
/// on success. Per-correlation-id event processing is serialized by this
/// mechanism; cross-correlation processing is parallel.
#[async_trait]
pub trait SagaRepository<D: Send + Sync + 'static>: Send + Sync {
    /// Fetch a saga by correlation id.
    async fn get(&self, correlation_id: &str) -> Result<Option<SagaInstance<D>>>;

    /// Persist a new saga. Fails if the correlation id already exists.
    async fn create(&self, saga: &SagaInstance<D>) -> Result<()>;

    /// Persist an updated saga under optimistic concurrency.
    async fn update(&self, saga: &SagaInstance<D>) -> Result<()>;

    /// Remove a saga.
    async fn delete(&self, correlation_id: &str) -> Result<()>;

    /// Sagas not updated since the given instant and not yet completed.
    async fn find_stale(&self, older_than: DateTime<Utc>) -> Result<Vec<SagaInstance<D>>>;

    /// Sagas currently in the named state.
    async fn find_by_state(&self, state: &str) -> Result<Vec<SagaInstance<D>>>;
}
