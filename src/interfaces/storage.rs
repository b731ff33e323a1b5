//! Message persistence contracts (inbox/outbox/queue) behind a unit of work.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::message::Envelope;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors raised by message storages.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Message '{0}' not found")]
    NotFound(Uuid),

    #[error("No active transaction")]
    NoTransaction,

    #[error("Savepoint '{0}' not found")]
    UnknownSavepoint(String),

    #[error("Storage failure: {0}")]
    Backend(String),
}

/// A persisted envelope plus bookkeeping state.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub envelope: Envelope,
    pub stored_at: DateTime<Utc>,
    /// Set when the message has been handed off (outbox) or fully
    /// processed (inbox).
    pub processed_at: Option<DateTime<Utc>>,
}

/// Minimal CRUD over persisted messages.
#[async_trait]
pub trait MessageStorage: Send + Sync {
    async fn put(&self, envelope: Envelope) -> Result<()>;
    async fn get(&self, message_id: Uuid) -> Result<Option<StoredMessage>>;
    async fn mark_processed(&self, message_id: Uuid) -> Result<()>;
    async fn delete(&self, message_id: Uuid) -> Result<()>;
    /// Unprocessed messages in stored order, up to `limit`.
    async fn pending(&self, limit: usize) -> Result<Vec<StoredMessage>>;
}

/// Outbox: messages recorded transactionally for later transport hand-off.
#[async_trait]
pub trait OutboxStorage: MessageStorage {}

/// Inbox: received messages recorded for at-most-once processing.
#[async_trait]
pub trait InboxStorage: MessageStorage {}

/// Durable backing for transport queues.
#[async_trait]
pub trait QueueStorage: MessageStorage {
    /// Queue name this storage backs.
    fn queue_name(&self) -> &str;
}

/// Transaction scope over the storages.
///
/// The core never reaches a storage except through a unit of work;
/// savepoints allow partial rollback within one transaction.
#[async_trait]
pub trait UnitOfWork: Send + Sync {
    async fn begin(&self) -> Result<()>;
    async fn commit(&self) -> Result<()>;
    async fn rollback(&self) -> Result<()>;

    async fn savepoint(&self, name: &str) -> Result<()>;
    async fn rollback_to(&self, name: &str) -> Result<()>;

    fn messages(&self) -> &dyn MessageStorage;
    fn outbox(&self) -> &dyn OutboxStorage;
    fn inbox(&self) -> &dyn InboxStorage;
}
