//! Abstract interfaces for runtime collaborators.
//!
//! These traits define the contracts the core consumes; concrete
//! database-backed implementations live outside the crate:
//! - Saga persistence (optimistic concurrency)
//! - Idempotency store (at-most-one concurrent build per fingerprint)
//! - Message/outbox/inbox/queue storage behind a unit of work
//! - Serialization (format carried as envelope content-type)
//! - Transport instrumentation (trace context through envelope headers)

pub mod idempotency_store;
pub mod instrumentation;
pub mod saga_repository;
pub mod serializer;
pub mod storage;

pub use idempotency_store::{
    CachedFailure, IdempotencyError, IdempotencyRecord, IdempotencyStatus, IdempotencyStore,
};
pub use instrumentation::{NoopInstrumentation, TransportInstrumentation};
pub use saga_repository::{SagaRepository, SagaRepositoryError};
pub use serializer::{JsonSerializer, Serializer, SerializerError};
pub use storage::{
    InboxStorage, MessageStorage, OutboxStorage, QueueStorage, StorageError, StoredMessage,
    UnitOfWork,
};
