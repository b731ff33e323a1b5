//! In-memory collaborator implementations.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::interfaces::idempotency_store::{
    self, CachedFailure, IdempotencyRecord, IdempotencyStatus, IdempotencyStore,
};
use crate::interfaces::saga_repository::{self, SagaRepository, SagaRepositoryError};
use crate::interfaces::storage::{
    self, InboxStorage, MessageStorage, OutboxStorage, StorageError, StoredMessage, UnitOfWork,
};
use crate::message::{Envelope, ResponseValue};
use crate::sagas::SagaInstance;

// ============================================================================
// Saga repository
// ============================================================================

/// Saga repository over a process-local map with optimistic concurrency.
pub struct InMemorySagaRepository<D> {
    sagas: Mutex<HashMap<String, SagaInstance<D>>>,
}

impl<D> InMemorySagaRepository<D> {
    pub fn new() -> Self {
        Self {
            sagas: Mutex::new(HashMap::new()),
        }
    }
}

impl<D> Default for InMemorySagaRepository<D> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<D: Clone + Send + Sync + 'static> SagaRepository<D> for InMemorySagaRepository<D> {
    async fn get(&self, correlation_id: &str) -> saga_repository::Result<Option<SagaInstance<D>>> {
        let sagas = self.sagas.lock().expect("saga store poisoned");
        Ok(sagas.get(correlation_id).cloned())
    }

    async fn create(&self, saga: &SagaInstance<D>) -> saga_repository::Result<()> {
        let mut sagas = self.sagas.lock().expect("saga store poisoned");
        if sagas.contains_key(saga.correlation_id()) {
            return Err(SagaRepositoryError::AlreadyExists {
                correlation_id: saga.correlation_id().to_string(),
            });
        }
        sagas.insert(saga.correlation_id().to_string(), saga.clone());
        Ok(())
    }

    async fn update(&self, saga: &SagaInstance<D>) -> saga_repository::Result<()> {
        let mut sagas = self.sagas.lock().expect("saga store poisoned");
        let stored = sagas.get_mut(saga.correlation_id()).ok_or_else(|| {
            SagaRepositoryError::NotFound {
                correlation_id: saga.correlation_id().to_string(),
            }
        })?;
        if stored.version() != saga.version() {
            return Err(SagaRepositoryError::Concurrency {
                correlation_id: saga.correlation_id().to_string(),
                expected: saga.version(),
                actual: stored.version(),
            });
        }
        let mut updated = saga.clone();
        updated.bump_version();
        *stored = updated;
        Ok(())
    }

    async fn delete(&self, correlation_id: &str) -> saga_repository::Result<()> {
        self.sagas
            .lock()
            .expect("saga store poisoned")
            .remove(correlation_id);
        Ok(())
    }

    async fn find_stale(
        &self,
        older_than: DateTime<Utc>,
    ) -> saga_repository::Result<Vec<SagaInstance<D>>> {
        let sagas = self.sagas.lock().expect("saga store poisoned");
        Ok(sagas
            .values()
            .filter(|s| !s.is_completed() && s.updated_at() < older_than)
            .cloned()
            .collect())
    }

    async fn find_by_state(&self, state: &str) -> saga_repository::Result<Vec<SagaInstance<D>>> {
        let sagas = self.sagas.lock().expect("saga store poisoned");
        Ok(sagas
            .values()
            .filter(|s| s.state() == state)
            .cloned()
            .collect())
    }
}

// ============================================================================
// Idempotency store
// ============================================================================

/// Idempotency store over a process-local map. The processing-lock
/// guarantee holds because installs go through one mutex.
pub struct InMemoryIdempotencyStore {
    entries: Mutex<HashMap<String, IdempotencyRecord>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn live(record: &IdempotencyRecord) -> bool {
        record.expires_at > Utc::now()
    }

    fn record(status: IdempotencyStatus, ttl: Duration) -> IdempotencyRecord {
        let now = Utc::now();
        IdempotencyRecord {
            status,
            payload: None,
            failure: None,
            stored_at: now,
            expires_at: now
                + chrono::Duration::from_std(ttl)
                    .unwrap_or_else(|_| chrono::Duration::days(36500)),
        }
    }
}

impl Default for InMemoryIdempotencyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn get(&self, key: &str) -> idempotency_store::Result<Option<IdempotencyRecord>> {
        let entries = self.entries.lock().expect("idempotency store poisoned");
        Ok(entries.get(key).filter(|r| Self::live(r)).cloned())
    }

    async fn try_begin(&self, key: &str, ttl: Duration) -> idempotency_store::Result<bool> {
        let mut entries = self.entries.lock().expect("idempotency store poisoned");
        if entries.get(key).is_some_and(Self::live) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Self::record(IdempotencyStatus::Processing, ttl),
        );
        Ok(true)
    }

    async fn store_success(
        &self,
        key: &str,
        payload: Option<ResponseValue>,
        ttl: Duration,
    ) -> idempotency_store::Result<()> {
        let mut record = Self::record(IdempotencyStatus::Success, ttl);
        record.payload = payload;
        self.entries
            .lock()
            .expect("idempotency store poisoned")
            .insert(key.to_string(), record);
        Ok(())
    }

    async fn store_failure(
        &self,
        key: &str,
        failure: CachedFailure,
        ttl: Duration,
    ) -> idempotency_store::Result<()> {
        let mut record = Self::record(IdempotencyStatus::Failure, ttl);
        record.failure = Some(failure);
        self.entries
            .lock()
            .expect("idempotency store poisoned")
            .insert(key.to_string(), record);
        Ok(())
    }

    async fn remove(&self, key: &str) -> idempotency_store::Result<()> {
        self.entries
            .lock()
            .expect("idempotency store poisoned")
            .remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> idempotency_store::Result<bool> {
        let entries = self.entries.lock().expect("idempotency store poisoned");
        Ok(entries.get(key).is_some_and(Self::live))
    }

    async fn cleanup_expired(&self) -> idempotency_store::Result<usize> {
        let mut entries = self.entries.lock().expect("idempotency store poisoned");
        let before = entries.len();
        entries.retain(|_, r| Self::live(r));
        Ok(before - entries.len())
    }
}

// ============================================================================
// Message storage + unit of work
// ============================================================================

type MessageMap = HashMap<Uuid, StoredMessage>;

/// Message store over a process-local map; serves as message, outbox,
/// inbox, and queue storage.
pub struct InMemoryMessageStorage {
    queue_name: String,
    messages: Mutex<MessageMap>,
}

impl InMemoryMessageStorage {
    pub fn new() -> Self {
        Self::for_queue("default")
    }

    pub fn for_queue(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            messages: Mutex::new(HashMap::new()),
        }
    }

    fn snapshot(&self) -> MessageMap {
        self.messages.lock().expect("message store poisoned").clone()
    }

    fn restore(&self, snapshot: MessageMap) {
        *self.messages.lock().expect("message store poisoned") = snapshot;
    }
}

impl Default for InMemoryMessageStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageStorage for InMemoryMessageStorage {
    async fn put(&self, envelope: Envelope) -> storage::Result<()> {
        let mut messages = self.messages.lock().expect("message store poisoned");
        messages.insert(
            envelope.message_id(),
            StoredMessage {
                envelope,
                stored_at: Utc::now(),
                processed_at: None,
            },
        );
        Ok(())
    }

    async fn get(&self, message_id: Uuid) -> storage::Result<Option<StoredMessage>> {
        let messages = self.messages.lock().expect("message store poisoned");
        Ok(messages.get(&message_id).cloned())
    }

    async fn mark_processed(&self, message_id: Uuid) -> storage::Result<()> {
        let mut messages = self.messages.lock().expect("message store poisoned");
        let stored = messages
            .get_mut(&message_id)
            .ok_or(StorageError::NotFound(message_id))?;
        stored.processed_at = Some(Utc::now());
        Ok(())
    }

    async fn delete(&self, message_id: Uuid) -> storage::Result<()> {
        self.messages
            .lock()
            .expect("message store poisoned")
            .remove(&message_id);
        Ok(())
    }

    async fn pending(&self, limit: usize) -> storage::Result<Vec<StoredMessage>> {
        let messages = self.messages.lock().expect("message store poisoned");
        let mut pending: Vec<StoredMessage> = messages
            .values()
            .filter(|m| m.processed_at.is_none())
            .cloned()
            .collect();
        pending.sort_by_key(|m| m.stored_at);
        pending.truncate(limit);
        Ok(pending)
    }
}

#[async_trait]
impl OutboxStorage for InMemoryMessageStorage {}

#[async_trait]
impl InboxStorage for InMemoryMessageStorage {}

#[async_trait]
impl storage::QueueStorage for InMemoryMessageStorage {
    fn queue_name(&self) -> &str {
        &self.queue_name
    }
}

struct UnitOfWorkState {
    active: bool,
    /// Store snapshots for full rollback.
    begin_snapshot: Option<(MessageMap, MessageMap, MessageMap)>,
    savepoints: Vec<(String, (MessageMap, MessageMap, MessageMap))>,
}

/// Unit of work over the in-memory stores: rollback restores snapshots
/// taken at begin/savepoint time.
pub struct InMemoryUnitOfWork {
    messages: InMemoryMessageStorage,
    outbox: InMemoryMessageStorage,
    inbox: InMemoryMessageStorage,
    state: Mutex<UnitOfWorkState>,
}

impl InMemoryUnitOfWork {
    pub fn new() -> Self {
        Self {
            messages: InMemoryMessageStorage::new(),
            outbox: InMemoryMessageStorage::for_queue("outbox"),
            inbox: InMemoryMessageStorage::for_queue("inbox"),
            state: Mutex::new(UnitOfWorkState {
                active: false,
                begin_snapshot: None,
                savepoints: Vec::new(),
            }),
        }
    }

    fn snapshots(&self) -> (MessageMap, MessageMap, MessageMap) {
        (
            self.messages.snapshot(),
            self.outbox.snapshot(),
            self.inbox.snapshot(),
        )
    }

    fn restore_all(&self, snapshot: (MessageMap, MessageMap, MessageMap)) {
        self.messages.restore(snapshot.0);
        self.outbox.restore(snapshot.1);
        self.inbox.restore(snapshot.2);
    }
}

impl Default for InMemoryUnitOfWork {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UnitOfWork for InMemoryUnitOfWork {
    async fn begin(&self) -> storage::Result<()> {
        let snapshot = self.snapshots();
        let mut state = self.state.lock().expect("unit of work poisoned");
        state.active = true;
        state.begin_snapshot = Some(snapshot);
        state.savepoints.clear();
        Ok(())
    }

    async fn commit(&self) -> storage::Result<()> {
        let mut state = self.state.lock().expect("unit of work poisoned");
        if !state.active {
            return Err(StorageError::NoTransaction);
        }
        state.active = false;
        state.begin_snapshot = None;
        state.savepoints.clear();
        Ok(())
    }

    async fn rollback(&self) -> storage::Result<()> {
        let snapshot = {
            let mut state = self.state.lock().expect("unit of work poisoned");
            if !state.active {
                return Err(StorageError::NoTransaction);
            }
            state.active = false;
            state.savepoints.clear();
            state.begin_snapshot.take()
        };
        if let Some(snapshot) = snapshot {
            self.restore_all(snapshot);
        }
        Ok(())
    }

    async fn savepoint(&self, name: &str) -> storage::Result<()> {
        let snapshot = self.snapshots();
        let mut state = self.state.lock().expect("unit of work poisoned");
        if !state.active {
            return Err(StorageError::NoTransaction);
        }
        state.savepoints.push((name.to_string(), snapshot));
        Ok(())
    }

    async fn rollback_to(&self, name: &str) -> storage::Result<()> {
        let snapshot = {
            let mut state = self.state.lock().expect("unit of work poisoned");
            if !state.active {
                return Err(StorageError::NoTransaction);
            }
            let index = state
                .savepoints
                .iter()
                .position(|(n, _)| n == name)
                .ok_or_else(|| StorageError::UnknownSavepoint(name.to_string()))?;
            let (_, snapshot) = state.savepoints.swap_remove(index);
            // Later savepoints are invalidated by the rollback.
            state.savepoints.truncate(index);
            snapshot
        };
        self.restore_all(snapshot);
        Ok(())
    }

    fn messages(&self) -> &dyn MessageStorage {
        &self.messages
    }

    fn outbox(&self) -> &dyn OutboxStorage {
        &self.outbox
    }

    fn inbox(&self) -> &dyn InboxStorage {
        &self.inbox
    }
}
