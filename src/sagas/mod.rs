//! Saga orchestration.
//!
//! This module contains:
//! - `SagaInstance`: persistent state-machine instance
//! - `StateMachineDefinition` + builder DSL
//! - `SagaOrchestrator`: event-driven state advancement
//! - `CompensationStack`: LIFO undo actions
//! - `TimeoutMonitor`: periodic stale-saga sweep

mod compensation;
mod orchestrator;
mod state_machine;
mod timeout;

pub use compensation::{CompensationFn, CompensationReport, CompensationStack};
pub use orchestrator::{SagaOptions, SagaOrchestrator, SagaOutcome};
pub use state_machine::{
    CompensationArgs, CompensationHandler, SagaAction, SagaContext, StateMachineBuilder,
    StateMachineDefinition, TransitionBuilder,
};
pub use timeout::{SagaBackgroundTask, TimeoutMonitor, TimeoutMonitorOptions, TIMED_OUT_STATE};

use std::any::TypeId;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::interfaces::SagaRepositoryError;
use crate::message::{HandlerContext, Message, ProcessingError};

/// Result type for saga operations.
pub type Result<T> = std::result::Result<T, SagaError>;

/// Errors raised during saga orchestration.
#[derive(Debug, thiserror::Error)]
pub enum SagaError {
    #[error("Saga action failed: {0}")]
    Action(String),

    #[error("Invalid state machine definition: {0}")]
    Definition(String),

    #[error("Event '{0}' carries no correlation id")]
    MissingCorrelation(String),

    #[error(transparent)]
    Repository(#[from] SagaRepositoryError),

    #[error("Operation cancelled")]
    Cancelled,
}

impl SagaError {
    pub fn action(message: impl Into<String>) -> Self {
        Self::Action(message.into())
    }

    /// Concurrency conflicts are retried or swallowed by background
    /// scanners; everything else is surfaced.
    pub fn is_concurrency(&self) -> bool {
        matches!(self, Self::Repository(e) if e.is_concurrency())
    }
}

/// Domain payload carried by a saga. Instances are created with
/// `Default` on the starting event and cloned into the repository.
pub trait SagaData: Default + Clone + Send + Sync + 'static {}

impl<T: Default + Clone + Send + Sync + 'static> SagaData for T {}

/// A persistent state-machine instance coordinating one workflow.
///
/// The correlation id is fixed at creation; `updated_at` only moves
/// forward; a completed saga accepts no further transitions. The
/// version backs the repository's optimistic concurrency.
#[derive(Debug, Clone)]
pub struct SagaInstance<D> {
    correlation_id: String,
    state: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed: bool,
    version: u64,
    /// Names of registered compensations, oldest first. Persisted with
    /// the saga so a later event's failure can undo earlier steps; the
    /// undo handlers themselves live on the state machine definition.
    compensations: Vec<String>,
    pub data: D,
}

impl<D> SagaInstance<D> {
    pub fn new(correlation_id: impl Into<String>, initial_state: impl Into<String>, data: D) -> Self {
        let now = Utc::now();
        Self {
            correlation_id: correlation_id.into(),
            state: initial_state.into(),
            created_at: now,
            updated_at: now,
            completed: false,
            version: 0,
            compensations: Vec::new(),
            data,
        }
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn state(&self) -> &str {
        &self.state
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Move to a new state, touching `updated_at`.
    pub fn set_state(&mut self, state: impl Into<String>) {
        self.state = state.into();
        self.touch();
    }

    /// Advance `updated_at` monotonically.
    pub fn touch(&mut self) {
        let now = Utc::now();
        if now > self.updated_at {
            self.updated_at = now;
        }
    }

    /// Flag completion; no further transitions are accepted and the
    /// pending compensations are dropped.
    pub fn complete(&mut self) {
        self.completed = true;
        self.compensations.clear();
        self.touch();
    }

    /// Record a named compensation for a completed workflow step.
    pub fn register_compensation(&mut self, name: impl Into<String>) {
        self.compensations.push(name.into());
    }

    /// Registered compensation names, oldest first.
    pub fn compensations(&self) -> &[String] {
        &self.compensations
    }

    /// Drop all registered compensations (after they ran).
    pub fn clear_compensations(&mut self) {
        self.compensations.clear();
    }

    /// Bump the optimistic-concurrency version (repository-side).
    pub fn bump_version(&mut self) {
        self.version += 1;
    }
}

/// Route from the general event bus into one saga orchestrator.
///
/// Events published through the facade reach every route whose
/// definition handles the event type; correlation happens inside the
/// orchestrator.
#[async_trait]
pub trait SagaEventRoute: Send + Sync {
    /// Saga name, for logs and failure aggregation.
    fn route_name(&self) -> &str;

    /// Whether this saga reacts to the event type at all.
    fn accepts(&self, event_type: TypeId) -> bool;

    async fn dispatch_event(
        &self,
        event: Arc<dyn Message>,
        ctx: &HandlerContext,
    ) -> std::result::Result<(), ProcessingError>;
}

#[cfg(test)]
mod tests;
