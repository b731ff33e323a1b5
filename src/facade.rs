//! HeroMessaging facade for in-process library usage.
//!
//! Wires the decorator pipeline, handler registry, saga orchestrators,
//! and in-memory transport behind one entry point.
//!
//! # Example
//!
//! ```ignore
//! use hero_messaging::{HeroMessaging, HeroMessagingBuilder};
//!
//! let messaging = HeroMessaging::builder()
//!     .with_command_handler::<ChargeCard, _>(ChargeHandler::new())
//!     .with_event_handler::<OrderCreated, _>(AuditTrail::new())
//!     .build()?;
//!
//! messaging.start().await?;
//! messaging.send(ChargeCard { .. }).await?;
//! let total: u64 = messaging.query(OpenOrders { .. }).await?;
//! messaging.stop().await?;
//! ```

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::RuntimeConfig;
use crate::interfaces::{IdempotencyStore, SagaRepository, UnitOfWork};
use crate::message::{
    Command, Event, Message, MessageKind, ProcessingContext, ProcessingError, Query,
};
use crate::pipeline::decorators::{
    CircuitBreakerDecorator, ErrorHandlingDecorator, IdempotencyDecorator, RateLimitDecorator,
    RetryDecorator, TelemetryDecorator, TransactionDecorator, ValidationDecorator,
    ValidationOptions,
};
use crate::pipeline::{
    CommandHandler, Dispatcher, EventHandler, HandlerRegistry, Pipeline, PipelineBuilder,
    QueryHandler,
};
use crate::resilience::ResiliencePolicy;
use crate::sagas::{
    SagaBackgroundTask, SagaData, SagaEventRoute, SagaOptions, SagaOrchestrator,
    StateMachineDefinition, TimeoutMonitor,
};
use crate::storage::InMemoryIdempotencyStore;
use crate::transport::{
    InMemoryTransport, QueueOptions, TransportError, TransportHealth, TransportOptions,
};

/// Errors raised while building the facade.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Handler registration failed: {0}")]
    Registration(String),
}

/// Builder for a [`HeroMessaging`] instance.
pub struct HeroMessagingBuilder {
    config: RuntimeConfig,
    registry: Arc<HandlerRegistry>,
    saga_routes: Vec<Arc<dyn SagaEventRoute>>,
    background_tasks: Vec<Arc<dyn SagaBackgroundTask>>,
    idempotency_store: Option<Arc<dyn IdempotencyStore>>,
    unit_of_work: Option<Arc<dyn UnitOfWork>>,
    registration_errors: Vec<String>,
}

impl HeroMessagingBuilder {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            registry: Arc::new(HandlerRegistry::new()),
            saga_routes: Vec::new(),
            background_tasks: Vec::new(),
            idempotency_store: None,
            unit_of_work: None,
            registration_errors: Vec::new(),
        }
    }

    /// Register the handler for command type `C`.
    pub fn with_command_handler<C, H>(mut self, handler: H) -> Self
    where
        C: Command,
        H: CommandHandler<C> + 'static,
    {
        if let Err(e) = self.registry.register_command::<C, _>(handler) {
            self.registration_errors.push(e.to_string());
        }
        self
    }

    /// Register the handler for query type `Q`.
    pub fn with_query_handler<Q, H>(mut self, handler: H) -> Self
    where
        Q: Query,
        H: QueryHandler<Q> + 'static,
    {
        if let Err(e) = self.registry.register_query::<Q, _>(handler) {
            self.registration_errors.push(e.to_string());
        }
        self
    }

    /// Register an additional handler for event type `E`.
    pub fn with_event_handler<E, H>(self, handler: H) -> Self
    where
        E: Event,
        H: EventHandler<E> + 'static,
    {
        self.registry.register_event::<E, _>(handler);
        self
    }

    /// Register a saga: events published through the facade reach its
    /// orchestrator, and a timeout monitor sweeps its repository.
    pub fn with_saga<D: SagaData>(
        mut self,
        definition: StateMachineDefinition<D>,
        repository: Arc<dyn SagaRepository<D>>,
    ) -> Self {
        let saga_name = definition.saga_name().to_string();
        let orchestrator = Arc::new(SagaOrchestrator::with_options(
            definition,
            Arc::clone(&repository),
            SagaOptions {
                stop_compensation_on_first_error: self.config.saga.stop_compensation_on_first_error,
                correlation_extractor: None,
            },
        ));
        self.saga_routes.push(orchestrator);

        let monitor = Arc::new(TimeoutMonitor::new(
            saga_name,
            repository,
            self.config.saga.timeout_options(),
        ));
        self.background_tasks
            .push(Arc::new(monitor) as Arc<dyn SagaBackgroundTask>);
        self
    }

    /// Override the idempotency store (default: in-memory).
    pub fn with_idempotency_store(mut self, store: Arc<dyn IdempotencyStore>) -> Self {
        self.idempotency_store = Some(store);
        self
    }

    /// Wrap terminal dispatch in a unit-of-work transaction.
    pub fn with_unit_of_work(mut self, unit_of_work: Arc<dyn UnitOfWork>) -> Self {
        self.unit_of_work = Some(unit_of_work);
        self
    }

    /// Assemble the pipeline in the recommended decorator order and
    /// wire the transport.
    pub fn build(self) -> Result<HeroMessaging, BuildError> {
        if !self.registration_errors.is_empty() {
            return Err(BuildError::Registration(self.registration_errors.join("; ")));
        }

        let dispatcher = Arc::new(Dispatcher::with_saga_routes(
            Arc::clone(&self.registry),
            self.saga_routes,
        ));

        let pipeline_config = &self.config.pipeline;
        let mut builder = PipelineBuilder::new(dispatcher).with_decorator(Arc::new(
            ValidationDecorator::new(ValidationOptions::all()),
        ));
        if pipeline_config.idempotency.enabled {
            let store = self
                .idempotency_store
                .unwrap_or_else(|| Arc::new(InMemoryIdempotencyStore::new()));
            builder = builder.with_decorator(Arc::new(IdempotencyDecorator::new(
                store,
                pipeline_config.idempotency.options(),
            )));
        }
        if pipeline_config.batching.enabled {
            builder = builder.with_batching(pipeline_config.batching.options());
        }
        if pipeline_config.rate_limit.enabled {
            builder = builder.with_decorator(Arc::new(RateLimitDecorator::new(
                pipeline_config.rate_limit.options(),
            )));
        }
        if pipeline_config.retry.enabled {
            builder = builder.with_decorator(Arc::new(RetryDecorator::new(
                pipeline_config.retry.options(),
            )));
        }
        if pipeline_config.circuit_breaker.enabled {
            builder = builder.with_decorator(Arc::new(CircuitBreakerDecorator::new(
                pipeline_config.circuit_breaker.options(),
            )));
        }
        if let Some(unit_of_work) = self.unit_of_work {
            builder = builder.with_decorator(Arc::new(TransactionDecorator::new(unit_of_work)));
        }
        let pipeline = builder
            .with_decorator(Arc::new(ErrorHandlingDecorator::new()))
            .with_decorator(Arc::new(TelemetryDecorator::new()))
            .build();

        let transport = Arc::new(InMemoryTransport::new(TransportOptions {
            name: self.config.transport.name.clone(),
            simulated_latency: self.config.transport.simulated_latency(),
            default_queue: QueueOptions {
                capacity: self.config.transport.default_queue_capacity,
                overflow: self.config.transport.default_overflow,
            },
            default_consumer: Default::default(),
        }));

        let resilience = Arc::new(ResiliencePolicy::new(self.config.resilience.options()));

        Ok(HeroMessaging {
            pipeline,
            registry: self.registry,
            transport,
            resilience,
            background_tasks: self.background_tasks,
            cancel: CancellationToken::new(),
        })
    }
}

/// Top-level facade dispatching commands, queries, and events into the
/// processing pipeline.
pub struct HeroMessaging {
    pipeline: Arc<Pipeline>,
    registry: Arc<HandlerRegistry>,
    transport: Arc<InMemoryTransport>,
    resilience: Arc<ResiliencePolicy>,
    background_tasks: Vec<Arc<dyn SagaBackgroundTask>>,
    cancel: CancellationToken,
}

impl HeroMessaging {
    /// Builder with default configuration.
    pub fn builder() -> HeroMessagingBuilder {
        HeroMessagingBuilder::new(RuntimeConfig::default())
    }

    /// Builder with explicit configuration.
    pub fn builder_with_config(config: RuntimeConfig) -> HeroMessagingBuilder {
        HeroMessagingBuilder::new(config)
    }

    /// Connect the transport and launch background tasks.
    pub async fn start(&self) -> Result<(), TransportError> {
        self.transport.connect().await?;
        for task in &self.background_tasks {
            task.start().await;
        }
        info!("HeroMessaging started");
        Ok(())
    }

    /// Drain background tasks and disconnect the transport.
    pub async fn stop(&self) -> Result<(), TransportError> {
        self.cancel.cancel();
        for task in &self.background_tasks {
            task.stop().await;
        }
        self.transport.disconnect().await?;
        info!("HeroMessaging stopped");
        Ok(())
    }

    /// Dispatch a command without expecting a response.
    pub async fn send<C: Command>(&self, command: C) -> Result<(), ProcessingError> {
        self.execute(Arc::new(command), MessageKind::Command)
            .await
            .map(|_| ())
    }

    /// Dispatch a command and return the handler's response.
    pub async fn send_expecting<C, R>(&self, command: C) -> Result<R, ProcessingError>
    where
        C: Command,
        R: Clone + Send + Sync + 'static,
    {
        let value = self.execute(Arc::new(command), MessageKind::Command).await?;
        Self::downcast_response(value)
    }

    /// Dispatch a query and return its response.
    pub async fn query<Q, R>(&self, query: Q) -> Result<R, ProcessingError>
    where
        Q: Query,
        R: Clone + Send + Sync + 'static,
    {
        let value = self.execute(Arc::new(query), MessageKind::Query).await?;
        Self::downcast_response(value)
    }

    /// Publish an event to all registered handlers and saga routes.
    pub async fn publish<E: Event>(&self, event: E) -> Result<(), ProcessingError> {
        self.execute(Arc::new(event), MessageKind::Event)
            .await
            .map(|_| ())
    }

    /// Publish an already-shared event.
    pub async fn publish_arc(&self, event: Arc<dyn Message>) -> Result<(), ProcessingError> {
        self.execute(event, MessageKind::Event).await.map(|_| ())
    }

    /// Dispatch a batch of commands, preserving per-message results.
    pub async fn send_batch<C: Command>(
        &self,
        commands: Vec<C>,
    ) -> Vec<Result<(), ProcessingError>> {
        let mut results = Vec::with_capacity(commands.len());
        for command in commands {
            results.push(self.send(command).await);
        }
        results
    }

    /// Publish a batch of events, preserving per-message results.
    pub async fn publish_batch<E: Event>(
        &self,
        events: Vec<E>,
    ) -> Vec<Result<(), ProcessingError>> {
        let mut results = Vec::with_capacity(events.len());
        for event in events {
            results.push(self.publish(event).await);
        }
        results
    }

    /// The in-memory transport facade.
    pub fn transport(&self) -> &Arc<InMemoryTransport> {
        &self.transport
    }

    /// Shared resilience policy for wrapping collaborator calls.
    pub fn resilience(&self) -> &Arc<ResiliencePolicy> {
        &self.resilience
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Transport health snapshot.
    pub async fn health(&self) -> TransportHealth {
        self.transport.health().await
    }

    async fn execute(
        &self,
        message: Arc<dyn Message>,
        kind: MessageKind,
    ) -> Result<Option<crate::message::ResponseValue>, ProcessingError> {
        let mut ctx =
            ProcessingContext::with_cancellation(message, kind, self.cancel.child_token());
        self.pipeline.execute(&mut ctx).await
    }

    fn downcast_response<R: Clone + Send + Sync + 'static>(
        value: Option<crate::message::ResponseValue>,
    ) -> Result<R, ProcessingError> {
        value
            .and_then(|v| v.downcast::<R>())
            .ok_or_else(|| {
                ProcessingError::fatal(format!(
                    "handler response did not match expected type {}",
                    std::any::type_name::<R>()
                ))
            })
    }
}
