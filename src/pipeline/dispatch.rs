//! Terminal dispatch: type-token handler registry and invocation.
//!
//! Handler registries are maps from a type-identity token to a
//! type-erased invoker closure; the closure downcasts and calls the
//! typed handler, so no runtime reflection is involved.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::{debug, warn};

use crate::message::{
    Command, Event, HandlerContext, Message, MessageKind, ProcessingContext, ProcessingError,
    ProcessingResult, Query, ResponseValue,
};
use crate::sagas::SagaEventRoute;

/// Errors raised during handler registration.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("A handler for '{message_type}' is already registered")]
    Duplicate { message_type: &'static str },
}

/// Handler for a command of type `C`.
#[async_trait]
pub trait CommandHandler<C: Command>: Send + Sync {
    /// Response returned to the caller; `()` for fire-and-forget.
    type Response: Send + Sync + 'static;

    async fn handle(
        &self,
        command: &C,
        ctx: &HandlerContext,
    ) -> Result<Self::Response, ProcessingError>;
}

/// Handler for a query of type `Q`. Contractually read-only.
#[async_trait]
pub trait QueryHandler<Q: Query>: Send + Sync {
    type Response: Send + Sync + 'static;

    async fn handle(
        &self,
        query: &Q,
        ctx: &HandlerContext,
    ) -> Result<Self::Response, ProcessingError>;
}

/// Handler for an event of type `E`. Zero or more per event type.
#[async_trait]
pub trait EventHandler<E: Event>: Send + Sync {
    async fn handle(&self, event: &E, ctx: &HandlerContext) -> Result<(), ProcessingError>;

    /// Name used when aggregating failures.
    fn name(&self) -> &'static str
    where
        Self: Sized,
    {
        std::any::type_name::<Self>()
    }
}

type Invoker =
    Arc<dyn Fn(Arc<dyn Message>, HandlerContext) -> BoxFuture<'static, ProcessingResult> + Send + Sync>;

struct HandlerEntry {
    name: String,
    invoke: Invoker,
}

/// Registry of command/query/event handlers keyed by message type token.
#[derive(Default)]
pub struct HandlerRegistry {
    commands: RwLock<HashMap<TypeId, HandlerEntry>>,
    queries: RwLock<HashMap<TypeId, HandlerEntry>>,
    events: RwLock<HashMap<TypeId, Vec<HandlerEntry>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the single handler for command type `C`.
    pub fn register_command<C, H>(&self, handler: H) -> Result<(), RegistryError>
    where
        C: Command,
        H: CommandHandler<C> + 'static,
    {
        let mut commands = self.commands.write().expect("registry lock poisoned");
        if commands.contains_key(&TypeId::of::<C>()) {
            return Err(RegistryError::Duplicate {
                message_type: std::any::type_name::<C>(),
            });
        }
        let handler = Arc::new(handler);
        let invoke: Invoker = Arc::new(move |message, ctx| {
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                let Some(command) = message.as_any().downcast_ref::<C>() else {
                    return Err(ProcessingError::fatal(format!(
                        "command handler expected {}",
                        std::any::type_name::<C>()
                    )));
                };
                let response = handler.handle(command, &ctx).await?;
                Ok(Some(ResponseValue::new(response)))
            })
        });
        commands.insert(
            TypeId::of::<C>(),
            HandlerEntry {
                name: std::any::type_name::<H>().to_string(),
                invoke,
            },
        );
        debug!(command = std::any::type_name::<C>(), "Command handler registered");
        Ok(())
    }

    /// Register the single handler for query type `Q`.
    pub fn register_query<Q, H>(&self, handler: H) -> Result<(), RegistryError>
    where
        Q: Query,
        H: QueryHandler<Q> + 'static,
    {
        let mut queries = self.queries.write().expect("registry lock poisoned");
        if queries.contains_key(&TypeId::of::<Q>()) {
            return Err(RegistryError::Duplicate {
                message_type: std::any::type_name::<Q>(),
            });
        }
        let handler = Arc::new(handler);
        let invoke: Invoker = Arc::new(move |message, ctx| {
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                let Some(query) = message.as_any().downcast_ref::<Q>() else {
                    return Err(ProcessingError::fatal(format!(
                        "query handler expected {}",
                        std::any::type_name::<Q>()
                    )));
                };
                let response = handler.handle(query, &ctx).await?;
                Ok(Some(ResponseValue::new(response)))
            })
        });
        queries.insert(
            TypeId::of::<Q>(),
            HandlerEntry {
                name: std::any::type_name::<H>().to_string(),
                invoke,
            },
        );
        debug!(query = std::any::type_name::<Q>(), "Query handler registered");
        Ok(())
    }

    /// Register an additional handler for event type `E`.
    pub fn register_event<E, H>(&self, handler: H)
    where
        E: Event,
        H: EventHandler<E> + 'static,
    {
        let name = handler.name().to_string();
        let handler = Arc::new(handler);
        let invoke: Invoker = Arc::new(move |message, ctx| {
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                let Some(event) = message.as_any().downcast_ref::<E>() else {
                    return Err(ProcessingError::fatal(format!(
                        "event handler expected {}",
                        std::any::type_name::<E>()
                    )));
                };
                handler.handle(event, &ctx).await?;
                Ok(None)
            })
        });

        let mut events = self.events.write().expect("registry lock poisoned");
        events
            .entry(TypeId::of::<E>())
            .or_default()
            .push(HandlerEntry { name, invoke });
        debug!(event = std::any::type_name::<E>(), "Event handler registered");
    }

    fn command_entry(&self, type_id: TypeId) -> Option<(String, Invoker)> {
        let commands = self.commands.read().expect("registry lock poisoned");
        commands
            .get(&type_id)
            .map(|e| (e.name.clone(), Arc::clone(&e.invoke)))
    }

    fn query_entry(&self, type_id: TypeId) -> Option<(String, Invoker)> {
        let queries = self.queries.read().expect("registry lock poisoned");
        queries
            .get(&type_id)
            .map(|e| (e.name.clone(), Arc::clone(&e.invoke)))
    }

    fn event_entries(&self, type_id: TypeId) -> Vec<(String, Invoker)> {
        let events = self.events.read().expect("registry lock poisoned");
        events
            .get(&type_id)
            .map(|entries| {
                entries
                    .iter()
                    .map(|e| (e.name.clone(), Arc::clone(&e.invoke)))
                    .collect()
            })
            .unwrap_or_default()
    }

}

/// Terminal end of the pipeline.
#[async_trait]
pub trait TerminalDispatcher: Send + Sync {
    async fn dispatch(&self, ctx: &mut ProcessingContext) -> ProcessingResult;
}

/// Default terminal dispatcher over a [`HandlerRegistry`] plus the saga
/// routes fed from the event bus.
pub struct Dispatcher {
    registry: Arc<HandlerRegistry>,
    saga_routes: Vec<Arc<dyn SagaEventRoute>>,
}

impl Dispatcher {
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self {
            registry,
            saga_routes: Vec::new(),
        }
    }

    pub fn with_saga_routes(
        registry: Arc<HandlerRegistry>,
        saga_routes: Vec<Arc<dyn SagaEventRoute>>,
    ) -> Self {
        Self {
            registry,
            saga_routes,
        }
    }

    async fn dispatch_single(
        &self,
        ctx: &ProcessingContext,
        entry: Option<(String, Invoker)>,
        kind: &'static str,
    ) -> ProcessingResult {
        let message = Arc::clone(ctx.message());
        let Some((name, invoke)) = entry else {
            return Err(ProcessingError::fatal(format!(
                "no {} handler registered for '{}'",
                kind,
                message.message_type()
            )));
        };
        debug!(
            handler = %name,
            message_type = %message.message_type(),
            "Dispatching to handler"
        );
        invoke(message, ctx.handler_context()).await
    }

    async fn dispatch_event(&self, ctx: &ProcessingContext) -> ProcessingResult {
        let message = Arc::clone(ctx.message());
        let type_id = message.as_any().type_id();
        let handler_context = ctx.handler_context();

        let mut failures: Vec<(String, ProcessingError)> = Vec::new();
        let mut invoked = 0usize;

        for (name, invoke) in self.registry.event_entries(type_id) {
            invoked += 1;
            if let Err(error) = invoke(Arc::clone(&message), handler_context.clone()).await {
                warn!(handler = %name, error = %error, "Event handler failed");
                failures.push((name, error));
            }
        }

        for route in self
            .saga_routes
            .iter()
            .filter(|route| route.accepts(type_id))
        {
            invoked += 1;
            if let Err(error) = route
                .dispatch_event(Arc::clone(&message), &handler_context)
                .await
            {
                warn!(saga = %route.route_name(), error = %error, "Saga route failed");
                failures.push((route.route_name().to_string(), error));
            }
        }

        if invoked == 0 {
            debug!(
                message_type = %message.message_type(),
                "Event has no handlers"
            );
        }

        // The event succeeds iff every handler succeeded; failures are
        // signaled so retry/outbox layers can redeliver.
        if failures.is_empty() {
            return Ok(None);
        }
        if failures.len() == 1 {
            let (_, error) = failures.swap_remove(0);
            return Err(error);
        }
        let transient = failures.iter().any(|(_, e)| e.is_transient());
        let detail = failures
            .iter()
            .map(|(name, error)| format!("{}: {}", name, error))
            .collect::<Vec<_>>()
            .join("; ");
        let message = format!("{} event handlers failed: {}", failures.len(), detail);
        if transient {
            Err(ProcessingError::transient(message))
        } else {
            Err(ProcessingError::fatal(message))
        }
    }
}

#[async_trait]
impl TerminalDispatcher for Dispatcher {
    async fn dispatch(&self, ctx: &mut ProcessingContext) -> ProcessingResult {
        if ctx.is_cancelled() {
            return Err(ProcessingError::Cancelled);
        }
        let type_id = ctx.message().as_any().type_id();
        match ctx.kind() {
            MessageKind::Command => {
                self.dispatch_single(ctx, self.registry.command_entry(type_id), "command")
                    .await
            }
            MessageKind::Query => {
                self.dispatch_single(ctx, self.registry.query_entry(type_id), "query")
                    .await
            }
            MessageKind::Event => self.dispatch_event(ctx).await,
        }
    }
}
