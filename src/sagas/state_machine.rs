//! State-machine definition and builder DSL.
//!
//! A saga type is configured once at startup:
//!
//! ```ignore
//! let definition = StateMachineDefinition::<OrderData>::builder("order", "Pending")
//!     .initially()
//!     .when::<OrderCreated>()
//!     .then(|ctx: &mut SagaContext<OrderData>| Box::pin(async move {
//!         ctx.saga.data.reserved = true;
//!         Ok(())
//!     }))
//!     .transition_to("Created")
//!     .during("Created")
//!     .when::<PaymentSucceeded>()
//!     .transition_to("Completed")
//!     .finalize()
//!     .build()?;
//! ```
//!
//! Multiple `then` calls on one transition compose sequentially in
//! declaration order. `finalize` marks the target state as final;
//! entering it flags the saga completed.

use std::any::TypeId;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use super::{Result, SagaError, SagaInstance, TIMED_OUT_STATE};
use crate::message::Message;

/// Execution context handed to transition actions.
///
/// Owns the saga instance for the duration of one event's processing;
/// actions mutate `saga.data` directly and register compensations by
/// name as their step takes effect.
pub struct SagaContext<D> {
    pub saga: SagaInstance<D>,
    event: Arc<dyn Message>,
    pub cancellation: CancellationToken,
}

impl<D> SagaContext<D> {
    pub(crate) fn new(
        saga: SagaInstance<D>,
        event: Arc<dyn Message>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            saga,
            event,
            cancellation,
        }
    }

    /// The triggering event, downcast to its concrete type.
    pub fn event<E: Message>(&self) -> Option<&E> {
        self.event.as_any().downcast_ref::<E>()
    }

    pub fn raw_event(&self) -> &Arc<dyn Message> {
        &self.event
    }

    /// Record the named undo for the step this action performs. The
    /// handler is declared on the definition via
    /// [`StateMachineBuilder::compensation`] and runs if a later action
    /// of this saga fails.
    pub fn register_compensation(&mut self, name: impl Into<String>) {
        self.saga.register_compensation(name);
    }

    pub(crate) fn into_saga(self) -> SagaInstance<D> {
        self.saga
    }
}

/// Arguments handed to a compensation handler.
pub struct CompensationArgs<D> {
    /// Saga payload at the time of the failure.
    pub data: D,
    pub correlation_id: String,
    pub cancellation: CancellationToken,
}

/// Undo handler declared on the definition for one compensation name.
pub type CompensationHandler<D> =
    Arc<dyn Fn(CompensationArgs<D>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// A transition action: borrows the context, may suspend.
pub type SagaAction<D> =
    Arc<dyn for<'a> Fn(&'a mut SagaContext<D>) -> BoxFuture<'a, Result<()>> + Send + Sync>;

pub(crate) struct Transition<D> {
    pub event_type: TypeId,
    pub event_name: &'static str,
    pub target_state: Option<String>,
    pub actions: Vec<SagaAction<D>>,
}

/// Immutable state machine for one saga type.
pub struct StateMachineDefinition<D> {
    saga_name: String,
    initial_state: String,
    transitions: HashMap<String, Vec<Transition<D>>>,
    final_states: HashSet<String>,
    compensation_handlers: HashMap<String, CompensationHandler<D>>,
}

impl<D> StateMachineDefinition<D> {
    pub fn builder(
        saga_name: impl Into<String>,
        initial_state: impl Into<String>,
    ) -> StateMachineBuilder<D> {
        StateMachineBuilder::new(saga_name, initial_state)
    }

    pub fn saga_name(&self) -> &str {
        &self.saga_name
    }

    pub fn initial_state(&self) -> &str {
        &self.initial_state
    }

    pub fn is_final_state(&self, state: &str) -> bool {
        self.final_states.contains(state)
    }

    /// Whether the event type appears in the initial transitions,
    /// i.e. creates a saga instance when none exists.
    pub fn starts_on(&self, event_type: TypeId) -> bool {
        self.transitions
            .get(&self.initial_state)
            .is_some_and(|ts| ts.iter().any(|t| t.event_type == event_type))
    }

    /// Whether any state reacts to the event type.
    pub fn handles_event(&self, event_type: TypeId) -> bool {
        self.transitions
            .values()
            .any(|ts| ts.iter().any(|t| t.event_type == event_type))
    }

    pub(crate) fn transition_for(
        &self,
        state: &str,
        event_type: TypeId,
    ) -> Option<&Transition<D>> {
        self.transitions
            .get(state)?
            .iter()
            .find(|t| t.event_type == event_type)
    }

    pub(crate) fn compensation_handler(&self, name: &str) -> Option<&CompensationHandler<D>> {
        self.compensation_handlers.get(name)
    }
}

struct PendingTransition<D> {
    scope: String,
    event_type: TypeId,
    event_name: &'static str,
    target_state: Option<String>,
    finalize: bool,
    actions: Vec<SagaAction<D>>,
}

/// Fluent builder for a [`StateMachineDefinition`].
pub struct StateMachineBuilder<D> {
    saga_name: String,
    initial_state: String,
    transitions: HashMap<String, Vec<Transition<D>>>,
    final_states: HashSet<String>,
    compensation_handlers: HashMap<String, CompensationHandler<D>>,
    scope: String,
    pending: Option<PendingTransition<D>>,
    errors: Vec<String>,
}

impl<D> StateMachineBuilder<D> {
    fn new(saga_name: impl Into<String>, initial_state: impl Into<String>) -> Self {
        let initial_state = initial_state.into();
        Self {
            saga_name: saga_name.into(),
            initial_state: initial_state.clone(),
            transitions: HashMap::new(),
            final_states: HashSet::new(),
            compensation_handlers: HashMap::new(),
            scope: initial_state,
            pending: None,
            errors: Vec::new(),
        }
    }

    /// Declare the undo handler behind a compensation name that actions
    /// register with [`SagaContext::register_compensation`].
    pub fn compensation<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(CompensationArgs<D>) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
    {
        let name = name.into();
        if self
            .compensation_handlers
            .insert(name.clone(), Arc::new(handler))
            .is_some()
        {
            self.errors
                .push(format!("compensation '{}' declared twice", name));
        }
        self
    }

    /// Scope the following transitions to the initial state. Events
    /// matched here create the saga instance when none exists.
    pub fn initially(mut self) -> Self {
        self.commit_pending();
        self.scope = self.initial_state.clone();
        self
    }

    /// Scope the following transitions to the named state.
    pub fn during(mut self, state: impl Into<String>) -> Self {
        self.commit_pending();
        self.scope = state.into();
        self
    }

    /// Begin a transition triggered by event type `E`.
    pub fn when<E: Message>(mut self) -> TransitionBuilder<D> {
        self.commit_pending();
        self.pending = Some(PendingTransition {
            scope: self.scope.clone(),
            event_type: TypeId::of::<E>(),
            event_name: std::any::type_name::<E>(),
            target_state: None,
            finalize: false,
            actions: Vec::new(),
        });
        TransitionBuilder { builder: self }
    }

    fn commit_pending(&mut self) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        if pending.finalize {
            match &pending.target_state {
                Some(target) => {
                    self.final_states.insert(target.clone());
                }
                None => self.errors.push(format!(
                    "transition on '{}' is finalized but has no target state",
                    pending.event_name
                )),
            }
        }
        let duplicate = self
            .transitions
            .get(&pending.scope)
            .is_some_and(|ts| ts.iter().any(|t| t.event_type == pending.event_type));
        if duplicate {
            self.errors.push(format!(
                "state '{}' already handles '{}'",
                pending.scope, pending.event_name
            ));
            return;
        }
        self.transitions
            .entry(pending.scope)
            .or_default()
            .push(Transition {
                event_type: pending.event_type,
                event_name: pending.event_name,
                target_state: pending.target_state,
                actions: pending.actions,
            });
    }

    /// Validate and freeze the definition.
    pub fn build(mut self) -> Result<StateMachineDefinition<D>> {
        self.commit_pending();

        if !self.errors.is_empty() {
            return Err(SagaError::Definition(self.errors.join("; ")));
        }
        if self
            .transitions
            .get(&self.initial_state)
            .map_or(true, |ts| ts.is_empty())
        {
            return Err(SagaError::Definition(format!(
                "saga '{}' has no initial transitions",
                self.saga_name
            )));
        }

        // Every transition target must be a declared state: one with its
        // own transitions, a final state, or the timeout sentinel.
        for (state, transitions) in &self.transitions {
            for transition in transitions {
                let Some(target) = &transition.target_state else {
                    continue;
                };
                let known = self.transitions.contains_key(target)
                    || self.final_states.contains(target)
                    || target == TIMED_OUT_STATE;
                if !known {
                    return Err(SagaError::Definition(format!(
                        "transition '{}' -> '{}' (on {}) targets an undeclared state",
                        state, target, transition.event_name
                    )));
                }
            }
        }

        Ok(StateMachineDefinition {
            saga_name: self.saga_name,
            initial_state: self.initial_state,
            transitions: self.transitions,
            final_states: self.final_states,
            compensation_handlers: self.compensation_handlers,
        })
    }
}

/// Builder scoped to one transition under construction.
pub struct TransitionBuilder<D> {
    builder: StateMachineBuilder<D>,
}

impl<D> TransitionBuilder<D> {
    /// Append an action; multiple actions compose sequentially in
    /// declaration order.
    pub fn then<F>(mut self, action: F) -> Self
    where
        F: for<'a> Fn(&'a mut SagaContext<D>) -> BoxFuture<'a, Result<()>>
            + Send
            + Sync
            + 'static,
    {
        if let Some(pending) = self.builder.pending.as_mut() {
            pending.actions.push(Arc::new(action));
        }
        self
    }

    /// Assign the target state for this transition.
    pub fn transition_to(mut self, state: impl Into<String>) -> Self {
        if let Some(pending) = self.builder.pending.as_mut() {
            pending.target_state = Some(state.into());
        }
        self
    }

    /// Mark the target state final; entering it completes the saga.
    pub fn finalize(mut self) -> Self {
        if let Some(pending) = self.builder.pending.as_mut() {
            pending.finalize = true;
        }
        self
    }

    /// Scope the following transitions to the initial state.
    pub fn initially(self) -> StateMachineBuilder<D> {
        self.builder.initially()
    }

    /// Scope the following transitions to the named state.
    pub fn during(self, state: impl Into<String>) -> StateMachineBuilder<D> {
        self.builder.during(state)
    }

    /// Declare a compensation handler on the definition, closing the
    /// current transition.
    pub fn compensation<F>(mut self, name: impl Into<String>, handler: F) -> StateMachineBuilder<D>
    where
        F: Fn(CompensationArgs<D>) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
    {
        self.builder.commit_pending();
        self.builder.compensation(name, handler)
    }

    /// Begin another transition in the current scope.
    pub fn when<E: Message>(self) -> TransitionBuilder<D> {
        self.builder.when::<E>()
    }

    /// Validate and freeze the definition.
    pub fn build(self) -> Result<StateMachineDefinition<D>> {
        self.builder.build()
    }
}
