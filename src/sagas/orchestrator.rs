//! Event-driven saga state advancement.

use std::any::TypeId;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::state_machine::{CompensationArgs, SagaContext, StateMachineDefinition};
use super::{CompensationStack, Result, SagaData, SagaError, SagaEventRoute, SagaInstance};
use crate::interfaces::SagaRepository;
use crate::message::{HandlerContext, Message, ProcessingError};

/// Selector extracting the correlation id from an event when the event's
/// own correlation id field is not the grouping key.
pub type CorrelationExtractor = Arc<dyn Fn(&dyn Message) -> Option<String> + Send + Sync>;

/// Orchestrator configuration.
#[derive(Clone, Default)]
pub struct SagaOptions {
    /// Stop compensating after the first failed undo action.
    pub stop_compensation_on_first_error: bool,
    /// Custom correlation extraction; defaults to the event's
    /// correlation id.
    pub correlation_extractor: Option<CorrelationExtractor>,
}

/// What an event did to a saga.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SagaOutcome {
    /// No saga matched and the event starts none, the saga was already
    /// completed, or no transition matched the current state.
    Ignored,
    /// A new saga instance was created and advanced.
    Started { state: String, completed: bool },
    /// An existing saga advanced.
    Advanced { state: String, completed: bool },
}

/// Stateless coordinator: fetches the saga for an event's correlation
/// id, runs the matching transition, and persists the result. Holds a
/// lookup-only reference to the repository; the repository owns
/// persistence.
pub struct SagaOrchestrator<D: SagaData> {
    definition: Arc<StateMachineDefinition<D>>,
    repository: Arc<dyn SagaRepository<D>>,
    options: SagaOptions,
}

impl<D: SagaData> SagaOrchestrator<D> {
    pub fn new(
        definition: StateMachineDefinition<D>,
        repository: Arc<dyn SagaRepository<D>>,
    ) -> Self {
        Self::with_options(definition, repository, SagaOptions::default())
    }

    pub fn with_options(
        definition: StateMachineDefinition<D>,
        repository: Arc<dyn SagaRepository<D>>,
        options: SagaOptions,
    ) -> Self {
        Self {
            definition: Arc::new(definition),
            repository,
            options,
        }
    }

    pub fn definition(&self) -> &StateMachineDefinition<D> {
        &self.definition
    }

    /// Process one event against the saga it correlates to.
    ///
    /// Absent sagas are created when the event appears in the initial
    /// transitions; unmatched events are logged and ignored. Action
    /// failures run the compensation stack in LIFO order, persist the
    /// touched saga, and surface the failure to the caller. Repository
    /// concurrency conflicts propagate for the caller to decide.
    pub async fn handle_event(
        &self,
        event: Arc<dyn Message>,
        cancellation: CancellationToken,
    ) -> Result<SagaOutcome> {
        if cancellation.is_cancelled() {
            return Err(SagaError::Cancelled);
        }

        let correlation_id = self
            .extract_correlation(event.as_ref())
            .ok_or_else(|| SagaError::MissingCorrelation(event.message_type().to_string()))?;
        let event_type = event.as_any().type_id();

        let (saga, created) = match self.repository.get(&correlation_id).await? {
            Some(existing) => {
                if existing.is_completed() {
                    debug!(
                        saga = %self.definition.saga_name(),
                        correlation_id = %correlation_id,
                        "Event for completed saga ignored"
                    );
                    return Ok(SagaOutcome::Ignored);
                }
                (existing, false)
            }
            None => {
                if !self.definition.starts_on(event_type) {
                    debug!(
                        saga = %self.definition.saga_name(),
                        correlation_id = %correlation_id,
                        event = %event.message_type(),
                        "Event matches no saga and starts none; ignored"
                    );
                    return Ok(SagaOutcome::Ignored);
                }
                let instance = SagaInstance::new(
                    correlation_id.clone(),
                    self.definition.initial_state(),
                    D::default(),
                );
                self.repository.create(&instance).await?;
                info!(
                    saga = %self.definition.saga_name(),
                    correlation_id = %correlation_id,
                    "Saga started"
                );
                (instance, true)
            }
        };

        let Some(transition) = self.definition.transition_for(saga.state(), event_type) else {
            // Not an error: the workflow is simply not interested in
            // this event right now.
            debug!(
                saga = %self.definition.saga_name(),
                correlation_id = %correlation_id,
                state = %saga.state(),
                event = %event.message_type(),
                "No transition for event in current state; ignored"
            );
            return Ok(SagaOutcome::Ignored);
        };

        let mut context = SagaContext::new(saga, Arc::clone(&event), cancellation.clone());

        // Actions compose sequentially in declaration order.
        let mut failure: Option<SagaError> = None;
        for action in &transition.actions {
            if let Err(e) = action(&mut context).await {
                failure = Some(e);
                break;
            }
        }

        let target_state = transition.target_state.clone();
        let mut saga = context.into_saga();

        if let Some(failure) = failure {
            warn!(
                saga = %self.definition.saga_name(),
                correlation_id = %correlation_id,
                error = %failure,
                registered_compensations = saga.compensations().len(),
                "Transition action failed; compensating"
            );
            let stack = self.build_compensation_stack(&saga);
            let report = stack
                .compensate(
                    cancellation,
                    self.options.stop_compensation_on_first_error,
                )
                .await;
            if !report.succeeded() {
                error!(
                    saga = %self.definition.saga_name(),
                    correlation_id = %correlation_id,
                    executed = report.executed.len(),
                    failed = report.failed.len(),
                    skipped = report.skipped,
                    "Compensation finished with failures"
                );
            }

            // Compensated steps are spent; the failed attempt still
            // counts as activity on the saga.
            saga.clear_compensations();
            saga.touch();
            if let Err(e) = self.repository.update(&saga).await {
                warn!(
                    saga = %self.definition.saga_name(),
                    correlation_id = %correlation_id,
                    error = %e,
                    "Failed to persist saga after action failure"
                );
            }
            return Err(failure);
        }

        if let Some(target) = target_state {
            if self.definition.is_final_state(&target) {
                saga.set_state(&target);
                // Completion is flagged before the final persist.
                saga.complete();
            } else {
                saga.set_state(&target);
            }
        } else {
            saga.touch();
        }

        self.repository.update(&saga).await?;
        debug!(
            saga = %self.definition.saga_name(),
            correlation_id = %correlation_id,
            state = %saga.state(),
            completed = saga.is_completed(),
            "Saga advanced"
        );

        let outcome = if created {
            SagaOutcome::Started {
                state: saga.state().to_string(),
                completed: saga.is_completed(),
            }
        } else {
            SagaOutcome::Advanced {
                state: saga.state().to_string(),
                completed: saga.is_completed(),
            }
        };
        Ok(outcome)
    }

    fn extract_correlation(&self, event: &dyn Message) -> Option<String> {
        match &self.options.correlation_extractor {
            Some(extractor) => extractor(event),
            None => event.correlation_id().map(str::to_owned),
        }
    }

    /// Materialize the saga's persisted compensation names into an
    /// executable LIFO stack using the definition's handlers.
    fn build_compensation_stack(&self, saga: &SagaInstance<D>) -> CompensationStack {
        let mut stack = CompensationStack::new();
        for name in saga.compensations() {
            match self.definition.compensation_handler(name) {
                Some(handler) => {
                    let handler = Arc::clone(handler);
                    let args_data = saga.data.clone();
                    let correlation_id = saga.correlation_id().to_string();
                    stack.register(
                        name.clone(),
                        Box::new(move |cancellation| {
                            handler(CompensationArgs {
                                data: args_data,
                                correlation_id,
                                cancellation,
                            })
                        }),
                    );
                }
                None => {
                    let missing = name.clone();
                    stack.register(
                        name.clone(),
                        Box::new(move |_cancellation| {
                            Box::pin(async move {
                                Err(SagaError::action(format!(
                                    "no compensation handler declared for '{}'",
                                    missing
                                )))
                            })
                        }),
                    );
                }
            }
        }
        stack
    }
}

#[async_trait]
impl<D: SagaData> SagaEventRoute for SagaOrchestrator<D> {
    fn route_name(&self) -> &str {
        self.definition.saga_name()
    }

    fn accepts(&self, event_type: TypeId) -> bool {
        self.definition.handles_event(event_type)
    }

    async fn dispatch_event(
        &self,
        event: Arc<dyn Message>,
        ctx: &HandlerContext,
    ) -> std::result::Result<(), ProcessingError> {
        match self.handle_event(event, ctx.cancellation.clone()).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_concurrency() => Err(ProcessingError::Concurrency(e.to_string())),
            Err(SagaError::Cancelled) => Err(ProcessingError::Cancelled),
            Err(e) => Err(ProcessingError::fatal_with_source(
                format!("saga '{}' failed", self.definition.saga_name()),
                Box::new(e),
            )),
        }
    }
}
