use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::*;
use crate::interfaces::SagaRepository;
use crate::storage::InMemorySagaRepository;

#[derive(Debug, Clone, Default)]
struct OrderData {
    reserved: bool,
    paid: bool,
}

#[derive(Debug, Clone)]
struct OrderCreated {
    id: Uuid,
    correlation: String,
}

impl OrderCreated {
    fn new(correlation: &str) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            correlation: correlation.to_string(),
        })
    }
}

impl Message for OrderCreated {
    fn message_id(&self) -> Uuid {
        self.id
    }
    fn timestamp(&self) -> DateTime<Utc> {
        Utc::now()
    }
    fn correlation_id(&self) -> Option<&str> {
        Some(&self.correlation)
    }
    fn message_type(&self) -> &'static str {
        "OrderCreated"
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[derive(Debug, Clone)]
struct PaymentSucceeded {
    id: Uuid,
    correlation: String,
}

impl PaymentSucceeded {
    fn new(correlation: &str) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            correlation: correlation.to_string(),
        })
    }
}

impl Message for PaymentSucceeded {
    fn message_id(&self) -> Uuid {
        self.id
    }
    fn timestamp(&self) -> DateTime<Utc> {
        Utc::now()
    }
    fn correlation_id(&self) -> Option<&str> {
        Some(&self.correlation)
    }
    fn message_type(&self) -> &'static str {
        "PaymentSucceeded"
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[derive(Debug, Clone)]
struct UnrelatedEvent {
    id: Uuid,
    correlation: String,
}

impl Message for UnrelatedEvent {
    fn message_id(&self) -> Uuid {
        self.id
    }
    fn timestamp(&self) -> DateTime<Utc> {
        Utc::now()
    }
    fn correlation_id(&self) -> Option<&str> {
        Some(&self.correlation)
    }
    fn message_type(&self) -> &'static str {
        "UnrelatedEvent"
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Order saga: reserve on creation (with a declared undo), complete on
/// payment.
fn order_definition(
    compensation_runs: Arc<AtomicU32>,
    fail_payment: bool,
) -> StateMachineDefinition<OrderData> {
    StateMachineDefinition::<OrderData>::builder("order", "Pending")
        .compensation("cancel-reservation", move |_args| {
            let compensation_runs = Arc::clone(&compensation_runs);
            Box::pin(async move {
                compensation_runs.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
        .initially()
        .when::<OrderCreated>()
        .then(move |ctx: &mut SagaContext<OrderData>| {
            Box::pin(async move {
                ctx.saga.data.reserved = true;
                ctx.register_compensation("cancel-reservation");
                Ok(())
            })
        })
        .transition_to("Created")
        .during("Created")
        .when::<PaymentSucceeded>()
        .then(move |ctx: &mut SagaContext<OrderData>| {
            Box::pin(async move {
                if fail_payment {
                    return Err(SagaError::action("payment processor unreachable"));
                }
                ctx.saga.data.paid = true;
                Ok(())
            })
        })
        .transition_to("Completed")
        .finalize()
        .build()
        .expect("definition must build")
}

fn orchestrator(
    definition: StateMachineDefinition<OrderData>,
) -> (
    SagaOrchestrator<OrderData>,
    Arc<InMemorySagaRepository<OrderData>>,
) {
    let repository = Arc::new(InMemorySagaRepository::new());
    (
        SagaOrchestrator::new(definition, repository.clone()),
        repository,
    )
}

// ============================================================================
// Builder validation
// ============================================================================

#[test]
fn test_builder_rejects_missing_initial_transitions() {
    let result = StateMachineDefinition::<OrderData>::builder("order", "Pending")
        .during("Other")
        .when::<OrderCreated>()
        .transition_to("Other")
        .build();
    assert!(matches!(result, Err(SagaError::Definition(_))));
}

#[test]
fn test_builder_rejects_undeclared_target() {
    let result = StateMachineDefinition::<OrderData>::builder("order", "Pending")
        .initially()
        .when::<OrderCreated>()
        .transition_to("Nowhere")
        .build();
    assert!(matches!(result, Err(SagaError::Definition(_))));
}

#[test]
fn test_builder_rejects_duplicate_trigger_in_state() {
    let result = StateMachineDefinition::<OrderData>::builder("order", "Pending")
        .initially()
        .when::<OrderCreated>()
        .transition_to("Done")
        .finalize()
        .when::<OrderCreated>()
        .transition_to("Done")
        .finalize()
        .build();
    assert!(matches!(result, Err(SagaError::Definition(_))));
}

#[test]
fn test_definition_metadata() {
    let definition = order_definition(Arc::new(AtomicU32::new(0)), false);
    assert_eq!(definition.saga_name(), "order");
    assert_eq!(definition.initial_state(), "Pending");
    assert!(definition.is_final_state("Completed"));
    assert!(!definition.is_final_state("Created"));
    assert!(definition.starts_on(std::any::TypeId::of::<OrderCreated>()));
    assert!(!definition.starts_on(std::any::TypeId::of::<PaymentSucceeded>()));
    assert!(definition.handles_event(std::any::TypeId::of::<PaymentSucceeded>()));
}

// ============================================================================
// Orchestration
// ============================================================================

#[tokio::test]
async fn test_happy_path_creates_advances_and_completes() {
    let compensations = Arc::new(AtomicU32::new(0));
    let (orchestrator, repository) = orchestrator(order_definition(compensations.clone(), false));

    let outcome = orchestrator
        .handle_event(OrderCreated::new("C1"), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(
        outcome,
        SagaOutcome::Started {
            state: "Created".into(),
            completed: false
        }
    );

    let saga = repository.get("C1").await.unwrap().unwrap();
    assert_eq!(saga.state(), "Created");
    assert!(!saga.is_completed());
    assert!(saga.data.reserved);
    assert!(saga.updated_at() >= saga.created_at());
    // One compensation registered, none run.
    assert_eq!(saga.compensations(), ["cancel-reservation"]);
    assert_eq!(compensations.load(Ordering::SeqCst), 0);

    let outcome = orchestrator
        .handle_event(PaymentSucceeded::new("C1"), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(
        outcome,
        SagaOutcome::Advanced {
            state: "Completed".into(),
            completed: true
        }
    );

    let saga = repository.get("C1").await.unwrap().unwrap();
    assert_eq!(saga.state(), "Completed");
    assert!(saga.is_completed());
    assert!(saga.data.paid);
}

#[tokio::test]
async fn test_action_failure_compensates_and_surfaces() {
    let compensations = Arc::new(AtomicU32::new(0));
    let (orchestrator, repository) = orchestrator(order_definition(compensations.clone(), true));

    orchestrator
        .handle_event(OrderCreated::new("C1"), CancellationToken::new())
        .await
        .unwrap();
    let before = repository.get("C1").await.unwrap().unwrap().updated_at();

    tokio::time::sleep(Duration::from_millis(5)).await;
    let error = orchestrator
        .handle_event(PaymentSucceeded::new("C1"), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(error, SagaError::Action(_)));

    // The reservation undo registered by the creation step ran exactly
    // once.
    assert_eq!(compensations.load(Ordering::SeqCst), 1);

    let saga = repository.get("C1").await.unwrap().unwrap();
    assert_eq!(saga.state(), "Created");
    assert!(!saga.is_completed());
    // Spent compensations are cleared; the failed attempt still
    // progressed updated_at.
    assert!(saga.compensations().is_empty());
    assert!(saga.updated_at() > before);
}

#[tokio::test]
async fn test_failing_action_compensates_steps_of_same_attempt() {
    let compensations = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&compensations);
    let definition = StateMachineDefinition::<OrderData>::builder("order", "Pending")
        .compensation("cancel-reservation", move |_args| {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
        .initially()
        .when::<OrderCreated>()
        .then(move |ctx: &mut SagaContext<OrderData>| {
            Box::pin(async move {
                ctx.register_compensation("cancel-reservation");
                Err(SagaError::action("reservation service down"))
            })
        })
        .transition_to("Created")
        .during("Created")
        .when::<PaymentSucceeded>()
        .transition_to("Completed")
        .finalize()
        .build()
        .unwrap();

    let (orchestrator, repository) = orchestrator(definition);
    let error = orchestrator
        .handle_event(OrderCreated::new("C1"), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(error, SagaError::Action(_)));

    // The registered undo ran exactly once.
    assert_eq!(compensations.load(Ordering::SeqCst), 1);
    // The saga exists (created before the transition ran) and stayed in
    // its initial state.
    let saga = repository.get("C1").await.unwrap().unwrap();
    assert_eq!(saga.state(), "Pending");
}

#[tokio::test]
async fn test_unknown_compensation_name_reports_failure() {
    let definition = StateMachineDefinition::<OrderData>::builder("order", "Pending")
        .initially()
        .when::<OrderCreated>()
        .then(|ctx: &mut SagaContext<OrderData>| {
            Box::pin(async move {
                ctx.register_compensation("not-declared");
                Err(SagaError::action("boom"))
            })
        })
        .transition_to("Created")
        .during("Created")
        .when::<PaymentSucceeded>()
        .transition_to("Completed")
        .finalize()
        .build()
        .unwrap();

    let (orchestrator, _repository) = orchestrator(definition);
    // The missing handler is reported by the compensation run; the
    // original action failure still surfaces.
    let error = orchestrator
        .handle_event(OrderCreated::new("C1"), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(error, SagaError::Action(_)));
}

#[tokio::test]
async fn test_unmatched_event_is_ignored_not_error() {
    let (orchestrator, repository) = orchestrator(order_definition(Arc::new(AtomicU32::new(0)), false));

    // PaymentSucceeded does not start the saga.
    let outcome = orchestrator
        .handle_event(PaymentSucceeded::new("C1"), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome, SagaOutcome::Ignored);
    assert!(repository.get("C1").await.unwrap().is_none());

    // An event with no transition from the current state is ignored.
    orchestrator
        .handle_event(OrderCreated::new("C1"), CancellationToken::new())
        .await
        .unwrap();
    let outcome = orchestrator
        .handle_event(
            Arc::new(UnrelatedEvent {
                id: Uuid::new_v4(),
                correlation: "C1".into(),
            }),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(outcome, SagaOutcome::Ignored);
}

#[tokio::test]
async fn test_completed_saga_accepts_no_further_events() {
    let (orchestrator, repository) = orchestrator(order_definition(Arc::new(AtomicU32::new(0)), false));
    orchestrator
        .handle_event(OrderCreated::new("C1"), CancellationToken::new())
        .await
        .unwrap();
    orchestrator
        .handle_event(PaymentSucceeded::new("C1"), CancellationToken::new())
        .await
        .unwrap();

    let outcome = orchestrator
        .handle_event(PaymentSucceeded::new("C1"), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome, SagaOutcome::Ignored);
    assert!(repository.get("C1").await.unwrap().unwrap().is_completed());
}

#[tokio::test]
async fn test_missing_correlation_is_error() {
    #[derive(Debug)]
    struct Anonymous {
        id: Uuid,
    }
    impl Message for Anonymous {
        fn message_id(&self) -> Uuid {
            self.id
        }
        fn timestamp(&self) -> DateTime<Utc> {
            Utc::now()
        }
        fn message_type(&self) -> &'static str {
            "Anonymous"
        }
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    let (orchestrator, _) = orchestrator(order_definition(Arc::new(AtomicU32::new(0)), false));
    let error = orchestrator
        .handle_event(
            Arc::new(Anonymous { id: Uuid::new_v4() }),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(error, SagaError::MissingCorrelation(_)));
}

#[tokio::test]
async fn test_custom_correlation_extractor() {
    let repository = Arc::new(InMemorySagaRepository::new());
    let orchestrator = SagaOrchestrator::with_options(
        order_definition(Arc::new(AtomicU32::new(0)), false),
        repository.clone(),
        SagaOptions {
            correlation_extractor: Some(Arc::new(|event: &dyn Message| {
                // Group by type-qualified correlation.
                event
                    .correlation_id()
                    .map(|c| format!("order-{}", c))
            })),
            ..Default::default()
        },
    );

    orchestrator
        .handle_event(OrderCreated::new("C9"), CancellationToken::new())
        .await
        .unwrap();
    assert!(repository.get("order-C9").await.unwrap().is_some());
}

#[tokio::test]
async fn test_concurrent_update_surfaces_conflict() {
    let repository: Arc<InMemorySagaRepository<OrderData>> = Arc::new(InMemorySagaRepository::new());
    let repo_in_action = repository.clone();
    let definition = StateMachineDefinition::<OrderData>::builder("order", "Pending")
        .initially()
        .when::<OrderCreated>()
        .then(move |ctx: &mut SagaContext<OrderData>| {
            let repository = repo_in_action.clone();
            let correlation_id = ctx.saga.correlation_id().to_string();
            Box::pin(async move {
                // A concurrent writer advances the stored version while
                // this transition is mid-flight.
                if let Ok(Some(other)) = repository.get(&correlation_id).await {
                    let _ = repository.update(&other).await;
                }
                Ok(())
            })
        })
        .transition_to("Created")
        .during("Created")
        .when::<PaymentSucceeded>()
        .transition_to("Completed")
        .finalize()
        .build()
        .unwrap();

    let orchestrator = SagaOrchestrator::new(definition, repository.clone());
    let error = orchestrator
        .handle_event(OrderCreated::new("C1"), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(error.is_concurrency());
}

// ============================================================================
// Timeout monitor
// ============================================================================

#[tokio::test]
async fn test_sweep_times_out_stale_sagas() {
    let repository: Arc<InMemorySagaRepository<OrderData>> = Arc::new(InMemorySagaRepository::new());
    repository
        .create(&SagaInstance::new("stale", "Created", OrderData::default()))
        .await
        .unwrap();

    let monitor = TimeoutMonitor::new(
        "order",
        repository.clone() as Arc<dyn SagaRepository<OrderData>>,
        TimeoutMonitorOptions {
            check_interval: Duration::from_secs(3600),
            default_timeout: Duration::from_millis(1),
        },
    );

    tokio::time::sleep(Duration::from_millis(10)).await;
    monitor.sweep().await;

    let saga = repository.get("stale").await.unwrap().unwrap();
    assert_eq!(saga.state(), TIMED_OUT_STATE);
    assert!(saga.is_completed());
}

#[tokio::test]
async fn test_sweep_skips_fresh_and_completed_sagas() {
    let repository: Arc<InMemorySagaRepository<OrderData>> = Arc::new(InMemorySagaRepository::new());
    repository
        .create(&SagaInstance::new("fresh", "Created", OrderData::default()))
        .await
        .unwrap();

    let monitor = TimeoutMonitor::new(
        "order",
        repository.clone() as Arc<dyn SagaRepository<OrderData>>,
        TimeoutMonitorOptions {
            check_interval: Duration::from_secs(3600),
            default_timeout: Duration::from_secs(3600),
        },
    );
    monitor.sweep().await;

    let saga = repository.get("fresh").await.unwrap().unwrap();
    assert_eq!(saga.state(), "Created");
    assert!(!saga.is_completed());
}

#[tokio::test]
async fn test_background_loop_starts_and_drains() {
    let repository: Arc<InMemorySagaRepository<OrderData>> = Arc::new(InMemorySagaRepository::new());
    repository
        .create(&SagaInstance::new("stale", "Created", OrderData::default()))
        .await
        .unwrap();

    let monitor = Arc::new(TimeoutMonitor::new(
        "order",
        repository.clone() as Arc<dyn SagaRepository<OrderData>>,
        TimeoutMonitorOptions {
            check_interval: Duration::from_millis(20),
            default_timeout: Duration::from_millis(1),
        },
    ));

    monitor.start().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    monitor.stop().await;

    let saga = repository.get("stale").await.unwrap().unwrap();
    assert_eq!(saga.state(), TIMED_OUT_STATE);
}
