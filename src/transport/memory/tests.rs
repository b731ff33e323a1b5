use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::*;
use crate::message::{Address, Envelope};
use crate::transport::{
    ConsumeActions, HandlerError, MessageHandler, OverflowPolicy, QueueTopology, Topology,
    TopicTopology,
};

fn make_envelope(message_type: &str) -> Envelope {
    Envelope::new(
        Uuid::new_v4(),
        message_type,
        Bytes::from_static(b"{\"n\":1}"),
        "application/json",
    )
}

/// Handler that records received envelopes and succeeds.
struct RecordingHandler {
    seen: Arc<Mutex<Vec<Envelope>>>,
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle(
        &self,
        envelope: &Envelope,
        _actions: &dyn ConsumeActions,
    ) -> std::result::Result<(), HandlerError> {
        self.seen.lock().unwrap().push(envelope.clone());
        Ok(())
    }
}

/// Handler that fails the first `failures` deliveries, then succeeds.
struct FlakyHandler {
    calls: Arc<AtomicU32>,
    failures: u32,
}

#[async_trait]
impl MessageHandler for FlakyHandler {
    async fn handle(
        &self,
        _envelope: &Envelope,
        _actions: &dyn ConsumeActions,
    ) -> std::result::Result<(), HandlerError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
            Err("induced failure".into())
        } else {
            Ok(())
        }
    }
}

fn logging_sink() -> crate::transport::SharedDeadLetterSink {
    Arc::new(CollectingDeadLetterSink::new())
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

// ============================================================================
// Queue
// ============================================================================

#[tokio::test]
async fn test_enqueue_dequeue_preserves_envelope() {
    let queue = InMemoryQueue::start("orders", QueueOptions::default(), CancellationToken::new());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let consumer = Consumer::start(
        "c1",
        "memory",
        Address::queue("orders").unwrap(),
        Arc::new(RecordingHandler { seen: seen.clone() }),
        ConsumerOptions::default(),
        logging_sink(),
        CancellationToken::new(),
    );
    queue.add_consumer(consumer);

    let mut envelope = make_envelope("OrderCreated");
    envelope.set_header("trace", "t-1");
    let sent_body = envelope.body().clone();
    let sent_id = envelope.message_id();

    queue
        .enqueue(envelope, &CancellationToken::new())
        .await
        .unwrap();
    settle().await;

    let received = seen.lock().unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].message_id(), sent_id);
    assert_eq!(received[0].body(), &sent_body);
    assert_eq!(received[0].header("trace"), Some("t-1"));
}

#[tokio::test]
async fn test_drop_oldest_caps_depth_and_evicts() {
    let queue = InMemoryQueue::start(
        "bounded",
        QueueOptions {
            capacity: 3,
            overflow: OverflowPolicy::DropOldest,
        },
        CancellationToken::new(),
    );

    for _ in 0..10 {
        queue
            .enqueue(make_envelope("Tick"), &CancellationToken::new())
            .await
            .unwrap();
        assert!(queue.depth() <= 3, "depth exceeded capacity");
    }
    assert_eq!(queue.depth(), 3);
    assert_eq!(queue.enqueued(), 10);
    assert_eq!(queue.dropped(), 7);
    // Nothing was delivered: no consumers registered.
    assert_eq!(queue.delivered(), 0);
}

#[tokio::test]
async fn test_wait_policy_blocks_until_space() {
    let queue = InMemoryQueue::start(
        "tight",
        QueueOptions {
            capacity: 1,
            overflow: OverflowPolicy::Wait,
        },
        CancellationToken::new(),
    );
    queue
        .enqueue(make_envelope("First"), &CancellationToken::new())
        .await
        .unwrap();

    // Second enqueue blocks until a consumer drains the first.
    let blocked = {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move {
            queue
                .enqueue(make_envelope("Second"), &CancellationToken::new())
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!blocked.is_finished(), "enqueue should still be blocked");

    let seen = Arc::new(Mutex::new(Vec::new()));
    let consumer = Consumer::start(
        "drainer",
        "memory",
        Address::queue("tight").unwrap(),
        Arc::new(RecordingHandler { seen: seen.clone() }),
        ConsumerOptions::default(),
        logging_sink(),
        CancellationToken::new(),
    );
    queue.add_consumer(consumer);

    blocked.await.unwrap().unwrap();
    settle().await;
    assert_eq!(seen.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn test_wait_policy_enqueue_cancellation() {
    let queue = InMemoryQueue::start(
        "tight",
        QueueOptions {
            capacity: 1,
            overflow: OverflowPolicy::Wait,
        },
        CancellationToken::new(),
    );
    queue
        .enqueue(make_envelope("First"), &CancellationToken::new())
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let blocked = {
        let queue = Arc::clone(&queue);
        let cancel = cancel.clone();
        tokio::spawn(async move { queue.enqueue(make_envelope("Second"), &cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();

    let result = blocked.await.unwrap();
    assert!(matches!(result, Err(TransportError::Cancelled)));
}

#[tokio::test]
async fn test_closed_queue_rejects_enqueue() {
    let queue = InMemoryQueue::start("closing", QueueOptions::default(), CancellationToken::new());
    queue.close();
    let result = queue
        .enqueue(make_envelope("Late"), &CancellationToken::new())
        .await;
    assert!(matches!(result, Err(TransportError::QueueClosed(_))));
}

#[tokio::test]
async fn test_round_robin_across_consumers() {
    let queue = InMemoryQueue::start("fanout", QueueOptions::default(), CancellationToken::new());
    let counts: Vec<Arc<Mutex<Vec<Envelope>>>> =
        (0..4).map(|_| Arc::new(Mutex::new(Vec::new()))).collect();

    for (i, seen) in counts.iter().enumerate() {
        let consumer = Consumer::start(
            format!("c{}", i),
            "memory",
            Address::queue("fanout").unwrap(),
            Arc::new(RecordingHandler { seen: seen.clone() }),
            ConsumerOptions::default(),
            logging_sink(),
            CancellationToken::new(),
        );
        queue.add_consumer(consumer);
    }

    for _ in 0..100 {
        queue
            .enqueue(make_envelope("Tick"), &CancellationToken::new())
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    for seen in &counts {
        let received = seen.lock().unwrap().len();
        assert_eq!(received, 25, "round-robin should be fair");
    }
}

// ============================================================================
// Consumer
// ============================================================================

#[tokio::test]
async fn test_fifo_with_limit_one() {
    let queue = InMemoryQueue::start("fifo", QueueOptions::default(), CancellationToken::new());
    let order = Arc::new(Mutex::new(Vec::new()));

    /// Handler with deliberately uneven latency; FIFO must hold anyway.
    struct SlowFirstHandler {
        order: Arc<Mutex<Vec<String>>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MessageHandler for SlowFirstHandler {
        async fn handle(
            &self,
            envelope: &Envelope,
            _actions: &dyn ConsumeActions,
        ) -> std::result::Result<(), HandlerError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(80)).await;
            }
            self.order
                .lock()
                .unwrap()
                .push(envelope.message_type().to_string());
            Ok(())
        }
    }

    let consumer = Consumer::start(
        "sequential",
        "memory",
        Address::queue("fifo").unwrap(),
        Arc::new(SlowFirstHandler {
            order: order.clone(),
            calls: AtomicUsize::new(0),
        }),
        ConsumerOptions {
            concurrent_message_limit: 1,
            ..Default::default()
        },
        logging_sink(),
        CancellationToken::new(),
    );
    queue.add_consumer(consumer);

    for name in ["A", "B", "C"] {
        queue
            .enqueue(make_envelope(name), &CancellationToken::new())
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(*order.lock().unwrap(), vec!["A", "B", "C"]);
}

#[tokio::test]
async fn test_handler_failure_retries_then_dead_letters() {
    let sink = Arc::new(CollectingDeadLetterSink::new());
    let calls = Arc::new(AtomicU32::new(0));
    let consumer = Consumer::start(
        "flaky",
        "memory",
        Address::queue("work").unwrap(),
        Arc::new(FlakyHandler {
            calls: calls.clone(),
            failures: u32::MAX,
        }),
        ConsumerOptions {
            max_delivery_attempts: 3,
            retry_base_delay: Duration::from_millis(5),
            ..Default::default()
        },
        sink.clone(),
        CancellationToken::new(),
    );

    consumer.deliver(make_envelope("Poison")).unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    // Initial delivery plus redeliveries up to the attempt cap.
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(sink.len(), 1);
    let metrics = consumer.metrics();
    assert_eq!(metrics.failures, 3);
    assert_eq!(metrics.rejected, 2);
    assert_eq!(metrics.dead_lettered, 1);
    assert_eq!(metrics.in_flight(), 0);
    assert!(metrics.last_failure.is_some());
}

#[tokio::test]
async fn test_handler_failure_recovers_on_redelivery() {
    let sink = Arc::new(CollectingDeadLetterSink::new());
    let calls = Arc::new(AtomicU32::new(0));
    let consumer = Consumer::start(
        "recovering",
        "memory",
        Address::queue("work").unwrap(),
        Arc::new(FlakyHandler {
            calls: calls.clone(),
            failures: 1,
        }),
        ConsumerOptions {
            max_delivery_attempts: 3,
            retry_base_delay: Duration::from_millis(5),
            ..Default::default()
        },
        sink.clone(),
        CancellationToken::new(),
    );

    consumer.deliver(make_envelope("Flaky")).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(sink.len(), 0);
    assert_eq!(consumer.metrics().acknowledged, 1);
}

#[tokio::test]
async fn test_explicit_dead_letter_skips_auto_ack() {
    struct DeadLetteringHandler;

    #[async_trait]
    impl MessageHandler for DeadLetteringHandler {
        async fn handle(
            &self,
            _envelope: &Envelope,
            actions: &dyn ConsumeActions,
        ) -> std::result::Result<(), HandlerError> {
            actions.dead_letter("unprocessable payload").await;
            Ok(())
        }
    }

    let sink = Arc::new(CollectingDeadLetterSink::new());
    let consumer = Consumer::start(
        "rejecting",
        "memory",
        Address::queue("work").unwrap(),
        Arc::new(DeadLetteringHandler),
        ConsumerOptions::default(),
        sink.clone(),
        CancellationToken::new(),
    );

    consumer.deliver(make_envelope("Bad")).unwrap();
    settle().await;

    let metrics = consumer.metrics();
    assert_eq!(metrics.dead_lettered, 1);
    // The explicit settle suppressed auto-acknowledge.
    assert_eq!(metrics.acknowledged, 0);
    assert_eq!(metrics.in_flight(), 0);
    assert_eq!(sink.len(), 1);
    assert_eq!(sink.take()[0].reason, "unprocessable payload");
}

#[tokio::test]
async fn test_reject_with_requeue_redelivers() {
    struct RejectOnceHandler {
        calls: AtomicU32,
    }

    #[async_trait]
    impl MessageHandler for RejectOnceHandler {
        async fn handle(
            &self,
            envelope: &Envelope,
            actions: &dyn ConsumeActions,
        ) -> std::result::Result<(), HandlerError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                assert_eq!(envelope.delivery_count(), 0);
                actions.reject(true).await;
            } else {
                assert_eq!(envelope.delivery_count(), 1);
                actions.acknowledge().await;
            }
            Ok(())
        }
    }

    let consumer = Consumer::start(
        "requeue",
        "memory",
        Address::queue("work").unwrap(),
        Arc::new(RejectOnceHandler {
            calls: AtomicU32::new(0),
        }),
        ConsumerOptions::default(),
        logging_sink(),
        CancellationToken::new(),
    );

    consumer.deliver(make_envelope("Retry")).unwrap();
    settle().await;

    let metrics = consumer.metrics();
    assert_eq!(metrics.received, 2);
    assert_eq!(metrics.rejected, 1);
    assert_eq!(metrics.acknowledged, 1);
}

#[tokio::test]
async fn test_defer_redelivers_after_delay() {
    struct DeferOnceHandler {
        calls: AtomicU32,
        deferred_at: Mutex<Option<std::time::Instant>>,
    }

    #[async_trait]
    impl MessageHandler for DeferOnceHandler {
        async fn handle(
            &self,
            envelope: &Envelope,
            actions: &dyn ConsumeActions,
        ) -> std::result::Result<(), HandlerError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                *self.deferred_at.lock().unwrap() = Some(std::time::Instant::now());
                actions.defer(Duration::from_millis(40)).await;
            } else {
                assert_eq!(envelope.delivery_count(), 1);
                let waited = self.deferred_at.lock().unwrap().unwrap().elapsed();
                assert!(waited >= Duration::from_millis(40));
                actions.acknowledge().await;
            }
            Ok(())
        }
    }

    let consumer = Consumer::start(
        "deferring",
        "memory",
        Address::queue("work").unwrap(),
        Arc::new(DeferOnceHandler {
            calls: AtomicU32::new(0),
            deferred_at: Mutex::new(None),
        }),
        ConsumerOptions::default(),
        logging_sink(),
        CancellationToken::new(),
    );

    consumer.deliver(make_envelope("Later")).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let metrics = consumer.metrics();
    assert_eq!(metrics.received, 2);
    assert_eq!(metrics.rejected, 1);
    assert_eq!(metrics.acknowledged, 1);
    assert_eq!(metrics.in_flight(), 0);
}

#[tokio::test]
async fn test_stop_drains_intake() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let consumer = Consumer::start(
        "draining",
        "memory",
        Address::queue("work").unwrap(),
        Arc::new(RecordingHandler { seen: seen.clone() }),
        ConsumerOptions::default(),
        logging_sink(),
        CancellationToken::new(),
    );

    for _ in 0..5 {
        consumer.deliver(make_envelope("Tick")).unwrap();
    }
    consumer.stop().await;

    assert_eq!(seen.lock().unwrap().len(), 5);
    assert!(consumer.deliver(make_envelope("Late")).is_err());
}

// ============================================================================
// Topic
// ============================================================================

#[tokio::test]
async fn test_topic_fans_out_to_all_subscriptions() {
    let topic = InMemoryTopic::new("audit");
    let seen: Vec<Arc<Mutex<Vec<Envelope>>>> =
        (0..3).map(|_| Arc::new(Mutex::new(Vec::new()))).collect();

    for (i, records) in seen.iter().enumerate() {
        let consumer = Consumer::start(
            format!("sub{}", i),
            "memory",
            Address::topic("audit").unwrap(),
            Arc::new(RecordingHandler {
                seen: records.clone(),
            }),
            ConsumerOptions::default(),
            logging_sink(),
            CancellationToken::new(),
        );
        topic.subscribe(format!("sub{}", i), consumer);
    }

    for _ in 0..4 {
        topic.publish(make_envelope("AuditEvent")).unwrap();
    }
    settle().await;

    assert_eq!(topic.published(), 4);
    for records in &seen {
        assert_eq!(records.lock().unwrap().len(), 4);
    }
    assert_eq!(topic.pending(), 0);
}

// ============================================================================
// Transport lifecycle
// ============================================================================

#[tokio::test]
async fn test_operations_require_connected() {
    let transport = InMemoryTransport::new(TransportOptions::default());
    let address = Address::queue("orders").unwrap();

    let result = transport.send(&address, make_envelope("Early")).await;
    assert!(matches!(result, Err(TransportError::NotConnected { .. })));
}

#[tokio::test]
async fn test_connect_disconnect_cycle_emits_events() {
    let transport = InMemoryTransport::new(TransportOptions::default());
    let mut events = transport.events();

    transport.connect().await.unwrap();
    assert_eq!(transport.state().await, TransportState::Connected);
    // Reconnect while connected is a no-op.
    transport.connect().await.unwrap();

    transport.disconnect().await.unwrap();
    assert_eq!(transport.state().await, TransportState::Disconnected);

    let mut transitions = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let TransportEvent::StateChanged { from, to } = event {
            transitions.push((from, to));
        }
    }
    assert_eq!(
        transitions,
        vec![
            (TransportState::Disconnected, TransportState::Connecting),
            (TransportState::Connecting, TransportState::Connected),
            (TransportState::Connected, TransportState::Disconnecting),
            (TransportState::Disconnecting, TransportState::Disconnected),
        ]
    );
}

#[tokio::test]
async fn test_subscribe_and_send_through_transport() {
    let transport = InMemoryTransport::new(TransportOptions::default());
    transport.connect().await.unwrap();
    transport
        .configure_topology(Topology {
            queues: vec![QueueTopology {
                name: "orders".into(),
                capacity: 16,
                overflow: OverflowPolicy::Wait,
            }],
            topics: vec![TopicTopology {
                name: "audit".into(),
            }],
        })
        .await
        .unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    transport
        .subscribe(
            Address::queue("orders").unwrap(),
            Arc::new(RecordingHandler { seen: seen.clone() }),
            None,
        )
        .await
        .unwrap();

    transport
        .send(&Address::queue("orders").unwrap(), make_envelope("Order"))
        .await
        .unwrap();
    settle().await;

    assert_eq!(seen.lock().unwrap().len(), 1);
    // Destination address is stamped on delivery.
    assert_eq!(
        seen.lock().unwrap()[0].destination().map(|a| a.name().to_string()),
        Some("orders".to_string())
    );

    let health = transport.health().await;
    assert_eq!(health.state, TransportState::Connected);
    assert_eq!(health.queues.len(), 1);
    assert_eq!(health.consumers.len(), 1);

    transport.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_send_to_topic_address_is_kind_error() {
    let transport = InMemoryTransport::new(TransportOptions::default());
    transport.connect().await.unwrap();

    let result = transport
        .send(&Address::topic("audit").unwrap(), make_envelope("Nope"))
        .await;
    assert!(matches!(
        result,
        Err(TransportError::WrongAddressKind { .. })
    ));
}
