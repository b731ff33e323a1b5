//! In-memory transport: queues, topics, and live consumers behind the
//! connection lifecycle state machine.

mod consumer;
mod queue;
mod topic;

pub use consumer::{Consumer, ConsumerMetricsSnapshot, ConsumerOptions};
pub use queue::{InMemoryQueue, QueueOptions};
pub use topic::InMemoryTopic;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::interfaces::{NoopInstrumentation, TransportInstrumentation};
use crate::message::{Address, AddressKind, Envelope};
use crate::transport::{
    CollectingDeadLetterSink, ConsumerHealth, MessageHandler, QueueHealth, Result, Topology,
    TransportError, TransportEvent, TransportHealth, TransportState,
};

/// Capacity of the transport event broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Transport configuration.
#[derive(Clone, Debug)]
pub struct TransportOptions {
    pub name: String,
    /// Artificial delay applied to send/publish, for testing backpressure
    /// and timeout handling against realistic latencies.
    pub simulated_latency: Option<Duration>,
    /// Defaults for queues created on demand.
    pub default_queue: QueueOptions,
    pub default_consumer: ConsumerOptions,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            name: "memory".to_string(),
            simulated_latency: None,
            default_queue: QueueOptions::default(),
            default_consumer: ConsumerOptions::default(),
        }
    }
}

/// Registry of queues/topics and live consumers.
///
/// The state field is guarded by a single-entry lock; a separate binary
/// semaphore serializes concurrent `connect` calls. Operations other
/// than lifecycle and topology require the Connected state.
pub struct InMemoryTransport {
    options: TransportOptions,
    state: Mutex<TransportState>,
    connect_gate: Semaphore,
    queues: RwLock<HashMap<String, Arc<InMemoryQueue>>>,
    topics: RwLock<HashMap<String, Arc<InMemoryTopic>>>,
    consumers: RwLock<Vec<Arc<Consumer>>>,
    events: broadcast::Sender<TransportEvent>,
    dead_letters: Arc<CollectingDeadLetterSink>,
    instrumentation: Arc<dyn TransportInstrumentation>,
    cancel: CancellationToken,
}

impl InMemoryTransport {
    pub fn new(options: TransportOptions) -> Self {
        Self::with_instrumentation(options, Arc::new(NoopInstrumentation))
    }

    pub fn with_instrumentation(
        options: TransportOptions,
        instrumentation: Arc<dyn TransportInstrumentation>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            options,
            state: Mutex::new(TransportState::Disconnected),
            connect_gate: Semaphore::new(1),
            queues: RwLock::new(HashMap::new()),
            topics: RwLock::new(HashMap::new()),
            consumers: RwLock::new(Vec::new()),
            events,
            dead_letters: Arc::new(CollectingDeadLetterSink::new()),
            instrumentation,
            cancel: CancellationToken::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.options.name
    }

    /// Subscribe to state-change and error events.
    pub fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    /// Dead letters parked by consumers of this transport.
    pub fn dead_letters(&self) -> Arc<CollectingDeadLetterSink> {
        Arc::clone(&self.dead_letters)
    }

    pub async fn state(&self) -> TransportState {
        *self.state.lock().await
    }

    /// Connect: Disconnected -> Connecting -> Connected.
    ///
    /// Concurrent connects are serialized by the gate; a connect against
    /// an already-Connected transport is a no-op.
    pub async fn connect(&self) -> Result<()> {
        let _permit = self
            .connect_gate
            .acquire()
            .await
            .map_err(|_| TransportError::Cancelled)?;

        {
            let state = self.state.lock().await;
            match *state {
                TransportState::Connected => return Ok(()),
                TransportState::Disconnected => {}
                other => {
                    return Err(TransportError::InvalidTransition {
                        from: other,
                        to: TransportState::Connecting,
                    })
                }
            }
        }

        self.transition(TransportState::Connecting).await?;
        if let Some(latency) = self.options.simulated_latency {
            tokio::time::sleep(latency).await;
        }
        self.transition(TransportState::Connected).await?;
        info!(transport = %self.options.name, "Transport connected");
        Ok(())
    }

    /// Disconnect: Connected -> Disconnecting (stop consumers, dispose
    /// queues and topics) -> Disconnected.
    pub async fn disconnect(&self) -> Result<()> {
        {
            let state = self.state.lock().await;
            match *state {
                TransportState::Disconnected => return Ok(()),
                TransportState::Connected => {}
                other => {
                    return Err(TransportError::InvalidTransition {
                        from: other,
                        to: TransportState::Disconnecting,
                    })
                }
            }
        }

        self.transition(TransportState::Disconnecting).await?;

        let consumers: Vec<Arc<Consumer>> =
            std::mem::take(&mut *self.consumers.write().await);
        for consumer in consumers {
            consumer.stop().await;
        }

        let queues: Vec<Arc<InMemoryQueue>> =
            self.queues.write().await.drain().map(|(_, q)| q).collect();
        for queue in queues {
            queue.shutdown().await;
        }

        let topics: Vec<Arc<InMemoryTopic>> =
            self.topics.write().await.drain().map(|(_, t)| t).collect();
        for topic in topics {
            topic.clear();
        }

        self.transition(TransportState::Disconnected).await?;
        info!(transport = %self.options.name, "Transport disconnected");
        Ok(())
    }

    /// Declare queues and topics ahead of use.
    pub async fn configure_topology(&self, topology: Topology) -> Result<()> {
        {
            let state = self.state.lock().await;
            if *state == TransportState::Disconnecting {
                return Err(TransportError::NotConnected { actual: *state });
            }
        }

        for declaration in topology.queues {
            self.get_or_create_queue(
                &declaration.name,
                Some(QueueOptions {
                    capacity: declaration.capacity,
                    overflow: declaration.overflow,
                }),
            )
            .await;
        }
        for declaration in topology.topics {
            self.get_or_create_topic(&declaration.name).await;
        }
        Ok(())
    }

    /// Send an envelope to a queue address.
    pub async fn send(&self, address: &Address, envelope: Envelope) -> Result<()> {
        self.ensure_connected().await?;
        Self::expect_kind(address, AddressKind::Queue)?;
        self.apply_latency().await;

        let mut envelope = envelope.with_destination(address.clone());
        self.instrumentation.inject_trace_context(&mut envelope);
        self.instrumentation.on_send(&self.options.name, &envelope);

        let queue = self.get_or_create_queue(address.name(), None).await;
        queue.enqueue(envelope, &self.cancel).await
    }

    /// Publish an envelope to a topic address.
    pub async fn publish(&self, address: &Address, envelope: Envelope) -> Result<()> {
        self.ensure_connected().await?;
        Self::expect_kind(address, AddressKind::Topic)?;
        self.apply_latency().await;

        let mut envelope = envelope.with_destination(address.clone());
        self.instrumentation.inject_trace_context(&mut envelope);
        self.instrumentation
            .on_publish(&self.options.name, &envelope);

        let topic = self.get_or_create_topic(address.name()).await;
        topic.publish(envelope)
    }

    /// Attach a consumer to a queue or a topic subscription.
    ///
    /// For topics the subscription name is the consumer name; each
    /// subscription receives every published envelope.
    pub async fn subscribe(
        &self,
        source: Address,
        handler: Arc<dyn MessageHandler>,
        options: Option<ConsumerOptions>,
    ) -> Result<Arc<Consumer>> {
        self.ensure_connected().await?;

        let options = options.unwrap_or_else(|| self.options.default_consumer.clone());
        let consumer_name = format!("{}-consumer-{}", source.name(), uuid::Uuid::new_v4());
        let consumer = Consumer::start(
            consumer_name,
            self.options.name.clone(),
            source.clone(),
            handler,
            options,
            self.dead_letters.clone(),
            self.cancel.child_token(),
        );

        match source.kind() {
            AddressKind::Queue => {
                let queue = self.get_or_create_queue(source.name(), None).await;
                queue.add_consumer(Arc::clone(&consumer));
            }
            AddressKind::Topic | AddressKind::Subscription => {
                let topic = self.get_or_create_topic(source.name()).await;
                topic.subscribe(consumer.name().to_string(), Arc::clone(&consumer));
            }
            AddressKind::Exchange => {
                return Err(TransportError::WrongAddressKind {
                    address: source.name().to_string(),
                    expected: AddressKind::Queue,
                    found: AddressKind::Exchange,
                })
            }
        }

        self.consumers.write().await.push(Arc::clone(&consumer));
        debug!(
            transport = %self.options.name,
            consumer = %consumer.name(),
            source = %source,
            "Consumer subscribed"
        );
        Ok(consumer)
    }

    /// Detach and stop a consumer.
    pub async fn unsubscribe(&self, consumer: &Arc<Consumer>) -> Result<()> {
        self.consumers
            .write()
            .await
            .retain(|c| c.id() != consumer.id());

        match consumer.source().kind() {
            AddressKind::Queue => {
                if let Some(queue) = self.queues.read().await.get(consumer.source().name()) {
                    queue.remove_consumer(consumer.id());
                }
            }
            _ => {
                if let Some(topic) = self.topics.read().await.get(consumer.source().name()) {
                    topic.unsubscribe(consumer.name());
                }
            }
        }
        consumer.stop().await;
        Ok(())
    }

    /// Aggregate health snapshot.
    pub async fn health(&self) -> TransportHealth {
        let state = *self.state.lock().await;
        let queues = self.queues.read().await;
        let queue_health = queues
            .values()
            .map(|queue| QueueHealth {
                name: queue.name().to_string(),
                depth: queue.depth(),
                enqueued: queue.enqueued(),
                delivered: queue.delivered(),
                dropped: queue.dropped(),
                consumers: queue.consumer_count(),
            })
            .collect();
        drop(queues);

        let consumers = self.consumers.read().await;
        let consumer_health = consumers
            .iter()
            .map(|consumer| ConsumerHealth {
                name: consumer.name().to_string(),
                metrics: consumer.metrics(),
            })
            .collect();
        drop(consumers);

        TransportHealth {
            state,
            queues: queue_health,
            consumers: consumer_health,
            dead_letters: self.dead_letters.len(),
        }
    }

    /// Look up a queue without creating it.
    pub async fn queue(&self, name: &str) -> Option<Arc<InMemoryQueue>> {
        self.queues.read().await.get(name).cloned()
    }

    /// Look up a topic without creating it.
    pub async fn topic(&self, name: &str) -> Option<Arc<InMemoryTopic>> {
        self.topics.read().await.get(name).cloned()
    }

    async fn ensure_connected(&self) -> Result<()> {
        let state = self.state.lock().await;
        if *state != TransportState::Connected {
            return Err(TransportError::NotConnected { actual: *state });
        }
        Ok(())
    }

    fn expect_kind(address: &Address, expected: AddressKind) -> Result<()> {
        if address.kind() != expected {
            return Err(TransportError::WrongAddressKind {
                address: address.name().to_string(),
                expected,
                found: address.kind(),
            });
        }
        Ok(())
    }

    async fn apply_latency(&self) {
        if let Some(latency) = self.options.simulated_latency {
            tokio::time::sleep(latency).await;
        }
    }

    async fn get_or_create_queue(
        &self,
        name: &str,
        options: Option<QueueOptions>,
    ) -> Arc<InMemoryQueue> {
        if let Some(queue) = self.queues.read().await.get(name) {
            return Arc::clone(queue);
        }
        let mut queues = self.queues.write().await;
        // Double-checked: another writer may have created it.
        if let Some(queue) = queues.get(name) {
            return Arc::clone(queue);
        }
        let queue = InMemoryQueue::start(
            name,
            options.unwrap_or_else(|| self.options.default_queue.clone()),
            self.cancel.child_token(),
        );
        queues.insert(name.to_string(), Arc::clone(&queue));
        queue
    }

    async fn get_or_create_topic(&self, name: &str) -> Arc<InMemoryTopic> {
        if let Some(topic) = self.topics.read().await.get(name) {
            return Arc::clone(topic);
        }
        let mut topics = self.topics.write().await;
        if let Some(topic) = topics.get(name) {
            return Arc::clone(topic);
        }
        let topic = InMemoryTopic::new(name);
        topics.insert(name.to_string(), Arc::clone(&topic));
        topic
    }

    /// Serialized state transition: legality is checked and the change
    /// is emitted while the state lock is held.
    async fn transition(&self, to: TransportState) -> Result<()> {
        let mut state = self.state.lock().await;
        let from = *state;
        if !from.can_transition_to(to) {
            let error = TransportError::InvalidTransition { from, to };
            let _ = self.events.send(TransportEvent::Error {
                message: error.to_string(),
            });
            return Err(error);
        }
        *state = to;
        drop(state);

        debug!(transport = %self.options.name, ?from, ?to, "State changed");
        let _ = self.events.send(TransportEvent::StateChanged { from, to });
        Ok(())
    }
}

#[cfg(test)]
mod tests;
