//! Bounded in-memory FIFO queue with competing consumers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::consumer::Consumer;
use crate::message::Envelope;
use crate::transport::{OverflowPolicy, Result, TransportError};

/// Queue configuration.
#[derive(Clone, Debug)]
pub struct QueueOptions {
    pub capacity: usize,
    pub overflow: OverflowPolicy,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            capacity: 1024,
            overflow: OverflowPolicy::Wait,
        }
    }
}

/// Buffered FIFO for point-to-point delivery.
///
/// Delivery is round-robin across registered consumers; the consumer
/// snapshot is cached by the delivery loop and refreshed only when the
/// generation counter moves. A failed hand-off to one consumer is
/// logged and the loop continues with the next envelope.
pub struct InMemoryQueue {
    name: String,
    options: QueueOptions,
    buffer: Mutex<VecDeque<Envelope>>,
    closed: AtomicBool,
    data: Notify,
    space: Notify,
    depth: AtomicUsize,
    enqueued: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    consumers: Mutex<Vec<Arc<Consumer>>>,
    generation: AtomicU64,
    consumers_changed: Notify,
    rr_index: AtomicUsize,
    cancel: CancellationToken,
    delivery_loop: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl InMemoryQueue {
    /// Create the queue and spawn its delivery loop.
    pub fn start(
        name: impl Into<String>,
        options: QueueOptions,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let queue = Arc::new(Self {
            name: name.into(),
            options,
            buffer: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
            data: Notify::new(),
            space: Notify::new(),
            depth: AtomicUsize::new(0),
            enqueued: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            consumers: Mutex::new(Vec::new()),
            generation: AtomicU64::new(0),
            consumers_changed: Notify::new(),
            rr_index: AtomicUsize::new(0),
            cancel,
            delivery_loop: tokio::sync::Mutex::new(None),
        });

        let handle = tokio::spawn(Self::run_delivery_loop(Arc::clone(&queue)));
        if let Ok(mut slot) = queue.delivery_loop.try_lock() {
            *slot = Some(handle);
        }
        info!(queue = %queue.name, capacity = queue.options.capacity, "Queue started");
        queue
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue an envelope.
    ///
    /// Fails without panicking when the queue is closed. With the Wait
    /// policy a full buffer suspends the caller until space frees up or
    /// the token cancels; with DropOldest the oldest pending envelope is
    /// evicted and the enqueue succeeds immediately.
    pub async fn enqueue(&self, envelope: Envelope, cancel: &CancellationToken) -> Result<()> {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(TransportError::QueueClosed(self.name.clone()));
            }

            {
                let mut buffer = self.buffer.lock().expect("queue buffer poisoned");
                if buffer.len() < self.options.capacity {
                    buffer.push_back(envelope);
                    // The capped counter moves under the buffer lock so
                    // the delivery loop's decrement can never underflow.
                    if self.options.overflow == OverflowPolicy::DropOldest {
                        self.increment_depth_capped();
                    }
                    drop(buffer);
                    self.enqueued.fetch_add(1, Ordering::SeqCst);
                    self.data.notify_one();
                    return Ok(());
                }

                if self.options.overflow == OverflowPolicy::DropOldest {
                    let evicted = buffer.pop_front();
                    buffer.push_back(envelope);
                    // Depth stays capped at capacity.
                    self.increment_depth_capped();
                    drop(buffer);
                    if let Some(evicted) = evicted {
                        self.dropped.fetch_add(1, Ordering::SeqCst);
                        debug!(
                            queue = %self.name,
                            message_id = %evicted.message_id(),
                            "Evicted oldest envelope on overflow"
                        );
                    }
                    self.enqueued.fetch_add(1, Ordering::SeqCst);
                    self.data.notify_one();
                    return Ok(());
                }
            }

            tokio::select! {
                _ = self.space.notified() => {}
                _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            }
        }
    }

    /// Register a consumer. The delivery loop observes the change via
    /// the generation counter.
    pub fn add_consumer(&self, consumer: Arc<Consumer>) {
        self.consumers
            .lock()
            .expect("consumer list poisoned")
            .push(consumer);
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.consumers_changed.notify_waiters();
    }

    /// Deregister a consumer by id.
    pub fn remove_consumer(&self, consumer_id: uuid::Uuid) {
        self.consumers
            .lock()
            .expect("consumer list poisoned")
            .retain(|c| c.id() != consumer_id);
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.consumers_changed.notify_waiters();
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.lock().expect("consumer list poisoned").len()
    }

    /// Stop accepting new envelopes.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        // Wake blocked producers so they observe the closed flag.
        self.space.notify_waiters();
    }

    /// Close, cancel the delivery loop, and await its exit.
    pub async fn shutdown(&self) {
        self.close();
        self.cancel.cancel();
        self.data.notify_waiters();
        let handle = self.delivery_loop.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(queue = %self.name, error = %e, "Delivery loop join failed");
            }
        }
    }

    /// Pending-envelope depth.
    ///
    /// Under DropOldest the counter is maintained by a compare-exchange
    /// loop capped at capacity; under Wait it is strictly
    /// `enqueued - delivered`.
    pub fn depth(&self) -> usize {
        match self.options.overflow {
            OverflowPolicy::DropOldest => self.depth.load(Ordering::SeqCst),
            OverflowPolicy::Wait => {
                let enqueued = self.enqueued.load(Ordering::SeqCst);
                let delivered = self.delivered.load(Ordering::SeqCst);
                enqueued.saturating_sub(delivered) as usize
            }
        }
    }

    pub fn enqueued(&self) -> u64 {
        self.enqueued.load(Ordering::SeqCst)
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::SeqCst)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::SeqCst)
    }

    /// Compare-exchange loop keeping depth capped at capacity under the
    /// DropOldest policy.
    fn increment_depth_capped(&self) {
        let mut current = self.depth.load(Ordering::Acquire);
        loop {
            if current >= self.options.capacity {
                break;
            }
            match self.depth.compare_exchange(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }

    async fn run_delivery_loop(queue: Arc<InMemoryQueue>) {
        let mut cached_generation = u64::MAX;
        let mut cached_consumers: Vec<Arc<Consumer>> = Vec::new();

        loop {
            // Wait for at least one consumer before touching the buffer:
            // popping early would free capacity no consumer can absorb.
            // The cached snapshot is kept until the generation counter
            // invalidates it.
            let consumer = loop {
                if queue.cancel.is_cancelled() {
                    debug!(queue = %queue.name, "Delivery loop cancelled");
                    return;
                }
                let generation = queue.generation.load(Ordering::SeqCst);
                if generation != cached_generation {
                    cached_consumers = queue
                        .consumers
                        .lock()
                        .expect("consumer list poisoned")
                        .clone();
                    cached_generation = generation;
                }
                if !cached_consumers.is_empty() {
                    let index =
                        queue.rr_index.fetch_add(1, Ordering::SeqCst) % cached_consumers.len();
                    break Arc::clone(&cached_consumers[index]);
                }
                tokio::select! {
                    _ = queue.consumers_changed.notified() => {}
                    _ = queue.cancel.cancelled() => return,
                }
            };

            // Pull the next envelope, suspending while the buffer is empty.
            let envelope = loop {
                let popped = {
                    let mut buffer = queue.buffer.lock().expect("queue buffer poisoned");
                    let envelope = buffer.pop_front();
                    if envelope.is_some()
                        && queue.options.overflow == OverflowPolicy::DropOldest
                    {
                        queue.depth.fetch_sub(1, Ordering::SeqCst);
                    }
                    envelope
                };
                if let Some(envelope) = popped {
                    break envelope;
                }
                tokio::select! {
                    _ = queue.data.notified() => {}
                    _ = queue.cancel.cancelled() => return,
                }
            };

            if let Err(e) = consumer.deliver(envelope) {
                // Failure is isolated to this envelope; the loop advances
                // rather than retrying the same consumer.
                error!(
                    queue = %queue.name,
                    consumer = %consumer.name(),
                    error = %e,
                    "Delivery failed, skipping envelope"
                );
            }
            queue.delivered.fetch_add(1, Ordering::SeqCst);
            queue.space.notify_one();
        }
    }
}
