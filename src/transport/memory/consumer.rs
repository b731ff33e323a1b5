//! Competing consumer with ack/nack/defer/dead-letter semantics.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::message::{Address, Envelope};
use crate::transport::{
    ConsumeActions, HandlerError, MessageHandler, Result, SharedDeadLetterSink, TransportError,
};

/// Smoothing factor for the rolling processing-duration average.
const PROCESSING_TIME_ALPHA: f64 = 0.2;

/// Consumer behavior knobs.
#[derive(Clone, Debug)]
pub struct ConsumerOptions {
    /// Acknowledge automatically when the handler returns without having
    /// explicitly handled the envelope.
    pub auto_acknowledge: bool,
    /// Concurrent in-flight messages. 1 preserves strict FIFO.
    pub concurrent_message_limit: usize,
    /// Total delivery attempts before dead-lettering.
    pub max_delivery_attempts: u32,
    /// Base delay for redelivery backoff.
    pub retry_base_delay: Duration,
    /// Redelivery delay cap.
    pub retry_max_delay: Duration,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            auto_acknowledge: true,
            concurrent_message_limit: 1,
            max_delivery_attempts: 3,
            retry_base_delay: Duration::from_millis(50),
            retry_max_delay: Duration::from_secs(5),
        }
    }
}

impl ConsumerOptions {
    /// Redelivery delay for a given delivery count (1-indexed).
    fn redelivery_delay(&self, delivery_count: u32) -> Duration {
        let exponent = delivery_count.saturating_sub(1).min(20);
        let base_ms = self.retry_base_delay.as_millis() as u64;
        let delay_ms = base_ms
            .saturating_mul(1u64 << exponent)
            .min(self.retry_max_delay.as_millis() as u64);
        Duration::from_millis(delay_ms)
    }
}

#[derive(Default)]
struct ConsumerMetrics {
    received: AtomicU64,
    acknowledged: AtomicU64,
    rejected: AtomicU64,
    dead_lettered: AtomicU64,
    failures: AtomicU64,
    currently_processing: AtomicUsize,
    last_failure: Mutex<Option<String>>,
    avg_processing_ms: Mutex<f64>,
}

impl ConsumerMetrics {
    fn record_duration(&self, elapsed: Duration) {
        let ms = elapsed.as_secs_f64() * 1000.0;
        let mut avg = self.avg_processing_ms.lock().expect("metrics lock poisoned");
        *avg = if *avg == 0.0 {
            ms
        } else {
            *avg * (1.0 - PROCESSING_TIME_ALPHA) + ms * PROCESSING_TIME_ALPHA
        };
    }
}

/// Point-in-time consumer metrics.
#[derive(Debug, Clone)]
pub struct ConsumerMetricsSnapshot {
    pub received: u64,
    pub acknowledged: u64,
    pub rejected: u64,
    pub dead_lettered: u64,
    pub failures: u64,
    pub currently_processing: usize,
    pub last_failure: Option<String>,
    pub avg_processing_ms: f64,
}

impl ConsumerMetricsSnapshot {
    /// Envelopes received but not yet terminally settled.
    pub fn in_flight(&self) -> u64 {
        self.received
            .saturating_sub(self.acknowledged + self.rejected + self.dead_lettered)
    }
}

/// Acknowledgement surface handed to the handler for one envelope.
struct ConsumeContext {
    transport: String,
    source: Address,
    envelope: Envelope,
    handled: AtomicBool,
    metrics: Arc<ConsumerMetrics>,
    intake: mpsc::UnboundedSender<Envelope>,
    dead_letters: SharedDeadLetterSink,
}

impl ConsumeContext {
    fn mark_handled(&self) -> bool {
        // First explicit action wins; later calls are no-ops so the
        // auto-acknowledge policy cannot double-settle.
        !self.handled.swap(true, Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ConsumeActions for ConsumeContext {
    async fn acknowledge(&self) {
        if self.mark_handled() {
            self.metrics.acknowledged.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn reject(&self, requeue: bool) {
        if !self.mark_handled() {
            return;
        }
        self.metrics.rejected.fetch_add(1, Ordering::SeqCst);
        if requeue {
            let redelivery = self.envelope.with_incremented_delivery();
            if self.intake.send(redelivery).is_err() {
                warn!(
                    message_id = %self.envelope.message_id(),
                    "Requeue after reject dropped: consumer stopped"
                );
            }
        }
    }

    async fn defer(&self, delay: Duration) {
        if !self.mark_handled() {
            return;
        }
        // A deferral settles this attempt like a requeueing reject; the
        // redelivery arrives as a fresh receive.
        self.metrics.rejected.fetch_add(1, Ordering::SeqCst);
        let redelivery = self.envelope.with_incremented_delivery();
        let intake = self.intake.clone();
        // Scheduled off the processing loop so deferral never blocks it.
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if intake.send(redelivery).is_err() {
                warn!("Deferred envelope dropped: consumer stopped");
            }
        });
    }

    async fn dead_letter(&self, reason: &str) {
        if !self.mark_handled() {
            return;
        }
        self.metrics.dead_lettered.fetch_add(1, Ordering::SeqCst);
        self.dead_letters
            .dead_letter(self.envelope.clone(), reason)
            .await;
    }

    fn transport_name(&self) -> &str {
        &self.transport
    }

    fn source(&self) -> &Address {
        &self.source
    }
}

/// Receives envelopes from a queue or topic subscription and runs the
/// user handler with acknowledgement capabilities.
///
/// The intake channel is unbounded and dispatched strictly in order; the
/// concurrency limiter is acquired per message inside the loop, so a
/// limit of 1 yields FIFO handling while a larger limit detaches
/// handling onto spawned tasks after sequential dispatch.
pub struct Consumer {
    id: Uuid,
    name: String,
    transport: String,
    source: Address,
    options: ConsumerOptions,
    intake: Mutex<Option<mpsc::UnboundedSender<Envelope>>>,
    metrics: Arc<ConsumerMetrics>,
    cancel: CancellationToken,
    processing_loop: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Consumer {
    /// Create the consumer and spawn its processing loop.
    pub fn start(
        name: impl Into<String>,
        transport: impl Into<String>,
        source: Address,
        handler: Arc<dyn MessageHandler>,
        options: ConsumerOptions,
        dead_letters: SharedDeadLetterSink,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (intake_tx, intake_rx) = mpsc::unbounded_channel();
        let consumer = Arc::new(Self {
            id: Uuid::new_v4(),
            name: name.into(),
            transport: transport.into(),
            source,
            options,
            intake: Mutex::new(Some(intake_tx)),
            metrics: Arc::new(ConsumerMetrics::default()),
            cancel,
            processing_loop: tokio::sync::Mutex::new(None),
        });

        let handle = tokio::spawn(Self::run_loop(
            Arc::clone(&consumer),
            intake_rx,
            handler,
            dead_letters,
        ));
        // The loop handle is stored for stop(); try_lock cannot contend
        // here because the consumer was just created.
        if let Ok(mut slot) = consumer.processing_loop.try_lock() {
            *slot = Some(handle);
        }
        consumer
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &Address {
        &self.source
    }

    /// Hand an envelope to this consumer's intake.
    pub fn deliver(&self, envelope: Envelope) -> Result<()> {
        let intake = self.intake.lock().expect("intake lock poisoned");
        match intake.as_ref() {
            Some(tx) => tx
                .send(envelope)
                .map_err(|_| TransportError::ConsumerStopped(self.name.clone())),
            None => Err(TransportError::ConsumerStopped(self.name.clone())),
        }
    }

    /// Close the intake and wait for the loop to drain and exit, so no
    /// envelope is abandoned mid-handler.
    pub async fn stop(&self) {
        let closed = self.intake.lock().expect("intake lock poisoned").take();
        drop(closed);
        let handle = self.processing_loop.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(consumer = %self.name, error = %e, "Processing loop join failed");
            }
        }
    }

    pub fn metrics(&self) -> ConsumerMetricsSnapshot {
        ConsumerMetricsSnapshot {
            received: self.metrics.received.load(Ordering::SeqCst),
            acknowledged: self.metrics.acknowledged.load(Ordering::SeqCst),
            rejected: self.metrics.rejected.load(Ordering::SeqCst),
            dead_lettered: self.metrics.dead_lettered.load(Ordering::SeqCst),
            failures: self.metrics.failures.load(Ordering::SeqCst),
            currently_processing: self.metrics.currently_processing.load(Ordering::SeqCst),
            last_failure: self
                .metrics
                .last_failure
                .lock()
                .expect("metrics lock poisoned")
                .clone(),
            avg_processing_ms: *self
                .metrics
                .avg_processing_ms
                .lock()
                .expect("metrics lock poisoned"),
        }
    }

    async fn run_loop(
        consumer: Arc<Consumer>,
        mut intake_rx: mpsc::UnboundedReceiver<Envelope>,
        handler: Arc<dyn MessageHandler>,
        dead_letters: SharedDeadLetterSink,
    ) {
        let limiter = Arc::new(Semaphore::new(
            consumer.options.concurrent_message_limit.max(1),
        ));

        // One envelope at a time off the intake preserves per-consumer
        // FIFO; cancellation lets the current message finish.
        while let Some(envelope) = intake_rx.recv().await {
            consumer.metrics.received.fetch_add(1, Ordering::SeqCst);

            let permit = match Arc::clone(&limiter).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            if consumer.options.concurrent_message_limit > 1 {
                let consumer = Arc::clone(&consumer);
                let handler = Arc::clone(&handler);
                let dead_letters = Arc::clone(&dead_letters);
                tokio::spawn(async move {
                    Self::process_one(&consumer, envelope, &handler, &dead_letters).await;
                    drop(permit);
                });
            } else {
                Self::process_one(&consumer, envelope, &handler, &dead_letters).await;
                drop(permit);
            }

            if consumer.cancel.is_cancelled() {
                debug!(consumer = %consumer.name, "Consumer loop cancelled");
                break;
            }
        }
        debug!(consumer = %consumer.name, "Consumer loop drained");
    }

    async fn process_one(
        consumer: &Arc<Consumer>,
        envelope: Envelope,
        handler: &Arc<dyn MessageHandler>,
        dead_letters: &SharedDeadLetterSink,
    ) {
        let intake_tx = {
            let intake = consumer.intake.lock().expect("intake lock poisoned");
            intake.clone()
        };
        let Some(intake_tx) = intake_tx else {
            // Stopped between dispatch and processing; nothing to do.
            return;
        };

        consumer
            .metrics
            .currently_processing
            .fetch_add(1, Ordering::SeqCst);
        let started = Instant::now();

        let context = ConsumeContext {
            transport: consumer.transport.clone(),
            source: consumer.source.clone(),
            envelope: envelope.clone(),
            handled: AtomicBool::new(false),
            metrics: Arc::clone(&consumer.metrics),
            intake: intake_tx.clone(),
            dead_letters: Arc::clone(dead_letters),
        };

        let outcome = handler.handle(&envelope, &context).await;
        consumer.metrics.record_duration(started.elapsed());
        consumer
            .metrics
            .currently_processing
            .fetch_sub(1, Ordering::SeqCst);

        match outcome {
            Ok(()) => {
                if consumer.options.auto_acknowledge && !context.handled.load(Ordering::SeqCst) {
                    context.acknowledge().await;
                }
            }
            Err(error) => {
                Self::handle_failure(consumer, envelope, error, intake_tx, dead_letters).await;
            }
        }
    }

    async fn handle_failure(
        consumer: &Arc<Consumer>,
        envelope: Envelope,
        error: HandlerError,
        intake_tx: mpsc::UnboundedSender<Envelope>,
        dead_letters: &SharedDeadLetterSink,
    ) {
        consumer.metrics.failures.fetch_add(1, Ordering::SeqCst);
        *consumer
            .metrics
            .last_failure
            .lock()
            .expect("metrics lock poisoned") = Some(error.to_string());

        let redelivery = envelope.with_incremented_delivery();
        if redelivery.delivery_count() < consumer.options.max_delivery_attempts {
            // The failed attempt settles as rejected; the redelivery is a
            // fresh receive.
            consumer.metrics.rejected.fetch_add(1, Ordering::SeqCst);
            let delay = consumer.options.redelivery_delay(redelivery.delivery_count());
            warn!(
                consumer = %consumer.name,
                message_id = %redelivery.message_id(),
                delivery_count = redelivery.delivery_count(),
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Handler failed, scheduling redelivery"
            );
            // Redelivery is scheduled off the loop so it never blocks
            // subsequent envelopes.
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if intake_tx.send(redelivery).is_err() {
                    warn!("Redelivery dropped: consumer stopped");
                }
            });
        } else {
            consumer
                .metrics
                .dead_lettered
                .fetch_add(1, Ordering::SeqCst);
            dead_letters
                .dead_letter(redelivery, &format!("max delivery attempts: {}", error))
                .await;
        }
    }
}
