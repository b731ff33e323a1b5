//! Message transport for in-process delivery.
//!
//! This module contains:
//! - `TransportState`: connection lifecycle state machine
//! - `MessageHandler` trait: consumer-side message processing
//! - `DeadLetterSink` trait: terminal routing for poisoned messages
//! - Transport configuration types
//! - Implementation: in-memory queues/topics with competing consumers

pub mod memory;

pub use memory::{
    Consumer, ConsumerMetricsSnapshot, ConsumerOptions, InMemoryQueue, InMemoryTopic,
    InMemoryTransport, QueueOptions, TransportOptions,
};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::message::{Address, AddressKind, Envelope};

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Boxed error returned by user message handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Transport is {actual:?}; operation requires Connected")]
    NotConnected { actual: TransportState },

    #[error("Invalid state transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: TransportState,
        to: TransportState,
    },

    #[error("Queue '{0}' is closed")]
    QueueClosed(String),

    #[error("Address '{address}' is a {found:?}, expected {expected:?}")]
    WrongAddressKind {
        address: String,
        expected: AddressKind,
        found: AddressKind,
    },

    #[error("Consumer '{0}' is stopped")]
    ConsumerStopped(String),

    #[error("Delivery failed: {0}")]
    Delivery(String),

    #[error("Operation cancelled")]
    Cancelled,
}

/// Connection lifecycle state.
///
/// Transitions form a cycle through the connect/disconnect pair:
/// Disconnected -> Connecting -> Connected -> Disconnecting -> Disconnected.
/// Only one state change is in flight at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl TransportState {
    /// Whether moving to `next` is a legal lifecycle step.
    pub fn can_transition_to(&self, next: TransportState) -> bool {
        use TransportState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Disconnecting)
                | (Disconnecting, Disconnected)
        )
    }
}

/// State-change and error notifications emitted by a transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    StateChanged {
        from: TransportState,
        to: TransportState,
    },
    Error {
        message: String,
    },
}

/// Context handed to a [`MessageHandler`] for one received envelope.
///
/// Exposes the acknowledgement surface: exactly one of acknowledge,
/// reject, defer, or dead-letter should be called; when none is and the
/// consumer runs with auto-acknowledge, the consumer acknowledges after
/// the handler returns.
#[async_trait]
pub trait ConsumeActions: Send + Sync {
    /// Mark the envelope successfully processed.
    async fn acknowledge(&self);

    /// Refuse the envelope; optionally requeue it for redelivery.
    async fn reject(&self, requeue: bool);

    /// Requeue the envelope after a delay.
    async fn defer(&self, delay: Duration);

    /// Route the envelope to the dead-letter sink.
    async fn dead_letter(&self, reason: &str);

    /// Transport the envelope arrived on.
    fn transport_name(&self) -> &str;

    /// Address the envelope was consumed from.
    fn source(&self) -> &Address;
}

/// Handler invoked by a consumer for each received envelope.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(
        &self,
        envelope: &Envelope,
        actions: &dyn ConsumeActions,
    ) -> std::result::Result<(), HandlerError>;
}

/// A dead-lettered envelope plus the reason it was parked.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub envelope: Envelope,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Terminal routing for envelopes that exhausted their delivery attempts
/// or were explicitly dead-lettered by a handler.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn dead_letter(&self, envelope: Envelope, reason: &str);
}

/// Default sink: keeps dead letters in memory for inspection.
#[derive(Default)]
pub struct CollectingDeadLetterSink {
    entries: std::sync::Mutex<Vec<DeadLetter>>,
}

impl CollectingDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<DeadLetter> {
        std::mem::take(&mut self.entries.lock().expect("dead letter lock poisoned"))
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("dead letter lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DeadLetterSink for CollectingDeadLetterSink {
    async fn dead_letter(&self, envelope: Envelope, reason: &str) {
        tracing::warn!(
            message_id = %envelope.message_id(),
            message_type = %envelope.message_type(),
            reason = %reason,
            "Envelope dead-lettered"
        );
        self.entries
            .lock()
            .expect("dead letter lock poisoned")
            .push(DeadLetter {
                envelope,
                reason: reason.to_string(),
                at: Utc::now(),
            });
    }
}

/// Policy for a full queue buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Block the producer until space frees up.
    #[default]
    Wait,
    /// Evict the oldest pending envelope.
    DropOldest,
}

/// Declarative topology applied via `configure_topology`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Topology {
    pub queues: Vec<QueueTopology>,
    pub topics: Vec<TopicTopology>,
}

/// Queue declaration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueTopology {
    pub name: String,
    pub capacity: usize,
    pub overflow: OverflowPolicy,
}

impl Default for QueueTopology {
    fn default() -> Self {
        Self {
            name: String::new(),
            capacity: 1024,
            overflow: OverflowPolicy::Wait,
        }
    }
}

/// Topic declaration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TopicTopology {
    pub name: String,
}

/// Aggregate transport health snapshot.
#[derive(Debug, Clone)]
pub struct TransportHealth {
    pub state: TransportState,
    pub queues: Vec<QueueHealth>,
    pub consumers: Vec<ConsumerHealth>,
    pub dead_letters: usize,
}

/// Per-queue health.
#[derive(Debug, Clone)]
pub struct QueueHealth {
    pub name: String,
    pub depth: usize,
    pub enqueued: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub consumers: usize,
}

/// Per-consumer health.
#[derive(Debug, Clone)]
pub struct ConsumerHealth {
    pub name: String,
    pub metrics: memory::ConsumerMetricsSnapshot,
}

pub(crate) type SharedDeadLetterSink = Arc<dyn DeadLetterSink>;
