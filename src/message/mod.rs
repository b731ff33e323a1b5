//! Message model for the processing runtime.
//!
//! This module contains:
//! - `Message` trait and the `Command`/`Query`/`Event` marker traits
//! - `Envelope`: transport-level container with headers and delivery state
//! - `Address`: queue/topic addressing
//! - `ProcessingContext`/`ProcessingResult`: per-invocation pipeline state

mod context;
mod envelope;

pub use context::{
    HandlerContext, MessageKind, ProcessingContext, ProcessingError, ProcessingResult,
    ResponseValue,
};
pub use envelope::{Address, AddressError, AddressKind, Envelope};

use std::any::Any;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// A message flowing through the runtime.
///
/// Identity and timestamp are fixed at creation. Correlation groups all
/// messages belonging to one logical workflow; causation points at the
/// message that directly produced this one.
pub trait Message: Send + Sync + 'static {
    /// Unique id, immutable for the lifetime of the message.
    fn message_id(&self) -> Uuid;

    /// Creation timestamp, never mutated after creation.
    fn timestamp(&self) -> DateTime<Utc>;

    /// Correlation id grouping this message's workflow, if any.
    fn correlation_id(&self) -> Option<&str> {
        None
    }

    /// Id of the message that directly caused this one, if any.
    fn causation_id(&self) -> Option<Uuid> {
        None
    }

    /// Stable type name used for envelopes, logging, and version lookup.
    fn message_type(&self) -> &'static str;

    /// Canonical payload for content-based fingerprinting.
    ///
    /// Types that opt into content-hash idempotency return
    /// `Some(serde_json::to_value(self))`; the default opts out and the
    /// idempotency decorator falls back to the message id.
    fn canonical_payload(&self) -> Option<serde_json::Value> {
        None
    }

    /// Downcast support for the type-token handler registry.
    fn as_any(&self) -> &dyn Any;
}

/// Marker for messages that request a state change.
pub trait Command: Message {}

/// Marker for read-only requests. Handlers are contractually free of
/// state mutation; the runtime does not enforce this.
pub trait Query: Message {}

/// Marker for facts that already happened. Zero or more handlers.
pub trait Event: Message {}
