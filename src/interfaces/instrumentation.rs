//! Transport instrumentation contract.
//!
//! Spans and counters are emitted at send/publish/receive boundaries;
//! trace context travels through envelope headers so an external tracer
//! can stitch producer and consumer together.

use crate::message::Envelope;

/// Header carrying the propagated trace context.
pub const TRACE_CONTEXT_HEADER: &str = "traceparent";

/// Hooks invoked by the transport at message boundaries.
pub trait TransportInstrumentation: Send + Sync {
    /// A message is about to be enqueued.
    fn on_send(&self, transport: &str, envelope: &Envelope);

    /// A message is about to be fanned out to subscriptions.
    fn on_publish(&self, transport: &str, envelope: &Envelope);

    /// A consumer received a message.
    fn on_receive(&self, transport: &str, consumer: &str, envelope: &Envelope);

    /// Inject the current trace context into outgoing headers.
    fn inject_trace_context(&self, envelope: &mut Envelope);

    /// Extract the trace context from incoming headers, if present.
    fn extract_trace_context(&self, envelope: &Envelope) -> Option<String> {
        envelope.header(TRACE_CONTEXT_HEADER).map(str::to_owned)
    }
}

/// Default instrumentation: structured log lines only.
#[derive(Debug, Default)]
pub struct NoopInstrumentation;

impl TransportInstrumentation for NoopInstrumentation {
    fn on_send(&self, transport: &str, envelope: &Envelope) {
        tracing::trace!(
            transport = %transport,
            message_type = %envelope.message_type(),
            message_id = %envelope.message_id(),
            "send"
        );
    }

    fn on_publish(&self, transport: &str, envelope: &Envelope) {
        tracing::trace!(
            transport = %transport,
            message_type = %envelope.message_type(),
            message_id = %envelope.message_id(),
            "publish"
        );
    }

    fn on_receive(&self, transport: &str, consumer: &str, envelope: &Envelope) {
        tracing::trace!(
            transport = %transport,
            consumer = %consumer,
            message_type = %envelope.message_type(),
            message_id = %envelope.message_id(),
            "receive"
        );
    }

    fn inject_trace_context(&self, _envelope: &mut Envelope) {}
}
