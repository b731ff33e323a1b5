//! Spans and timing around message processing.

use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, info_span, Instrument};

use crate::message::{ProcessingContext, ProcessingResult};
use crate::pipeline::{MessageDecorator, Next};

/// Wraps the inner chain in a tracing span carrying message identity and
/// records the processing duration on completion.
#[derive(Debug, Default)]
pub struct TelemetryDecorator;

impl TelemetryDecorator {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MessageDecorator for TelemetryDecorator {
    fn name(&self) -> &'static str {
        "telemetry"
    }

    async fn process(&self, ctx: &mut ProcessingContext, next: Next<'_>) -> ProcessingResult {
        let span = info_span!(
            "process_message",
            message_type = %ctx.message().message_type(),
            message_id = %ctx.message().message_id(),
            correlation_id = ctx.correlation_id().unwrap_or(""),
            kind = ctx.kind().marker_name(),
            attempt = ctx.attempt,
        );

        let started = Instant::now();
        let result = next.run(ctx).instrument(span).await;
        debug!(
            duration_ms = started.elapsed().as_millis() as u64,
            success = result.is_ok(),
            "Message processed"
        );
        result
    }
}
