//! Error classification, context, and logging at the pipeline boundary.

use async_trait::async_trait;
use tracing::{debug, error, warn};

use crate::message::{ProcessingContext, ProcessingError, ProcessingResult};
use crate::pipeline::{MessageDecorator, Next};

/// Logs failures with operation context by severity class and lets every
/// error pass through typed. Sits just outside the terminal layers so
/// attempt counts from retry are visible in the log fields.
#[derive(Debug, Default)]
pub struct ErrorHandlingDecorator;

impl ErrorHandlingDecorator {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MessageDecorator for ErrorHandlingDecorator {
    fn name(&self) -> &'static str {
        "error_handling"
    }

    async fn process(&self, ctx: &mut ProcessingContext, next: Next<'_>) -> ProcessingResult {
        let result = next.run(ctx).await;

        if let Err(ref failure) = result {
            let message_type = ctx.message().message_type();
            let correlation_id = ctx.correlation_id().unwrap_or("");
            match failure {
                ProcessingError::Cancelled => {
                    debug!(
                        message_type = %message_type,
                        correlation_id = %correlation_id,
                        attempt = ctx.attempt,
                        "Processing cancelled"
                    );
                }
                ProcessingError::Validation(_)
                | ProcessingError::NotFound(_)
                | ProcessingError::Unauthorized(_)
                | ProcessingError::BusinessRule(_) => {
                    debug!(
                        message_type = %message_type,
                        correlation_id = %correlation_id,
                        attempt = ctx.attempt,
                        error = %failure,
                        kind = failure.kind_name(),
                        "Domain failure"
                    );
                }
                ProcessingError::Transient { .. }
                | ProcessingError::RateLimited { .. }
                | ProcessingError::CircuitOpen { .. }
                | ProcessingError::Concurrency(_) => {
                    warn!(
                        message_type = %message_type,
                        correlation_id = %correlation_id,
                        attempt = ctx.attempt,
                        error = %failure,
                        kind = failure.kind_name(),
                        "Recoverable failure"
                    );
                }
                ProcessingError::Fatal { .. } => {
                    error!(
                        message_type = %message_type,
                        correlation_id = %correlation_id,
                        attempt = ctx.attempt,
                        error = %failure,
                        "Fatal failure"
                    );
                }
            }
        }
        result
    }
}
