//! Marker-interface validation.

use async_trait::async_trait;

use crate::message::{MessageKind, ProcessingContext, ProcessingError, ProcessingResult};
use crate::pipeline::{MessageDecorator, Next};

/// Which marker kinds the pipeline accepts.
#[derive(Debug, Clone)]
pub struct ValidationOptions {
    pub allowed: Vec<MessageKind>,
}

impl Default for ValidationOptions {
    fn default() -> Self {
        Self {
            allowed: vec![MessageKind::Command, MessageKind::Event],
        }
    }
}

impl ValidationOptions {
    /// Accept commands, queries, and events.
    pub fn all() -> Self {
        Self {
            allowed: vec![MessageKind::Command, MessageKind::Query, MessageKind::Event],
        }
    }
}

/// Rejects messages dispatched under a marker the pipeline was not
/// configured to accept. The failure enumerates the allowed markers.
pub struct ValidationDecorator {
    options: ValidationOptions,
}

impl ValidationDecorator {
    pub fn new(options: ValidationOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl MessageDecorator for ValidationDecorator {
    fn name(&self) -> &'static str {
        "validation"
    }

    async fn process(&self, ctx: &mut ProcessingContext, next: Next<'_>) -> ProcessingResult {
        if !self.options.allowed.contains(&ctx.kind()) {
            let allowed = self
                .options
                .allowed
                .iter()
                .map(|kind| kind.marker_name())
                .collect::<Vec<_>>()
                .join(", ");
            return Err(ProcessingError::Validation(format!(
                "message '{}' was dispatched as {} but this pipeline accepts only: {}",
                ctx.message().message_type(),
                ctx.kind().marker_name(),
                allowed
            )));
        }
        next.run(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::pipeline::tests::{command_context, noop_terminal, query_context};
    use crate::pipeline::PipelineBuilder;

    #[tokio::test]
    async fn test_allowed_kind_passes() {
        let pipeline = PipelineBuilder::new(noop_terminal())
            .with_decorator(Arc::new(ValidationDecorator::new(ValidationOptions::default())))
            .build();
        let mut ctx = command_context();
        assert!(pipeline.execute(&mut ctx).await.is_ok());
    }

    #[tokio::test]
    async fn test_disallowed_kind_rejected_with_enumeration() {
        let pipeline = PipelineBuilder::new(noop_terminal())
            .with_decorator(Arc::new(ValidationDecorator::new(ValidationOptions::default())))
            .build();
        let mut ctx = query_context();
        let error = pipeline.execute(&mut ctx).await.unwrap_err();
        match error {
            ProcessingError::Validation(message) => {
                assert!(message.contains("Command, Event"), "message: {}", message);
            }
            other => panic!("expected validation failure, got {}", other),
        }
    }
}
