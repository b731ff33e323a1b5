//! Unit-of-work scope around terminal dispatch.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, warn};

use crate::interfaces::UnitOfWork;
use crate::message::{ProcessingContext, ProcessingError, ProcessingResult};
use crate::pipeline::{MessageDecorator, Next};

/// Opens a transaction before the inner chain runs, commits on success,
/// and rolls back on failure. A failed commit surfaces as transient so
/// retry layers can redeliver.
pub struct TransactionDecorator {
    unit_of_work: Arc<dyn UnitOfWork>,
}

impl TransactionDecorator {
    pub fn new(unit_of_work: Arc<dyn UnitOfWork>) -> Self {
        Self { unit_of_work }
    }
}

#[async_trait]
impl MessageDecorator for TransactionDecorator {
    fn name(&self) -> &'static str {
        "transaction"
    }

    async fn process(&self, ctx: &mut ProcessingContext, next: Next<'_>) -> ProcessingResult {
        if let Err(e) = self.unit_of_work.begin().await {
            return Err(ProcessingError::transient_with_source(
                "failed to begin transaction",
                Box::new(e),
            ));
        }

        match next.run(ctx).await {
            Ok(value) => {
                if let Err(e) = self.unit_of_work.commit().await {
                    error!(
                        message_type = %ctx.message().message_type(),
                        error = %e,
                        "Commit failed"
                    );
                    return Err(ProcessingError::transient_with_source(
                        "failed to commit transaction",
                        Box::new(e),
                    ));
                }
                Ok(value)
            }
            Err(inner) => {
                if let Err(e) = self.unit_of_work.rollback().await {
                    // The original failure stays the primary signal.
                    warn!(
                        message_type = %ctx.message().message_type(),
                        error = %e,
                        "Rollback failed"
                    );
                }
                Err(inner)
            }
        }
    }
}
