//! Message processing pipeline.
//!
//! This module contains:
//! - `MessageDecorator` trait: one cross-cutting concern per decorator
//! - `Pipeline`: ordered decorator chain around a terminal dispatcher
//! - `HandlerRegistry`: type-token handler registration and dispatch
//! - Decorator implementations (validation, idempotency, retry, ...)
//!
//! The pipeline itself has no policy beyond composition; decorators
//! implement policy and their declared order is the design. The
//! recommended producer-side order is Validation -> Idempotency ->
//! Batching -> RateLimiting -> Retry -> CircuitBreaker -> Transaction ->
//! ErrorHandling -> Telemetry -> terminal dispatch.

pub mod decorators;
mod dispatch;

pub use dispatch::{
    CommandHandler, Dispatcher, EventHandler, HandlerRegistry, QueryHandler, RegistryError,
    TerminalDispatcher,
};

use std::sync::Arc;

use async_trait::async_trait;

use crate::message::{ProcessingContext, ProcessingResult};

/// One cross-cutting concern wrapped around the rest of the chain.
///
/// A decorator may short-circuit (return without calling `next`),
/// translate errors, or re-invoke `next` (retry). `Next` is `Copy`, so
/// re-invocation is a plain second call.
#[async_trait]
pub trait MessageDecorator: Send + Sync {
    /// Decorator name for logging and diagnostics.
    fn name(&self) -> &'static str;

    async fn process(&self, ctx: &mut ProcessingContext, next: Next<'_>) -> ProcessingResult;
}

/// The remainder of the chain after the current decorator.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    decorators: &'a [Arc<dyn MessageDecorator>],
    terminal: &'a Arc<dyn TerminalDispatcher>,
}

impl<'a> Next<'a> {
    /// Run the remaining decorators and the terminal dispatcher.
    pub async fn run(self, ctx: &mut ProcessingContext) -> ProcessingResult {
        match self.decorators.split_first() {
            Some((head, rest)) => {
                head.process(
                    ctx,
                    Next {
                        decorators: rest,
                        terminal: self.terminal,
                    },
                )
                .await
            }
            None => self.terminal.dispatch(ctx).await,
        }
    }
}

/// Ordered decorator chain wrapping a terminal dispatcher.
pub struct Pipeline {
    decorators: Vec<Arc<dyn MessageDecorator>>,
    terminal: Arc<dyn TerminalDispatcher>,
}

impl Pipeline {
    pub(crate) fn from_parts(
        decorators: Vec<Arc<dyn MessageDecorator>>,
        terminal: Arc<dyn TerminalDispatcher>,
    ) -> Self {
        Self {
            decorators,
            terminal,
        }
    }

    /// Execute one message through the full chain.
    pub async fn execute(&self, ctx: &mut ProcessingContext) -> ProcessingResult {
        Next {
            decorators: &self.decorators,
            terminal: &self.terminal,
        }
        .run(ctx)
        .await
    }

    /// Declared decorator names, outermost first.
    pub fn decorator_names(&self) -> Vec<&'static str> {
        self.decorators.iter().map(|d| d.name()).collect()
    }
}

enum DecoratorEntry {
    Ready(Arc<dyn MessageDecorator>),
    /// Batching is materialized at build time: it needs the chain suffix
    /// after its own position as an owned inner pipeline for flushes.
    Batching(decorators::BatchingOptions),
}

/// Builder declaring the decorator order around a terminal dispatcher.
pub struct PipelineBuilder {
    entries: Vec<DecoratorEntry>,
    terminal: Arc<dyn TerminalDispatcher>,
}

impl PipelineBuilder {
    /// Start a pipeline over the given terminal dispatcher.
    pub fn new(terminal: Arc<dyn TerminalDispatcher>) -> Self {
        Self {
            entries: Vec::new(),
            terminal,
        }
    }

    /// Append a decorator; first appended is outermost.
    pub fn with_decorator(mut self, decorator: Arc<dyn MessageDecorator>) -> Self {
        self.entries.push(DecoratorEntry::Ready(decorator));
        self
    }

    /// Append the batching decorator at this position.
    pub fn with_batching(mut self, options: decorators::BatchingOptions) -> Self {
        self.entries.push(DecoratorEntry::Batching(options));
        self
    }

    pub fn build(self) -> Arc<Pipeline> {
        let terminal = self.terminal;
        // Assembled back to front so batching can capture the suffix
        // after its own position as an owned inner pipeline.
        let mut suffix_reversed: Vec<Arc<dyn MessageDecorator>> = Vec::new();
        for entry in self.entries.into_iter().rev() {
            let decorator: Arc<dyn MessageDecorator> = match entry {
                DecoratorEntry::Ready(decorator) => decorator,
                DecoratorEntry::Batching(options) => {
                    let suffix: Vec<Arc<dyn MessageDecorator>> =
                        suffix_reversed.iter().rev().cloned().collect();
                    let inner =
                        Arc::new(Pipeline::from_parts(suffix, Arc::clone(&terminal)));
                    Arc::new(decorators::BatchingDecorator::new(options, inner))
                }
            };
            suffix_reversed.push(decorator);
        }
        suffix_reversed.reverse();
        Arc::new(Pipeline::from_parts(suffix_reversed, terminal))
    }
}
