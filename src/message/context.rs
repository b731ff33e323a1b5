//! Per-invocation processing state and the tagged pipeline result.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::Message;

/// Which marker a message was dispatched as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Command,
    Query,
    Event,
}

impl MessageKind {
    /// Marker name used in validation failures.
    pub fn marker_name(&self) -> &'static str {
        match self {
            MessageKind::Command => "Command",
            MessageKind::Query => "Query",
            MessageKind::Event => "Event",
        }
    }
}

/// Type-erased, cloneable handler response.
///
/// Responses are `Clone` so the idempotency store can replay them; the
/// erased value is shared behind an `Arc`.
#[derive(Clone)]
pub struct ResponseValue(Arc<dyn Any + Send + Sync>);

impl ResponseValue {
    pub fn new<T: Send + Sync + 'static>(value: T) -> Self {
        Self(Arc::new(value))
    }

    /// Downcast to the expected response type, cloning out of the Arc.
    pub fn downcast<T: Clone + Send + Sync + 'static>(&self) -> Option<T> {
        self.0.downcast_ref::<T>().cloned()
    }

    pub fn downcast_ref<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl std::fmt::Debug for ResponseValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ResponseValue(..)")
    }
}

/// Result threaded through every decorator layer.
///
/// `Ok(None)` is a successful invocation without a return value;
/// `Ok(Some(_))` carries a command/query response.
pub type ProcessingResult = Result<Option<ResponseValue>, ProcessingError>;

/// Tagged pipeline error: kind, short message, optional retry-after hint,
/// and the original cause chain.
#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Business rule violated: {0}")]
    BusinessRule(String),

    #[error("Transient failure: {message}")]
    Transient {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Concurrency conflict: {0}")]
    Concurrency(String),

    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("Circuit open for '{operation}', retry after {retry_after:?}")]
    CircuitOpen {
        operation: String,
        retry_after: Duration,
    },

    #[error("Fatal: {message}")]
    Fatal {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl ProcessingError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            source: None,
        }
    }

    pub fn transient_with_source(
        message: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        Self::Transient {
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
            source: None,
        }
    }

    pub fn fatal_with_source(
        message: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        Self::Fatal {
            message: message.into(),
            source: Some(source),
        }
    }

    /// Stable kind name for logs and cached failure records.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::Unauthorized(_) => "unauthorized",
            Self::BusinessRule(_) => "business_rule",
            Self::Transient { .. } => "transient",
            Self::Cancelled => "cancelled",
            Self::Concurrency(_) => "concurrency",
            Self::RateLimited { .. } => "rate_limited",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::Fatal { .. } => "fatal",
        }
    }

    /// Eligible for retry. Cancellation is never retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Deterministic domain failure, eligible for idempotency caching.
    pub fn is_deterministic(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::NotFound(_) | Self::Unauthorized(_) | Self::BusinessRule(_)
        )
    }

    /// Retry-after hint, when one applies.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } | Self::CircuitOpen { retry_after, .. } => {
                Some(*retry_after)
            }
            _ => None,
        }
    }
}

/// State for one pipeline invocation.
///
/// Metadata mutations are visible only within this execution; the
/// attempt counter starts at 1 and is advanced by the retry decorator.
pub struct ProcessingContext {
    message: Arc<dyn Message>,
    kind: MessageKind,
    pub attempt: u32,
    cancellation: CancellationToken,
    correlation_id: Option<String>,
    causation_id: Option<Uuid>,
    metadata: HashMap<String, serde_json::Value>,
}

impl ProcessingContext {
    pub fn new(message: Arc<dyn Message>, kind: MessageKind) -> Self {
        Self::with_cancellation(message, kind, CancellationToken::new())
    }

    pub fn with_cancellation(
        message: Arc<dyn Message>,
        kind: MessageKind,
        cancellation: CancellationToken,
    ) -> Self {
        let correlation_id = message.correlation_id().map(str::to_owned);
        let causation_id = message.causation_id();
        Self {
            message,
            kind,
            attempt: 1,
            cancellation,
            correlation_id,
            causation_id,
            metadata: HashMap::new(),
        }
    }

    pub fn message(&self) -> &Arc<dyn Message> {
        &self.message
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn causation_id(&self) -> Option<Uuid> {
        self.causation_id
    }

    pub fn metadata(&self, key: &str) -> Option<&serde_json::Value> {
        self.metadata.get(key)
    }

    pub fn set_metadata(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.metadata.insert(key.into(), value);
    }

    /// Context handed to user handlers at terminal dispatch.
    pub fn handler_context(&self) -> HandlerContext {
        HandlerContext {
            cancellation: self.cancellation.clone(),
            correlation_id: self.correlation_id.clone(),
            causation_id: self.causation_id,
            attempt: self.attempt,
        }
    }
}

/// Narrow view of the processing context exposed to handlers.
#[derive(Clone)]
pub struct HandlerContext {
    pub cancellation: CancellationToken,
    pub correlation_id: Option<String>,
    pub causation_id: Option<Uuid>,
    pub attempt: u32,
}
