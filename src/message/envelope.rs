//! Transport envelope and addressing.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Kind of transport destination an address names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressKind {
    /// Point-to-point queue with competing consumers.
    Queue,
    /// Pub/sub topic fanning out to all subscriptions.
    Topic,
    /// Routing exchange (reserved for external bindings).
    Exchange,
    /// A named subscription on a topic.
    Subscription,
}

/// Immutable transport address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    name: String,
    kind: AddressKind,
    scheme: Option<String>,
}

impl Address {
    /// Create an address. The name must be non-empty.
    pub fn new(name: impl Into<String>, kind: AddressKind) -> Result<Self, AddressError> {
        let name = name.into();
        if name.is_empty() {
            return Err(AddressError::EmptyName);
        }
        Ok(Self {
            name,
            kind,
            scheme: None,
        })
    }

    /// Queue address shorthand.
    pub fn queue(name: impl Into<String>) -> Result<Self, AddressError> {
        Self::new(name, AddressKind::Queue)
    }

    /// Topic address shorthand.
    pub fn topic(name: impl Into<String>) -> Result<Self, AddressError> {
        Self::new(name, AddressKind::Topic)
    }

    /// Attach a scheme (e.g. "memory").
    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = Some(scheme.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> AddressKind {
        self.kind
    }

    pub fn scheme(&self) -> Option<&str> {
        self.scheme.as_deref()
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.scheme {
            Some(scheme) => write!(f, "{}://{}", scheme, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Errors constructing an address.
#[derive(Debug, thiserror::Error)]
pub enum AddressError {
    #[error("Address name must be non-empty")]
    EmptyName,
}

/// Transport-level container carrying a serialized message plus headers.
///
/// The header map is copy-on-write: clones share the map until one of
/// them mutates it. Delivery count only moves forward; redelivery copies
/// are produced with [`Envelope::with_incremented_delivery`].
#[derive(Debug, Clone)]
pub struct Envelope {
    message_id: Uuid,
    correlation_id: Option<String>,
    message_type: String,
    body: Bytes,
    content_type: String,
    headers: Arc<HashMap<String, String>>,
    timestamp: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    priority: u8,
    delivery_count: u32,
    source: Option<Address>,
    destination: Option<Address>,
}

impl Envelope {
    /// Create an envelope for a serialized message body.
    pub fn new(
        message_id: Uuid,
        message_type: impl Into<String>,
        body: Bytes,
        content_type: impl Into<String>,
    ) -> Self {
        Self {
            message_id,
            correlation_id: None,
            message_type: message_type.into(),
            body,
            content_type: content_type.into(),
            headers: Arc::new(HashMap::new()),
            timestamp: Utc::now(),
            expires_at: None,
            priority: 0,
            delivery_count: 0,
            source: None,
            destination: None,
        }
    }

    pub fn message_id(&self) -> Uuid {
        self.message_id
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    pub fn source(&self) -> Option<&Address> {
        self.source.as_ref()
    }

    pub fn destination(&self) -> Option<&Address> {
        self.destination.as_ref()
    }

    /// Whether the envelope has passed its expiry.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// Set a header. Clones the shared map on first write.
    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        Arc::make_mut(&mut self.headers).insert(key.into(), value.into());
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_source(mut self, source: Address) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_destination(mut self, destination: Address) -> Self {
        self.destination = Some(destination);
        self
    }

    /// Copy for redelivery with the delivery count advanced.
    pub fn with_incremented_delivery(&self) -> Self {
        let mut copy = self.clone();
        copy.delivery_count = self.delivery_count.saturating_add(1);
        copy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_requires_name() {
        assert!(matches!(Address::queue(""), Err(AddressError::EmptyName)));
        assert!(Address::queue("orders").is_ok());
    }

    #[test]
    fn test_address_display_with_scheme() {
        let addr = Address::topic("audit").unwrap().with_scheme("memory");
        assert_eq!(addr.to_string(), "memory://audit");
    }

    #[test]
    fn test_headers_copy_on_write() {
        let mut original = Envelope::new(
            Uuid::new_v4(),
            "OrderCreated",
            Bytes::from_static(b"{}"),
            "application/json",
        );
        original.set_header("trace", "abc");

        let mut copy = original.clone();
        copy.set_header("trace", "def");

        assert_eq!(original.header("trace"), Some("abc"));
        assert_eq!(copy.header("trace"), Some("def"));
    }

    #[test]
    fn test_delivery_count_monotonic() {
        let envelope = Envelope::new(
            Uuid::new_v4(),
            "OrderCreated",
            Bytes::new(),
            "application/json",
        );
        let redelivered = envelope.with_incremented_delivery();
        assert_eq!(envelope.delivery_count(), 0);
        assert_eq!(redelivered.delivery_count(), 1);
        // Body and headers survive the copy.
        assert_eq!(redelivered.message_id(), envelope.message_id());
    }

    #[test]
    fn test_expiry() {
        let envelope = Envelope::new(Uuid::new_v4(), "Ping", Bytes::new(), "application/json")
            .with_expiry(Utc::now() - chrono::Duration::seconds(1));
        assert!(envelope.is_expired(Utc::now()));
    }
}
