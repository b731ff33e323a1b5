//! Message serialization contract.
//!
//! The wire format is a collaborator concern; the core carries the
//! content type on the envelope and treats bodies as opaque bytes.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::message::{Envelope, Message};

/// Result type for serializer operations.
pub type Result<T> = std::result::Result<T, SerializerError>;

/// Errors raised during (de)serialization.
#[derive(Debug, thiserror::Error)]
pub enum SerializerError {
    #[error("Serialization failed: {0}")]
    Serialize(String),

    #[error("Deserialization failed: {0}")]
    Deserialize(String),

    #[error("Content type '{found}' does not match serializer '{expected}'")]
    ContentTypeMismatch { expected: String, found: String },
}

/// Opaque blob <-> structured value conversion.
pub trait Serializer: Send + Sync {
    /// Content type stamped on envelopes produced with this serializer.
    fn content_type(&self) -> &'static str;

    fn serialize_value(&self, value: &serde_json::Value) -> Result<Bytes>;

    fn deserialize_value(&self, bytes: &[u8]) -> Result<serde_json::Value>;
}

/// Serialize a typed message into a transport envelope.
pub fn to_envelope<M>(message: &M, serializer: &dyn Serializer) -> Result<Envelope>
where
    M: Message + Serialize,
{
    let value = serde_json::to_value(message)
        .map_err(|e| SerializerError::Serialize(e.to_string()))?;
    let body = serializer.serialize_value(&value)?;
    let mut envelope = Envelope::new(
        message.message_id(),
        message.message_type(),
        body,
        serializer.content_type(),
    );
    if let Some(correlation_id) = message.correlation_id() {
        envelope = envelope.with_correlation_id(correlation_id);
    }
    Ok(envelope)
}

/// Deserialize an envelope body back into a typed message.
pub fn from_envelope<M>(envelope: &Envelope, serializer: &dyn Serializer) -> Result<M>
where
    M: Message + DeserializeOwned,
{
    if envelope.content_type() != serializer.content_type() {
        return Err(SerializerError::ContentTypeMismatch {
            expected: serializer.content_type().to_string(),
            found: envelope.content_type().to_string(),
        });
    }
    let value = serializer.deserialize_value(envelope.body())?;
    serde_json::from_value(value).map_err(|e| SerializerError::Deserialize(e.to_string()))
}

/// JSON serializer shipped with the core.
#[derive(Debug, Default, Clone)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn serialize_value(&self, value: &serde_json::Value) -> Result<Bytes> {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|e| SerializerError::Serialize(e.to_string()))
    }

    fn deserialize_value(&self, bytes: &[u8]) -> Result<serde_json::Value> {
        serde_json::from_slice(bytes).map_err(|e| SerializerError::Deserialize(e.to_string()))
    }
}
