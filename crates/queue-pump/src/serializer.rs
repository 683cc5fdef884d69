//! Pluggable payload encoding.

use crate::error::SerializationError;
use serde_json::Value;

/// Converts between message bodies and structured values.
///
/// Typed payloads are produced from the returned [`Value`] by the handler
/// registry, so a serializer only has to understand the wire format.
pub trait MessageSerializer: Send + Sync {
    fn serialize(&self, value: &Value) -> Result<String, SerializationError>;

    fn deserialize(&self, body: &str) -> Result<Value, SerializationError>;
}

/// JSON wire format.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonMessageSerializer;

impl MessageSerializer for JsonMessageSerializer {
    fn serialize(&self, value: &Value) -> Result<String, SerializationError> {
        Ok(serde_json::to_string(value)?)
    }

    fn deserialize(&self, body: &str) -> Result<Value, SerializationError> {
        Ok(serde_json::from_str(body)?)
    }
}

#[cfg(test)]
#[path = "serializer_tests.rs"]
mod tests;
