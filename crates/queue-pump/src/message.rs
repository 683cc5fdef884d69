//! Message types flowing through the pump, including core domain identifiers.

use crate::error::{ParseError, ProcessingError, ValidationError};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Well-known message attribute names.
pub mod attributes {
    /// Carries the logical message type name.
    pub const MESSAGE_TYPE: &str = "messageType";

    /// Present when the message was relayed through a publish/subscribe topic.
    pub const FROM_RELAY: &str = "fromSns";

    /// Service-reported delivery counter.
    pub const RECEIVE_COUNT: &str = "ApproximateReceiveCount";
}

/// Name under which the envelope type itself is registered for generic fault handlers.
pub const TRANSPORT_MESSAGE_TYPE: &str = "TransportMessage";

/// SQS-compatible queue name: 1-80 characters of `[A-Za-z0-9_-]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueName(String);

impl QueueName {
    pub const MAX_LENGTH: usize = 80;

    pub fn new(name: String) -> Result<Self, ValidationError> {
        if name.trim().is_empty() || name.len() > Self::MAX_LENGTH {
            return Err(ValidationError::OutOfRange {
                field: "queue_name".to_string(),
                message: format!("must be 1-{} characters", Self::MAX_LENGTH),
            });
        }

        if let Some(bad) = name
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
        {
            return Err(ValidationError::InvalidFormat {
                field: "queue_name".to_string(),
                message: format!("character '{}' is not allowed in an SQS queue name", bad),
            });
        }

        Ok(Self(name))
    }

    /// Name of the paired dead-letter queue (`<name>_Dead_Letter`)
    pub fn dead_letter(&self) -> Result<Self, ValidationError> {
        Self::new(format!("{}_Dead_Letter", self.0))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a file-queue record. Doubles as its file name and receipt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// UTC instant stored on file-queue records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    pub fn now() -> Self {
        Self(Utc::now())
    }

    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }

    /// Shift forward, saturating at the original instant on overflow
    pub fn plus(&self, duration: Duration) -> Self {
        ChronoDuration::from_std(duration)
            .ok()
            .and_then(|delta| self.0.checked_add_signed(delta))
            .map(Self)
            .unwrap_or(*self)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

// ============================================================================
// Message Type Descriptors
// ============================================================================

/// A message payload type that can travel through a queue.
///
/// `MESSAGE_TYPE` is the name stamped into the `messageType` attribute on
/// send and matched (case-insensitively) on receive.
pub trait QueueMessage: Serialize + DeserializeOwned + Send + Sync + 'static {
    const MESSAGE_TYPE: &'static str;
}

/// Resolved descriptor of a payload type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageType {
    name: &'static str,
    type_id: TypeId,
}

impl MessageType {
    /// Descriptor for a concrete payload type
    pub fn of<M: QueueMessage>() -> Self {
        Self {
            name: M::MESSAGE_TYPE,
            type_id: TypeId::of::<M>(),
        }
    }

    /// Descriptor for the envelope itself, the key for generic fault handlers
    pub fn generic() -> Self {
        Self {
            name: TRANSPORT_MESSAGE_TYPE,
            type_id: TypeId::of::<TransportMessage>(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_generic(&self) -> bool {
        self.type_id == TypeId::of::<TransportMessage>()
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Type-erased decoded payload.
pub type Payload = Arc<dyn Any + Send + Sync>;

// ============================================================================
// Raw and Transport Messages
// ============================================================================

/// A record exactly as a backend delivered it, before parsing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawMessage {
    pub message_id: String,
    pub receipt_handle: String,
    pub body: String,
    /// Service-level attributes such as the receive counter.
    pub attributes: HashMap<String, String>,
    /// User-level attributes such as the message type.
    pub message_attributes: HashMap<String, String>,
}

impl RawMessage {
    pub fn new(
        message_id: impl Into<String>,
        receipt_handle: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            receipt_handle: receipt_handle.into(),
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_message_attribute(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.message_attributes.insert(key.into(), value.into());
        self
    }
}

/// Decoded envelope carrying a payload plus delivery metadata.
///
/// A message either parsed successfully, in which case it carries a payload and
/// a resolved type, or it failed, in which case it carries a [`ParseError`] and
/// no payload. The constructors are the only way to build one.
#[derive(Clone)]
pub struct TransportMessage {
    id: String,
    receipt_handle: String,
    body: String,
    message_type_name: Option<String>,
    message_type: Option<MessageType>,
    message: Option<Payload>,
    attempt_number: u32,
    parse_error: Option<ParseError>,
    published: bool,
}

impl TransportMessage {
    /// Envelope for a successfully decoded payload
    pub fn parsed(
        id: impl Into<String>,
        receipt_handle: impl Into<String>,
        body: impl Into<String>,
        message_type: MessageType,
        message: Payload,
    ) -> Self {
        Self {
            id: id.into(),
            receipt_handle: receipt_handle.into(),
            body: body.into(),
            message_type_name: Some(message_type.name().to_string()),
            message_type: Some(message_type),
            message: Some(message),
            attempt_number: 0,
            parse_error: None,
            published: false,
        }
    }

    /// Envelope for a record that could not be decoded
    pub fn failed(
        id: impl Into<String>,
        receipt_handle: impl Into<String>,
        body: impl Into<String>,
        error: ParseError,
    ) -> Self {
        Self {
            id: id.into(),
            receipt_handle: receipt_handle.into(),
            body: body.into(),
            message_type_name: None,
            message_type: None,
            message: None,
            attempt_number: 0,
            parse_error: Some(error),
            published: false,
        }
    }

    /// Convenience constructor for a typed payload
    pub fn from_payload<M: QueueMessage>(
        id: impl Into<String>,
        receipt_handle: impl Into<String>,
        message: M,
    ) -> Self {
        let body = serde_json::to_string(&message).unwrap_or_default();
        Self::parsed(id, receipt_handle, body, MessageType::of::<M>(), Arc::new(message))
    }

    pub fn with_attempt_number(mut self, attempt_number: u32) -> Self {
        self.attempt_number = attempt_number;
        self
    }

    pub fn with_published(mut self, published: bool) -> Self {
        self.published = published;
        self
    }

    /// Record the type name read from the wire, even if it did not resolve
    pub fn with_message_type_name(mut self, name: impl Into<String>) -> Self {
        self.message_type_name = Some(name.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn receipt_handle(&self) -> &str {
        &self.receipt_handle
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn message_type_name(&self) -> Option<&str> {
        self.message_type_name.as_deref()
    }

    pub fn message_type(&self) -> Option<MessageType> {
        self.message_type
    }

    pub fn message(&self) -> Option<&Payload> {
        self.message.as_ref()
    }

    /// Typed view of the payload, if it was decoded as `M`
    pub fn payload<M: Any>(&self) -> Option<&M> {
        self.message.as_ref().and_then(|m| m.downcast_ref::<M>())
    }

    pub fn attempt_number(&self) -> u32 {
        self.attempt_number
    }

    pub fn parsing_succeeded(&self) -> bool {
        self.parse_error.is_none()
    }

    pub fn parse_error(&self) -> Option<&ParseError> {
        self.parse_error.as_ref()
    }

    pub fn published(&self) -> bool {
        self.published
    }
}

impl fmt::Debug for TransportMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportMessage")
            .field("id", &self.id)
            .field("receipt_handle", &self.receipt_handle)
            .field("message_type_name", &self.message_type_name)
            .field("attempt_number", &self.attempt_number)
            .field("parsing_succeeded", &self.parsing_succeeded())
            .field("parse_error", &self.parse_error)
            .field("published", &self.published)
            .field("body_length", &self.body.len())
            .finish()
    }
}

// ============================================================================
// Processing Results
// ============================================================================

/// Outcome of dispatching one message to its handlers.
#[derive(Debug, Clone)]
pub struct MessageProcessingResult {
    pub successful: bool,
    pub error: Option<Arc<ProcessingError>>,
    pub runtime: Duration,
}

impl MessageProcessingResult {
    pub fn success(runtime: Duration) -> Self {
        Self {
            successful: true,
            error: None,
            runtime,
        }
    }

    pub fn failure(error: ProcessingError, runtime: Duration) -> Self {
        Self {
            successful: false,
            error: Some(Arc::new(error)),
            runtime,
        }
    }
}

/// Per-message numbers handed to statistics handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageStatistics {
    pub final_attempt: bool,
    pub handler_runtime: Duration,
    pub body_length: usize,
    pub message_type_name: Option<String>,
    pub successful: bool,
    pub previous_attempt_count: u32,
}

/// Ordered key/value pair attached to a sent message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataEntry {
    pub key: String,
    pub value: String,
}

impl MetadataEntry {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
