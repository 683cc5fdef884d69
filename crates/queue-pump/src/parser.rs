//! Decoding of raw backend records into transport messages.

use crate::error::ParseError;
use crate::message::{attributes, RawMessage, TransportMessage};
use crate::registry::HandlerRegistry;
use crate::serializer::MessageSerializer;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Turns a raw backend record into a [`TransportMessage`].
///
/// Parsing never fails outright. A record that cannot be decoded yields a
/// message with `parsing_succeeded() == false` that still carries its receipt
/// handle, so it can be faulted and redelivered like any other message.
pub trait MessageParser: Send + Sync {
    fn parse(&self, raw: RawMessage) -> TransportMessage;
}

/// Envelope used when a message was relayed through a publish/subscribe topic.
#[derive(Debug, Deserialize)]
struct RelayEnvelope {
    #[serde(rename = "Message")]
    message: String,

    #[serde(rename = "MessageAttributes", default)]
    message_attributes: HashMap<String, RelayAttribute>,
}

#[derive(Debug, Deserialize)]
struct RelayAttribute {
    #[serde(rename = "Value")]
    value: String,
}

/// Parser resolving type names against a [`HandlerRegistry`].
pub struct DefaultMessageParser {
    registry: Arc<HandlerRegistry>,
    serializer: Arc<dyn MessageSerializer>,
}

impl DefaultMessageParser {
    pub fn new(registry: Arc<HandlerRegistry>, serializer: Arc<dyn MessageSerializer>) -> Self {
        Self {
            registry,
            serializer,
        }
    }

    fn unwrap_relay_envelope(&self, body: &str) -> Result<(String, String), ParseError> {
        let value = self
            .serializer
            .deserialize(body)
            .map_err(|e| ParseError::MalformedEnvelope {
                message: format!("body is neither typed nor a relay envelope: {}", e),
            })?;

        let envelope: RelayEnvelope =
            serde_json::from_value(value).map_err(|e| ParseError::MalformedEnvelope {
                message: format!("relay envelope could not be read: {}", e),
            })?;

        match envelope.message_attributes.get(attributes::MESSAGE_TYPE) {
            Some(attribute) => Ok((attribute.value.clone(), envelope.message)),
            None => Err(ParseError::MalformedEnvelope {
                message: format!(
                    "relay envelope has no '{}' attribute",
                    attributes::MESSAGE_TYPE
                ),
            }),
        }
    }
}

impl MessageParser for DefaultMessageParser {
    fn parse(&self, raw: RawMessage) -> TransportMessage {
        let RawMessage {
            message_id,
            receipt_handle,
            body,
            attributes: system_attributes,
            message_attributes,
        } = raw;

        let attempt_number = match system_attributes.get(attributes::RECEIVE_COUNT) {
            None => 0,
            Some(value) => match value.trim().parse::<u32>() {
                Ok(count) => count,
                Err(_) => {
                    let error = ParseError::InvalidReceiveCount {
                        value: value.clone(),
                    };
                    return TransportMessage::failed(message_id, receipt_handle, body, error);
                }
            },
        };

        let mut published = message_attributes.contains_key(attributes::FROM_RELAY);

        let (type_name, payload_body) = match message_attributes.get(attributes::MESSAGE_TYPE) {
            Some(type_name) => (type_name.clone(), body),
            None => match self.unwrap_relay_envelope(&body) {
                Ok(unwrapped) => {
                    published = true;
                    unwrapped
                }
                Err(error) => {
                    debug!(message_id = %message_id, error = %error, "Message envelope rejected");
                    return TransportMessage::failed(message_id, receipt_handle, body, error)
                        .with_attempt_number(attempt_number)
                        .with_published(published);
                }
            },
        };

        let failed = |error: ParseError, body: String| {
            TransportMessage::failed(message_id.clone(), receipt_handle.clone(), body, error)
                .with_message_type_name(type_name.clone())
                .with_attempt_number(attempt_number)
                .with_published(published)
        };

        let Some(registered) = self.registry.registered_type(&type_name) else {
            let error = ParseError::UnknownMessageType {
                type_name: type_name.clone(),
            };
            return failed(error, payload_body);
        };

        let decoded = self
            .serializer
            .deserialize(&payload_body)
            .map_err(|e| e.to_string())
            .and_then(|value| (registered.decode)(value).map_err(|e| e.to_string()));

        match decoded {
            Ok(payload) => TransportMessage::parsed(
                message_id.clone(),
                receipt_handle.clone(),
                payload_body,
                registered.message_type,
                payload,
            )
            .with_attempt_number(attempt_number)
            .with_published(published),
            Err(message) => failed(ParseError::Deserialization { message }, payload_body),
        }
    }
}

#[cfg(test)]
#[path = "parser_tests.rs"]
mod tests;
