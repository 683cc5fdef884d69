//! Error types for queue, parsing and dispatch operations.

use thiserror::Error;

/// Error type returned by user-supplied handlers, hooks and factories.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Comprehensive error type for all queue operations
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue not found: {queue_name}")]
    QueueNotFound { queue_name: String },

    #[error("Queue '{queue_name}' has not been initialized")]
    NotInitialized { queue_name: String },

    #[error("Invalid receipt handle: '{receipt}'")]
    InvalidReceipt { receipt: String },

    #[error("Invalid operation: {message}")]
    InvalidOperation { message: String },

    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Provider error ({provider}): {code} - {message}")]
    ProviderError {
        provider: String,
        code: String,
        message: String,
    },

    #[error("Storage operation failed on '{path}': {source}")]
    Storage {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization failed: {0}")]
    SerializationError(#[from] SerializationError),

    #[error("Configuration error: {0}")]
    ConfigurationError(#[from] ConfigurationError),

    #[error("Validation error: {0}")]
    ValidationError(#[from] ValidationError),
}

impl QueueError {
    /// Check if error is transient and a later attempt may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Self::QueueNotFound { .. } => false,
            Self::NotInitialized { .. } => false,
            Self::InvalidReceipt { .. } => false,
            Self::InvalidOperation { .. } => false,
            Self::ConnectionFailed { .. } => true,
            Self::AuthenticationFailed { .. } => false,
            Self::ProviderError { .. } => true, // Service-side errors are usually throttling or outages
            Self::Storage { .. } => true,
            Self::SerializationError(_) => false,
            Self::ConfigurationError(_) => false,
            Self::ValidationError(_) => false,
        }
    }

    pub(crate) fn storage(path: &std::path::Path, source: std::io::Error) -> Self {
        Self::Storage {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Errors during message serialization/deserialization
#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("JSON serialization failed: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Message attribute '{key}' has invalid value")]
    InvalidAttribute { key: String },
}

/// Configuration errors
#[derive(Debug, Clone, Error)]
pub enum ConfigurationError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required configuration: {key}")]
    Missing { key: String },

    #[error("Configuration parsing failed: {message}")]
    Parsing { message: String },
}

/// Validation errors
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    Required { field: String },

    #[error("Invalid format for {field}: {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Value out of range for {field}: {message}")]
    OutOfRange { field: String, message: String },
}

/// Reasons a raw backend record could not be turned into a typed message.
///
/// Parse failures never abort the pump. They travel on the
/// [`TransportMessage`](crate::message::TransportMessage) into the fault path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("Invalid message format: {message}")]
    MalformedEnvelope { message: String },

    #[error("Unable to find message type {type_name}")]
    UnknownMessageType { type_name: String },

    #[error("Receive count '{value}' is not a valid number")]
    InvalidReceiveCount { value: String },

    #[error("Failed to parse message: {message}")]
    Deserialization { message: String },
}

/// Failures raised while dispatching a message to its handlers.
#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("No handlers registered for message type {message_type}")]
    NoHandlers { message_type: String },

    #[error("Message has no decoded payload")]
    MissingPayload,

    #[error("Payload does not match the registered type for handler '{handler}'")]
    PayloadMismatch { handler: String },

    #[error("Message could not be parsed: {0}")]
    Parse(#[from] ParseError),

    #[error("Handler '{handler}' failed: {source}")]
    Handler {
        handler: String,
        #[source]
        source: HandlerError,
    },

    #[error("Handler '{handler}' panicked: {message}")]
    HandlerPanicked { handler: String, message: String },

    #[error("Failed to construct handler '{handler}': {source}")]
    HandlerResolution {
        handler: String,
        #[source]
        source: HandlerError,
    },

    #[error("Pre-handler hook failed: {source}")]
    PreHandler {
        #[source]
        source: HandlerError,
    },
}

/// Failures looking up services in a [`ServiceContainer`](crate::container::ServiceContainer).
#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("No registration found for service '{service}'")]
    NotRegistered { service: &'static str },

    #[error("Factory for service '{service}' failed: {source}")]
    Factory {
        service: &'static str,
        #[source]
        source: HandlerError,
    },
}

/// A recorded send count did not match what a test expected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Message of type {message_type} was expected to be sent {expected} times but was sent {actual}")]
pub struct SendVerificationError {
    pub message_type: String,
    pub expected: usize,
    pub actual: usize,
}

/// Turn a caught panic payload into a readable message.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
