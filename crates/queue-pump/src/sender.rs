//! Typed sending onto a queue backend.

use crate::backend::QueueBackend;
use crate::error::{QueueError, SerializationError, ValidationError};
use crate::logger::{MessageLogger, NoOpMessageLogger};
use crate::message::{attributes, MetadataEntry, QueueMessage};
use crate::serializer::MessageSerializer;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Capability to publish messages onto one queue.
///
/// Every request scope holds an `Arc<dyn MessageSender>`, so handlers send
/// follow-up messages without knowing the backend. [`SendQueue`] is the live
/// implementation and [`RecordingSendQueue`](crate::testing::RecordingSendQueue)
/// records sends for handler unit tests.
#[async_trait]
pub trait MessageSender: Send + Sync {
    fn queue_name(&self) -> &str;

    /// Enqueue a payload under the given type name.
    ///
    /// `metadata` must not carry its own `messageType` entry.
    async fn send_value(
        &self,
        message_type: &str,
        payload: Value,
        metadata: Vec<MetadataEntry>,
    ) -> Result<(), QueueError>;
}

impl dyn MessageSender {
    /// Encode and enqueue a typed message
    pub async fn send<M: QueueMessage>(&self, message: &M) -> Result<(), QueueError> {
        let payload = serde_json::to_value(message).map_err(SerializationError::from)?;
        self.send_value(M::MESSAGE_TYPE, payload, Vec::new()).await
    }
}

/// Checks shared by every sender before anything is enqueued
pub(crate) fn check_outgoing(
    message_type: &str,
    metadata: &[MetadataEntry],
) -> Result<(), QueueError> {
    if message_type.trim().is_empty() {
        return Err(ValidationError::Required {
            field: "message_type".to_string(),
        }
        .into());
    }
    if metadata.iter().any(|e| e.key == attributes::MESSAGE_TYPE) {
        return Err(SerializationError::InvalidAttribute {
            key: attributes::MESSAGE_TYPE.to_string(),
        }
        .into());
    }
    Ok(())
}

/// Send capability bound to one queue.
///
/// Every message is stamped with the `messageType` attribute so the receiving
/// parser can resolve its payload type. Receiving runtimes seed their
/// `SendQueue` into each request scope as an `Arc<dyn MessageSender>`.
///
/// # Examples
///
/// ```
/// # tokio_test::block_on(async {
/// use queue_pump::backends::FileQueue;
/// use queue_pump::{JsonMessageSerializer, QueueBackend, SendQueue};
/// use std::sync::Arc;
///
/// let dir = tempfile::tempdir().unwrap();
/// let queue = Arc::new(FileQueue::new(dir.path(), 5));
/// queue.init().await.unwrap();
///
/// let sender = SendQueue::new(queue.clone(), Arc::new(JsonMessageSerializer));
/// sender
///     .send_body(r#"{"order_id":1}"#, "OrderPlaced", Vec::new())
///     .await
///     .unwrap();
///
/// assert_eq!(queue.active_records().await.unwrap().len(), 1);
/// # });
/// ```
#[derive(Clone)]
pub struct SendQueue {
    backend: Arc<dyn QueueBackend>,
    serializer: Arc<dyn MessageSerializer>,
    logger: Arc<dyn MessageLogger>,
}

impl SendQueue {
    pub fn new(backend: Arc<dyn QueueBackend>, serializer: Arc<dyn MessageSerializer>) -> Self {
        Self {
            backend,
            serializer,
            logger: Arc::new(NoOpMessageLogger),
        }
    }

    pub fn with_message_logger(mut self, logger: Arc<dyn MessageLogger>) -> Self {
        self.logger = logger;
        self
    }

    /// Serialize and enqueue a typed message
    pub async fn send<M: QueueMessage>(&self, message: &M) -> Result<(), QueueError> {
        let payload = serde_json::to_value(message).map_err(SerializationError::from)?;
        self.send_value(M::MESSAGE_TYPE, payload, Vec::new()).await
    }

    /// Enqueue an already serialized body under the given type name.
    ///
    /// `metadata` is sent after the `messageType` entry; an entry with the same
    /// key is rejected.
    pub async fn send_body(
        &self,
        body: &str,
        message_type: &str,
        metadata: Vec<MetadataEntry>,
    ) -> Result<(), QueueError> {
        check_outgoing(message_type, &metadata)?;

        let mut entries = Vec::with_capacity(metadata.len() + 1);
        entries.push(MetadataEntry::new(attributes::MESSAGE_TYPE, message_type));
        entries.extend(metadata);

        self.logger.outbound_log(body, message_type);
        self.backend.send(body, &entries).await?;

        debug!(
            queue = self.backend.name(),
            message_type = %message_type,
            body_length = body.len(),
            "Message sent"
        );
        Ok(())
    }
}

#[async_trait]
impl MessageSender for SendQueue {
    fn queue_name(&self) -> &str {
        self.backend.name()
    }

    async fn send_value(
        &self,
        message_type: &str,
        payload: Value,
        metadata: Vec<MetadataEntry>,
    ) -> Result<(), QueueError> {
        let body = self.serializer.serialize(&payload)?;
        self.send_body(&body, message_type, metadata).await
    }
}

impl std::fmt::Debug for SendQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendQueue")
            .field("queue", &self.backend.name())
            .finish()
    }
}

#[cfg(test)]
#[path = "sender_tests.rs"]
mod tests;
