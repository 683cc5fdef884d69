//! # SQS Queue Backend
//!
//! Queue backed by an SQS-compatible service. Retry counting and
//! dead-lettering are left to the service: `init` attaches a redrive policy
//! whose `maxReceiveCount` is the configured retry count, and the attempt
//! number of each message is the service's `ApproximateReceiveCount`.
//!
//! Messages that fail before their final attempt are simply not deleted. When
//! they reappear is governed by the queue's visibility timeout, which is part
//! of the queue's own configuration.

use crate::backend::QueueBackend;
use crate::error::QueueError;
use crate::message::{attributes, MetadataEntry, QueueName, RawMessage, TransportMessage};
use crate::parser::MessageParser;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Queue attribute holding the dead-letter redrive policy
pub const REDRIVE_POLICY: &str = "RedrivePolicy";

/// Queue attribute holding the queue's ARN
pub const QUEUE_ARN: &str = "QueueArn";

/// Queue attribute holding the retention period in seconds
pub const MESSAGE_RETENTION_PERIOD: &str = "MessageRetentionPeriod";

/// Fourteen days, the longest retention SQS allows
pub const MAX_RETENTION_SECONDS: u32 = 1_209_600;

/// Parameters of a single receive call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveRequest {
    pub queue_url: String,
    pub wait_time_seconds: u64,
    pub max_messages: usize,
    pub attribute_names: Vec<String>,
    pub message_attribute_names: Vec<String>,
}

/// Wire-level SQS operations used by [`SqsQueue`].
#[async_trait]
pub trait SqsTransport: Send + Sync {
    /// Create the queue if needed and return its URL
    async fn create_queue(&self, queue_name: &QueueName) -> Result<String, QueueError>;

    async fn get_queue_attributes(
        &self,
        queue_url: &str,
    ) -> Result<HashMap<String, String>, QueueError>;

    async fn set_queue_attributes(
        &self,
        queue_url: &str,
        attributes: &HashMap<String, String>,
    ) -> Result<(), QueueError>;

    async fn receive_messages(&self, request: &ReceiveRequest)
        -> Result<Vec<RawMessage>, QueueError>;

    async fn delete_message(&self, queue_url: &str, receipt_handle: &str)
        -> Result<(), QueueError>;

    /// Send a message with string attributes and return the service's message id
    async fn send_message(
        &self,
        queue_url: &str,
        body: &str,
        attributes: &[MetadataEntry],
    ) -> Result<String, QueueError>;
}

/// Queue backed by an [`SqsTransport`].
pub struct SqsQueue {
    transport: Arc<dyn SqsTransport>,
    queue_name: QueueName,
    retry_count: u32,
    wait_time_seconds: u64,
    max_messages_per_receive: usize,
    queue_url: OnceCell<String>,
}

impl SqsQueue {
    pub fn new(transport: Arc<dyn SqsTransport>, queue_name: QueueName, retry_count: u32) -> Self {
        Self {
            transport,
            queue_name,
            retry_count,
            wait_time_seconds: 0,
            max_messages_per_receive: 1,
            queue_url: OnceCell::new(),
        }
    }

    /// Long-poll duration for each receive call
    pub fn with_wait_time_seconds(mut self, wait_time_seconds: u64) -> Self {
        self.wait_time_seconds = wait_time_seconds;
        self
    }

    pub fn with_max_messages_per_receive(mut self, max_messages: usize) -> Self {
        self.max_messages_per_receive = max_messages.max(1);
        self
    }

    pub fn queue_name(&self) -> &QueueName {
        &self.queue_name
    }

    /// URL of the queue once `init` has completed
    pub fn url(&self) -> Option<&str> {
        self.queue_url.get().map(String::as_str)
    }

    fn initialized_url(&self) -> Result<&str, QueueError> {
        self.url().ok_or_else(|| QueueError::NotInitialized {
            queue_name: self.queue_name.to_string(),
        })
    }

    async fn provision(&self) -> Result<String, QueueError> {
        let queue_url = self.transport.create_queue(&self.queue_name).await?;
        let queue_attributes = self.transport.get_queue_attributes(&queue_url).await?;

        if queue_attributes.contains_key(REDRIVE_POLICY) {
            debug!(queue = %self.queue_name, "Queue already has a redrive policy");
            return Ok(queue_url);
        }

        let dead_letter_name = self.queue_name.dead_letter()?;
        let dead_letter_url = self.transport.create_queue(&dead_letter_name).await?;
        let dead_letter_attributes = self
            .transport
            .get_queue_attributes(&dead_letter_url)
            .await?;
        let dead_letter_arn =
            dead_letter_attributes
                .get(QUEUE_ARN)
                .ok_or_else(|| QueueError::ProviderError {
                    provider: "Sqs".to_string(),
                    code: "MissingQueueArn".to_string(),
                    message: format!("queue '{}' reported no {}", dead_letter_name, QUEUE_ARN),
                })?;

        let redrive_policy = serde_json::json!({
            "maxReceiveCount": self.retry_count.to_string(),
            "deadLetterTargetArn": dead_letter_arn,
        })
        .to_string();

        let retention = (
            MESSAGE_RETENTION_PERIOD.to_string(),
            MAX_RETENTION_SECONDS.to_string(),
        );
        let main_attributes = HashMap::from([
            (REDRIVE_POLICY.to_string(), redrive_policy),
            retention.clone(),
        ]);
        self.transport
            .set_queue_attributes(&queue_url, &main_attributes)
            .await?;
        self.transport
            .set_queue_attributes(&dead_letter_url, &HashMap::from([retention]))
            .await?;

        info!(
            queue = %self.queue_name,
            dead_letter_queue = %dead_letter_name,
            max_receive_count = self.retry_count,
            "Attached dead letter queue"
        );
        Ok(queue_url)
    }
}

#[async_trait]
impl QueueBackend for SqsQueue {
    async fn init(&self) -> Result<(), QueueError> {
        self.queue_url
            .get_or_try_init(|| self.provision())
            .await?;
        Ok(())
    }

    async fn receive(
        &self,
        parser: &dyn MessageParser,
        cancel: &CancellationToken,
    ) -> Result<Vec<TransportMessage>, QueueError> {
        let request = ReceiveRequest {
            queue_url: self.initialized_url()?.to_string(),
            wait_time_seconds: self.wait_time_seconds,
            max_messages: self.max_messages_per_receive,
            attribute_names: vec![attributes::RECEIVE_COUNT.to_string()],
            message_attribute_names: vec![
                attributes::MESSAGE_TYPE.to_string(),
                attributes::FROM_RELAY.to_string(),
            ],
        };

        let raw_messages = tokio::select! {
            _ = cancel.cancelled() => return Ok(Vec::new()),
            result = self.transport.receive_messages(&request) => result?,
        };

        Ok(raw_messages
            .into_iter()
            .map(|raw| parser.parse(raw))
            .collect())
    }

    async fn ack(&self, message: &TransportMessage) -> Result<(), QueueError> {
        if message.receipt_handle().trim().is_empty() {
            return Err(QueueError::InvalidReceipt {
                receipt: message.receipt_handle().to_string(),
            });
        }

        let queue_url = self.initialized_url()?;
        self.transport
            .delete_message(queue_url, message.receipt_handle())
            .await
    }

    async fn send(&self, body: &str, metadata: &[MetadataEntry]) -> Result<(), QueueError> {
        let queue_url = self.initialized_url()?;
        let message_id = self.transport.send_message(queue_url, body, metadata).await?;

        debug!(queue = %self.queue_name, message_id = %message_id, "Message sent");
        Ok(())
    }

    fn wait_time_seconds(&self) -> u64 {
        self.wait_time_seconds
    }

    fn max_messages_per_receive(&self) -> usize {
        self.max_messages_per_receive
    }

    fn name(&self) -> &str {
        self.queue_name.as_str()
    }
}

impl std::fmt::Debug for SqsQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqsQueue")
            .field("queue_name", &self.queue_name)
            .field("retry_count", &self.retry_count)
            .field("wait_time_seconds", &self.wait_time_seconds)
            .field("max_messages_per_receive", &self.max_messages_per_receive)
            .field("queue_url", &self.queue_url.get())
            .finish()
    }
}

#[cfg(test)]
#[path = "sqs_tests.rs"]
mod tests;
