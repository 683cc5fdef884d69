//! Queue backend capability shared by the SQS and file implementations.

use crate::error::QueueError;
use crate::message::{MetadataEntry, TransportMessage};
use crate::parser::MessageParser;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// A durable queue the pump can poll.
///
/// Retry and dead-letter handling belong to the backend. The pump only acks
/// messages that were handled successfully and leaves everything else for the
/// backend to redeliver or dead-letter.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Provision the queue and its dead-letter counterpart. Safe to call repeatedly.
    async fn init(&self) -> Result<(), QueueError>;

    /// Fetch up to [`max_messages_per_receive`](Self::max_messages_per_receive)
    /// messages, waiting at most [`wait_time_seconds`](Self::wait_time_seconds).
    ///
    /// Returns early with an empty batch once `cancel` fires.
    async fn receive(
        &self,
        parser: &dyn MessageParser,
        cancel: &CancellationToken,
    ) -> Result<Vec<TransportMessage>, QueueError>;

    /// Remove a handled message from active storage.
    async fn ack(&self, message: &TransportMessage) -> Result<(), QueueError>;

    /// Enqueue a new message body with its metadata.
    async fn send(&self, body: &str, metadata: &[MetadataEntry]) -> Result<(), QueueError>;

    fn wait_time_seconds(&self) -> u64;

    fn max_messages_per_receive(&self) -> usize;

    /// Human-readable queue identifier used in logs.
    fn name(&self) -> &str;
}
