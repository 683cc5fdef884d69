//! Test doubles for code that sends messages.
//!
//! [`RecordingSendQueue`] stands in for the scoped [`MessageSender`] in handler
//! unit tests. It keeps every payload in memory and verifies what was sent
//! by decoding the recorded payloads back into their message types.
//!
//! ```
//! # tokio_test::block_on(async {
//! use queue_pump::testing::RecordingSendQueue;
//! use queue_pump::{MessageSender, QueueMessage};
//! use serde::{Deserialize, Serialize};
//! use std::sync::Arc;
//!
//! #[derive(Serialize, Deserialize)]
//! struct Refund { amount: u32 }
//!
//! impl QueueMessage for Refund {
//!     const MESSAGE_TYPE: &'static str = "Refund";
//! }
//!
//! let recorder = Arc::new(RecordingSendQueue::new());
//! let sender: Arc<dyn MessageSender> = recorder.clone();
//! sender.send(&Refund { amount: 30 }).await.unwrap();
//!
//! recorder.verify_sent::<Refund>(|r| r.amount == 30, 1).unwrap();
//! recorder.verify_not_sent::<Refund>(|r| r.amount > 100).unwrap();
//! # });
//! ```

use crate::error::{QueueError, SendVerificationError};
use crate::message::{MetadataEntry, QueueMessage};
use crate::sender::{check_outgoing, MessageSender};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

/// One message captured by a [`RecordingSendQueue`].
#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub message_type: String,
    pub payload: Value,
    pub metadata: Vec<MetadataEntry>,
}

impl SentMessage {
    /// Decode the payload when it was sent under `M`'s type name
    pub fn decode<M: QueueMessage>(&self) -> Option<M> {
        if !self.message_type.eq_ignore_ascii_case(M::MESSAGE_TYPE) {
            return None;
        }
        serde_json::from_value(self.payload.clone()).ok()
    }
}

/// In-memory [`MessageSender`] that records instead of enqueuing.
#[derive(Debug)]
pub struct RecordingSendQueue {
    name: String,
    sent: Mutex<Vec<SentMessage>>,
}

impl Default for RecordingSendQueue {
    fn default() -> Self {
        Self::named("recording")
    }
}

impl RecordingSendQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Everything sent so far, in send order
    pub fn sent(&self) -> Vec<SentMessage> {
        self.records().clone()
    }

    /// Decoded payloads sent under `M`'s type name
    pub fn sent_messages<M: QueueMessage>(&self) -> Vec<M> {
        self.records().iter().filter_map(SentMessage::decode).collect()
    }

    /// Number of `M` messages matching the predicate
    pub fn count_sent<M: QueueMessage>(&self, predicate: impl Fn(&M) -> bool) -> usize {
        self.records()
            .iter()
            .filter_map(SentMessage::decode::<M>)
            .filter(|message| predicate(message))
            .count()
    }

    /// Check that exactly `expected_times` `M` messages matched the predicate
    pub fn verify_sent<M: QueueMessage>(
        &self,
        predicate: impl Fn(&M) -> bool,
        expected_times: usize,
    ) -> Result<(), SendVerificationError> {
        let actual = self.count_sent(predicate);
        if actual == expected_times {
            return Ok(());
        }
        Err(SendVerificationError {
            message_type: M::MESSAGE_TYPE.to_string(),
            expected: expected_times,
            actual,
        })
    }

    /// Check that no `M` message matched the predicate
    pub fn verify_not_sent<M: QueueMessage>(
        &self,
        predicate: impl Fn(&M) -> bool,
    ) -> Result<(), SendVerificationError> {
        self.verify_sent(predicate, 0)
    }

    /// Forget everything recorded so far
    pub fn reset(&self) {
        self.records().clear();
    }

    fn records(&self) -> MutexGuard<'_, Vec<SentMessage>> {
        // Keep records readable after a panicking test thread poisoned the lock
        self.sent.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl MessageSender for RecordingSendQueue {
    fn queue_name(&self) -> &str {
        &self.name
    }

    async fn send_value(
        &self,
        message_type: &str,
        payload: Value,
        metadata: Vec<MetadataEntry>,
    ) -> Result<(), QueueError> {
        check_outgoing(message_type, &metadata)?;

        debug!(queue = %self.name, message_type = %message_type, "Recorded sent message");
        self.records().push(SentMessage {
            message_type: message_type.to_string(),
            payload,
            metadata,
        });
        Ok(())
    }
}

#[cfg(test)]
#[path = "testing_tests.rs"]
mod tests;
