//! # Message Pump
//!
//! Drives the receive-and-dispatch cycle for one queue.
//!
//! ## Loop
//!
//! Each iteration waits out the idle backoff, takes one slot from the
//! admission gate, and calls the backend's `receive`. An empty or failed poll
//! hands the slot straight back and grows the backoff. A non-empty poll resets
//! the backoff and spawns one worker per message. The slot is returned only
//! when every worker of that poll has finished, so the gate bounds receive and
//! in-flight processing together.
//!
//! ## Per-message handling
//!
//! ```text
//! inbound log -> parsed? -> process_message -> successful? -> ack
//!                   |                               |
//!                   no -> failed result             no -> final attempt? -> fault handlers
//!                                                   (statistics always)
//! ```
//!
//! Messages that fail before their final attempt are left unacknowledged for
//! the backend to redeliver.

use crate::backend::QueueBackend;
use crate::backoff::{BackoffPolicy, IdleBackoff};
use crate::error::{panic_message, ProcessingError, QueueError, ValidationError};
use crate::logger::{MessageLogger, NoOpMessageLogger};
use crate::message::{MessageProcessingResult, MessageStatistics, TransportMessage};
use crate::parser::MessageParser;
use crate::processor::MessageProcessor;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Settings for a [`MessagePump`].
#[derive(Debug, Clone)]
pub struct PumpConfig {
    /// Size of the admission gate. Must be greater than zero.
    pub max_simultaneous_messages: usize,
    /// Attempt number on which a failing message is handed to fault handlers
    pub message_retry_count: u32,
    pub idle_backoff: BackoffPolicy,
    /// When set, `shutdown` waits up to this long for in-flight workers
    pub drain_timeout: Option<Duration>,
}

impl PumpConfig {
    pub fn new(max_simultaneous_messages: usize, message_retry_count: u32) -> Self {
        Self {
            max_simultaneous_messages,
            message_retry_count,
            idle_backoff: BackoffPolicy::default(),
            drain_timeout: None,
        }
    }

    pub fn with_idle_backoff(mut self, idle_backoff: BackoffPolicy) -> Self {
        self.idle_backoff = idle_backoff;
        self
    }

    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = Some(drain_timeout);
        self
    }

    pub fn validate(&self) -> Result<(), QueueError> {
        if self.max_simultaneous_messages == 0 {
            return Err(ValidationError::OutOfRange {
                field: "max_simultaneous_messages".to_string(),
                message: "must be greater than zero".to_string(),
            }
            .into());
        }
        self.idle_backoff.validate()?;
        Ok(())
    }
}

/// Lifecycle of a pump. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PumpState {
    Idle = 0,
    Polling = 1,
    Dispatching = 2,
    Stopped = 3,
}

impl PumpState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Polling,
            2 => Self::Dispatching,
            3 => Self::Stopped,
            _ => Self::Idle,
        }
    }
}

/// Everything a worker needs to handle one message.
struct MessageDispatcher {
    backend: Arc<dyn QueueBackend>,
    processor: Arc<dyn MessageProcessor>,
    logger: Arc<dyn MessageLogger>,
    message_retry_count: u32,
}

impl MessageDispatcher {
    async fn handle_message(&self, message: TransportMessage) {
        self.logger.inbound_log(
            message.body(),
            message.message_type_name(),
            message.id(),
            message.attempt_number(),
        );

        let result = if message.parsing_succeeded() {
            self.process(&message).await
        } else {
            let error = message
                .parse_error()
                .cloned()
                .map(ProcessingError::Parse)
                .unwrap_or(ProcessingError::MissingPayload);
            debug!(message_id = %message.id(), error = %error, "Skipping dispatch of unparsed message");
            MessageProcessingResult::failure(error, Duration::ZERO)
        };

        let final_attempt = message.attempt_number() == self.message_retry_count;

        if result.successful {
            match self.backend.ack(&message).await {
                Ok(()) => debug!(message_id = %message.id(), "Message acknowledged"),
                Err(e) => warn!(
                    message_id = %message.id(),
                    queue = self.backend.name(),
                    error = %e,
                    "Failed to acknowledge handled message"
                ),
            }
        } else if final_attempt {
            warn!(
                message_id = %message.id(),
                message_type = message.message_type_name().unwrap_or("unknown"),
                attempt = message.attempt_number(),
                error = ?result.error.as_deref().map(ToString::to_string),
                "Message failed on its final attempt"
            );
            self.processor
                .process_faulted_message(&message, result.error.as_deref())
                .await;
        } else {
            debug!(
                message_id = %message.id(),
                attempt = message.attempt_number(),
                "Message failed, leaving it for redelivery"
            );
        }

        let statistics = MessageStatistics {
            final_attempt,
            handler_runtime: result.runtime,
            body_length: message.body().len(),
            message_type_name: message.message_type_name().map(str::to_string),
            successful: result.successful,
            previous_attempt_count: message.attempt_number(),
        };
        self.processor.process_message_statistics(&statistics).await;
    }

    async fn process(&self, message: &TransportMessage) -> MessageProcessingResult {
        match AssertUnwindSafe(self.processor.process_message(message))
            .catch_unwind()
            .await
        {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                warn!(message_id = %message.id(), error = %e, "Message processing failed");
                MessageProcessingResult::failure(e, Duration::ZERO)
            }
            Err(panic) => {
                let panic_msg = panic_message(&*panic);
                error!(message_id = %message.id(), panic_msg = %panic_msg, "Message processor panicked");
                MessageProcessingResult::failure(
                    ProcessingError::HandlerPanicked {
                        handler: "message processor".to_string(),
                        message: panic_msg,
                    },
                    Duration::ZERO,
                )
            }
        }
    }
}

/// Polls a [`QueueBackend`] and feeds messages to a [`MessageProcessor`].
///
/// # Examples
///
/// ```no_run
/// # use std::sync::Arc;
/// # use queue_pump::pump::{MessagePump, PumpConfig};
/// # async fn example(
/// #     backend: Arc<dyn queue_pump::QueueBackend>,
/// #     parser: Arc<dyn queue_pump::MessageParser>,
/// #     processor: Arc<dyn queue_pump::MessageProcessor>,
/// # ) -> Result<(), queue_pump::QueueError> {
/// let pump = Arc::new(MessagePump::new(backend, parser, processor, PumpConfig::new(4, 5))?);
///
/// let runner = pump.clone();
/// let handle = tokio::spawn(async move { runner.run().await });
///
/// pump.stop();
/// let _ = handle.await;
/// pump.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct MessagePump {
    dispatcher: Arc<MessageDispatcher>,
    parser: Arc<dyn MessageParser>,
    config: PumpConfig,
    gate: Arc<Semaphore>,
    cancel: CancellationToken,
    workers: TaskTracker,
    state: AtomicU8,
}

impl MessagePump {
    pub fn new(
        backend: Arc<dyn QueueBackend>,
        parser: Arc<dyn MessageParser>,
        processor: Arc<dyn MessageProcessor>,
        config: PumpConfig,
    ) -> Result<Self, QueueError> {
        config.validate()?;

        Ok(Self {
            dispatcher: Arc::new(MessageDispatcher {
                backend,
                processor,
                logger: Arc::new(NoOpMessageLogger),
                message_retry_count: config.message_retry_count,
            }),
            parser,
            gate: Arc::new(Semaphore::new(config.max_simultaneous_messages)),
            config,
            cancel: CancellationToken::new(),
            workers: TaskTracker::new(),
            state: AtomicU8::new(PumpState::Idle as u8),
        })
    }

    /// Replace the inbound message logger. Only effective before `run`.
    pub fn with_message_logger(mut self, logger: Arc<dyn MessageLogger>) -> Self {
        if let Some(dispatcher) = Arc::get_mut(&mut self.dispatcher) {
            dispatcher.logger = logger;
        }
        self
    }

    pub fn state(&self) -> PumpState {
        PumpState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: PumpState) {
        // Stopped is terminal
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current != PumpState::Stopped as u8).then_some(state as u8)
            });
    }

    /// Admission slots not currently held by a poll or its workers
    pub fn available_slots(&self) -> usize {
        self.gate.available_permits()
    }

    /// Number of per-message workers still running
    pub fn in_flight(&self) -> usize {
        self.workers.len()
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Run the poll loop until [`stop`](Self::stop) is called.
    pub async fn run(&self) {
        if self.cancel.is_cancelled() {
            self.set_state(PumpState::Stopped);
            return;
        }

        let queue = self.dispatcher.backend.name().to_string();
        info!(
            queue = %queue,
            max_simultaneous_messages = self.config.max_simultaneous_messages,
            message_retry_count = self.config.message_retry_count,
            "Message pump started"
        );

        let mut backoff = IdleBackoff::new(self.config.idle_backoff.clone());

        loop {
            let delay = backoff.current_delay();
            if !delay.is_zero() {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let permit = tokio::select! {
                _ = self.cancel.cancelled() => break,
                permit = self.gate.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            if self.cancel.is_cancelled() {
                break;
            }

            self.set_state(PumpState::Polling);
            match self
                .dispatcher
                .backend
                .receive(self.parser.as_ref(), &self.cancel)
                .await
            {
                Ok(messages) if messages.is_empty() => {
                    drop(permit);
                    backoff.record_idle();
                }
                Ok(messages) => {
                    backoff.reset();
                    self.dispatch(messages, permit);
                }
                Err(e) => {
                    drop(permit);
                    backoff.record_idle();
                    if e.is_transient() {
                        warn!(queue = %queue, error = %e, "Receive failed, will retry");
                    } else {
                        error!(queue = %queue, error = %e, "Receive failed");
                    }
                }
            }
        }

        self.set_state(PumpState::Stopped);
        info!(queue = %queue, in_flight = self.workers.len(), "Message pump stopped");
    }

    fn dispatch(&self, messages: Vec<TransportMessage>, permit: OwnedSemaphorePermit) {
        self.set_state(PumpState::Dispatching);

        // Shared by every worker of this poll; the slot frees when the last one finishes
        let permit = Arc::new(permit);
        for message in messages {
            let dispatcher = self.dispatcher.clone();
            let permit = permit.clone();
            self.workers.spawn(async move {
                dispatcher.handle_message(message).await;
                drop(permit);
            });
        }

        self.set_state(PumpState::Polling);
    }

    /// Signal the poll loop to exit. In-flight workers keep running.
    pub fn stop(&self) {
        if !self.cancel.is_cancelled() {
            debug!(queue = self.dispatcher.backend.name(), "Stop requested");
        }
        self.cancel.cancel();
    }

    /// Stop, then wait for in-flight workers if a drain timeout is configured.
    ///
    /// Returns `true` when no workers remain.
    pub async fn shutdown(&self) -> bool {
        self.stop();
        self.workers.close();

        let Some(drain_timeout) = self.config.drain_timeout else {
            return self.workers.is_empty();
        };

        match tokio::time::timeout(drain_timeout, self.workers.wait()).await {
            Ok(()) => {
                debug!(queue = self.dispatcher.backend.name(), "In-flight messages drained");
                true
            }
            Err(_) => {
                warn!(
                    queue = self.dispatcher.backend.name(),
                    remaining = self.workers.len(),
                    timeout = ?drain_timeout,
                    "Drain timed out with messages still in flight"
                );
                false
            }
        }
    }
}

impl std::fmt::Debug for MessagePump {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagePump")
            .field("queue", &self.dispatcher.backend.name())
            .field("config", &self.config)
            .field("state", &self.state())
            .field("available_slots", &self.available_slots())
            .finish()
    }
}

#[cfg(test)]
#[path = "pump_tests.rs"]
mod tests;
