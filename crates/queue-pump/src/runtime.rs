//! # Queue Runtime
//!
//! Owns one backend and, for receiving runtimes, the pump that polls it.
//! Built by [`QueueBuilder`](crate::QueueBuilder).
//!
//! Every processed message gets a request scope holding an
//! `Arc<dyn MessageSender>` for the same backend, so handlers can publish
//! follow-up messages by resolving it from the scope.

use crate::backend::QueueBackend;
use crate::container::ServiceContainer;
use crate::error::QueueError;
use crate::logger::MessageLogger;
use crate::parser::DefaultMessageParser;
use crate::processor::{DefaultMessageProcessor, PreHandler};
use crate::pump::{MessagePump, PumpConfig};
use crate::registry::HandlerRegistry;
use crate::sender::{MessageSender, SendQueue};
use crate::serializer::MessageSerializer;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Handler side of a runtime, absent for send-only runtimes
pub(crate) struct ReceiveSettings {
    pub(crate) container: Arc<ServiceContainer>,
    pub(crate) registry: Arc<HandlerRegistry>,
    pub(crate) pre_handler: Option<PreHandler>,
    pub(crate) pump_config: PumpConfig,
}

struct ActivePump {
    pump: Arc<MessagePump>,
    handle: JoinHandle<()>,
}

/// A configured queue, ready to send and optionally to receive.
pub struct QueueRuntime {
    backend: Arc<dyn QueueBackend>,
    serializer: Arc<dyn MessageSerializer>,
    logger: Arc<dyn MessageLogger>,
    sender: SendQueue,
    receive: Option<ReceiveSettings>,
    initialized: OnceCell<()>,
    active: Mutex<Option<ActivePump>>,
}

impl QueueRuntime {
    pub(crate) fn new(
        backend: Arc<dyn QueueBackend>,
        serializer: Arc<dyn MessageSerializer>,
        logger: Arc<dyn MessageLogger>,
        receive: Option<ReceiveSettings>,
    ) -> Self {
        let sender =
            SendQueue::new(backend.clone(), serializer.clone()).with_message_logger(logger.clone());
        Self {
            backend,
            serializer,
            logger,
            sender,
            receive,
            initialized: OnceCell::new(),
            active: Mutex::new(None),
        }
    }

    pub fn queue_name(&self) -> &str {
        self.backend.name()
    }

    /// False for runtimes built with `build_send_only`
    pub fn can_receive(&self) -> bool {
        self.receive.is_some()
    }

    pub async fn is_receiving(&self) -> bool {
        self.active.lock().await.is_some()
    }

    async fn ensure_initialized(&self) -> Result<(), QueueError> {
        self.initialized
            .get_or_try_init(|| async {
                self.backend.init().await?;
                info!(queue = self.backend.name(), "Queue initialized");
                Ok::<(), QueueError>(())
            })
            .await?;
        Ok(())
    }

    /// Initialize the backend and start the pump in a background task.
    ///
    /// Fails with [`QueueError::InvalidOperation`] for send-only runtimes and
    /// when the pump is already running.
    pub async fn start_receiving(&self) -> Result<(), QueueError> {
        let Some(receive) = &self.receive else {
            return Err(QueueError::InvalidOperation {
                message: "runtime was built send-only".to_string(),
            });
        };

        let mut active = self.active.lock().await;
        if active.is_some() {
            return Err(QueueError::InvalidOperation {
                message: "runtime is already receiving".to_string(),
            });
        }

        self.ensure_initialized().await?;

        let parser = Arc::new(DefaultMessageParser::new(
            receive.registry.clone(),
            self.serializer.clone(),
        ));

        let sender: Arc<dyn MessageSender> = Arc::new(self.sender.clone());
        let user_pre_handler = receive.pre_handler.clone();
        let processor = DefaultMessageProcessor::new(
            receive.container.clone(),
            receive.registry.clone(),
        )
        .with_pre_handler(move |scope| {
            scope.register_instance(sender.clone());
            match &user_pre_handler {
                Some(pre_handler) => pre_handler(scope),
                None => Ok(()),
            }
        });

        let pump = Arc::new(
            MessagePump::new(
                self.backend.clone(),
                parser,
                Arc::new(processor),
                receive.pump_config.clone(),
            )?
            .with_message_logger(self.logger.clone()),
        );

        let runner = pump.clone();
        let handle = tokio::spawn(async move { runner.run().await });
        *active = Some(ActivePump { pump, handle });

        info!(queue = self.backend.name(), "Receiving started");
        Ok(())
    }

    /// Stop the pump, wait for its poll loop, and drain in-flight messages
    /// when a drain timeout is configured.
    ///
    /// Returns `true` when no messages are still being processed. Calling it
    /// on a runtime that is not receiving returns `true` immediately.
    pub async fn stop_receiving(&self) -> bool {
        let Some(ActivePump { pump, handle }) = self.active.lock().await.take() else {
            debug!(queue = self.backend.name(), "Stop requested but runtime is not receiving");
            return true;
        };

        pump.stop();
        if let Err(e) = handle.await {
            error!(queue = self.backend.name(), error = %e, "Poll loop terminated abnormally");
        }

        let drained = pump.shutdown().await;
        if drained {
            info!(queue = self.backend.name(), "Receiving stopped");
        } else {
            warn!(
                queue = self.backend.name(),
                in_flight = pump.in_flight(),
                "Receiving stopped with messages still in flight"
            );
        }
        drained
    }

    /// Initialize the backend and hand out a send capability for it
    pub async fn create_send_queue(&self) -> Result<SendQueue, QueueError> {
        self.ensure_initialized().await?;
        Ok(self.sender.clone())
    }
}

impl std::fmt::Debug for QueueRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueRuntime")
            .field("queue", &self.backend.name())
            .field("can_receive", &self.can_receive())
            .field("initialized", &self.initialized.initialized())
            .finish()
    }
}

#[cfg(test)]
#[path = "runtime_tests.rs"]
mod tests;
