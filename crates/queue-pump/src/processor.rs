//! Routing of decoded messages to success, fault and statistics handlers.

use crate::container::{RequestScope, ServiceContainer};
use crate::error::{panic_message, HandlerError, ProcessingError};
use crate::handler::StatisticsHandler;
use crate::message::{MessageProcessingResult, MessageStatistics, MessageType, TransportMessage};
use crate::registry::HandlerRegistry;
use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Hook run against every request scope before any handler is built.
pub type PreHandler = Arc<dyn Fn(&mut RequestScope) -> Result<(), HandlerError> + Send + Sync>;

/// Dispatches messages to handlers.
#[async_trait]
pub trait MessageProcessor: Send + Sync {
    /// Run every success handler registered for the message's type.
    ///
    /// Returns an error only when the message carries no payload or the
    /// pre-handler hook fails. Handler failures produce an unsuccessful result.
    async fn process_message(
        &self,
        message: &TransportMessage,
    ) -> Result<MessageProcessingResult, ProcessingError>;

    /// Notify fault handlers of a message that failed on its final attempt.
    ///
    /// Each fault handler gets its own request scope, so the pre-handler runs
    /// once per fault handler. A pre-handler failure skips only that handler.
    async fn process_faulted_message(
        &self,
        message: &TransportMessage,
        error: Option<&ProcessingError>,
    );

    /// Hand statistics to every registered statistics handler.
    async fn process_message_statistics(&self, statistics: &MessageStatistics);
}

/// Processor backed by a [`HandlerRegistry`] and a [`ServiceContainer`].
pub struct DefaultMessageProcessor {
    container: Arc<ServiceContainer>,
    registry: Arc<HandlerRegistry>,
    pre_handler: Option<PreHandler>,
}

impl DefaultMessageProcessor {
    pub fn new(container: Arc<ServiceContainer>, registry: Arc<HandlerRegistry>) -> Self {
        Self {
            container,
            registry,
            pre_handler: None,
        }
    }

    pub fn with_pre_handler<F>(mut self, pre_handler: F) -> Self
    where
        F: Fn(&mut RequestScope) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.pre_handler = Some(Arc::new(pre_handler));
        self
    }

    fn new_scope(&self) -> Result<RequestScope, ProcessingError> {
        let mut scope = self.container.nested_scope();
        if let Some(pre_handler) = &self.pre_handler {
            match std::panic::catch_unwind(AssertUnwindSafe(|| pre_handler(&mut scope))) {
                Ok(Ok(())) => {}
                Ok(Err(source)) => return Err(ProcessingError::PreHandler { source }),
                Err(panic) => {
                    return Err(ProcessingError::PreHandler {
                        source: panic_message(&*panic).into(),
                    })
                }
            }
        }
        Ok(scope)
    }
}

#[async_trait]
impl MessageProcessor for DefaultMessageProcessor {
    async fn process_message(
        &self,
        message: &TransportMessage,
    ) -> Result<MessageProcessingResult, ProcessingError> {
        let message_type = match (message.message_type(), message.message()) {
            (Some(message_type), Some(_)) => message_type,
            _ => return Err(ProcessingError::MissingPayload),
        };

        let handlers = self.registry.handlers_for(&message_type);
        if handlers.is_empty() {
            warn!(
                message_id = %message.id(),
                message_type = %message_type,
                "No handlers registered for message type"
            );
            return Ok(MessageProcessingResult::failure(
                ProcessingError::NoHandlers {
                    message_type: message_type.name().to_string(),
                },
                Duration::ZERO,
            ));
        }

        let started = Instant::now();
        let scope = self.new_scope()?;

        let mut first_error: Option<ProcessingError> = None;
        for handler in handlers {
            let outcome = AssertUnwindSafe(handler.dispatch(&scope, message))
                .catch_unwind()
                .await;

            let failure = match outcome {
                Ok(Ok(())) => {
                    debug!(
                        message_id = %message.id(),
                        handler = handler.name(),
                        "Handler completed"
                    );
                    continue;
                }
                Ok(Err(e)) => e,
                Err(panic) => ProcessingError::HandlerPanicked {
                    handler: handler.name().to_string(),
                    message: panic_message(&*panic),
                },
            };

            warn!(
                message_id = %message.id(),
                message_type = %message_type,
                handler = handler.name(),
                error = %failure,
                "Handler failed"
            );
            if first_error.is_none() {
                first_error = Some(failure);
            }
        }

        let runtime = started.elapsed();
        scope.release();

        Ok(match first_error {
            None => MessageProcessingResult::success(runtime),
            Some(failure) => MessageProcessingResult::failure(failure, runtime),
        })
    }

    async fn process_faulted_message(
        &self,
        message: &TransportMessage,
        error: Option<&ProcessingError>,
    ) {
        let generic = MessageType::generic();
        let key = match message.message_type() {
            Some(message_type) if message.parsing_succeeded() => message_type,
            _ => generic,
        };

        let specific = if key.is_generic() {
            &[][..]
        } else {
            self.registry.fault_handlers_for(&key)
        };
        let generic_handlers = self.registry.fault_handlers_for(&generic);

        if specific.is_empty() && generic_handlers.is_empty() {
            debug!(message_id = %message.id(), "No fault handlers registered");
            return;
        }

        for handler in specific.iter().chain(generic_handlers) {
            let scope = match self.new_scope() {
                Ok(scope) => scope,
                Err(e) => {
                    error!(
                        message_id = %message.id(),
                        handler = handler.name(),
                        error = %e,
                        "Unable to prepare scope for fault handler"
                    );
                    continue;
                }
            };

            let outcome = AssertUnwindSafe(handler.dispatch(&scope, message, error))
                .catch_unwind()
                .await;

            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(
                    message_id = %message.id(),
                    handler = handler.name(),
                    error = %e,
                    "Fault handler failed"
                ),
                Err(panic) => warn!(
                    message_id = %message.id(),
                    handler = handler.name(),
                    panic_msg = %panic_message(&*panic),
                    "Fault handler panicked"
                ),
            }

            scope.release();
        }
    }

    async fn process_message_statistics(&self, statistics: &MessageStatistics) {
        let handlers = self.container.resolve_all::<dyn StatisticsHandler>();

        for handler in handlers {
            match AssertUnwindSafe(handler.handle(statistics))
                .catch_unwind()
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Statistics handler failed"),
                Err(panic) => warn!(
                    panic_msg = %panic_message(&*panic),
                    "Statistics handler panicked"
                ),
            }
        }
    }
}

#[cfg(test)]
#[path = "processor_tests.rs"]
mod tests;
