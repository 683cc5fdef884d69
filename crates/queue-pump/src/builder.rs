//! Fluent construction of a [`QueueRuntime`].
//!
//! A builder starts from a backend choice ([`QueueBuilder::file`],
//! [`QueueBuilder::sqs`] or [`QueueBuilder::with_backend`]), collects pump and
//! handler settings, and validates everything when one of the `build_*`
//! methods is called. Setters never fail; all range checks happen at build
//! time so that one error describes the first invalid setting.

use crate::backend::QueueBackend;
use crate::backends::{FileQueue, HttpSqsTransport, SqsConnection, SqsQueue, SqsTransport};
use crate::backoff::BackoffPolicy;
use crate::container::{RequestScope, ServiceContainer};
use crate::error::{ConfigurationError, HandlerError, QueueError, ValidationError};
use crate::logger::{MessageLogger, NoOpMessageLogger, TracingMessageLogger};
use crate::message::QueueName;
use crate::processor::PreHandler;
use crate::pump::PumpConfig;
use crate::registry::HandlerRegistry;
use crate::runtime::{QueueRuntime, ReceiveSettings};
use crate::serializer::{JsonMessageSerializer, MessageSerializer};
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_RETRY_COUNT: u32 = 5;
pub const DEFAULT_POLL_WAIT_SECONDS: u64 = 14;

const POLL_WAIT_RANGE: RangeInclusive<u64> = 0..=20;
const RETRY_COUNT_RANGE: RangeInclusive<u32> = 1..=1000;
const BATCH_SIZE_RANGE: RangeInclusive<usize> = 1..=10;

enum BackendChoice {
    File {
        path: PathBuf,
        retry_delay: Option<Duration>,
    },
    Sqs {
        queue_name: String,
        connection: SqsConnection,
        transport: Option<Arc<dyn SqsTransport>>,
    },
    Custom(Arc<dyn QueueBackend>),
}

impl BackendChoice {
    fn kind(&self) -> &'static str {
        match self {
            Self::File { .. } => "file",
            Self::Sqs { .. } => "sqs",
            Self::Custom(_) => "custom",
        }
    }
}

/// Builder for [`QueueRuntime`].
///
/// # Examples
///
/// ```no_run
/// use async_trait::async_trait;
/// use queue_pump::{HandlerError, HandlerRegistry, MessageHandler, QueueBuilder, QueueMessage};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct OrderPlaced { order_id: u64 }
///
/// impl QueueMessage for OrderPlaced {
///     const MESSAGE_TYPE: &'static str = "OrderPlaced";
/// }
///
/// struct PrintOrder;
///
/// #[async_trait]
/// impl MessageHandler<OrderPlaced> for PrintOrder {
///     async fn handle(&self, message: &OrderPlaced) -> Result<(), HandlerError> {
///         println!("order {}", message.order_id);
///         Ok(())
///     }
/// }
///
/// # async fn example() -> Result<(), queue_pump::QueueError> {
/// let runtime = QueueBuilder::file("./data/orders")
///     .max_simultaneous_messages(4)
///     .with_handlers(HandlerRegistry::new().with_handler::<OrderPlaced, _, _>(|_| Ok(PrintOrder)))
///     .build_startable()?;
///
/// runtime.start_receiving().await?;
/// runtime.create_send_queue().await?.send(&OrderPlaced { order_id: 1 }).await?;
/// runtime.stop_receiving().await;
/// # Ok(())
/// # }
/// ```
pub struct QueueBuilder {
    backend: BackendChoice,
    container: ServiceContainer,
    serializer: Arc<dyn MessageSerializer>,
    logger: Arc<dyn MessageLogger>,
    poll_wait_seconds: u64,
    max_simultaneous_messages: usize,
    retry_count: u32,
    max_messages_per_receive: usize,
    pre_handler: Option<PreHandler>,
    registry: HandlerRegistry,
    drain_timeout: Option<Duration>,
    idle_backoff: BackoffPolicy,
    // First setter misuse, reported by build
    misconfiguration: Option<ConfigurationError>,
}

impl QueueBuilder {
    fn with_choice(backend: BackendChoice) -> Self {
        Self {
            backend,
            container: ServiceContainer::new(),
            serializer: Arc::new(JsonMessageSerializer),
            logger: Arc::new(NoOpMessageLogger),
            poll_wait_seconds: DEFAULT_POLL_WAIT_SECONDS,
            max_simultaneous_messages: 0,
            retry_count: DEFAULT_RETRY_COUNT,
            max_messages_per_receive: 1,
            pre_handler: None,
            registry: HandlerRegistry::new(),
            drain_timeout: None,
            idle_backoff: BackoffPolicy::default(),
            misconfiguration: None,
        }
    }

    /// Queue stored in a local folder
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::with_choice(BackendChoice::File {
            path: path.into(),
            retry_delay: None,
        })
    }

    /// Queue hosted by SQS in `region`.
    ///
    /// Credentials default to the `AWS_ACCESS_KEY_ID` and
    /// `AWS_SECRET_ACCESS_KEY` environment variables.
    pub fn sqs(queue_name: impl Into<String>, region: impl Into<String>) -> Self {
        Self::with_choice(BackendChoice::Sqs {
            queue_name: queue_name.into(),
            connection: SqsConnection::new(region),
            transport: None,
        })
    }

    /// Use an already constructed backend.
    ///
    /// Poll wait and batch size are left to the backend itself.
    pub fn with_backend(backend: Arc<dyn QueueBackend>) -> Self {
        Self::with_choice(BackendChoice::Custom(backend))
    }

    fn misuse(&mut self, setting: &str) {
        if self.misconfiguration.is_none() {
            self.misconfiguration = Some(ConfigurationError::Invalid {
                message: format!(
                    "'{}' does not apply to a {} backend",
                    setting,
                    self.backend.kind()
                ),
            });
        }
    }

    /// Delay before an unacknowledged file record is retried
    pub fn file_retry_delay(mut self, delay: Duration) -> Self {
        match &mut self.backend {
            BackendChoice::File { retry_delay, .. } => *retry_delay = Some(delay),
            _ => self.misuse("file_retry_delay"),
        }
        self
    }

    pub fn sqs_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        match &mut self.backend {
            BackendChoice::Sqs { connection, .. } => connection.endpoint = Some(endpoint.into()),
            _ => self.misuse("sqs_endpoint"),
        }
        self
    }

    pub fn sqs_credentials(
        mut self,
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
    ) -> Self {
        match &mut self.backend {
            BackendChoice::Sqs { connection, .. } => {
                connection.access_key_id = Some(access_key_id.into());
                connection.secret_access_key = Some(secret_access_key.into());
            }
            _ => self.misuse("sqs_credentials"),
        }
        self
    }

    /// Replace the HTTP transport used to reach SQS
    pub fn with_sqs_transport(mut self, sqs_transport: Arc<dyn SqsTransport>) -> Self {
        match &mut self.backend {
            BackendChoice::Sqs { transport, .. } => *transport = Some(sqs_transport),
            _ => self.misuse("with_sqs_transport"),
        }
        self
    }

    /// Root container handlers are resolved from
    pub fn with_container(mut self, container: ServiceContainer) -> Self {
        self.container = container;
        self
    }

    pub fn with_serializer(mut self, serializer: Arc<dyn MessageSerializer>) -> Self {
        self.serializer = serializer;
        self
    }

    /// Log every inbound and outbound body through `tracing`
    pub fn enable_message_logging(self) -> Self {
        self.with_message_logger(Arc::new(TracingMessageLogger))
    }

    pub fn with_message_logger(mut self, logger: Arc<dyn MessageLogger>) -> Self {
        self.logger = logger;
        self
    }

    /// Long-poll duration of each receive, 0 to 20 seconds
    pub fn poll_wait_seconds(mut self, seconds: u64) -> Self {
        self.poll_wait_seconds = seconds;
        self
    }

    pub fn max_simultaneous_messages(mut self, max: usize) -> Self {
        self.max_simultaneous_messages = max;
        self
    }

    /// Delivery attempts before a message is faulted and dead-lettered
    pub fn retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    /// Upper bound on messages returned by one receive, 1 to 10
    pub fn max_messages_per_receive(mut self, max: usize) -> Self {
        self.max_messages_per_receive = max;
        self
    }

    /// Hook run against each request scope after the send queue is registered
    pub fn with_pre_handler<F>(mut self, pre_handler: F) -> Self
    where
        F: Fn(&mut RequestScope) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.pre_handler = Some(Arc::new(pre_handler));
        self
    }

    pub fn with_handlers(mut self, registry: HandlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Wait up to `timeout` for in-flight messages when receiving stops
    pub fn drain_on_stop(mut self, timeout: Duration) -> Self {
        self.drain_timeout = Some(timeout);
        self
    }

    /// Delay policy applied after empty or failed polls
    pub fn idle_backoff(mut self, policy: BackoffPolicy) -> Self {
        self.idle_backoff = policy;
        self
    }

    /// Build a runtime that can both send and receive.
    ///
    /// Requires at least one registered handler and a non-zero
    /// `max_simultaneous_messages`.
    pub fn build_startable(self) -> Result<QueueRuntime, QueueError> {
        self.validate()?;

        if !self.registry.has_handlers() {
            return Err(ValidationError::Required {
                field: "handlers".to_string(),
            }
            .into());
        }

        let pump_config = PumpConfig::new(self.max_simultaneous_messages, self.retry_count)
            .with_idle_backoff(self.idle_backoff.clone());
        let pump_config = match self.drain_timeout {
            Some(timeout) => pump_config.with_drain_timeout(timeout),
            None => pump_config,
        };
        pump_config.validate()?;

        let backend = self.create_backend()?;
        debug!(
            queue = backend.name(),
            handlers = ?self.registry.message_type_names(),
            max_simultaneous_messages = self.max_simultaneous_messages,
            retry_count = self.retry_count,
            "Built receiving queue runtime"
        );

        let receive = ReceiveSettings {
            container: Arc::new(self.container),
            registry: Arc::new(self.registry),
            pre_handler: self.pre_handler,
            pump_config,
        };
        Ok(QueueRuntime::new(
            backend,
            self.serializer,
            self.logger,
            Some(receive),
        ))
    }

    /// Build a runtime that can only send
    pub fn build_send_only(self) -> Result<QueueRuntime, QueueError> {
        self.validate()?;

        let backend = self.create_backend()?;
        debug!(queue = backend.name(), "Built send-only queue runtime");
        Ok(QueueRuntime::new(backend, self.serializer, self.logger, None))
    }

    fn validate(&self) -> Result<(), QueueError> {
        if let Some(error) = &self.misconfiguration {
            return Err(error.clone().into());
        }

        check_range("poll_wait_seconds", self.poll_wait_seconds, POLL_WAIT_RANGE)?;
        check_range("retry_count", self.retry_count, RETRY_COUNT_RANGE)?;
        check_range(
            "max_messages_per_receive",
            self.max_messages_per_receive,
            BATCH_SIZE_RANGE,
        )?;
        Ok(())
    }

    fn create_backend(&self) -> Result<Arc<dyn QueueBackend>, QueueError> {
        match &self.backend {
            BackendChoice::File { path, retry_delay } => {
                if path.as_os_str().is_empty() {
                    return Err(ConfigurationError::Missing {
                        key: "queue_path".to_string(),
                    }
                    .into());
                }
                let mut queue = FileQueue::new(path.clone(), self.retry_count)
                    .with_wait_time_seconds(self.poll_wait_seconds);
                if let Some(delay) = retry_delay {
                    queue = queue.with_retry_delay(*delay);
                }
                Ok(Arc::new(queue))
            }
            BackendChoice::Sqs {
                queue_name,
                connection,
                transport,
            } => {
                let queue_name = QueueName::new(queue_name.clone())?;
                let transport: Arc<dyn SqsTransport> = match transport {
                    Some(transport) => transport.clone(),
                    None => Arc::new(HttpSqsTransport::new(
                        connection.clone().with_env_credentials(),
                    )?),
                };
                let queue = SqsQueue::new(transport, queue_name, self.retry_count)
                    .with_wait_time_seconds(self.poll_wait_seconds)
                    .with_max_messages_per_receive(self.max_messages_per_receive);
                Ok(Arc::new(queue))
            }
            BackendChoice::Custom(backend) => Ok(backend.clone()),
        }
    }
}

fn check_range<T>(field: &str, value: T, range: RangeInclusive<T>) -> Result<(), QueueError>
where
    T: PartialOrd + std::fmt::Display,
{
    if range.contains(&value) {
        return Ok(());
    }
    Err(ValidationError::OutOfRange {
        field: field.to_string(),
        message: format!(
            "{} is outside {}..={}",
            value,
            range.start(),
            range.end()
        ),
    }
    .into())
}

impl std::fmt::Debug for QueueBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueBuilder")
            .field("backend", &self.backend.kind())
            .field("poll_wait_seconds", &self.poll_wait_seconds)
            .field("max_simultaneous_messages", &self.max_simultaneous_messages)
            .field("retry_count", &self.retry_count)
            .field("max_messages_per_receive", &self.max_messages_per_receive)
            .field("drain_timeout", &self.drain_timeout)
            .field("registry", &self.registry)
            .finish()
    }
}

#[cfg(test)]
#[path = "builder_tests.rs"]
mod tests;
