//! # Queue Pump
//!
//! Client runtime for message queues: a polling message pump that parses raw
//! queue records into typed messages, dispatches them to registered handlers,
//! and hands messages that fail on their final attempt to fault handlers.
//!
//! ## Module Organization
//!
//! - [`backend`] / [`backends`] - queue transports (SQS and a local folder)
//! - [`parser`] - raw record to typed message
//! - [`processor`] - handler dispatch and the fault cascade
//! - [`pump`] - bounded-concurrency receive loop
//! - [`builder`] / [`runtime`] - fluent setup and the start/stop facade
//! - [`config`] - file and environment settings
//! - [`testing`] - a recording sender for handler unit tests
//!
//! ## Usage
//!
//! ```no_run
//! use async_trait::async_trait;
//! use queue_pump::{HandlerError, HandlerRegistry, MessageHandler, QueueBuilder, QueueMessage};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct InvoiceCreated { invoice_id: String }
//!
//! impl QueueMessage for InvoiceCreated {
//!     const MESSAGE_TYPE: &'static str = "InvoiceCreated";
//! }
//!
//! struct MailInvoice;
//!
//! #[async_trait]
//! impl MessageHandler<InvoiceCreated> for MailInvoice {
//!     async fn handle(&self, invoice: &InvoiceCreated) -> Result<(), HandlerError> {
//!         println!("mailing {}", invoice.invoice_id);
//!         Ok(())
//!     }
//! }
//!
//! # async fn example() -> Result<(), queue_pump::QueueError> {
//! let runtime = QueueBuilder::sqs("invoices", "eu-west-1")
//!     .max_simultaneous_messages(8)
//!     .with_handlers(
//!         HandlerRegistry::new().with_handler::<InvoiceCreated, _, _>(|_| Ok(MailInvoice)),
//!     )
//!     .build_startable()?;
//!
//! runtime.start_receiving().await?;
//! tokio::signal::ctrl_c().await.ok();
//! runtime.stop_receiving().await;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod backends;
pub mod backoff;
pub mod builder;
pub mod config;
pub mod container;
pub mod error;
pub mod handler;
pub mod logger;
pub mod message;
pub mod parser;
pub mod processor;
pub mod pump;
pub mod registry;
pub mod runtime;
pub mod sender;
pub mod serializer;
pub mod testing;

// Re-export commonly used types at crate root for convenience
pub use backend::QueueBackend;
pub use builder::QueueBuilder;
pub use crate::config::{BackendKind, QueueSettings};
pub use container::{RequestScope, ServiceContainer};
pub use error::{
    ConfigurationError, HandlerError, ParseError, ProcessingError, QueueError, ResolutionError,
    SendVerificationError, SerializationError, ValidationError,
};
pub use handler::{FaultHandler, MessageHandler, StatisticsHandler};
pub use logger::{MessageLogger, NoOpMessageLogger, TracingMessageLogger};
pub use message::{
    MessageProcessingResult, MessageStatistics, MessageType, MetadataEntry, QueueMessage,
    QueueName, RawMessage, RecordId, Timestamp, TransportMessage,
};
pub use parser::{DefaultMessageParser, MessageParser};
pub use processor::{DefaultMessageProcessor, MessageProcessor};
pub use registry::HandlerRegistry;
pub use runtime::QueueRuntime;
pub use sender::{MessageSender, SendQueue};
pub use serializer::{JsonMessageSerializer, MessageSerializer};
