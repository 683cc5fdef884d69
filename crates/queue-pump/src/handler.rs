//! Handler traits implemented by applications.

use crate::error::{HandlerError, ProcessingError};
use crate::message::MessageStatistics;
use async_trait::async_trait;

/// Handles successfully decoded messages of type `M`.
///
/// Several handlers may be registered for one message type. All of them run
/// for every message, even if an earlier one fails.
#[async_trait]
pub trait MessageHandler<M>: Send + Sync
where
    M: Send + Sync + 'static,
{
    async fn handle(&self, message: &M) -> Result<(), HandlerError>;
}

/// Notified when a message of type `M` fails on its final attempt.
///
/// Implementing `FaultHandler<TransportMessage>` produces a generic fault
/// handler, which runs for every faulted message including those that could
/// not be parsed. Errors returned here are logged and otherwise ignored.
#[async_trait]
pub trait FaultHandler<M>: Send + Sync
where
    M: Send + Sync + 'static,
{
    async fn handle_fault(
        &self,
        message: &M,
        error: Option<&ProcessingError>,
    ) -> Result<(), HandlerError>;
}

/// Receives per-message statistics after every processed message.
#[async_trait]
pub trait StatisticsHandler: Send + Sync {
    async fn handle(&self, statistics: &MessageStatistics) -> Result<(), HandlerError>;
}
