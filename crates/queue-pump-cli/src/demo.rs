//! Demo message and handlers used by `run` and `send`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use queue_pump::{
    FaultHandler, HandlerError, HandlerRegistry, MessageHandler, MessageStatistics,
    ProcessingError, QueueMessage, ServiceContainer, StatisticsHandler, TransportMessage,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Names starting with this prefix make [`DemoHandler`] fail
pub const FAILING_NAME_PREFIX: &str = "fail-";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DemoMessage {
    pub id: u64,
    pub name: String,
    pub modified: DateTime<Utc>,
}

impl QueueMessage for DemoMessage {
    const MESSAGE_TYPE: &'static str = "DemoMessage";
}

impl DemoMessage {
    pub fn new(id: u64, failing: bool) -> Self {
        let prefix = if failing { FAILING_NAME_PREFIX } else { "" };
        Self {
            id,
            name: format!("{}{}", prefix, uuid::Uuid::new_v4()),
            modified: Utc::now(),
        }
    }
}

pub struct DemoHandler;

#[async_trait]
impl MessageHandler<DemoMessage> for DemoHandler {
    async fn handle(&self, message: &DemoMessage) -> Result<(), HandlerError> {
        if message.name.starts_with(FAILING_NAME_PREFIX) {
            return Err(format!("demo message {} asked to fail", message.id).into());
        }
        info!(id = message.id, name = %message.name, "Handled demo message");
        Ok(())
    }
}

pub struct DemoFaultHandler;

#[async_trait]
impl FaultHandler<DemoMessage> for DemoFaultHandler {
    async fn handle_fault(
        &self,
        message: &DemoMessage,
        error: Option<&ProcessingError>,
    ) -> Result<(), HandlerError> {
        warn!(
            id = message.id,
            name = %message.name,
            error = ?error.map(ToString::to_string),
            "Demo message gave up"
        );
        Ok(())
    }
}

/// Catches every faulted message, including ones that could not be parsed
pub struct UnhandledFaultLogger;

#[async_trait]
impl FaultHandler<TransportMessage> for UnhandledFaultLogger {
    async fn handle_fault(
        &self,
        message: &TransportMessage,
        error: Option<&ProcessingError>,
    ) -> Result<(), HandlerError> {
        warn!(
            message_id = %message.id(),
            message_type = message.message_type_name().unwrap_or("unknown"),
            error = ?error.map(ToString::to_string),
            "Message faulted"
        );
        Ok(())
    }
}

pub struct StatisticsLogger;

#[async_trait]
impl StatisticsHandler for StatisticsLogger {
    async fn handle(&self, statistics: &MessageStatistics) -> Result<(), HandlerError> {
        info!(
            message_type = statistics.message_type_name.as_deref().unwrap_or("unknown"),
            successful = statistics.successful,
            final_attempt = statistics.final_attempt,
            attempt = statistics.previous_attempt_count,
            runtime_ms = statistics.handler_runtime.as_millis() as u64,
            body_length = statistics.body_length,
            "Message statistics"
        );
        Ok(())
    }
}

pub fn registry() -> HandlerRegistry {
    HandlerRegistry::new()
        .with_handler::<DemoMessage, _, _>(|_| Ok(DemoHandler))
        .with_fault_handler::<DemoMessage, _, _>(|_| Ok(DemoFaultHandler))
        .with_generic_fault_handler(|_| Ok(UnhandledFaultLogger))
}

pub fn container() -> ServiceContainer {
    let mut container = ServiceContainer::new();
    container.add_to_collection::<dyn StatisticsHandler>(Arc::new(StatisticsLogger));
    container
}
