//! Message body logging hooks.

use tracing::info;

/// Receives every message body that enters or leaves the runtime.
pub trait MessageLogger: Send + Sync {
    fn inbound_log(&self, body: &str, message_type: Option<&str>, message_id: &str, attempt: u32);

    fn outbound_log(&self, _body: &str, _message_type: &str) {}
}

/// Logger that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpMessageLogger;

impl MessageLogger for NoOpMessageLogger {
    fn inbound_log(&self, _body: &str, _message_type: Option<&str>, _message_id: &str, _attempt: u32) {}
}

/// Logger that records message bodies through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMessageLogger;

impl MessageLogger for TracingMessageLogger {
    fn inbound_log(&self, body: &str, message_type: Option<&str>, message_id: &str, attempt: u32) {
        info!(
            target: "queue_pump::messages",
            message_id = %message_id,
            message_type = message_type.unwrap_or("unknown"),
            attempt = attempt,
            body = %body,
            "Inbound message"
        );
    }

    fn outbound_log(&self, body: &str, message_type: &str) {
        info!(
            target: "queue_pump::messages",
            message_type = %message_type,
            body = %body,
            "Outbound message"
        );
    }
}
