//! Explicit handler registration table.
//!
//! The registry is assembled once while configuring a queue and is immutable
//! afterwards. It maps each message type to the handlers that process it and
//! to the fault handlers notified when it fails for the last time. Fault
//! handlers registered under [`MessageType::generic`] apply to every message.
//!
//! Handlers are registered as factories so that each message gets fresh
//! handler instances built from its own [`RequestScope`].

use crate::container::RequestScope;
use crate::error::{HandlerError, ProcessingError};
use crate::handler::{FaultHandler, MessageHandler};
use crate::message::{MessageType, Payload, QueueMessage, TransportMessage};
use async_trait::async_trait;
use std::any::{type_name, TypeId};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, warn};

/// Turns a structured value into the typed payload of a registered message type.
pub(crate) type PayloadDecoder = fn(serde_json::Value) -> Result<Payload, serde_json::Error>;

fn decode_payload<M: QueueMessage>(value: serde_json::Value) -> Result<Payload, serde_json::Error> {
    let message: M = serde_json::from_value(value)?;
    Ok(Arc::new(message))
}

/// A message type known to the parser.
#[derive(Clone, Copy)]
pub(crate) struct RegisteredType {
    pub(crate) message_type: MessageType,
    pub(crate) decode: PayloadDecoder,
}

// ============================================================================
// Type-erased dispatch
// ============================================================================

#[async_trait]
pub(crate) trait DispatchHandler: Send + Sync {
    fn name(&self) -> &'static str;

    fn handler_id(&self) -> TypeId;

    async fn dispatch(
        &self,
        scope: &RequestScope,
        message: &TransportMessage,
    ) -> Result<(), ProcessingError>;
}

#[async_trait]
pub(crate) trait DispatchFaultHandler: Send + Sync {
    fn name(&self) -> &'static str;

    fn handler_id(&self) -> TypeId;

    async fn dispatch(
        &self,
        scope: &RequestScope,
        message: &TransportMessage,
        error: Option<&ProcessingError>,
    ) -> Result<(), ProcessingError>;
}

struct TypedHandler<M, H, F> {
    factory: F,
    _marker: PhantomData<fn() -> (M, H)>,
}

#[async_trait]
impl<M, H, F> DispatchHandler for TypedHandler<M, H, F>
where
    M: QueueMessage,
    H: MessageHandler<M> + 'static,
    F: Fn(&RequestScope) -> Result<H, HandlerError> + Send + Sync + 'static,
{
    fn name(&self) -> &'static str {
        type_name::<H>()
    }

    fn handler_id(&self) -> TypeId {
        TypeId::of::<H>()
    }

    async fn dispatch(
        &self,
        scope: &RequestScope,
        message: &TransportMessage,
    ) -> Result<(), ProcessingError> {
        let payload = message
            .payload::<M>()
            .ok_or_else(|| ProcessingError::PayloadMismatch {
                handler: self.name().to_string(),
            })?;

        let handler = (self.factory)(scope).map_err(|source| ProcessingError::HandlerResolution {
            handler: self.name().to_string(),
            source,
        })?;

        handler
            .handle(payload)
            .await
            .map_err(|source| ProcessingError::Handler {
                handler: self.name().to_string(),
                source,
            })
    }
}

struct TypedFaultHandler<M, H, F> {
    factory: F,
    _marker: PhantomData<fn() -> (M, H)>,
}

#[async_trait]
impl<M, H, F> DispatchFaultHandler for TypedFaultHandler<M, H, F>
where
    M: QueueMessage,
    H: FaultHandler<M> + 'static,
    F: Fn(&RequestScope) -> Result<H, HandlerError> + Send + Sync + 'static,
{
    fn name(&self) -> &'static str {
        type_name::<H>()
    }

    fn handler_id(&self) -> TypeId {
        TypeId::of::<H>()
    }

    async fn dispatch(
        &self,
        scope: &RequestScope,
        message: &TransportMessage,
        error: Option<&ProcessingError>,
    ) -> Result<(), ProcessingError> {
        let payload = message
            .payload::<M>()
            .ok_or_else(|| ProcessingError::PayloadMismatch {
                handler: self.name().to_string(),
            })?;

        let handler = (self.factory)(scope).map_err(|source| ProcessingError::HandlerResolution {
            handler: self.name().to_string(),
            source,
        })?;

        handler
            .handle_fault(payload, error)
            .await
            .map_err(|source| ProcessingError::Handler {
                handler: self.name().to_string(),
                source,
            })
    }
}

struct EnvelopeFaultHandler<H, F> {
    factory: F,
    _marker: PhantomData<fn() -> H>,
}

#[async_trait]
impl<H, F> DispatchFaultHandler for EnvelopeFaultHandler<H, F>
where
    H: FaultHandler<TransportMessage> + 'static,
    F: Fn(&RequestScope) -> Result<H, HandlerError> + Send + Sync + 'static,
{
    fn name(&self) -> &'static str {
        type_name::<H>()
    }

    fn handler_id(&self) -> TypeId {
        TypeId::of::<H>()
    }

    async fn dispatch(
        &self,
        scope: &RequestScope,
        message: &TransportMessage,
        error: Option<&ProcessingError>,
    ) -> Result<(), ProcessingError> {
        let handler = (self.factory)(scope).map_err(|source| ProcessingError::HandlerResolution {
            handler: self.name().to_string(),
            source,
        })?;

        handler
            .handle_fault(message, error)
            .await
            .map_err(|source| ProcessingError::Handler {
                handler: self.name().to_string(),
                source,
            })
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Immutable mapping from message types to handler factories.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    // Lower-cased type name -> descriptor
    message_types: HashMap<String, RegisteredType>,
    handlers: HashMap<MessageType, Vec<Arc<dyn DispatchHandler>>>,
    fault_handlers: HashMap<MessageType, Vec<Arc<dyn DispatchFaultHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `M` known to the parser without attaching any handler
    pub fn register_message_type<M: QueueMessage>(mut self) -> Self {
        self.add_message_type::<M>();
        self
    }

    /// Register a handler for `M`, built per message by `factory`.
    ///
    /// Registering the same handler type twice for one message type has no
    /// further effect.
    pub fn with_handler<M, H, F>(mut self, factory: F) -> Self
    where
        M: QueueMessage,
        H: MessageHandler<M> + 'static,
        F: Fn(&RequestScope) -> Result<H, HandlerError> + Send + Sync + 'static,
    {
        let message_type = self.add_message_type::<M>();
        let entry: Arc<dyn DispatchHandler> = Arc::new(TypedHandler::<M, H, F> {
            factory,
            _marker: PhantomData,
        });

        let entries = self.handlers.entry(message_type).or_default();
        if entries.iter().any(|e| e.handler_id() == entry.handler_id()) {
            debug!(
                message_type = %message_type,
                handler = entry.name(),
                "Handler already registered, ignoring duplicate"
            );
        } else {
            entries.push(entry);
        }
        self
    }

    /// Register a fault handler for the final failure of an `M` message
    pub fn with_fault_handler<M, H, F>(mut self, factory: F) -> Self
    where
        M: QueueMessage,
        H: FaultHandler<M> + 'static,
        F: Fn(&RequestScope) -> Result<H, HandlerError> + Send + Sync + 'static,
    {
        let message_type = self.add_message_type::<M>();
        let entry: Arc<dyn DispatchFaultHandler> = Arc::new(TypedFaultHandler::<M, H, F> {
            factory,
            _marker: PhantomData,
        });
        self.add_fault_handler(message_type, entry);
        self
    }

    /// Register a fault handler that runs for every faulted message
    pub fn with_generic_fault_handler<H, F>(mut self, factory: F) -> Self
    where
        H: FaultHandler<TransportMessage> + 'static,
        F: Fn(&RequestScope) -> Result<H, HandlerError> + Send + Sync + 'static,
    {
        let entry: Arc<dyn DispatchFaultHandler> = Arc::new(EnvelopeFaultHandler::<H, F> {
            factory,
            _marker: PhantomData,
        });
        self.add_fault_handler(MessageType::generic(), entry);
        self
    }

    /// Look up a message type by name, ignoring case
    pub fn resolve_message_type(&self, name: &str) -> Option<MessageType> {
        self.registered_type(name).map(|t| t.message_type)
    }

    pub(crate) fn registered_type(&self, name: &str) -> Option<&RegisteredType> {
        self.message_types.get(&name.to_lowercase())
    }

    pub(crate) fn handlers_for(&self, message_type: &MessageType) -> &[Arc<dyn DispatchHandler>] {
        self.handlers
            .get(message_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub(crate) fn fault_handlers_for(
        &self,
        message_type: &MessageType,
    ) -> &[Arc<dyn DispatchFaultHandler>] {
        self.fault_handlers
            .get(message_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn handler_count(&self, message_type: &MessageType) -> usize {
        self.handlers_for(message_type).len()
    }

    pub fn fault_handler_count(&self, message_type: &MessageType) -> usize {
        self.fault_handlers_for(message_type).len()
    }

    /// True when at least one success handler is registered
    pub fn has_handlers(&self) -> bool {
        self.handlers.values().any(|entries| !entries.is_empty())
    }

    /// Names of all known message types
    pub fn message_type_names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self
            .message_types
            .values()
            .map(|t| t.message_type.name())
            .collect();
        names.sort_unstable();
        names
    }

    fn add_message_type<M: QueueMessage>(&mut self) -> MessageType {
        let message_type = MessageType::of::<M>();
        let key = message_type.name().to_lowercase();

        if let Some(existing) = self.message_types.get(&key) {
            if existing.message_type != message_type {
                warn!(
                    message_type = %message_type,
                    "Message type name registered by two different types, last one wins"
                );
            }
        }

        self.message_types.insert(
            key,
            RegisteredType {
                message_type,
                decode: decode_payload::<M>,
            },
        );
        message_type
    }

    fn add_fault_handler(&mut self, message_type: MessageType, entry: Arc<dyn DispatchFaultHandler>) {
        let entries = self.fault_handlers.entry(message_type).or_default();
        if entries.iter().any(|e| e.handler_id() == entry.handler_id()) {
            debug!(
                message_type = %message_type,
                handler = entry.name(),
                "Fault handler already registered, ignoring duplicate"
            );
        } else {
            entries.push(entry);
        }
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("message_types", &self.message_type_names())
            .field(
                "handlers",
                &self.handlers.values().map(Vec::len).sum::<usize>(),
            )
            .field(
                "fault_handlers",
                &self.fault_handlers.values().map(Vec::len).sum::<usize>(),
            )
            .finish()
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
