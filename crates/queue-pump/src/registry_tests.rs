use super::*;
use crate::container::ServiceContainer;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct OrderPlaced {
    order_id: u64,
}

impl QueueMessage for OrderPlaced {
    const MESSAGE_TYPE: &'static str = "OrderPlaced";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OrderShipped {
    order_id: u64,
}

impl QueueMessage for OrderShipped {
    const MESSAGE_TYPE: &'static str = "OrderShipped";
}

struct AuditHandler;

#[async_trait]
impl MessageHandler<OrderPlaced> for AuditHandler {
    async fn handle(&self, _message: &OrderPlaced) -> Result<(), HandlerError> {
        Ok(())
    }
}

struct BillingHandler;

#[async_trait]
impl MessageHandler<OrderPlaced> for BillingHandler {
    async fn handle(&self, message: &OrderPlaced) -> Result<(), HandlerError> {
        if message.order_id == 0 {
            return Err("order id must be positive".into());
        }
        Ok(())
    }
}

struct AlertOnFault;

#[async_trait]
impl FaultHandler<TransportMessage> for AlertOnFault {
    async fn handle_fault(
        &self,
        _message: &TransportMessage,
        _error: Option<&ProcessingError>,
    ) -> Result<(), HandlerError> {
        Ok(())
    }
}

#[async_trait]
impl FaultHandler<OrderPlaced> for AlertOnFault {
    async fn handle_fault(
        &self,
        _message: &OrderPlaced,
        _error: Option<&ProcessingError>,
    ) -> Result<(), HandlerError> {
        Ok(())
    }
}

fn order_registry() -> HandlerRegistry {
    HandlerRegistry::new()
        .with_handler::<OrderPlaced, _, _>(|_| Ok(AuditHandler))
        .with_handler::<OrderPlaced, _, _>(|_| Ok(BillingHandler))
}

#[test]
fn test_handlers_are_grouped_by_message_type() {
    let registry = order_registry();

    assert_eq!(registry.handler_count(&MessageType::of::<OrderPlaced>()), 2);
    assert_eq!(registry.handler_count(&MessageType::of::<OrderShipped>()), 0);
    assert!(registry.has_handlers());
}

#[test]
fn test_duplicate_handler_type_is_registered_once() {
    let registry = order_registry().with_handler::<OrderPlaced, _, _>(|_| Ok(AuditHandler));

    assert_eq!(registry.handler_count(&MessageType::of::<OrderPlaced>()), 2);
}

#[test]
fn test_message_type_lookup_ignores_case() {
    let registry = order_registry();

    assert_eq!(
        registry.resolve_message_type("orderplaced"),
        Some(MessageType::of::<OrderPlaced>())
    );
    assert_eq!(
        registry.resolve_message_type("ORDERPLACED"),
        Some(MessageType::of::<OrderPlaced>())
    );
    assert_eq!(registry.resolve_message_type("OrderShipped"), None);
}

#[test]
fn test_register_message_type_without_handlers() {
    let registry = HandlerRegistry::new().register_message_type::<OrderShipped>();

    assert!(registry.resolve_message_type("OrderShipped").is_some());
    assert!(!registry.has_handlers());
    assert_eq!(registry.message_type_names(), vec!["OrderShipped"]);
}

#[test]
fn test_generic_and_typed_fault_handlers_use_separate_keys() {
    let registry = HandlerRegistry::new()
        .with_fault_handler::<OrderPlaced, _, _>(|_| Ok(AlertOnFault))
        .with_generic_fault_handler(|_| Ok(AlertOnFault));

    assert_eq!(
        registry.fault_handler_count(&MessageType::of::<OrderPlaced>()),
        1
    );
    assert_eq!(registry.fault_handler_count(&MessageType::generic()), 1);
    assert!(!registry.has_handlers());
}

#[test]
fn test_registered_decoder_produces_typed_payload() {
    let registry = order_registry();
    let registered = registry.registered_type("OrderPlaced").unwrap();

    let payload = (registered.decode)(serde_json::json!({"order_id": 9})).unwrap();
    assert_eq!(
        payload.downcast_ref::<OrderPlaced>(),
        Some(&OrderPlaced { order_id: 9 })
    );
    assert!((registered.decode)(serde_json::json!({"wrong": true})).is_err());
}

#[tokio::test]
async fn test_dispatch_invokes_handler_with_payload() {
    let registry = order_registry();
    let container = Arc::new(ServiceContainer::new());
    let scope = container.nested_scope();
    let handlers = registry.handlers_for(&MessageType::of::<OrderPlaced>());

    let good = TransportMessage::from_payload("m-1", "r-1", OrderPlaced { order_id: 1 });
    for handler in handlers {
        assert!(handler.dispatch(&scope, &good).await.is_ok());
    }

    let bad = TransportMessage::from_payload("m-2", "r-2", OrderPlaced { order_id: 0 });
    let results: Vec<_> = futures::future::join_all(
        handlers.iter().map(|handler| handler.dispatch(&scope, &bad)),
    )
    .await;
    assert!(results[0].is_ok());
    assert!(matches!(results[1], Err(ProcessingError::Handler { .. })));
}

#[tokio::test]
async fn test_dispatch_rejects_mismatched_payload() {
    let registry = order_registry();
    let container = Arc::new(ServiceContainer::new());
    let scope = container.nested_scope();

    let shipped = TransportMessage::from_payload("m-1", "r-1", OrderShipped { order_id: 1 });
    let handler = &registry.handlers_for(&MessageType::of::<OrderPlaced>())[0];

    let result = handler.dispatch(&scope, &shipped).await;
    assert!(matches!(result, Err(ProcessingError::PayloadMismatch { .. })));
}

#[tokio::test]
async fn test_factory_failure_is_reported_as_resolution_error() {
    let registry = HandlerRegistry::new()
        .with_handler::<OrderPlaced, AuditHandler, _>(|_| Err("database unavailable".into()));
    let container = Arc::new(ServiceContainer::new());
    let scope = container.nested_scope();

    let message = TransportMessage::from_payload("m-1", "r-1", OrderPlaced { order_id: 1 });
    let handler = &registry.handlers_for(&MessageType::of::<OrderPlaced>())[0];

    let result = handler.dispatch(&scope, &message).await;
    assert!(matches!(
        result,
        Err(ProcessingError::HandlerResolution { .. })
    ));
}
