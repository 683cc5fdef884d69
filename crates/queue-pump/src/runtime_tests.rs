use super::*;
use crate::backends::FileQueue;
use crate::backoff::BackoffPolicy;
use crate::builder::QueueBuilder;
use crate::error::{HandlerError, ProcessingError};
use crate::handler::{FaultHandler, MessageHandler};
use crate::message::QueueMessage;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tempfile::TempDir;

#[derive(Debug, Clone, Serialize, Deserialize)]
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

/// Re-publishes every placed order as shipped through the scoped send queue.
struct ShipOrder {
    sender: Arc<dyn MessageSender>,
}

#[async_trait]
impl MessageHandler<OrderPlaced> for ShipOrder {
    async fn handle(&self, message: &OrderPlaced) -> Result<(), HandlerError> {
        self.sender
            .send(&OrderShipped {
                order_id: message.order_id,
            })
            .await?;
        Ok(())
    }
}

struct RecordShipped(Arc<StdMutex<Vec<u64>>>);

#[async_trait]
impl MessageHandler<OrderShipped> for RecordShipped {
    async fn handle(&self, message: &OrderShipped) -> Result<(), HandlerError> {
        self.0.lock().unwrap().push(message.order_id);
        Ok(())
    }
}

struct RejectOrder;

#[async_trait]
impl MessageHandler<OrderPlaced> for RejectOrder {
    async fn handle(&self, _message: &OrderPlaced) -> Result<(), HandlerError> {
        Err("order rejected".into())
    }
}

struct RecordFault(Arc<StdMutex<Vec<u64>>>);

#[async_trait]
impl FaultHandler<OrderPlaced> for RecordFault {
    async fn handle_fault(
        &self,
        message: &OrderPlaced,
        _error: Option<&ProcessingError>,
    ) -> Result<(), HandlerError> {
        self.0.lock().unwrap().push(message.order_id);
        Ok(())
    }
}

fn fast_backoff() -> BackoffPolicy {
    BackoffPolicy::new(Duration::from_millis(5), Duration::from_millis(20), 2.0).without_jitter()
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within 5 seconds"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_send_only_runtime_refuses_to_receive() {
    let dir = TempDir::new().unwrap();
    let runtime = QueueBuilder::file(dir.path().join("q"))
        .build_send_only()
        .unwrap();

    let result = runtime.start_receiving().await;

    assert!(matches!(result, Err(QueueError::InvalidOperation { .. })));
    assert!(!runtime.is_receiving().await);
}

#[tokio::test]
async fn test_create_send_queue_initializes_backend() {
    let dir = TempDir::new().unwrap();
    let folder = dir.path().join("q");
    let runtime = QueueBuilder::file(&folder).build_send_only().unwrap();

    let sender = runtime.create_send_queue().await.unwrap();
    sender.send(&OrderPlaced { order_id: 9 }).await.unwrap();

    assert!(folder.is_dir());
    assert!(folder.join(crate::backends::DEAD_LETTER_FOLDER).is_dir());
    let queue = FileQueue::new(&folder, 5);
    assert_eq!(queue.active_records().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_start_twice_is_rejected() {
    let dir = TempDir::new().unwrap();
    let shipped = Arc::new(StdMutex::new(Vec::new()));
    let recorded = shipped.clone();
    let runtime = QueueBuilder::file(dir.path().join("q"))
        .poll_wait_seconds(0)
        .max_simultaneous_messages(1)
        .idle_backoff(fast_backoff())
        .with_handlers(
            HandlerRegistry::new()
                .with_handler::<OrderShipped, _, _>(move |_| Ok(RecordShipped(recorded.clone()))),
        )
        .build_startable()
        .unwrap();

    runtime.start_receiving().await.unwrap();
    let second = runtime.start_receiving().await;

    assert!(matches!(second, Err(QueueError::InvalidOperation { .. })));
    assert!(runtime.is_receiving().await);
    assert!(runtime.stop_receiving().await);
    assert!(!runtime.is_receiving().await);
}

#[tokio::test]
async fn test_stop_when_not_receiving_is_a_no_op() {
    let dir = TempDir::new().unwrap();
    let runtime = QueueBuilder::file(dir.path().join("q"))
        .build_send_only()
        .unwrap();

    assert!(runtime.stop_receiving().await);
    assert!(runtime.stop_receiving().await);
}

#[tokio::test]
async fn test_handlers_can_send_through_scoped_send_queue() {
    let dir = TempDir::new().unwrap();
    let shipped = Arc::new(StdMutex::new(Vec::new()));
    let recorded = shipped.clone();

    let registry = HandlerRegistry::new()
        .with_handler::<OrderPlaced, _, _>(|scope| {
            Ok(ShipOrder {
                sender: scope.resolve::<dyn MessageSender>()?,
            })
        })
        .with_handler::<OrderShipped, _, _>(move |_| Ok(RecordShipped(recorded.clone())));

    let runtime = QueueBuilder::file(dir.path().join("orders"))
        .poll_wait_seconds(0)
        .max_simultaneous_messages(2)
        .idle_backoff(fast_backoff())
        .with_handlers(registry)
        .build_startable()
        .unwrap();

    runtime.start_receiving().await.unwrap();
    runtime
        .create_send_queue()
        .await
        .unwrap()
        .send(&OrderPlaced { order_id: 77 })
        .await
        .unwrap();

    wait_until(|| shipped.lock().unwrap().as_slice() == [77]).await;
    runtime.stop_receiving().await;

    let queue = FileQueue::new(dir.path().join("orders"), 5);
    assert!(queue.active_records().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_user_pre_handler_runs_for_each_message() {
    let dir = TempDir::new().unwrap();
    let calls = Arc::new(StdMutex::new(0usize));
    let counted = calls.clone();
    let shipped = Arc::new(StdMutex::new(Vec::new()));
    let recorded = shipped.clone();

    let runtime = QueueBuilder::file(dir.path().join("q"))
        .poll_wait_seconds(0)
        .max_simultaneous_messages(1)
        .idle_backoff(fast_backoff())
        .with_pre_handler(move |scope| {
            // The send queue is registered before the user hook runs
            scope.resolve::<dyn MessageSender>()?;
            *counted.lock().unwrap() += 1;
            Ok(())
        })
        .with_handlers(
            HandlerRegistry::new()
                .with_handler::<OrderShipped, _, _>(move |_| Ok(RecordShipped(recorded.clone()))),
        )
        .build_startable()
        .unwrap();

    runtime.start_receiving().await.unwrap();
    let sender = runtime.create_send_queue().await.unwrap();
    sender.send(&OrderShipped { order_id: 1 }).await.unwrap();
    sender.send(&OrderShipped { order_id: 2 }).await.unwrap();

    wait_until(|| shipped.lock().unwrap().len() == 2).await;
    runtime.stop_receiving().await;

    assert_eq!(*calls.lock().unwrap(), 2);
}

#[tokio::test]
async fn test_failing_message_is_faulted_then_dead_lettered() {
    let dir = TempDir::new().unwrap();
    let folder = dir.path().join("orders");
    let queue = Arc::new(FileQueue::new(&folder, 2).with_retry_delay(Duration::ZERO));
    let faults = Arc::new(StdMutex::new(Vec::new()));
    let recorded = faults.clone();

    let runtime = QueueBuilder::with_backend(queue.clone())
        .retry_count(2)
        .max_simultaneous_messages(1)
        .idle_backoff(fast_backoff())
        .with_handlers(
            HandlerRegistry::new()
                .with_handler::<OrderPlaced, _, _>(|_| Ok(RejectOrder))
                .with_fault_handler::<OrderPlaced, _, _>(move |_| {
                    Ok(RecordFault(recorded.clone()))
                }),
        )
        .build_startable()
        .unwrap();

    runtime.start_receiving().await.unwrap();
    runtime
        .create_send_queue()
        .await
        .unwrap()
        .send(&OrderPlaced { order_id: 13 })
        .await
        .unwrap();

    wait_until(|| faults.lock().unwrap().as_slice() == [13]).await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if queue.dead_letter_records().await.unwrap().len() == 1 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "record was not dead-lettered");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    runtime.stop_receiving().await;

    let dead = queue.dead_letter_records().await.unwrap();
    assert_eq!(dead[0].attempts, 2);
    assert!(queue.active_records().await.unwrap().is_empty());
    assert_eq!(faults.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_receiving_can_restart_after_stop() {
    let dir = TempDir::new().unwrap();
    let shipped = Arc::new(StdMutex::new(Vec::new()));
    let recorded = shipped.clone();
    let runtime = QueueBuilder::file(dir.path().join("q"))
        .poll_wait_seconds(0)
        .max_simultaneous_messages(1)
        .idle_backoff(fast_backoff())
        .with_handlers(
            HandlerRegistry::new()
                .with_handler::<OrderShipped, _, _>(move |_| Ok(RecordShipped(recorded.clone()))),
        )
        .build_startable()
        .unwrap();

    runtime.start_receiving().await.unwrap();
    runtime.stop_receiving().await;
    runtime.start_receiving().await.unwrap();

    runtime
        .create_send_queue()
        .await
        .unwrap()
        .send(&OrderShipped { order_id: 5 })
        .await
        .unwrap();
    wait_until(|| shipped.lock().unwrap().as_slice() == [5]).await;

    runtime.stop_receiving().await;
}
