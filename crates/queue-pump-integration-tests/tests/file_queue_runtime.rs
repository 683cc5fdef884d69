//! End-to-end tests of a runtime backed by a file queue.

mod common;

use common::*;
use queue_pump::backends::FileQueue;
use queue_pump::{
    HandlerRegistry, MessageLogger, QueueBuilder, QueueSettings, ServiceContainer,
    StatisticsHandler,
};
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

fn slow_handlers(observations: &Arc<Observations>, delay: Duration) -> HandlerRegistry {
    let observations = observations.clone();
    HandlerRegistry::new().with_handler::<OrderPlaced, _, _>(move |_| {
        Ok(SlowHandler {
            observations: observations.clone(),
            delay,
        })
    })
}

fn file_builder(path: &Path) -> QueueBuilder {
    QueueBuilder::file(path)
        .poll_wait_seconds(0)
        .file_retry_delay(Duration::ZERO)
        .idle_backoff(fast_backoff())
}

#[tokio::test]
async fn test_processing_respects_max_simultaneous_messages() {
    let dir = TempDir::new().unwrap();
    let observations = Arc::new(Observations::default());

    let runtime = file_builder(dir.path())
        .max_simultaneous_messages(2)
        .with_handlers(slow_handlers(&observations, Duration::from_millis(100)))
        .build_startable()
        .unwrap();

    let sender = runtime.create_send_queue().await.unwrap();
    for order_id in 1..=6 {
        sender.send(&OrderPlaced { order_id }).await.unwrap();
    }

    runtime.start_receiving().await.unwrap();
    wait_for("all orders handled", || observations.handled().len() == 6).await;
    assert!(runtime.stop_receiving().await);

    assert_eq!(observations.handled(), vec![1, 2, 3, 4, 5, 6]);
    let peak = observations.peak_running.load(Ordering::SeqCst);
    assert!(peak >= 1 && peak <= 2, "peak concurrency was {peak}");

    let queue = FileQueue::new(dir.path(), 5);
    assert!(queue.active_records().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_failing_message_is_retried_faulted_and_dead_lettered() {
    let dir = TempDir::new().unwrap();
    let observations = Arc::new(Observations::default());
    let faults = observations.clone();

    let mut container = ServiceContainer::new();
    container.add_to_collection::<dyn StatisticsHandler>(Arc::new(StatisticsRecorder(
        observations.clone(),
    )));

    let runtime = file_builder(dir.path())
        .retry_count(3)
        .max_simultaneous_messages(1)
        .with_container(container)
        .with_handlers(
            HandlerRegistry::new()
                .with_handler::<OrderPlaced, _, _>(|_| Ok(FailingHandler))
                .with_fault_handler::<OrderPlaced, _, _>(move |_| {
                    Ok(OrderFaultRecorder(faults.clone()))
                }),
        )
        .build_startable()
        .unwrap();

    runtime.start_receiving().await.unwrap();
    runtime
        .create_send_queue()
        .await
        .unwrap()
        .send(&OrderPlaced { order_id: 41 })
        .await
        .unwrap();

    let queue = FileQueue::new(dir.path(), 3);
    let dead_letters = &queue;
    wait_until("record dead-lettered", move || async move {
        dead_letters
            .dead_letter_records()
            .await
            .map(|records| records.len() == 1)
            .unwrap_or(false)
    })
    .await;
    runtime.stop_receiving().await;

    assert_eq!(*observations.faulted.lock().unwrap(), vec![41]);

    let statistics = observations.statistics.lock().unwrap().clone();
    assert_eq!(statistics.len(), 3);
    assert_eq!(
        statistics
            .iter()
            .map(|s| s.previous_attempt_count)
            .collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert!(statistics.iter().all(|s| !s.successful));
    assert_eq!(
        statistics.iter().map(|s| s.final_attempt).collect::<Vec<_>>(),
        vec![false, false, true]
    );

    let dead = queue.dead_letter_records().await.unwrap();
    assert_eq!(dead[0].attempts, 3);
    assert!(queue.active_records().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_message_type_reaches_generic_fault_handler() {
    let dir = TempDir::new().unwrap();
    let observations = Arc::new(Observations::default());
    let generic = observations.clone();

    let runtime = file_builder(dir.path())
        .retry_count(1)
        .max_simultaneous_messages(1)
        .with_handlers(
            slow_handlers(&observations, Duration::ZERO)
                .with_generic_fault_handler(move |_| Ok(GenericFaultRecorder(generic.clone()))),
        )
        .build_startable()
        .unwrap();

    runtime.start_receiving().await.unwrap();
    runtime
        .create_send_queue()
        .await
        .unwrap()
        .send_body(r#"{"mystery":true}"#, "Mystery", Vec::new())
        .await
        .unwrap();

    wait_for("generic fault recorded", || {
        !observations.generic_faults.lock().unwrap().is_empty()
    })
    .await;
    runtime.stop_receiving().await;

    let faults = observations.generic_faults.lock().unwrap().clone();
    assert_eq!(faults.len(), 1);
    assert_eq!(faults[0].0, r#"{"mystery":true}"#);
    assert!(faults[0].1.is_some());
    assert!(observations.handled().is_empty());
}

#[tokio::test]
async fn test_successful_message_statistics() {
    let dir = TempDir::new().unwrap();
    let observations = Arc::new(Observations::default());

    let mut container = ServiceContainer::new();
    container.add_to_collection::<dyn StatisticsHandler>(Arc::new(StatisticsRecorder(
        observations.clone(),
    )));

    let runtime = file_builder(dir.path())
        .max_simultaneous_messages(1)
        .with_container(container)
        .with_handlers(slow_handlers(&observations, Duration::ZERO))
        .build_startable()
        .unwrap();

    runtime.start_receiving().await.unwrap();
    runtime
        .create_send_queue()
        .await
        .unwrap()
        .send(&OrderPlaced { order_id: 3 })
        .await
        .unwrap();

    wait_for("statistics recorded", || {
        !observations.statistics.lock().unwrap().is_empty()
    })
    .await;
    runtime.stop_receiving().await;

    let statistics = observations.statistics.lock().unwrap()[0].clone();
    assert!(statistics.successful);
    assert!(!statistics.final_attempt);
    assert_eq!(statistics.previous_attempt_count, 1);
    assert_eq!(statistics.message_type_name.as_deref(), Some("OrderPlaced"));
    assert_eq!(statistics.body_length, r#"{"order_id":3}"#.len());
}

#[tokio::test]
async fn test_stop_drains_in_flight_messages() {
    let dir = TempDir::new().unwrap();
    let observations = Arc::new(Observations::default());

    let runtime = file_builder(dir.path())
        .max_simultaneous_messages(1)
        .drain_on_stop(Duration::from_secs(5))
        .with_handlers(slow_handlers(&observations, Duration::from_millis(300)))
        .build_startable()
        .unwrap();

    runtime.start_receiving().await.unwrap();
    runtime
        .create_send_queue()
        .await
        .unwrap()
        .send(&OrderPlaced { order_id: 8 })
        .await
        .unwrap();

    wait_for("handler running", || {
        observations.running.load(Ordering::SeqCst) == 1
    })
    .await;

    assert!(runtime.stop_receiving().await);
    assert_eq!(observations.handled(), vec![8]);
}

#[tokio::test]
async fn test_stop_without_drain_returns_while_in_flight() {
    let dir = TempDir::new().unwrap();
    let observations = Arc::new(Observations::default());

    let runtime = file_builder(dir.path())
        .max_simultaneous_messages(1)
        .with_handlers(slow_handlers(&observations, Duration::from_millis(500)))
        .build_startable()
        .unwrap();

    runtime.start_receiving().await.unwrap();
    runtime
        .create_send_queue()
        .await
        .unwrap()
        .send(&OrderPlaced { order_id: 9 })
        .await
        .unwrap();

    wait_for("handler running", || {
        observations.running.load(Ordering::SeqCst) == 1
    })
    .await;

    assert!(!runtime.stop_receiving().await);
    assert!(observations.handled().is_empty());
}

#[derive(Default)]
struct RecordingLogger {
    inbound: Mutex<Vec<(String, u32)>>,
    outbound: Mutex<Vec<String>>,
}

impl MessageLogger for RecordingLogger {
    fn inbound_log(&self, _body: &str, message_type: Option<&str>, _message_id: &str, attempt: u32) {
        self.inbound
            .lock()
            .unwrap()
            .push((message_type.unwrap_or_default().to_string(), attempt));
    }

    fn outbound_log(&self, _body: &str, message_type: &str) {
        self.outbound.lock().unwrap().push(message_type.to_string());
    }
}

#[tokio::test]
async fn test_message_logger_sees_both_directions() {
    let dir = TempDir::new().unwrap();
    let observations = Arc::new(Observations::default());
    let logger = Arc::new(RecordingLogger::default());

    let runtime = file_builder(dir.path())
        .max_simultaneous_messages(1)
        .with_message_logger(logger.clone())
        .with_handlers(slow_handlers(&observations, Duration::ZERO))
        .build_startable()
        .unwrap();

    runtime.start_receiving().await.unwrap();
    runtime
        .create_send_queue()
        .await
        .unwrap()
        .send(&OrderPlaced { order_id: 1 })
        .await
        .unwrap();

    wait_for("order handled", || observations.handled() == vec![1]).await;
    runtime.stop_receiving().await;

    assert_eq!(*logger.outbound.lock().unwrap(), vec!["OrderPlaced".to_string()]);
    assert_eq!(
        *logger.inbound.lock().unwrap(),
        vec![("OrderPlaced".to_string(), 1)]
    );
}

#[tokio::test]
async fn test_runtime_from_settings() {
    let dir = TempDir::new().unwrap();
    let observations = Arc::new(Observations::default());

    let mut settings = QueueSettings::default();
    settings.file.path = Some(dir.path().join("from-settings"));
    settings.pump.max_simultaneous_messages = 2;
    settings.pump.poll_wait_seconds = 0;

    let runtime = settings
        .to_builder()
        .unwrap()
        .with_handlers(slow_handlers(&observations, Duration::ZERO))
        .build_startable()
        .unwrap();

    runtime.start_receiving().await.unwrap();
    let sender = runtime.create_send_queue().await.unwrap();
    sender.send(&OrderPlaced { order_id: 1 }).await.unwrap();
    sender.send(&OrderPlaced { order_id: 2 }).await.unwrap();

    wait_for("orders handled", || observations.handled() == vec![1, 2]).await;
    assert!(runtime.stop_receiving().await);
}
