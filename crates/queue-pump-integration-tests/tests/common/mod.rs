//! Common test utilities for queue-pump integration tests
//!
//! This module provides:
//! - Test message types
//! - Recording handlers that count what they see
//! - Polling helpers for asynchronous assertions

#![allow(dead_code)]

use async_trait::async_trait;
use queue_pump::backoff::BackoffPolicy;
use queue_pump::{
    FaultHandler, HandlerError, MessageHandler, MessageStatistics, ProcessingError, QueueMessage,
    StatisticsHandler, TransportMessage,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderPlaced {
    pub order_id: u64,
}

impl QueueMessage for OrderPlaced {
    const MESSAGE_TYPE: &'static str = "OrderPlaced";
}

// ============================================================================
// Recording Handlers
// ============================================================================

/// Everything observed by the recording handlers of one test.
#[derive(Default)]
pub struct Observations {
    pub handled: Mutex<Vec<u64>>,
    pub faulted: Mutex<Vec<u64>>,
    pub generic_faults: Mutex<Vec<(String, Option<String>)>>,
    pub statistics: Mutex<Vec<MessageStatistics>>,
    pub running: AtomicUsize,
    pub peak_running: AtomicUsize,
}

impl Observations {
    pub fn handled(&self) -> Vec<u64> {
        let mut handled = self.handled.lock().unwrap().clone();
        handled.sort_unstable();
        handled
    }
}

/// Succeeds after holding the message for `delay`, tracking peak concurrency.
pub struct SlowHandler {
    pub observations: Arc<Observations>,
    pub delay: Duration,
}

#[async_trait]
impl MessageHandler<OrderPlaced> for SlowHandler {
    async fn handle(&self, message: &OrderPlaced) -> Result<(), HandlerError> {
        let running = self.observations.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.observations
            .peak_running
            .fetch_max(running, Ordering::SeqCst);

        tokio::time::sleep(self.delay).await;

        self.observations.running.fetch_sub(1, Ordering::SeqCst);
        self.observations
            .handled
            .lock()
            .unwrap()
            .push(message.order_id);
        Ok(())
    }
}

pub struct FailingHandler;

#[async_trait]
impl MessageHandler<OrderPlaced> for FailingHandler {
    async fn handle(&self, message: &OrderPlaced) -> Result<(), HandlerError> {
        Err(format!("order {} cannot be processed", message.order_id).into())
    }
}

pub struct OrderFaultRecorder(pub Arc<Observations>);

#[async_trait]
impl FaultHandler<OrderPlaced> for OrderFaultRecorder {
    async fn handle_fault(
        &self,
        message: &OrderPlaced,
        _error: Option<&ProcessingError>,
    ) -> Result<(), HandlerError> {
        self.0.faulted.lock().unwrap().push(message.order_id);
        Ok(())
    }
}

pub struct GenericFaultRecorder(pub Arc<Observations>);

#[async_trait]
impl FaultHandler<TransportMessage> for GenericFaultRecorder {
    async fn handle_fault(
        &self,
        message: &TransportMessage,
        error: Option<&ProcessingError>,
    ) -> Result<(), HandlerError> {
        self.0
            .generic_faults
            .lock()
            .unwrap()
            .push((message.body().to_string(), error.map(ToString::to_string)));
        Ok(())
    }
}

pub struct StatisticsRecorder(pub Arc<Observations>);

#[async_trait]
impl StatisticsHandler for StatisticsRecorder {
    async fn handle(&self, statistics: &MessageStatistics) -> Result<(), HandlerError> {
        self.0.statistics.lock().unwrap().push(statistics.clone());
        Ok(())
    }
}

// ============================================================================
// Helpers
// ============================================================================

pub fn fast_backoff() -> BackoffPolicy {
    BackoffPolicy::new(Duration::from_millis(5), Duration::from_millis(25), 2.0).without_jitter()
}

/// Poll `condition` every 10ms, failing the test after 10 seconds
pub async fn wait_until<F, Fut>(description: &str, condition: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !condition().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for: {description}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Synchronous form of [`wait_until`]
pub async fn wait_for<F>(description: &str, condition: F)
where
    F: Fn() -> bool,
{
    wait_until(description, || std::future::ready(condition())).await
}
