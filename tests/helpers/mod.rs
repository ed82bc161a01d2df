#![allow(dead_code)]
pub mod flaky_transport;
pub mod mock_handler;
pub mod test_metrics;

use alerts_worker::core::{EventHandler, QueueTransport};
use alerts_worker::dispatcher::{RetryConfig, RetryingDispatcher};
use alerts_worker::queue::{InMemoryTransport, Queue};
use alerts_worker::worker::{WorkerOptions, WorkerPool};
use std::sync::Arc;
use std::time::Duration;
use test_metrics::TestMetrics;

pub const TEST_QUEUE: &str = "test_alerts";

/// Retry settings small enough for tests: 2 retries, 100ms doubling to 1s.
pub fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_retries: 2,
        initial_backoff_ms: 100,
        max_backoff_ms: 1_000,
        backoff_factor: 2.0,
    }
}

/// Worker options with short waits so idle loops turn over quickly.
pub fn fast_options(workers: i64) -> WorkerOptions {
    WorkerOptions {
        pop_timeout: Duration::from_millis(50),
        processing_timeout: Duration::from_secs(5),
        transport_error_backoff: Duration::from_millis(10),
        report_queue_depth: true,
        ..WorkerOptions::default()
    }
    .with_worker_count(workers)
}

/// A worker pool wired to a test recorder.
pub struct TestPool {
    pub pool: WorkerPool,
    pub queue: Queue,
    pub metrics: TestMetrics,
}

pub fn build_pool(
    transport: Arc<dyn QueueTransport>,
    handler: Arc<dyn EventHandler>,
    retry: RetryConfig,
    options: WorkerOptions,
) -> TestPool {
    let metrics = TestMetrics::new();
    let queue = Queue::new(transport, TEST_QUEUE, metrics.metrics());
    let dispatcher = Arc::new(RetryingDispatcher::new(handler, retry, metrics.metrics()));
    let pool = WorkerPool::new(queue.clone(), dispatcher, metrics.metrics(), options);
    TestPool { pool, queue, metrics }
}

pub fn memory_pool(handler: Arc<dyn EventHandler>, retry: RetryConfig, options: WorkerOptions) -> TestPool {
    build_pool(Arc::new(InMemoryTransport::new()), handler, retry, options)
}

/// Polls `condition` until it holds or `timeout` elapses.
pub async fn eventually<F>(timeout: Duration, mut condition: F)
where
    F: FnMut() -> bool,
{
    let start = tokio::time::Instant::now();
    while !condition() {
        if start.elapsed() >= timeout {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
