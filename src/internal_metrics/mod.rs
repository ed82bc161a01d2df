//! # Internal Metrics Module
//!
//! This module provides the infrastructure for collecting and exposing
//! worker metrics.
//!
//! ## Components:
//!
//! - **`MetricsBuilder`**: The entry point for initializing the metrics system.
//!   It sets up the Prometheus recorder, binds the metrics server, and
//!   constructs the `Metrics` handle.
//!
//! - **`Metrics`**: A cloneable collector that owns its recorder. It is
//!   constructed once and passed to the queue, the dispatcher and the worker
//!   pool, so no process-wide registry is involved and tests can plug in
//!   their own recorder.
//!
//! - **`WorkerMetrics`**: Handles pre-registered for one `(queue, worker_id)`
//!   pair, used inside a worker loop.
//!
//! - **`MetricsServer`**: (Defined in `server.rs`) An `axum`-based web server
//!   that exposes the `/metrics` endpoint for Prometheus to scrape.
//!
//! - **`SystemCollector`**: (Defined in `system.rs`) A background task that
//!   periodically reports process CPU and memory usage.

use crate::config::MetricsConfig;
use crate::internal_metrics::logging_recorder::LoggingRecorder;
use crate::internal_metrics::server::MetricsServer;
use crate::internal_metrics::system::SystemCollector;
use crate::task_manager::TaskManager;
use chrono::Utc;
use metrics::{Counter, Gauge, Histogram, Key, KeyName, Label, Level, Metadata, NoopRecorder, Recorder, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub mod logging_recorder;
pub mod server;
pub mod system;

pub const EVENT_PROCESSING_DURATION: &str = "worker_event_processing_duration_seconds";
pub const EVENTS_PROCESSED_TOTAL: &str = "worker_events_processed_total";
pub const PROCESSING_ERRORS_TOTAL: &str = "worker_processing_errors_total";
pub const QUEUE_SIZE: &str = "worker_queue_size";
pub const EVENT_AGE: &str = "worker_event_age_seconds";
pub const WORKER_STATUS: &str = "worker_status";
pub const WORKER_BUSY: &str = "worker_busy";
pub const WORKER_LAST_SUCCESS: &str = "worker_last_success_timestamp";
pub const WORKER_LAST_ERROR: &str = "worker_last_error_timestamp";
pub const DISPATCH_RETRIES_TOTAL: &str = "worker_dispatch_retries_total";
pub const DISPATCH_BACKOFF: &str = "worker_dispatch_backoff_seconds";
pub const EVENTS_PUBLISHED_TOTAL: &str = "queue_events_published_total";
pub const PROCESS_CPU_USAGE: &str = "process_cpu_usage_percent";
pub const PROCESS_MEMORY_USAGE: &str = "process_memory_usage_bytes";

const DURATION_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];
const AGE_BUCKETS: &[f64] = &[1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 600.0, 1800.0, 3600.0];
const BACKOFF_BUCKETS: &[f64] = &[0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 180.0];

fn metadata() -> Metadata<'static> {
    Metadata::new(module_path!(), Level::INFO, Some(module_path!()))
}

fn labels(pairs: &[(&'static str, &str)]) -> Vec<Label> {
    pairs
        .iter()
        .map(|(name, value)| Label::new(*name, value.to_string()))
        .collect()
}

/// The public API for the metrics system.
#[derive(Clone)]
pub struct Metrics {
    recorder: Arc<dyn Recorder + Send + Sync>,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

impl Metrics {
    /// Creates a new `Metrics` instance on top of `recorder` and registers
    /// descriptions for all supported metrics.
    pub fn new(recorder: Arc<dyn Recorder + Send + Sync>) -> Self {
        let metrics = Self { recorder };
        metrics.describe();
        metrics
    }

    /// Creates a `Metrics` instance that performs no operations.
    /// Used when metrics are disabled in the configuration.
    pub fn disabled() -> Self {
        Self {
            recorder: Arc::new(NoopRecorder),
        }
    }

    fn describe(&self) {
        let r = &self.recorder;
        r.describe_histogram(KeyName::from_const_str(EVENT_PROCESSING_DURATION), Some(Unit::Seconds), "Time taken to process each event.".into());
        r.describe_counter(KeyName::from_const_str(EVENTS_PROCESSED_TOTAL), Some(Unit::Count), "Total number of processed events, labeled by status.".into());
        r.describe_counter(KeyName::from_const_str(PROCESSING_ERRORS_TOTAL), Some(Unit::Count), "Total number of event processing errors, labeled by error type.".into());
        r.describe_gauge(KeyName::from_const_str(QUEUE_SIZE), Some(Unit::Count), "Current number of events in the queue.".into());
        r.describe_histogram(KeyName::from_const_str(EVENT_AGE), Some(Unit::Seconds), "Age of events when they are picked up for processing.".into());
        r.describe_gauge(KeyName::from_const_str(WORKER_STATUS), Some(Unit::Count), "Worker status (1=active, 0=inactive).".into());
        r.describe_gauge(KeyName::from_const_str(WORKER_BUSY), Some(Unit::Count), "Whether the worker is currently processing (1=busy, 0=idle).".into());
        r.describe_gauge(KeyName::from_const_str(WORKER_LAST_SUCCESS), Some(Unit::Seconds), "Unix timestamp of the last successfully processed event.".into());
        r.describe_gauge(KeyName::from_const_str(WORKER_LAST_ERROR), Some(Unit::Seconds), "Unix timestamp of the last processing error.".into());
        r.describe_counter(KeyName::from_const_str(DISPATCH_RETRIES_TOTAL), Some(Unit::Count), "Total number of handler retries performed by the dispatcher.".into());
        r.describe_histogram(KeyName::from_const_str(DISPATCH_BACKOFF), Some(Unit::Seconds), "Backoff waited before each handler retry.".into());
        r.describe_counter(KeyName::from_const_str(EVENTS_PUBLISHED_TOTAL), Some(Unit::Count), "Total number of events published to a queue.".into());
        r.describe_gauge(KeyName::from_const_str(PROCESS_CPU_USAGE), Some(Unit::Percent), "The percentage of CPU time the process is currently using.".into());
        r.describe_gauge(KeyName::from_const_str(PROCESS_MEMORY_USAGE), Some(Unit::Bytes), "Resident set size of the process, in bytes.".into());
    }

    fn counter(&self, name: &'static str, pairs: &[(&'static str, &str)]) -> Counter {
        self.recorder
            .register_counter(&Key::from_parts(name, labels(pairs)), &metadata())
    }

    fn gauge(&self, name: &'static str, pairs: &[(&'static str, &str)]) -> Gauge {
        self.recorder
            .register_gauge(&Key::from_parts(name, labels(pairs)), &metadata())
    }

    fn histogram(&self, name: &'static str, pairs: &[(&'static str, &str)]) -> Histogram {
        self.recorder
            .register_histogram(&Key::from_parts(name, labels(pairs)), &metadata())
    }

    /// Returns handles bound to a single worker of a queue.
    pub fn for_worker(&self, queue: &str, worker_id: usize) -> WorkerMetrics {
        let worker = worker_id.to_string();
        let pairs = [("queue", queue), ("worker_id", worker.as_str())];
        WorkerMetrics {
            status: self.gauge(WORKER_STATUS, &pairs),
            busy: self.gauge(WORKER_BUSY, &pairs),
            last_success: self.gauge(WORKER_LAST_SUCCESS, &pairs),
            last_error: self.gauge(WORKER_LAST_ERROR, &pairs),
            queue_size: self.gauge(QUEUE_SIZE, &[("queue", queue)]),
            metrics: self.clone(),
            queue: queue.to_string(),
            worker,
        }
    }

    /// Increments the counter of events published to `queue`.
    pub fn increment_published(&self, queue: &str, event_type: &str) {
        self.counter(EVENTS_PUBLISHED_TOTAL, &[("queue", queue), ("event_type", event_type)])
            .increment(1);
    }

    /// Records one dispatcher retry and the backoff waited before it.
    pub fn record_retry(&self, event_type: &str, backoff: Duration) {
        self.counter(DISPATCH_RETRIES_TOTAL, &[("event_type", event_type)])
            .increment(1);
        self.histogram(DISPATCH_BACKOFF, &[("event_type", event_type)])
            .record(backoff);
    }

    /// Sets the process resource gauges.
    pub fn set_process_usage(&self, cpu_percent: f64, memory_bytes: u64) {
        self.gauge(PROCESS_CPU_USAGE, &[]).set(cpu_percent);
        self.gauge(PROCESS_MEMORY_USAGE, &[]).set(memory_bytes as f64);
    }
}

/// Metric handles for one worker loop.
#[derive(Clone)]
pub struct WorkerMetrics {
    status: Gauge,
    busy: Gauge,
    last_success: Gauge,
    last_error: Gauge,
    queue_size: Gauge,
    metrics: Metrics,
    queue: String,
    worker: String,
}

impl WorkerMetrics {
    pub fn set_active(&self, active: bool) {
        self.status.set(if active { 1.0 } else { 0.0 });
    }

    pub fn set_busy(&self, busy: bool) {
        self.busy.set(if busy { 1.0 } else { 0.0 });
    }

    pub fn set_queue_size(&self, size: u64) {
        self.queue_size.set(size as f64);
    }

    pub fn record_event_age(&self, event_type: &str, age: Duration) {
        self.metrics
            .histogram(EVENT_AGE, &[("queue", self.queue.as_str()), ("event_type", event_type)])
            .record(age);
    }

    pub fn record_processing_duration(&self, event_type: &str, duration: Duration) {
        self.metrics
            .histogram(
                EVENT_PROCESSING_DURATION,
                &[("queue", self.queue.as_str()), ("worker_id", self.worker.as_str()), ("event_type", event_type)],
            )
            .record(duration);
    }

    /// Counts a processed event under `status` (`success`, `failure`, `cancelled`).
    pub fn increment_processed(&self, event_type: &str, status: &str) {
        self.metrics
            .counter(
                EVENTS_PROCESSED_TOTAL,
                &[
                    ("queue", self.queue.as_str()),
                    ("worker_id", self.worker.as_str()),
                    ("event_type", event_type),
                    ("status", status),
                ],
            )
            .increment(1);
    }

    /// Counts a processing error and stamps the last-error gauge.
    ///
    /// `event_type` is empty when the error happened before an envelope was decoded.
    pub fn record_error(&self, event_type: &str, error_type: &str) {
        self.metrics
            .counter(
                PROCESSING_ERRORS_TOTAL,
                &[
                    ("queue", self.queue.as_str()),
                    ("worker_id", self.worker.as_str()),
                    ("event_type", event_type),
                    ("error_type", error_type),
                ],
            )
            .increment(1);
        self.last_error.set(Utc::now().timestamp() as f64);
    }

    pub fn mark_success(&self) {
        self.last_success.set(Utc::now().timestamp() as f64);
    }
}

/// Builder for the metrics system.
///
/// This builder is responsible for initializing the recorder selected by the
/// configuration, binding the `MetricsServer`, and creating the `Metrics` handle.
pub struct MetricsBuilder {
    config: MetricsConfig,
}

impl MetricsBuilder {
    /// Creates a new `MetricsBuilder` with the given configuration.
    pub fn new(config: MetricsConfig) -> Self {
        Self { config }
    }

    /// Initializes the metrics system and returns a `Metrics` handle and an
    /// optional `MetricsServer` with its bound address.
    ///
    /// If metrics are disabled, or the listener cannot be bound, this returns
    /// a disabled `Metrics` instance and `None` for the server. Background
    /// collectors are spawned on `task_manager` and stop when `token` is cancelled.
    pub async fn build(
        self,
        task_manager: &TaskManager,
        token: CancellationToken,
    ) -> (Metrics, Option<(MetricsServer, SocketAddr)>) {
        if !self.config.enabled {
            return (Metrics::disabled(), None);
        }

        if self.config.log_metrics {
            info!(
                "Logging recorder enabled. Metrics will be logged every {} seconds.",
                self.config.log_aggregation_seconds
            );
            let recorder = LoggingRecorder::new(
                Duration::from_secs(self.config.log_aggregation_seconds),
                task_manager,
                token.clone(),
            );
            let metrics = Metrics::new(Arc::new(recorder));
            self.spawn_system_collector(&metrics, task_manager, token);
            return (metrics, None);
        }

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(Matcher::Suffix("duration_seconds".to_string()), DURATION_BUCKETS)
            .and_then(|b| b.set_buckets_for_metric(Matcher::Full(EVENT_AGE.to_string()), AGE_BUCKETS))
            .and_then(|b| b.set_buckets_for_metric(Matcher::Full(DISPATCH_BACKOFF.to_string()), BACKOFF_BUCKETS));
        let builder = match builder {
            Ok(builder) => builder,
            Err(e) => {
                error!("Failed to configure Prometheus buckets: {}", e);
                return (Metrics::disabled(), None);
            }
        };
        let recorder = builder.build_recorder();
        let handle = recorder.handle();

        let listener = match TcpListener::bind(self.config.listen_address).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(
                    "Failed to bind metrics server to {}: {}",
                    self.config.listen_address, e
                );
                return (Metrics::disabled(), None);
            }
        };

        let addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                error!("Failed to get local address for metrics server: {}", e);
                return (Metrics::disabled(), None);
            }
        };

        let metrics = Metrics::new(Arc::new(recorder));
        let server = MetricsServer::new(listener, handle, token.clone());
        self.spawn_system_collector(&metrics, task_manager, token);

        (metrics, Some((server, addr)))
    }

    fn spawn_system_collector(&self, metrics: &Metrics, task_manager: &TaskManager, token: CancellationToken) {
        if self.config.system_metrics_enabled {
            let collector = SystemCollector::new(metrics.clone());
            task_manager.spawn("SystemCollector", collector.run(token));
        }
    }
}
