//! A metrics recorder that periodically logs all captured metrics.

use crate::task_manager::TaskManager;
use metrics::{Counter, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit};
use metrics_util::registry::{AtomicStorage, Registry};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A metrics recorder that periodically logs counters and gauges through `tracing`.
///
/// Used instead of the Prometheus exporter when no scraper is available.
pub struct LoggingRecorder {
    registry: Arc<Registry<Key, AtomicStorage>>,
}

impl LoggingRecorder {
    /// Creates a new `LoggingRecorder` and spawns a task that logs a snapshot
    /// every `interval` until `token` is cancelled.
    pub fn new(interval: Duration, task_manager: &TaskManager, token: CancellationToken) -> Self {
        let registry = Arc::new(Registry::new(AtomicStorage));
        let recorder = Self {
            registry: registry.clone(),
        };

        task_manager.spawn("LoggingRecorder", async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately; skip the empty snapshot.
            ticker.tick().await;
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        tracing::debug!("Metrics logging task received shutdown signal.");
                        break;
                    }
                    _ = ticker.tick() => log_snapshot(&registry),
                }
            }
        });

        recorder
    }
}

fn log_snapshot(registry: &Registry<Key, AtomicStorage>) {
    tracing::debug!("--- Metrics Snapshot ---");

    for (key, counter) in registry.get_counter_handles() {
        let value = counter.load(Ordering::Relaxed);
        if value > 0 {
            tracing::info!("[Counter] {}: {}", render_key(&key), value);
        }
    }

    for (key, gauge) in registry.get_gauge_handles() {
        let value = f64::from_bits(gauge.load(Ordering::Relaxed));
        tracing::info!("[Gauge] {}: {}", render_key(&key), value);
    }
    // Histograms are not logged.
}

fn render_key(key: &Key) -> String {
    let labels: Vec<String> = key
        .labels()
        .map(|label| format!("{}={}", label.key(), label.value()))
        .collect();
    if labels.is_empty() {
        key.name().to_string()
    } else {
        format!("{}{{{}}}", key.name(), labels.join(","))
    }
}

impl Recorder for LoggingRecorder {
    fn describe_counter(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn describe_gauge(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn describe_histogram(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn register_counter(&self, key: &Key, _metadata: &Metadata<'_>) -> Counter {
        self.registry.get_or_create_counter(key, |c| c.clone()).into()
    }

    fn register_gauge(&self, key: &Key, _metadata: &Metadata<'_>) -> Gauge {
        self.registry.get_or_create_gauge(key, |g| g.clone()).into()
    }

    fn register_histogram(&self, key: &Key, _metadata: &Metadata<'_>) -> Histogram {
        self.registry.get_or_create_histogram(key, |h| h.clone()).into()
    }
}
