#![allow(dead_code)]
//! A simple in-memory metrics recorder for testing.
//!
//! Every series is stored under its rendered key, `name{label="value",...}`
//! with labels sorted by name, so assertions can target one exact series.

use alerts_worker::internal_metrics::Metrics;
use metrics::{Counter, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Default)]
struct Series {
    counters: HashMap<String, u64>,
    gauges: HashMap<String, f64>,
    histograms: HashMap<String, Vec<f64>>,
}

#[derive(Debug, Clone, Default)]
pub struct TestMetrics {
    series: Arc<Mutex<Series>>,
}

fn render(name: &str, labels: &[(&str, &str)]) -> String {
    let mut labels: Vec<(&str, &str)> = labels.to_vec();
    labels.sort_unstable();
    let rendered: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, v))
        .collect();
    format!("{}{{{}}}", name, rendered.join(","))
}

fn render_key(key: &Key) -> String {
    let labels: Vec<(&str, &str)> = key.labels().map(|l| (l.key(), l.value())).collect();
    render(key.name(), &labels)
}

fn name_of(rendered: &str) -> &str {
    rendered.split('{').next().unwrap_or(rendered)
}

impl TestMetrics {
    pub fn new() -> Self {
        Default::default()
    }

    /// A `Metrics` handle that records into this instance.
    pub fn metrics(&self) -> Metrics {
        Metrics::new(Arc::new(self.clone()))
    }

    pub fn counter(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let series = self.series.lock().unwrap();
        series.counters.get(&render(name, labels)).copied().unwrap_or(0)
    }

    /// Sum of a counter across all of its label sets.
    pub fn counter_total(&self, name: &str) -> u64 {
        let series = self.series.lock().unwrap();
        series
            .counters
            .iter()
            .filter(|(key, _)| name_of(key) == name)
            .map(|(_, value)| *value)
            .sum()
    }

    pub fn gauge(&self, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        let series = self.series.lock().unwrap();
        series.gauges.get(&render(name, labels)).copied()
    }

    pub fn histogram(&self, name: &str, labels: &[(&str, &str)]) -> Vec<f64> {
        let series = self.series.lock().unwrap();
        series.histograms.get(&render(name, labels)).cloned().unwrap_or_default()
    }

    /// Samples of a histogram across all of its label sets.
    pub fn histogram_all(&self, name: &str) -> Vec<f64> {
        let series = self.series.lock().unwrap();
        series
            .histograms
            .iter()
            .filter(|(key, _)| name_of(key) == name)
            .flat_map(|(_, samples)| samples.iter().copied())
            .collect()
    }

    pub async fn wait_for_counter_total(&self, name: &str, value: u64, timeout: Duration) {
        let start = tokio::time::Instant::now();
        while start.elapsed() < timeout {
            if self.counter_total(name) >= value {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "Timeout waiting for counter '{}' to reach '{}' (at {})",
            name,
            value,
            self.counter_total(name)
        );
    }
}

impl Recorder for TestMetrics {
    fn describe_counter(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}
    fn describe_gauge(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}
    fn describe_histogram(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn register_counter(&self, key: &Key, _metadata: &Metadata<'_>) -> Counter {
        Counter::from_arc(Arc::new(Handle {
            key: render_key(key),
            series: self.series.clone(),
        }))
    }

    fn register_gauge(&self, key: &Key, _metadata: &Metadata<'_>) -> Gauge {
        Gauge::from_arc(Arc::new(Handle {
            key: render_key(key),
            series: self.series.clone(),
        }))
    }

    fn register_histogram(&self, key: &Key, _metadata: &Metadata<'_>) -> Histogram {
        Histogram::from_arc(Arc::new(Handle {
            key: render_key(key),
            series: self.series.clone(),
        }))
    }
}

#[derive(Debug)]
struct Handle {
    key: String,
    series: Arc<Mutex<Series>>,
}

impl metrics::CounterFn for Handle {
    fn increment(&self, value: u64) {
        let mut series = self.series.lock().unwrap();
        *series.counters.entry(self.key.clone()).or_insert(0) += value;
    }

    fn absolute(&self, value: u64) {
        let mut series = self.series.lock().unwrap();
        series.counters.insert(self.key.clone(), value);
    }
}

impl metrics::GaugeFn for Handle {
    fn increment(&self, value: f64) {
        let mut series = self.series.lock().unwrap();
        *series.gauges.entry(self.key.clone()).or_insert(0.0) += value;
    }

    fn decrement(&self, value: f64) {
        let mut series = self.series.lock().unwrap();
        *series.gauges.entry(self.key.clone()).or_insert(0.0) -= value;
    }

    fn set(&self, value: f64) {
        let mut series = self.series.lock().unwrap();
        series.gauges.insert(self.key.clone(), value);
    }
}

impl metrics::HistogramFn for Handle {
    fn record(&self, value: f64) {
        let mut series = self.series.lock().unwrap();
        series.histograms.entry(self.key.clone()).or_default().push(value);
    }
}
