//! Configuration management for the alerts worker
//!
//! This module defines the main `Config` struct and its sub-structs,
//! responsible for holding all application settings. It uses the `figment`
//! crate to layer built-in defaults, an `alerts-worker.toml` file,
//! `ALERTS_WORKER_*` environment variables and command-line flags.

use crate::cli::Cli;
use crate::dispatcher::RetryConfig;
use crate::routing::UnknownTypePolicy;
use crate::worker::WorkerOptions;
use anyhow::{bail, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// File read when `--config` is not given. Missing is not an error.
pub const DEFAULT_CONFIG_FILE: &str = "alerts-worker.toml";

/// Prefix of environment variables; nested keys are separated by `__`,
/// e.g. `ALERTS_WORKER_WORKER__COUNT=8`.
pub const ENV_PREFIX: &str = "ALERTS_WORKER_";

/// Queue the worker consumes from unless configured otherwise.
pub const DEFAULT_QUEUE_NAME: &str = "binance_mark_price_alerts";

/// The main configuration struct for the application.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Config {
    /// The logging level, used when `RUST_LOG` is not set.
    pub log_level: String,
    pub log_format: LogFormat,
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
    pub retry: RetryConfig,
    pub routing: RoutingConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct QueueConfig {
    pub name: String,
    /// Redis connection URL. Without one the worker runs on an in-process queue.
    pub redis_url: Option<String>,
    /// How long one blocking pop waits before giving up.
    pub pop_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct WorkerConfig {
    /// Number of concurrent consumers. Values below one run a single worker.
    pub count: i64,
    pub processing_timeout_secs: u64,
    pub transport_error_backoff_ms: u64,
    pub shutdown_grace_secs: u64,
    pub report_queue_depth: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Default)]
pub struct RoutingConfig {
    pub unknown_type_policy: UnknownTypePolicy,
}

/// Configuration for the metrics system.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct MetricsConfig {
    pub enabled: bool,
    /// Address of the Prometheus `/metrics` endpoint.
    pub listen_address: SocketAddr,
    /// Report process CPU and memory usage.
    pub system_metrics_enabled: bool,
    /// Log metrics periodically instead of serving them.
    pub log_metrics: bool,
    /// The interval in seconds for logging metrics.
    pub log_aggregation_seconds: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            queue: QueueConfig::default(),
            worker: WorkerConfig::default(),
            retry: RetryConfig::default(),
            routing: RoutingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_QUEUE_NAME.to_string(),
            redis_url: None,
            pop_timeout_secs: 5,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: num_cpus::get() as i64,
            processing_timeout_secs: 30,
            transport_error_backoff_ms: 1000,
            shutdown_grace_secs: 10,
            report_queue_depth: true,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_address: SocketAddr::from(([0, 0, 0, 0], 2113)),
            system_metrics_enabled: true,
            log_metrics: false,
            log_aggregation_seconds: 60,
        }
    }
}

impl Config {
    /// Loads the configuration by layering defaults, the TOML file, the
    /// environment and the command-line arguments, then validates it.
    pub fn load(cli: &Cli) -> Result<Self> {
        Self::load_with_env_prefix(cli, ENV_PREFIX)
    }

    /// Same as [`Config::load`], reading environment variables under `prefix`.
    pub fn load_with_env_prefix(cli: &Cli, prefix: &str) -> Result<Self> {
        let path = match &cli.config {
            Some(path) => {
                if !path.exists() {
                    bail!("configuration file {} does not exist", path.display());
                }
                path.clone()
            }
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(prefix).split("__"))
            .merge(cli.clone())
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the worker cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.queue.name.trim().is_empty() {
            bail!("queue.name must not be empty");
        }
        if self.queue.pop_timeout_secs == 0 {
            bail!("queue.pop_timeout_secs must be greater than zero");
        }
        if self.worker.processing_timeout_secs == 0 {
            bail!("worker.processing_timeout_secs must be greater than zero");
        }
        if !self.retry.backoff_factor.is_finite() || self.retry.backoff_factor < 1.0 {
            bail!(
                "retry.backoff_factor must be a finite number >= 1.0, got {}",
                self.retry.backoff_factor
            );
        }
        if self.retry.max_backoff_ms < self.retry.initial_backoff_ms {
            bail!(
                "retry.max_backoff_ms ({}) must not be smaller than retry.initial_backoff_ms ({})",
                self.retry.max_backoff_ms,
                self.retry.initial_backoff_ms
            );
        }
        Ok(())
    }

    /// The worker pool options described by this configuration.
    pub fn worker_options(&self) -> WorkerOptions {
        WorkerOptions {
            pop_timeout: Duration::from_secs(self.queue.pop_timeout_secs),
            processing_timeout: Duration::from_secs(self.worker.processing_timeout_secs),
            transport_error_backoff: Duration::from_millis(self.worker.transport_error_backoff_ms),
            report_queue_depth: self.worker.report_queue_depth,
            ..WorkerOptions::default()
        }
        .with_worker_count(self.worker.count)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.worker.shutdown_grace_secs)
    }
}
