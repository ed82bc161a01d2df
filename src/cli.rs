//! Command-Line Interface (CLI) argument parsing.
//!
//! This module defines the command-line arguments for the application using the
//! `clap` crate. These arguments are parsed at startup and then merged with
//! the configuration from the `alerts-worker.toml` file and environment variables.

use clap::Parser;
use figment::{
    value::{Dict, Map, Value},
    Error, Metadata, Profile, Provider,
};
use std::path::PathBuf;

/// Consumes price events from a queue and evaluates user alerts against them.
#[derive(Parser, Debug, Clone, Default)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Number of concurrent queue consumers.
    #[arg(short, long, value_name = "COUNT", allow_negative_numbers = true)]
    pub workers: Option<i64>,

    /// Name of the queue to consume from.
    #[arg(short, long, value_name = "NAME")]
    pub queue: Option<String>,

    /// Redis URL, e.g. redis://127.0.0.1:6379.
    #[arg(long, value_name = "URL")]
    pub redis_url: Option<String>,

    /// Log level used when RUST_LOG is not set.
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<String>,
}

impl Provider for Cli {
    fn metadata(&self) -> Metadata {
        Metadata::named("Command-Line Arguments")
    }

    fn data(&self) -> Result<Map<Profile, Dict>, Error> {
        let mut root = Dict::new();
        let mut queue = Dict::new();
        let mut worker = Dict::new();

        if let Some(count) = self.workers {
            worker.insert("count".into(), Value::from(count));
        }
        if let Some(name) = &self.queue {
            queue.insert("name".into(), Value::from(name.clone()));
        }
        if let Some(url) = &self.redis_url {
            queue.insert("redis_url".into(), Value::from(url.clone()));
        }
        if let Some(level) = &self.log_level {
            root.insert("log_level".into(), Value::from(level.clone()));
        }

        // Empty sections would still be merged as dictionaries; leave them out.
        if !queue.is_empty() {
            root.insert("queue".into(), Value::from(queue));
        }
        if !worker.is_empty() {
            root.insert("worker".into(), Value::from(worker));
        }

        let mut map = Map::new();
        map.insert(Profile::Default, root);
        Ok(map)
    }
}
