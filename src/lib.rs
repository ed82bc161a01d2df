//! Alerts Worker - concurrent queue consumer for the alerting platform
//!
//! This library provides the blocking-queue worker pool and the retrying
//! event dispatcher that sit between price-event producers and the alert
//! evaluation logic.

pub mod app;
pub mod cli;
pub mod config;
pub mod core;
pub mod dispatcher;
pub mod events;
pub mod handlers;
pub mod internal_metrics;
pub mod queue;
pub mod routing;
pub mod task_manager;
pub mod worker;

// Re-export core types for convenience
pub use core::*;
