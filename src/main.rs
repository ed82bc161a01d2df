//! Alerts Worker
//!
//! Consumes mark-price events from a queue with a pool of concurrent workers
//! and hands each one to the alert evaluation pipeline.

use alerts_worker::{
    app::App,
    cli::Cli,
    config::{Config, LogFormat},
};
use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration by layering sources: defaults, file, environment, and CLI args.
    let config = match Config::load(&cli) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Failed to load configuration: {:#}", err);
            std::process::exit(1);
        }
    };

    init_tracing(&config);

    info!("Alerts worker starting up...");
    info!("-------------------- Configuration --------------------");
    info!("Log Level: {}", config.log_level);
    info!("Queue: {}", config.queue.name);
    info!(
        "Queue Transport: {}",
        if config.queue.redis_url.is_some() { "Redis" } else { "In-Memory" }
    );
    info!("Workers: {}", config.worker_options().worker_count);
    info!("Processing Timeout: {}s", config.worker.processing_timeout_secs);
    info!(
        "Retry: max {} retries, backoff {}ms..{}ms x{}",
        config.retry.max_retries,
        config.retry.initial_backoff_ms,
        config.retry.max_backoff_ms,
        config.retry.backoff_factor
    );
    info!("Unknown Event Types: {:?}", config.routing.unknown_type_policy);
    info!(
        "Metrics: {}",
        if config.metrics.enabled {
            config.metrics.listen_address.to_string()
        } else {
            "Disabled".to_string()
        }
    );
    info!("Shutdown Grace: {}s", config.worker.shutdown_grace_secs);
    info!("-------------------------------------------------------");

    let token = CancellationToken::new();
    let app = App::builder(config).build(token.clone()).await?;

    let signal_token = token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!("Failed to listen for shutdown signals: {}", e);
        }
        info!("Shutdown signal received. Shutting down gracefully...");
        signal_token.cancel();
    });

    app.run().await?;
    info!("Shutdown complete.");
    Ok(())
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res,
        _ = sigterm.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
