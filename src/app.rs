//! The main application logic, decoupled from the entry point.

use crate::{
    config::Config,
    core::{EventHandler, QueueTransport},
    dispatcher::RetryingDispatcher,
    events::EVENT_TYPE_MARK_PRICE,
    handlers::{AlertEvaluator, MarkPriceHandler, TracingAlertEvaluator},
    internal_metrics::{Metrics, MetricsBuilder},
    queue::{InMemoryTransport, Queue, RedisTransport},
    routing::HandlerRegistry,
    task_manager::TaskManager,
    worker::{PoolState, StopOutcome, WorkerPool},
};
use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// A handle to the running application.
pub struct App {
    task_manager: TaskManager,
    pool: WorkerPool,
    queue: Queue,
    metrics_addr: Option<SocketAddr>,
    shutdown_grace: Duration,
    token: CancellationToken,
}

impl App {
    /// Creates a new `AppBuilder` to construct an `App`.
    pub fn builder(config: Config) -> AppBuilder {
        AppBuilder::new(config)
    }

    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.metrics_addr
    }

    /// The queue the workers consume from. Producers in the same process
    /// publish through it.
    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    pub fn pool_state(&self) -> PoolState {
        self.pool.state()
    }

    /// Waits for the shutdown signal, then stops the pool, the queue and the
    /// background tasks. The whole sequence shares one grace period.
    pub async fn run(self) -> Result<StopOutcome> {
        self.token.cancelled().await;
        info!("Shutdown signal received. Stopping workers...");
        let deadline = Instant::now() + self.shutdown_grace;

        let outcome = self.pool.stop(self.shutdown_grace).await;
        self.queue.close().await;
        self.task_manager
            .shutdown(deadline.saturating_duration_since(Instant::now()))
            .await;

        info!(?outcome, "Alerts worker shut down.");
        Ok(outcome)
    }
}

/// Builder for the main application.
///
/// This pattern allows for a clean separation of concerns between constructing
/// the application's components and running the application. It also provides
/// a convenient way to override components for testing purposes.
pub struct AppBuilder {
    config: Config,
    transport_override: Option<Arc<dyn QueueTransport>>,
    handler_override: Option<Arc<dyn EventHandler>>,
    evaluator_override: Option<Arc<dyn AlertEvaluator>>,
    metrics_override: Option<Metrics>,
}

impl AppBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            transport_override: None,
            handler_override: None,
            evaluator_override: None,
            metrics_override: None,
        }
    }

    /// Overrides the queue transport selected by `queue.redis_url`.
    pub fn transport_override(mut self, transport: Arc<dyn QueueTransport>) -> Self {
        self.transport_override = Some(transport);
        self
    }

    /// Replaces the whole routing table with a single handler.
    pub fn handler_override(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handler_override = Some(handler);
        self
    }

    /// Overrides the evaluator behind the mark-price handler.
    pub fn evaluator_override(mut self, evaluator: Arc<dyn AlertEvaluator>) -> Self {
        self.evaluator_override = Some(evaluator);
        self
    }

    /// Overrides the metrics system for testing.
    pub fn metrics_override(mut self, metrics: Metrics) -> Self {
        self.metrics_override = Some(metrics);
        self
    }

    /// Builds every component and starts the worker pool.
    ///
    /// The pool, the metrics server and the background collectors all stop
    /// when `token` is cancelled.
    #[instrument(skip_all)]
    pub async fn build(self, token: CancellationToken) -> Result<App> {
        let config = self.config;
        config.validate()?;
        let task_manager = TaskManager::new();

        // =========================================================================
        // 1. Initialize Metrics
        // =========================================================================
        let (metrics, metrics_server_info) = match self.metrics_override {
            Some(m) => (m, None),
            None => {
                MetricsBuilder::new(config.metrics.clone())
                    .build(&task_manager, token.clone())
                    .await
            }
        };

        let metrics_addr = if let Some((server, addr)) = metrics_server_info {
            info!("Metrics server listening on http://{}/metrics", addr);
            task_manager.spawn("MetricsServer", server.run());
            Some(addr)
        } else {
            None
        };

        // =========================================================================
        // 2. Queue
        // =========================================================================
        let transport: Arc<dyn QueueTransport> = match self.transport_override {
            Some(transport) => transport,
            None => match &config.queue.redis_url {
                Some(url) => Arc::new(RedisTransport::connect(url).await?),
                None => {
                    warn!("No queue.redis_url configured; using an in-process queue.");
                    Arc::new(InMemoryTransport::new())
                }
            },
        };
        let queue = Queue::new(transport, config.queue.name.clone(), metrics.clone());

        // =========================================================================
        // 3. Handlers & Dispatcher
        // =========================================================================
        let handler: Arc<dyn EventHandler> = match self.handler_override {
            Some(handler) => handler,
            None => {
                let evaluator = self
                    .evaluator_override
                    .unwrap_or_else(|| Arc::new(TracingAlertEvaluator));
                let registry = HandlerRegistry::new(config.routing.unknown_type_policy)
                    .register(EVENT_TYPE_MARK_PRICE, Arc::new(MarkPriceHandler::new(evaluator)));
                debug!(?registry, "Initialized handler registry");
                Arc::new(registry)
            }
        };
        let dispatcher = Arc::new(RetryingDispatcher::new(
            handler,
            config.retry.clone(),
            metrics.clone(),
        ));

        // =========================================================================
        // 4. Worker Pool
        // =========================================================================
        let pool = WorkerPool::new(
            queue.clone(),
            dispatcher,
            metrics,
            config.worker_options(),
        );
        pool.start(&token)?;

        info!(
            queue = %config.queue.name,
            workers = pool.worker_count(),
            "Alerts worker initialized successfully. Waiting for events..."
        );

        Ok(App {
            task_manager,
            pool,
            queue,
            metrics_addr,
            shutdown_grace: config.shutdown_grace(),
            token,
        })
    }
}
