//! A fixed-size pool of queue consumers.
//!
//! Every worker runs the same loop against one shared [`Queue`]: pop with a
//! bounded wait, decode, dispatch under a per-event deadline, report, repeat.
//! Workers do not coordinate with each other; the transport hands each item
//! to exactly one of them.
//!
//! The pool moves through `Created → Running → Stopping → Stopped`.
//! Shutdown is cooperative: `stop` cancels the shared token and waits up to a
//! grace period for the workers to return, but never aborts them.

use crate::core::Envelope;
use crate::dispatcher::{DispatchError, RetryingDispatcher};
use crate::internal_metrics::{Metrics, WorkerMetrics};
use crate::queue::{Queue, QueueError};
use crate::task_manager::TaskManager;
use chrono::Utc;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

/// Tunables for a [`WorkerPool`].
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerOptions {
    pub worker_count: usize,
    /// Bounded wait of a single pop before looping back to check for shutdown.
    pub pop_timeout: Duration,
    /// Deadline for dispatching one event, retries included.
    pub processing_timeout: Duration,
    /// Pause after a transport failure before popping again.
    pub transport_error_backoff: Duration,
    /// Sample the queue depth gauge at the top of every loop.
    pub report_queue_depth: bool,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            worker_count: num_cpus::get().max(1),
            pop_timeout: Duration::from_secs(5),
            processing_timeout: Duration::from_secs(30),
            transport_error_backoff: Duration::from_secs(1),
            report_queue_depth: true,
        }
    }
}

impl WorkerOptions {
    /// Sets the worker count. Values below one are raised to one.
    pub fn with_worker_count(mut self, count: i64) -> Self {
        self.worker_count = usize::try_from(count).unwrap_or(0).max(1);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PoolState {
    Created = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl PoolState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => PoolState::Created,
            1 => PoolState::Running,
            2 => PoolState::Stopping,
            _ => PoolState::Stopped,
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PoolError {
    #[error("worker pool is already running")]
    AlreadyRunning,

    #[error("worker pool has been stopped and cannot be restarted")]
    Stopped,
}

/// How a call to [`WorkerPool::stop`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Every worker returned within the grace period.
    Graceful,
    /// The grace period elapsed first; remaining workers were left to finish
    /// on their own.
    TimedOut,
}

pub struct WorkerPool {
    queue: Queue,
    dispatcher: Arc<RetryingDispatcher>,
    metrics: Metrics,
    options: WorkerOptions,
    state: AtomicU8,
    shutdown: CancellationToken,
    tasks: TaskManager,
}

impl WorkerPool {
    pub fn new(queue: Queue, dispatcher: Arc<RetryingDispatcher>, metrics: Metrics, options: WorkerOptions) -> Self {
        let options = WorkerOptions {
            worker_count: options.worker_count.max(1),
            ..options
        };
        Self {
            queue,
            dispatcher,
            metrics,
            options,
            state: AtomicU8::new(PoolState::Created as u8),
            shutdown: CancellationToken::new(),
            tasks: TaskManager::new(),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.options.worker_count
    }

    pub fn options(&self) -> &WorkerOptions {
        &self.options
    }

    /// The current lifecycle state. A running pool whose parent token has
    /// been cancelled reports `Stopping` until `stop` completes.
    pub fn state(&self) -> PoolState {
        match PoolState::from_u8(self.state.load(Ordering::Acquire)) {
            PoolState::Running if self.shutdown.is_cancelled() => PoolState::Stopping,
            state => state,
        }
    }

    /// Spawns the workers. They run until `parent` is cancelled or
    /// [`stop`](Self::stop) is called.
    pub fn start(&self, parent: &CancellationToken) -> Result<(), PoolError> {
        if let Err(current) = self.state.compare_exchange(
            PoolState::Created as u8,
            PoolState::Running as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            return Err(match PoolState::from_u8(current) {
                PoolState::Running => PoolError::AlreadyRunning,
                _ => PoolError::Stopped,
            });
        }

        info!(
            queue = self.queue.name(),
            workers = self.options.worker_count,
            "Starting worker pool"
        );

        let parent = parent.clone();
        let shutdown = self.shutdown.clone();
        self.tasks.spawn("ShutdownRelay", async move {
            tokio::select! {
                _ = parent.cancelled() => {
                    debug!("Parent token cancelled, stopping workers.");
                    shutdown.cancel();
                }
                _ = shutdown.cancelled() => {}
            }
        });

        for id in 0..self.options.worker_count {
            let worker = Worker {
                id,
                queue: self.queue.clone(),
                dispatcher: self.dispatcher.clone(),
                metrics: self.metrics.for_worker(self.queue.name(), id),
                options: self.options.clone(),
                shutdown: self.shutdown.clone(),
            };
            let span = info_span!("worker", worker_id = id, queue = self.queue.name());
            self.tasks
                .spawn(format!("Worker-{}", id), worker.run().instrument(span));
        }

        Ok(())
    }

    /// Signals every worker to stop and waits for them for up to `grace`.
    ///
    /// Calling `stop` on a pool that was never started moves it straight to
    /// `Stopped`. Calling it again, or while another `stop` is in progress,
    /// returns immediately.
    pub async fn stop(&self, grace: Duration) -> StopOutcome {
        if let Err(current) = self.state.compare_exchange(
            PoolState::Running as u8,
            PoolState::Stopping as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            if PoolState::from_u8(current) == PoolState::Created {
                self.state.store(PoolState::Stopped as u8, Ordering::Release);
            }
            return StopOutcome::Graceful;
        }

        info!(queue = self.queue.name(), ?grace, "Stopping worker pool");
        self.shutdown.cancel();

        let outcome = if self.tasks.shutdown(grace).await {
            info!(queue = self.queue.name(), "All workers stopped");
            StopOutcome::Graceful
        } else {
            warn!(
                queue = self.queue.name(),
                ?grace,
                "Workers did not stop within the grace period; continuing shutdown"
            );
            StopOutcome::TimedOut
        };

        self.state.store(PoolState::Stopped as u8, Ordering::Release);
        outcome
    }
}

/// State owned by a single worker loop.
struct Worker {
    id: usize,
    queue: Queue,
    dispatcher: Arc<RetryingDispatcher>,
    metrics: WorkerMetrics,
    options: WorkerOptions,
    shutdown: CancellationToken,
}

impl Worker {
    async fn run(self) {
        info!("Worker started");
        let _status = StatusGuard::activate(&self.metrics);

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            if self.options.report_queue_depth {
                self.report_depth().await;
            }

            let envelope = match self.queue.pop(&self.shutdown, self.options.pop_timeout).await {
                Ok(envelope) => envelope,
                Err(QueueError::Empty) => continue,
                Err(QueueError::Cancelled) => break,
                Err(e @ QueueError::Transport(_)) => {
                    error!(error = %e, "Failed to pop from queue");
                    self.metrics.record_error("", e.kind());
                    tokio::select! {
                        biased;
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.options.transport_error_backoff) => {}
                    }
                    continue;
                }
                Err(e @ QueueError::Serialization { .. }) => {
                    error!(error = %e, "Dropping undecodable queue item");
                    self.metrics.record_error("", e.kind());
                    continue;
                }
            };

            self.process(envelope).await;
        }

        info!(worker_id = self.id, "Worker stopped");
    }

    async fn report_depth(&self) {
        let depth = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return,
            res = self.queue.depth() => res,
        };
        match depth {
            Ok(depth) => self.metrics.set_queue_size(depth),
            Err(e) => debug!(error = %e, "Failed to read queue depth"),
        }
    }

    async fn process(&self, envelope: Envelope) {
        let event_type = envelope.event_type();
        self.metrics.set_busy(true);
        self.metrics
            .record_event_age(event_type, envelope.age_at(Utc::now()));
        trace!(event_id = envelope.id(), event_type, "Processing event");

        let deadline = self.shutdown.child_token();
        let start = Instant::now();
        let dispatch = AssertUnwindSafe(self.dispatcher.dispatch(&deadline, &envelope)).catch_unwind();
        let result = tokio::time::timeout(self.options.processing_timeout, dispatch).await;
        deadline.cancel();
        self.metrics
            .record_processing_duration(event_type, start.elapsed());

        match result {
            Ok(Ok(Ok(()))) => {
                self.metrics.increment_processed(event_type, "success");
                self.metrics.mark_success();
                debug!(event_id = envelope.id(), event_type, "Event processed");
            }
            Ok(Ok(Err(DispatchError::Cancelled))) => {
                self.metrics.increment_processed(event_type, "cancelled");
                info!(event_id = envelope.id(), event_type, "Event processing cancelled by shutdown");
            }
            Ok(Ok(Err(e))) => {
                error!(event_id = envelope.id(), event_type, error = %e, "Failed to process event");
                self.metrics.increment_processed(event_type, "failure");
                self.metrics.record_error(event_type, e.kind());
            }
            Ok(Err(panic)) => {
                error!(
                    event_id = envelope.id(),
                    event_type,
                    panic = panic_message(panic.as_ref()),
                    "Handler panicked while processing event"
                );
                self.metrics.increment_processed(event_type, "failure");
                self.metrics.record_error(event_type, "panic");
            }
            Err(_) => {
                error!(
                    event_id = envelope.id(),
                    event_type,
                    timeout = ?self.options.processing_timeout,
                    "Event processing timed out"
                );
                self.metrics.increment_processed(event_type, "failure");
                self.metrics.record_error(event_type, "timeout");
            }
        }

        self.metrics.set_busy(false);
    }
}

/// Marks a worker active for as long as it lives and idle + inactive once
/// dropped, whether the loop returned or unwound.
struct StatusGuard<'a> {
    metrics: &'a WorkerMetrics,
}

impl<'a> StatusGuard<'a> {
    fn activate(metrics: &'a WorkerMetrics) -> Self {
        metrics.set_active(true);
        metrics.set_busy(false);
        Self { metrics }
    }
}

impl Drop for StatusGuard<'_> {
    fn drop(&mut self) {
        self.metrics.set_busy(false);
        self.metrics.set_active(false);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}
