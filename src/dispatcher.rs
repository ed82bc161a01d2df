//! Retrying dispatcher around an [`EventHandler`].
//!
//! A dispatch attempts the handler once and, while the error is retryable
//! and retries remain, sleeps for the current backoff and tries again. The
//! backoff grows by `backoff_factor` after each sleep and is capped at
//! `max_backoff`. All retry state lives on the stack of a single `dispatch`
//! call; nothing carries over between events.

use crate::core::{Envelope, EventHandler, HandlerError};
use crate::internal_metrics::Metrics;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Retry and backoff settings for a dispatcher.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RetryConfig {
    /// Retries after the first attempt. Zero still makes one attempt.
    pub max_retries: u32,
    /// Backoff before the first retry, in milliseconds.
    pub initial_backoff_ms: u64,
    /// Upper bound for any single backoff, in milliseconds.
    pub max_backoff_ms: u64,
    /// Multiplier applied to the backoff after each retry.
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 10_000,
            backoff_factor: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    /// Backoff to use after `current`: `min(current * backoff_factor, max_backoff)`.
    pub fn next_backoff(&self, current: Duration) -> Duration {
        let max = self.max_backoff();
        let next = current.as_secs_f64() * self.backoff_factor;
        if !next.is_finite() || next >= max.as_secs_f64() {
            max
        } else {
            Duration::from_secs_f64(next.max(0.0))
        }
    }

    /// Backoff waited before the first retry, capped at `max_backoff`.
    pub fn first_backoff(&self) -> Duration {
        self.initial_backoff().min(self.max_backoff())
    }
}

#[derive(Error, Debug)]
pub enum DispatchError {
    /// Every attempt failed with a retryable error.
    #[error("failed after {retries} retries: {source}")]
    Exhausted {
        retries: u32,
        #[source]
        source: HandlerError,
    },

    /// The handler reported an error that retrying cannot fix.
    #[error("rejected without retry: {0}")]
    Rejected(#[source] HandlerError),

    /// Cancellation was observed before or between attempts.
    #[error("dispatch cancelled")]
    Cancelled,
}

impl DispatchError {
    /// The `error_type` label used when this error is counted.
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::Exhausted { .. } => "handler_error",
            DispatchError::Rejected(HandlerError::UnknownType(_)) => "unknown_type",
            DispatchError::Rejected(_) => "rejected",
            DispatchError::Cancelled => "cancelled",
        }
    }
}

/// Wraps a handler with exponential-backoff retries.
pub struct RetryingDispatcher {
    handler: Arc<dyn EventHandler>,
    config: RetryConfig,
    metrics: Metrics,
}

impl RetryingDispatcher {
    pub fn new(handler: Arc<dyn EventHandler>, config: RetryConfig, metrics: Metrics) -> Self {
        debug!(?config, "Initializing retrying dispatcher");
        Self {
            handler,
            config,
            metrics,
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Runs the handler for `envelope` until it succeeds, fails terminally,
    /// or `token` is cancelled.
    #[instrument(skip_all, fields(event_id = envelope.id(), event_type = envelope.event_type()))]
    pub async fn dispatch(&self, token: &CancellationToken, envelope: &Envelope) -> Result<(), DispatchError> {
        let mut backoff = self.config.first_backoff();
        let mut attempt: u32 = 0;

        loop {
            if token.is_cancelled() {
                return Err(DispatchError::Cancelled);
            }

            let err = match self.handler.handle(token, envelope).await {
                Ok(()) => {
                    if attempt > 0 {
                        debug!(attempt, "event handled after retry");
                    }
                    return Ok(());
                }
                Err(HandlerError::Cancelled) => return Err(DispatchError::Cancelled),
                Err(e) if !e.is_retryable() => {
                    warn!(error = %e, "handler rejected event, not retrying");
                    return Err(DispatchError::Rejected(e));
                }
                Err(e) => e,
            };

            if attempt >= self.config.max_retries {
                return Err(DispatchError::Exhausted {
                    retries: self.config.max_retries,
                    source: err,
                });
            }

            attempt += 1;
            debug!(
                attempt,
                backoff_ms = backoff.as_millis() as u64,
                error = %err,
                "preparing retry attempt"
            );

            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(DispatchError::Cancelled),
                _ = tokio::time::sleep(backoff) => {}
            }
            self.metrics.record_retry(envelope.event_type(), backoff);

            backoff = self.config.next_backoff(backoff);
        }
    }
}
