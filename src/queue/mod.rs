//! A named FIFO queue of serialized [`Envelope`]s.
//!
//! Producers `publish` at the head of the list and consumers `pop` from the
//! tail, so events leave the queue in arrival order. Each item is handed to
//! exactly one popper; the transport is responsible for that guarantee.

pub mod memory;
pub mod redis;

use crate::core::{Envelope, QueueTransport};
use crate::internal_metrics::Metrics;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub use self::memory::InMemoryTransport;
pub use self::redis::RedisTransport;

#[derive(Error, Debug)]
pub enum QueueError {
    /// The wait elapsed with nothing to pop. This is the idle path, not a failure.
    #[error("queue is empty")]
    Empty,

    #[error("queue transport error: {0}")]
    Transport(#[source] anyhow::Error),

    /// The item could not be encoded, or a popped item could not be decoded.
    /// A popped item that fails here has already been removed from the queue.
    #[error("serialization error: {message}")]
    Serialization { message: String, payload_size: usize },

    #[error("queue operation cancelled")]
    Cancelled,
}

impl QueueError {
    /// The `error_type` label used when this error is counted.
    pub fn kind(&self) -> &'static str {
        match self {
            QueueError::Empty => "empty",
            QueueError::Transport(_) => "transport_error",
            QueueError::Serialization { .. } => "unmarshal_error",
            QueueError::Cancelled => "cancelled",
        }
    }
}

/// Handle to one named queue over a shared transport.
#[derive(Clone)]
pub struct Queue {
    transport: Arc<dyn QueueTransport>,
    name: String,
    metrics: Metrics,
}

impl Queue {
    pub fn new(transport: Arc<dyn QueueTransport>, name: impl Into<String>, metrics: Metrics) -> Self {
        Self {
            transport,
            name: name.into(),
            metrics,
        }
    }

    /// The queue name, used both as the storage key and as a metrics label.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Serializes `envelope` and appends it to the queue.
    pub async fn publish(&self, envelope: &Envelope) -> Result<(), QueueError> {
        let data = envelope.to_bytes().map_err(|e| QueueError::Serialization {
            message: e.to_string(),
            payload_size: 0,
        })?;
        let data_size = data.len();

        self.transport
            .push(&self.name, data)
            .await
            .map_err(QueueError::Transport)?;

        self.metrics
            .increment_published(&self.name, envelope.event_type());
        debug!(
            queue = %self.name,
            event_type = envelope.event_type(),
            data_size,
            "event published to queue"
        );
        Ok(())
    }

    /// Waits up to `wait` for the next envelope.
    ///
    /// Returns [`QueueError::Empty`] when the wait elapses and
    /// [`QueueError::Cancelled`] as soon as `token` is cancelled.
    pub async fn pop(&self, token: &CancellationToken, wait: Duration) -> Result<Envelope, QueueError> {
        let popped = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(QueueError::Cancelled),
            res = self.transport.pop(&self.name, wait) => res,
        };

        let bytes = match popped {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Err(QueueError::Empty),
            Err(e) => return Err(QueueError::Transport(e)),
        };
        debug!(queue = %self.name, payload_size = bytes.len(), "pulled item from queue");

        Envelope::from_slice(&bytes).map_err(|e| QueueError::Serialization {
            message: e.to_string(),
            payload_size: bytes.len(),
        })
    }

    /// Current number of queued items. Diagnostic only; may be stale by the
    /// time it is read.
    pub async fn depth(&self) -> Result<u64, QueueError> {
        self.transport
            .len(&self.name)
            .await
            .map_err(QueueError::Transport)
    }

    /// Releases the transport's connections.
    pub async fn close(&self) {
        self.transport.close().await;
    }
}
