//! Core domain types and service traits for the alerts worker
//!
//! This module defines the envelope that travels through the queue and the
//! trait contracts that the queue transport and the business-logic handlers
//! implement.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Epoch values at or above this are interpreted as milliseconds.
const EPOCH_MILLIS_THRESHOLD: i64 = 1_000_000_000_000;

/// The serialized unit of work moving through the queue.
///
/// An envelope is never mutated once it has been published; consumers only
/// read it. Fields are therefore private and exposed through accessors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    #[serde(default)]
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    data: serde_json::Value,
    #[serde(deserialize_with = "deserialize_created_at")]
    created_at: DateTime<Utc>,
}

impl Envelope {
    /// Creates a new envelope with a random id, stamped with the current time.
    pub fn new(event_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            data,
            created_at: Utc::now(),
        }
    }

    /// Replaces the generated id with a producer-assigned one.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Overrides the creation timestamp.
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn data(&self) -> &serde_json::Value {
        &self.data
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Time the envelope has spent between creation and `now`.
    ///
    /// Clock skew between producer and consumer can make `created_at` lie in
    /// the future; that case reports zero.
    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// Decodes the opaque payload into a typed event.
    pub fn typed_data<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.data)
    }

    /// Encodes the envelope into its JSON wire format.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decodes an envelope from its JSON wire format.
    ///
    /// An envelope without a type tag is rejected, since it cannot be routed.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let envelope: Envelope = serde_json::from_slice(bytes)?;
        if envelope.event_type.trim().is_empty() {
            return Err(EnvelopeError::MissingType);
        }
        Ok(envelope)
    }
}

/// Errors raised while decoding an envelope.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("envelope has an empty event type")]
    MissingType,
}

/// Accepts RFC 3339 strings as well as integer or fractional epochs in
/// seconds or milliseconds.
fn deserialize_created_at<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Timestamp {
        Text(DateTime<Utc>),
        Epoch(i64),
        Fractional(f64),
    }

    match Timestamp::deserialize(deserializer)? {
        Timestamp::Text(ts) => Ok(ts),
        Timestamp::Epoch(value) => {
            let parsed = if value >= EPOCH_MILLIS_THRESHOLD {
                Utc.timestamp_millis_opt(value).single()
            } else {
                Utc.timestamp_opt(value, 0).single()
            };
            parsed.ok_or_else(|| serde::de::Error::custom(format!("epoch {value} is out of range")))
        }
        Timestamp::Fractional(value) => {
            let secs = if value >= EPOCH_MILLIS_THRESHOLD as f64 {
                value / 1_000.0
            } else {
                value
            };
            let whole = secs.floor();
            let nanos = (((secs - whole) * 1e9).round() as u32).min(999_999_999);
            let parsed = if secs.is_finite() && whole.abs() < i64::MAX as f64 {
                Utc.timestamp_opt(whole as i64, nanos).single()
            } else {
                None
            };
            parsed.ok_or_else(|| serde::de::Error::custom(format!("epoch {value} is out of range")))
        }
    }
}

// =============================================================================
// Service Traits
// =============================================================================

/// A FIFO list store shared by producers and consumers.
///
/// Implementations must be safe to call from many tasks at once without
/// external locking.
#[async_trait]
pub trait QueueTransport: Send + Sync {
    /// Appends an item at the head of the named list.
    async fn push(&self, key: &str, payload: Vec<u8>) -> anyhow::Result<()>;

    /// Blocks until an item can be removed from the tail of the named list,
    /// or until `wait` elapses.
    ///
    /// # Returns
    /// * `Ok(Some(bytes))` when an item was removed
    /// * `Ok(None)` when the wait elapsed with the list empty
    /// * `Err` when the underlying store failed
    async fn pop(&self, key: &str, wait: Duration) -> anyhow::Result<Option<Vec<u8>>>;

    /// Returns the number of items currently in the named list.
    async fn len(&self, key: &str) -> anyhow::Result<u64>;

    /// Releases any connections held by this handle.
    async fn close(&self) {}
}

/// Business logic invoked for each popped envelope.
///
/// Handlers are called at most once per dispatch attempt and must return
/// promptly once `token` is cancelled.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, token: &CancellationToken, envelope: &Envelope) -> Result<(), HandlerError>;
}

/// Failure reported by an [`EventHandler`].
#[derive(Debug, Error)]
pub enum HandlerError {
    /// A transient business-logic failure. Retried by the dispatcher.
    #[error("handler failed: {0}")]
    Failed(#[from] anyhow::Error),

    /// The payload can never be processed. Not retried.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// No handler is registered for this event type. Not retried.
    #[error("no handler registered for event type '{0}'")]
    UnknownType(String),

    /// The handler observed cancellation and gave up.
    #[error("handler cancelled")]
    Cancelled,
}

impl HandlerError {
    /// Whether another attempt could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, HandlerError::Failed(_))
    }
}
