//! Routing of envelopes to handlers by event type.
//!
//! [`HandlerRegistry`] maps a type tag to the handler responsible for it and
//! is itself an [`EventHandler`], so it can be handed to the dispatcher.
//! Envelopes whose type has no registered handler are resolved by an explicit
//! [`UnknownTypePolicy`].

use crate::core::{Envelope, EventHandler, HandlerError};
use anyhow::anyhow;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// What to do with an envelope whose type has no registered handler.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum UnknownTypePolicy {
    /// Report [`HandlerError::UnknownType`]; the event is dropped and counted.
    #[default]
    Drop,
    /// Treat the event as handled.
    Ignore,
    /// Report a retryable failure so the dispatcher retries it.
    Retry,
}

/// Type tag → handler lookup table.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn EventHandler>>,
    unknown_type_policy: UnknownTypePolicy,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("event_types", &self.event_types())
            .field("unknown_type_policy", &self.unknown_type_policy)
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new(unknown_type_policy: UnknownTypePolicy) -> Self {
        Self {
            handlers: HashMap::new(),
            unknown_type_policy,
        }
    }

    /// Registers `handler` for `event_type`, replacing any previous one.
    pub fn register(mut self, event_type: impl Into<String>, handler: Arc<dyn EventHandler>) -> Self {
        let event_type = event_type.into();
        if self.handlers.insert(event_type.clone(), handler).is_some() {
            warn!(event_type = %event_type, "Replacing previously registered handler");
        }
        self
    }

    /// Registered type tags, sorted.
    pub fn event_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

#[async_trait]
impl EventHandler for HandlerRegistry {
    async fn handle(&self, token: &CancellationToken, envelope: &Envelope) -> Result<(), HandlerError> {
        if let Some(handler) = self.handlers.get(envelope.event_type()) {
            return handler.handle(token, envelope).await;
        }

        match self.unknown_type_policy {
            UnknownTypePolicy::Drop => Err(HandlerError::UnknownType(envelope.event_type().to_string())),
            UnknownTypePolicy::Ignore => {
                debug!(event_type = envelope.event_type(), "Ignoring event with no registered handler");
                Ok(())
            }
            UnknownTypePolicy::Retry => Err(HandlerError::Failed(anyhow!(
                "no handler registered for event type '{}'",
                envelope.event_type()
            ))),
        }
    }
}

/// Adapts a closure into an [`EventHandler`].
///
/// The closure receives its own clones of the token and envelope, so the
/// returned future owns everything it touches.
pub struct HandlerFn<F> {
    f: F,
}

impl<F> HandlerFn<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }

    pub fn arc(f: F) -> Arc<Self> {
        Arc::new(Self::new(f))
    }
}

#[async_trait]
impl<F, Fut> EventHandler for HandlerFn<F>
where
    F: Fn(CancellationToken, Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, token: &CancellationToken, envelope: &Envelope) -> Result<(), HandlerError> {
        (self.f)(token.clone(), envelope.clone()).await
    }
}
