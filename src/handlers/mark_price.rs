//! Handler for `mark_price` events.
//!
//! The handler owns decoding and validation of the payload; what happens to a
//! valid tick is delegated to an [`AlertEvaluator`].

use crate::core::{Envelope, EventHandler, HandlerError};
use crate::events::MarkPriceEvent;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Evaluates user alerts against a mark-price tick.
#[async_trait]
pub trait AlertEvaluator: Send + Sync {
    /// An `Err` is treated as transient and retried.
    async fn evaluate(&self, token: &CancellationToken, event: &MarkPriceEvent) -> anyhow::Result<()>;
}

/// Logs every tick it receives. Used until a real alert store is wired in.
#[derive(Debug, Default, Clone)]
pub struct TracingAlertEvaluator;

#[async_trait]
impl AlertEvaluator for TracingAlertEvaluator {
    async fn evaluate(&self, _token: &CancellationToken, event: &MarkPriceEvent) -> anyhow::Result<()> {
        info!(
            symbol = %event.symbol,
            price = event.price,
            funding_rate = event.funding_rate,
            "Evaluating alerts for mark price"
        );
        Ok(())
    }
}

pub struct MarkPriceHandler {
    evaluator: Arc<dyn AlertEvaluator>,
}

impl MarkPriceHandler {
    pub fn new(evaluator: Arc<dyn AlertEvaluator>) -> Self {
        Self { evaluator }
    }
}

#[async_trait]
impl EventHandler for MarkPriceHandler {
    async fn handle(&self, token: &CancellationToken, envelope: &Envelope) -> Result<(), HandlerError> {
        let event: MarkPriceEvent = envelope
            .typed_data()
            .map_err(|e| HandlerError::InvalidPayload(e.to_string()))?;
        event.validate().map_err(HandlerError::InvalidPayload)?;

        debug!(event_id = envelope.id(), symbol = %event.symbol, "Decoded mark price event");

        tokio::select! {
            biased;
            _ = token.cancelled() => Err(HandlerError::Cancelled),
            res = self.evaluator.evaluate(token, &event) => res.map_err(HandlerError::Failed),
        }
    }
}
