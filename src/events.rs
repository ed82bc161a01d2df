//! Event type tags and their typed payloads.

use serde::{Deserialize, Serialize};

/// Binance futures mark-price tick.
pub const EVENT_TYPE_MARK_PRICE: &str = "mark_price";

/// Payload carried by a [`EVENT_TYPE_MARK_PRICE`] envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct MarkPriceEvent {
    pub symbol: String,
    pub price: f64,
    #[serde(default)]
    pub index_price: f64,
    #[serde(default)]
    pub funding_rate: f64,
    #[serde(default)]
    pub next_funding_time: i64,
    #[serde(default)]
    pub timestamp: i64,
}

impl MarkPriceEvent {
    /// Checks the fields an alert evaluation relies on.
    pub fn validate(&self) -> Result<(), String> {
        if self.symbol.trim().is_empty() {
            return Err("symbol is empty".to_string());
        }
        if !self.price.is_finite() || self.price <= 0.0 {
            return Err(format!("price {} is not a positive number", self.price));
        }
        Ok(())
    }
}
