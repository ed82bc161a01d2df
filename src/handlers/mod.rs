//! Business-logic handlers for the event types this worker understands.

pub mod mark_price;

pub use self::mark_price::{AlertEvaluator, MarkPriceHandler, TracingAlertEvaluator};
