//! Integration tests for the retrying dispatcher's backoff state machine.

use alerts_worker::core::Envelope;
use alerts_worker::dispatcher::{DispatchError, RetryConfig, RetryingDispatcher};
use alerts_worker::internal_metrics::{DISPATCH_BACKOFF, DISPATCH_RETRIES_TOTAL};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

mod helpers;
use helpers::mock_handler::{ScriptedHandler, Step};
use helpers::test_metrics::TestMetrics;

fn retry(max_retries: u32, initial_ms: u64, max_ms: u64, factor: f64) -> RetryConfig {
    RetryConfig {
        max_retries,
        initial_backoff_ms: initial_ms,
        max_backoff_ms: max_ms,
        backoff_factor: factor,
    }
}

fn envelope(id: &str) -> Envelope {
    Envelope::new("mark_price", json!({"symbol": "BTCUSDT", "price": 65000.0})).with_id(id)
}

fn dispatcher(handler: Arc<ScriptedHandler>, config: RetryConfig) -> (RetryingDispatcher, TestMetrics) {
    let metrics = TestMetrics::new();
    (RetryingDispatcher::new(handler, config, metrics.metrics()), metrics)
}

#[tokio::test(start_paused = true)]
async fn test_always_failing_handler_is_invoked_retries_plus_one_times() {
    let handler = Arc::new(ScriptedHandler::always(Step::Fail));
    let (dispatcher, metrics) = dispatcher(handler.clone(), retry(2, 100, 1_000, 2.0));

    let result = dispatcher.dispatch(&CancellationToken::new(), &envelope("e1")).await;

    match result {
        Err(DispatchError::Exhausted { retries, ref source }) => {
            assert_eq!(retries, 2);
            assert!(source.to_string().contains("scripted failure"));
        }
        other => panic!("expected exhausted error, got {:?}", other),
    }
    assert_eq!(handler.call_count(), 3);
    assert_eq!(
        handler.gaps(),
        vec![Duration::from_millis(100), Duration::from_millis(200)]
    );
    assert_eq!(metrics.counter(DISPATCH_RETRIES_TOTAL, &[("event_type", "mark_price")]), 2);
    assert_eq!(
        metrics.histogram(DISPATCH_BACKOFF, &[("event_type", "mark_price")]),
        vec![0.1, 0.2]
    );
}

#[tokio::test(start_paused = true)]
async fn test_backoff_is_capped_at_max() {
    let handler = Arc::new(ScriptedHandler::always(Step::Fail));
    let (dispatcher, _) = dispatcher(handler.clone(), retry(4, 100, 250, 2.0));

    let result = dispatcher.dispatch(&CancellationToken::new(), &envelope("e1")).await;

    assert!(matches!(result, Err(DispatchError::Exhausted { retries: 4, .. })));
    assert_eq!(
        handler.gaps(),
        vec![
            Duration::from_millis(100),
            Duration::from_millis(200),
            Duration::from_millis(250),
            Duration::from_millis(250),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_success_short_circuits_remaining_retries() {
    let handler = Arc::new(ScriptedHandler::new([Step::Fail, Step::Fail], Step::Succeed));
    let (dispatcher, metrics) = dispatcher(handler.clone(), retry(5, 100, 1_000, 2.0));

    dispatcher
        .dispatch(&CancellationToken::new(), &envelope("e1"))
        .await
        .unwrap();

    assert_eq!(handler.call_count(), 3);
    assert_eq!(metrics.counter_total(DISPATCH_RETRIES_TOTAL), 2);
}

#[tokio::test(start_paused = true)]
async fn test_zero_retries_still_attempts_once() {
    let handler = Arc::new(ScriptedHandler::always(Step::Fail));
    let (dispatcher, metrics) = dispatcher(handler.clone(), retry(0, 100, 1_000, 2.0));

    let start = tokio::time::Instant::now();
    let result = dispatcher.dispatch(&CancellationToken::new(), &envelope("e1")).await;

    assert!(matches!(result, Err(DispatchError::Exhausted { retries: 0, .. })));
    assert_eq!(handler.call_count(), 1);
    assert_eq!(start.elapsed(), Duration::ZERO);
    assert_eq!(metrics.counter_total(DISPATCH_RETRIES_TOTAL), 0);
}

#[tokio::test(start_paused = true)]
async fn test_retry_state_does_not_carry_over_between_events() {
    let handler = Arc::new(ScriptedHandler::new(
        [Step::Fail, Step::Succeed, Step::Fail, Step::Succeed],
        Step::Succeed,
    ));
    let (dispatcher, _) = dispatcher(handler.clone(), retry(3, 100, 1_000, 2.0));
    let token = CancellationToken::new();

    dispatcher.dispatch(&token, &envelope("e1")).await.unwrap();
    dispatcher.dispatch(&token, &envelope("e2")).await.unwrap();

    let gaps = handler.gaps();
    assert_eq!(gaps[0], Duration::from_millis(100));
    // The second event starts again from the initial backoff.
    assert_eq!(gaps[2], Duration::from_millis(100));
    assert_eq!(handler.seen_ids(), vec!["e1", "e1", "e2", "e2"]);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_during_backoff_returns_immediately() {
    let handler = Arc::new(ScriptedHandler::always(Step::Fail));
    let (dispatcher, metrics) = dispatcher(handler.clone(), retry(3, 10_000, 60_000, 2.0));
    let dispatcher = Arc::new(dispatcher);
    let token = CancellationToken::new();

    let task = {
        let dispatcher = dispatcher.clone();
        let token = token.clone();
        tokio::spawn(async move { dispatcher.dispatch(&token, &envelope("e1")).await })
    };

    handler.wait_for_calls(1, Duration::from_secs(1)).await;
    let start = tokio::time::Instant::now();
    token.cancel();

    let result = task.await.unwrap();
    assert!(matches!(result, Err(DispatchError::Cancelled)));
    assert!(start.elapsed() < Duration::from_secs(10));
    assert_eq!(handler.call_count(), 1);
    assert_eq!(metrics.counter_total(DISPATCH_RETRIES_TOTAL), 0);
}

#[tokio::test]
async fn test_cancelled_token_skips_the_handler() {
    let handler = Arc::new(ScriptedHandler::always(Step::Succeed));
    let (dispatcher, _) = dispatcher(handler.clone(), RetryConfig::default());
    let token = CancellationToken::new();
    token.cancel();

    let result = dispatcher.dispatch(&token, &envelope("e1")).await;
    assert!(matches!(result, Err(DispatchError::Cancelled)));
    assert_eq!(handler.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_non_retryable_error_is_not_retried() {
    let handler = Arc::new(ScriptedHandler::always(Step::Reject));
    let (dispatcher, metrics) = dispatcher(handler.clone(), retry(5, 100, 1_000, 2.0));

    let result = dispatcher.dispatch(&CancellationToken::new(), &envelope("e1")).await;

    let err = result.unwrap_err();
    assert_eq!(err.kind(), "rejected");
    assert_eq!(handler.call_count(), 1);
    assert_eq!(metrics.counter_total(DISPATCH_RETRIES_TOTAL), 0);
}
