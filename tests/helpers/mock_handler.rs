#![allow(dead_code)]
use alerts_worker::core::{Envelope, EventHandler, HandlerError};
use alerts_worker::events::MarkPriceEvent;
use alerts_worker::handlers::AlertEvaluator;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// What a [`ScriptedHandler`] does on one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Succeed,
    /// Retryable failure.
    Fail,
    /// Non-retryable failure.
    Reject,
    /// Never returns and ignores cancellation.
    Hang,
    /// Waits for cancellation, then reports it.
    WaitForCancel,
    Panic,
}

/// A mock handler that follows a script and records every invocation.
pub struct ScriptedHandler {
    script: Mutex<VecDeque<Step>>,
    fallback: Step,
    calls: Mutex<Vec<(String, Instant)>>,
    notifier: Notify,
}

impl ScriptedHandler {
    /// Runs `script` in order, then `fallback` for every later call.
    pub fn new(script: impl IntoIterator<Item = Step>, fallback: Step) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            fallback,
            calls: Mutex::new(Vec::new()),
            notifier: Notify::new(),
        }
    }

    pub fn always(step: Step) -> Self {
        Self::new([], step)
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Event ids in invocation order.
    pub fn seen_ids(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(id, _)| id.clone()).collect()
    }

    /// Time between consecutive invocations.
    pub fn gaps(&self) -> Vec<Duration> {
        let calls = self.calls.lock().unwrap();
        calls.windows(2).map(|w| w[1].1 - w[0].1).collect()
    }

    pub async fn wait_for_calls(&self, target: usize, timeout: Duration) {
        let wait = async {
            loop {
                let notified = self.notifier.notified();
                if self.call_count() >= target {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .expect("Timed out waiting for handler calls");
    }
}

#[async_trait]
impl EventHandler for ScriptedHandler {
    async fn handle(&self, token: &CancellationToken, envelope: &Envelope) -> Result<(), HandlerError> {
        let step = self.script.lock().unwrap().pop_front().unwrap_or(self.fallback);
        self.calls
            .lock()
            .unwrap()
            .push((envelope.id().to_string(), Instant::now()));
        self.notifier.notify_waiters();

        match step {
            Step::Succeed => Ok(()),
            Step::Fail => Err(HandlerError::Failed(anyhow::anyhow!("scripted failure"))),
            Step::Reject => Err(HandlerError::InvalidPayload("scripted rejection".into())),
            Step::Hang => std::future::pending().await,
            Step::WaitForCancel => {
                token.cancelled().await;
                Err(HandlerError::Cancelled)
            }
            Step::Panic => panic!("scripted panic for event {}", envelope.id()),
        }
    }
}

/// A mock evaluator that counts the ticks it has received.
#[derive(Default)]
pub struct CountingEvaluator {
    pub symbols: Mutex<Vec<String>>,
}

impl CountingEvaluator {
    pub fn count(&self) -> usize {
        self.symbols.lock().unwrap().len()
    }
}

#[async_trait]
impl AlertEvaluator for CountingEvaluator {
    async fn evaluate(&self, _token: &CancellationToken, event: &MarkPriceEvent) -> anyhow::Result<()> {
        self.symbols.lock().unwrap().push(event.symbol.clone());
        Ok(())
    }
}
