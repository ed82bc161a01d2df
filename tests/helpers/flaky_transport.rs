#![allow(dead_code)]
use alerts_worker::core::QueueTransport;
use alerts_worker::queue::InMemoryTransport;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// An in-memory transport whose first `failures` pops fail.
pub struct FlakyTransport {
    inner: InMemoryTransport,
    failures_left: AtomicUsize,
    pops: AtomicUsize,
}

impl FlakyTransport {
    pub fn new(failures: usize) -> Self {
        Self {
            inner: InMemoryTransport::new(),
            failures_left: AtomicUsize::new(failures),
            pops: AtomicUsize::new(0),
        }
    }

    pub fn pop_count(&self) -> usize {
        self.pops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QueueTransport for FlakyTransport {
    async fn push(&self, key: &str, payload: Vec<u8>) -> anyhow::Result<()> {
        self.inner.push(key, payload).await
    }

    async fn pop(&self, key: &str, wait: Duration) -> anyhow::Result<Option<Vec<u8>>> {
        self.pops.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            anyhow::bail!("connection reset by peer");
        }
        self.inner.pop(key, wait).await
    }

    async fn len(&self, key: &str) -> anyhow::Result<u64> {
        self.inner.len(key).await
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}
