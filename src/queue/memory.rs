//! In-process transport backed by `async-channel`.
//!
//! Each named list is an unbounded MPMC channel: pushes are delivered in order
//! and every item is received by exactly one popper. Used in tests and when no
//! Redis URL is configured.

use crate::core::QueueTransport;
use anyhow::{anyhow, Result};
use async_channel::{Receiver, Sender};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

type Channel = (Sender<Vec<u8>>, Receiver<Vec<u8>>);

#[derive(Debug, Default)]
pub struct InMemoryTransport {
    lists: Mutex<HashMap<String, Channel>>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn channel(&self, key: &str) -> Channel {
        let mut lists = self.lists.lock().unwrap_or_else(|e| e.into_inner());
        lists
            .entry(key.to_string())
            .or_insert_with(async_channel::unbounded)
            .clone()
    }
}

#[async_trait]
impl QueueTransport for InMemoryTransport {
    async fn push(&self, key: &str, payload: Vec<u8>) -> Result<()> {
        let (tx, _) = self.channel(key);
        tx.send(payload)
            .await
            .map_err(|_| anyhow!("list '{}' is closed", key))
    }

    async fn pop(&self, key: &str, wait: Duration) -> Result<Option<Vec<u8>>> {
        let (_, rx) = self.channel(key);
        match tokio::time::timeout(wait, rx.recv()).await {
            Ok(Ok(payload)) => Ok(Some(payload)),
            Ok(Err(_)) => Err(anyhow!("list '{}' is closed", key)),
            Err(_) => Ok(None),
        }
    }

    async fn len(&self, key: &str) -> Result<u64> {
        let (_, rx) = self.channel(key);
        Ok(rx.len() as u64)
    }

    async fn close(&self) {
        let lists = self.lists.lock().unwrap_or_else(|e| e.into_inner());
        for (tx, _) in lists.values() {
            tx.close();
        }
    }
}
