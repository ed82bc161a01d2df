//! Redis list transport (`LPUSH` / `BRPOP` / `LLEN`).
//!
//! Non-blocking commands share one auto-reconnecting `ConnectionManager`.
//! `BRPOP` holds its connection until the server answers, so every pop runs
//! on a dedicated connection checked out from a small idle pool; otherwise a
//! blocked pop would stall publishes and depth checks queued behind it.

use crate::core::QueueTransport;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::Client;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

pub struct RedisTransport {
    client: Client,
    shared: ConnectionManager,
    idle: Mutex<Vec<MultiplexedConnection>>,
    closed: AtomicBool,
}

impl RedisTransport {
    /// Opens a transport for the Redis server at `redis_url`.
    ///
    /// Fails if the URL is invalid or the server cannot be reached.
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url).with_context(|| format!("invalid Redis URL '{}'", redis_url))?;
        let shared = client
            .get_connection_manager()
            .await
            .context("failed to connect to Redis")?;
        info!("Connected to Redis queue transport.");
        Ok(Self {
            client,
            shared,
            idle: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(anyhow!("redis transport is closed"));
        }
        Ok(())
    }

    async fn checkout(&self) -> Result<MultiplexedConnection> {
        let pooled = self.idle.lock().unwrap_or_else(|e| e.into_inner()).pop();
        match pooled {
            Some(conn) => Ok(conn),
            None => {
                debug!("Opening a new Redis connection for blocking pops.");
                self.client
                    .get_multiplexed_async_connection()
                    .await
                    .context("failed to open Redis connection")
            }
        }
    }

    fn checkin(&self, conn: MultiplexedConnection) {
        if !self.closed.load(Ordering::Acquire) {
            self.idle.lock().unwrap_or_else(|e| e.into_inner()).push(conn);
        }
    }
}

#[async_trait]
impl QueueTransport for RedisTransport {
    async fn push(&self, key: &str, payload: Vec<u8>) -> Result<()> {
        self.ensure_open()?;
        let mut conn = self.shared.clone();
        redis::cmd("LPUSH")
            .arg(key)
            .arg(payload)
            .query_async::<_, i64>(&mut conn)
            .await
            .context("LPUSH failed")?;
        Ok(())
    }

    async fn pop(&self, key: &str, wait: Duration) -> Result<Option<Vec<u8>>> {
        self.ensure_open()?;
        let mut conn = self.checkout().await?;
        let reply: Option<(String, Vec<u8>)> = redis::cmd("BRPOP")
            .arg(key)
            .arg(wait.as_secs_f64())
            .query_async(&mut conn)
            .await
            .context("BRPOP failed")?;
        // Only a connection that completed its reply goes back to the pool.
        self.checkin(conn);
        Ok(reply.map(|(_, payload)| payload))
    }

    async fn len(&self, key: &str) -> Result<u64> {
        self.ensure_open()?;
        let mut conn = self.shared.clone();
        let len = redis::cmd("LLEN")
            .arg(key)
            .query_async::<_, u64>(&mut conn)
            .await
            .context("LLEN failed")?;
        Ok(len)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.idle.lock().unwrap_or_else(|e| e.into_inner()).clear();
        info!("Redis queue transport closed.");
    }
}
