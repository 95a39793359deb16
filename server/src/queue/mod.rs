//! Durable FIFO queues keyed by string ids: the work queue per compat hash,
//! the token queue per assistant message, and the compliance queue per
//! worker. The `Broker` trait is the substrate seam; `MemoryBroker` is the
//! in-process implementation.

use async_trait::async_trait;
use shared::protocol::ResponsePacket;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

pub mod memory;

pub use memory::MemoryBroker;

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    #[error("queue serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[async_trait]
pub trait Broker: Send + Sync {
    async fn push(&self, key: &str, value: String) -> QueueResult<()>;
    /// Blocking FIFO pop; `None` after `timeout` with nothing to take.
    async fn pop(&self, key: &str, timeout: Duration) -> QueueResult<Option<String>>;
    /// Best-effort removal of a queued value; false if already popped.
    async fn remove(&self, key: &str, value: &str) -> QueueResult<bool>;
    /// `(index, queue_len)` of a queued value, if still queued.
    async fn position(&self, key: &str, value: &str) -> QueueResult<Option<(usize, usize)>>;
    async fn len(&self, key: &str) -> QueueResult<usize>;
    /// Drop the queue after `ttl` unless touched again.
    async fn expire(&self, key: &str, ttl: Duration) -> QueueResult<()>;
}

/// Work queue for one compat hash; entries are assistant message ids.
#[derive(Clone)]
pub struct WorkQueue {
    broker: Arc<dyn Broker>,
    key: String,
}

impl WorkQueue {
    pub fn new(broker: Arc<dyn Broker>, compat_hash: &str) -> Self {
        Self {
            broker,
            key: format!("work:{compat_hash}"),
        }
    }

    pub async fn enqueue(&self, message_id: Uuid) -> QueueResult<()> {
        self.broker.push(&self.key, message_id.to_string()).await
    }

    pub async fn pop(&self, timeout: Duration) -> QueueResult<Option<Uuid>> {
        let value = self.broker.pop(&self.key, timeout).await?;
        Ok(value.and_then(|v| v.parse().ok()))
    }

    pub async fn remove(&self, message_id: Uuid) -> QueueResult<bool> {
        self.broker.remove(&self.key, &message_id.to_string()).await
    }

    pub async fn position(&self, message_id: Uuid) -> QueueResult<Option<(usize, usize)>> {
        self.broker
            .position(&self.key, &message_id.to_string())
            .await
    }
}

/// Token queue for one assistant message. Single producer per session; the
/// `End` packet is terminal and later pushes are logged and dropped.
pub struct TokenQueue {
    broker: Arc<dyn Broker>,
    key: String,
    closed: AtomicBool,
}

impl TokenQueue {
    pub fn new(broker: Arc<dyn Broker>, message_id: Uuid) -> Self {
        Self {
            broker,
            key: format!("tokens:{message_id}"),
            closed: AtomicBool::new(false),
        }
    }

    pub async fn push(&self, packet: &ResponsePacket) -> QueueResult<()> {
        if self.closed.load(Ordering::Acquire) {
            tracing::warn!(key = %self.key, "dropping packet pushed after end");
            return Ok(());
        }
        let encoded = serde_json::to_string(packet)?;
        // Transient broker outages get a bounded retry before the session
        // gives up on the stream.
        let mut attempt = 0;
        loop {
            match self.broker.push(&self.key, encoded.clone()).await {
                Ok(()) => break,
                Err(QueueError::Unavailable(why)) if attempt < 3 => {
                    attempt += 1;
                    tracing::warn!(key = %self.key, "broker push failed ({why}), retry {attempt}");
                    tokio::time::sleep(Duration::from_millis(50 * attempt)).await;
                }
                Err(e) => return Err(e),
            }
        }
        if packet.is_end() {
            self.closed.store(true, Ordering::Release);
        }
        Ok(())
    }

    /// Arms the post-`end` TTL so an abandoned queue is reclaimed.
    pub async fn expire(&self, ttl: Duration) -> QueueResult<()> {
        self.broker.expire(&self.key, ttl).await
    }

    pub async fn pop(&self, timeout: Duration) -> QueueResult<Option<ResponsePacket>> {
        match self.broker.pop(&self.key, timeout).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }
}

/// Compliance queue for one worker; entries are canary prompts.
pub struct ComplianceQueue {
    broker: Arc<dyn Broker>,
    key: String,
}

impl ComplianceQueue {
    pub fn new(broker: Arc<dyn Broker>, worker_id: Uuid) -> Self {
        Self {
            broker,
            key: format!("compliance:{worker_id}"),
        }
    }

    pub async fn enqueue(&self, prompt: String) -> QueueResult<()> {
        self.broker.push(&self.key, prompt).await
    }

    pub async fn try_pop(&self) -> QueueResult<Option<String>> {
        self.broker.pop(&self.key, Duration::ZERO).await
    }
}
