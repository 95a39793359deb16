use super::{Broker, QueueResult};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

#[derive(Default)]
struct QueueState {
    items: VecDeque<String>,
    notify: Arc<Notify>,
    expires_at: Option<Instant>,
}

/// In-process broker backed by tokio sync primitives. FIFO per key, timed
/// blocking pop via `Notify`, lazy TTL enforcement on access.
#[derive(Default)]
pub struct MemoryBroker {
    queues: Mutex<HashMap<String, QueueState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    async fn with_live_queue<T>(&self, key: &str, f: impl FnOnce(&mut QueueState) -> T) -> T {
        let mut queues = self.queues.lock().await;
        Self::purge_expired(&mut queues);
        f(queues.entry(key.to_string()).or_default())
    }

    fn purge_expired(queues: &mut HashMap<String, QueueState>) {
        let now = Instant::now();
        queues.retain(|_, q| match q.expires_at {
            Some(at) => at > now,
            None => true,
        });
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn push(&self, key: &str, value: String) -> QueueResult<()> {
        self.with_live_queue(key, |q| {
            q.items.push_back(value);
            q.notify.notify_one();
        })
        .await;
        Ok(())
    }

    async fn pop(&self, key: &str, timeout: Duration) -> QueueResult<Option<String>> {
        let deadline = Instant::now() + timeout;
        loop {
            let notify = {
                let mut queues = self.queues.lock().await;
                Self::purge_expired(&mut queues);
                let q = queues.entry(key.to_string()).or_default();
                if let Some(item) = q.items.pop_front() {
                    return Ok(Some(item));
                }
                q.notify.clone()
            };
            // notify_one stores a permit, so a push between the unlock and
            // the await below is not lost.
            tokio::select! {
                _ = notify.notified() => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
            }
        }
    }

    async fn remove(&self, key: &str, value: &str) -> QueueResult<bool> {
        Ok(self
            .with_live_queue(key, |q| {
                match q.items.iter().position(|v| v == value) {
                    Some(idx) => {
                        q.items.remove(idx);
                        true
                    }
                    None => false,
                }
            })
            .await)
    }

    async fn position(&self, key: &str, value: &str) -> QueueResult<Option<(usize, usize)>> {
        Ok(self
            .with_live_queue(key, |q| {
                let len = q.items.len();
                q.items.iter().position(|v| v == value).map(|idx| (idx, len))
            })
            .await)
    }

    async fn len(&self, key: &str) -> QueueResult<usize> {
        Ok(self.with_live_queue(key, |q| q.items.len()).await)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> QueueResult<()> {
        self.with_live_queue(key, |q| {
            q.expires_at = Some(Instant::now() + ttl);
        })
        .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::TokenQueue;
    use shared::protocol::{EndReason, ResponsePacket};
    use uuid::Uuid;

    fn token(text: &str) -> ResponsePacket {
        ResponsePacket::Token {
            text: text.into(),
            log_prob: None,
            token_id: None,
        }
    }

    #[tokio::test]
    async fn pop_is_fifo() {
        let broker = MemoryBroker::new();
        broker.push("k", "a".into()).await.unwrap();
        broker.push("k", "b".into()).await.unwrap();
        assert_eq!(
            broker.pop("k", Duration::ZERO).await.unwrap(),
            Some("a".into())
        );
        assert_eq!(
            broker.pop("k", Duration::ZERO).await.unwrap(),
            Some("b".into())
        );
    }

    #[tokio::test]
    async fn pop_times_out_on_empty_queue() {
        let broker = MemoryBroker::new();
        let popped = broker.pop("empty", Duration::from_millis(20)).await.unwrap();
        assert_eq!(popped, None);
    }

    #[tokio::test]
    async fn pop_wakes_on_concurrent_push() {
        let broker = Arc::new(MemoryBroker::new());
        let pusher = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            pusher.push("k", "late".into()).await.unwrap();
        });
        let popped = broker.pop("k", Duration::from_secs(2)).await.unwrap();
        assert_eq!(popped, Some("late".into()));
    }

    #[tokio::test]
    async fn remove_and_position() {
        let broker = MemoryBroker::new();
        broker.push("k", "a".into()).await.unwrap();
        broker.push("k", "b".into()).await.unwrap();
        broker.push("k", "c".into()).await.unwrap();
        assert_eq!(broker.position("k", "b").await.unwrap(), Some((1, 3)));
        assert!(broker.remove("k", "b").await.unwrap());
        assert!(!broker.remove("k", "b").await.unwrap());
        assert_eq!(broker.position("k", "c").await.unwrap(), Some((1, 2)));
    }

    #[tokio::test]
    async fn expired_queue_is_dropped() {
        let broker = MemoryBroker::new();
        broker.push("k", "a".into()).await.unwrap();
        broker.expire("k", Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(broker.len("k").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn token_queue_drops_pushes_after_end() {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
        let queue = TokenQueue::new(broker.clone(), Uuid::now_v7());
        queue.push(&token("Hi")).await.unwrap();
        queue
            .push(&ResponsePacket::End {
                reason: EndReason::Success,
                error: None,
            })
            .await
            .unwrap();
        queue.push(&token("late")).await.unwrap();

        assert_eq!(queue.pop(Duration::ZERO).await.unwrap(), Some(token("Hi")));
        assert!(queue.pop(Duration::ZERO).await.unwrap().unwrap().is_end());
        assert_eq!(queue.pop(Duration::ZERO).await.unwrap(), None);
    }
}
