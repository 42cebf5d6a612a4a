//! Cross-process pub/sub channel
//!
//! One well-known channel carries every broadcast envelope between
//! processes. The Redis backend is the production transport; the in-memory
//! backend (tokio broadcast channels) serves single-process deployments and
//! lets tests run two broadcasters against one shared bus.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{broadcast, Mutex};

use pulsedesk_shared::CoreError;

/// Publisher/subscriber pair over one named channel namespace.
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Publish a payload. Failures are the caller's to log; fan-out to local
    /// connections has already happened by the time this is called.
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), CoreError>;

    /// Open a subscription. The handle must be closed before it is dropped
    /// so the registration is released.
    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>, CoreError>;
}

/// Live subscription handle.
#[async_trait]
pub trait Subscription: Send {
    /// Next payload. `Ok(None)` means the transport ended; `Err` a transport
    /// fault. Both are recoverable by resubscribing.
    async fn next_message(&mut self) -> Result<Option<String>, CoreError>;

    /// Release the registration. Idempotent.
    async fn close(&mut self);
}

/// Reconnect delay schedule: doubling from a base to a ceiling, reset on the
/// next successful receipt.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    next: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            next: base,
        }
    }

    /// The delay to sleep before the next attempt; advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (delay * 2).min(self.cap);
        delay
    }

    pub fn reset(&mut self) {
        self.next = self.base;
    }
}

// ==================== Redis ====================

/// Redis pub/sub transport.
pub struct RedisPubSub {
    client: redis::Client,
    publish_conn: redis::aio::ConnectionManager,
}

impl RedisPubSub {
    pub async fn connect(url: &str) -> Result<Self, CoreError> {
        let client =
            redis::Client::open(url).map_err(|e| CoreError::ServiceUnavailable(e.to_string()))?;
        let publish_conn = redis::aio::ConnectionManager::new(client.clone())
            .await
            .map_err(|e| CoreError::ServiceUnavailable(e.to_string()))?;
        Ok(Self {
            client,
            publish_conn,
        })
    }
}

#[async_trait]
impl PubSub for RedisPubSub {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), CoreError> {
        let mut conn = self.publish_conn.clone();
        redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async::<i64>(&mut conn)
            .await
            .map_err(|e| CoreError::ServiceUnavailable(e.to_string()))?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>, CoreError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| CoreError::ServiceUnavailable(e.to_string()))?;
        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| CoreError::ServiceUnavailable(e.to_string()))?;
        Ok(Box::new(RedisSubscription {
            pubsub,
            channel: channel.to_string(),
        }))
    }
}

struct RedisSubscription {
    pubsub: redis::aio::PubSub,
    channel: String,
}

#[async_trait]
impl Subscription for RedisSubscription {
    async fn next_message(&mut self) -> Result<Option<String>, CoreError> {
        match self.pubsub.on_message().next().await {
            Some(msg) => msg
                .get_payload::<String>()
                .map(Some)
                .map_err(|e| CoreError::ServiceUnavailable(e.to_string())),
            // Stream end means the server connection dropped
            None => Ok(None),
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.pubsub.unsubscribe(&self.channel).await {
            tracing::debug!(error = %e, channel = %self.channel, "Unsubscribe on close failed");
        }
    }
}

// ==================== In-memory ====================

/// In-memory pub/sub over tokio broadcast channels.
#[derive(Default)]
pub struct MemoryPubSub {
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

const MEMORY_CHANNEL_CAPACITY: usize = 256;

impl MemoryPubSub {
    pub fn new() -> Self {
        Self::default()
    }

    async fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        let mut channels = self.channels.lock().await;
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(MEMORY_CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl PubSub for MemoryPubSub {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), CoreError> {
        // No subscribers is not an error
        let _ = self.sender(channel).await.send(payload.to_string());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>, CoreError> {
        let rx = self.sender(channel).await.subscribe();
        Ok(Box::new(MemorySubscription { rx }))
    }
}

struct MemorySubscription {
    rx: broadcast::Receiver<String>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next_message(&mut self) -> Result<Option<String>, CoreError> {
        match self.rx.recv().await {
            Ok(payload) => Ok(Some(payload)),
            Err(broadcast::error::RecvError::Closed) => Ok(None),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                Err(CoreError::ServiceUnavailable(format!("lagged by {n}")))
            }
        }
    }

    async fn close(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_to_cap_and_resets() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));

        let mut delays = Vec::new();
        for _ in 0..8 {
            delays.push(backoff.next_delay().as_secs());
        }
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60]);

        backoff.reset();
        assert_eq!(backoff.next_delay().as_secs(), 1);
    }

    #[tokio::test]
    async fn test_memory_pubsub_delivers_to_all_subscribers() {
        let bus = MemoryPubSub::new();
        let mut sub_a = bus.subscribe("events").await.unwrap();
        let mut sub_b = bus.subscribe("events").await.unwrap();

        bus.publish("events", "hello").await.unwrap();

        assert_eq!(sub_a.next_message().await.unwrap(), Some("hello".into()));
        assert_eq!(sub_b.next_message().await.unwrap(), Some("hello".into()));
    }

    #[tokio::test]
    async fn test_memory_pubsub_channels_are_isolated() {
        let bus = MemoryPubSub::new();
        let mut sub = bus.subscribe("a").await.unwrap();

        bus.publish("b", "wrong channel").await.unwrap();
        bus.publish("a", "right channel").await.unwrap();

        assert_eq!(
            sub.next_message().await.unwrap(),
            Some("right channel".into())
        );
    }
}
