//! Redis-backed key/value store

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;

use pulsedesk_shared::CoreError;

use super::KeyValueStore;

/// Redis store over a multiplexed connection manager.
///
/// The manager reconnects on its own; command failures while it does are
/// surfaced as ServiceUnavailable and handled by the caller's path policy.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connect to Redis, retrying the initial handshake with backoff.
    pub async fn connect(url: &str) -> Result<Self, CoreError> {
        let client = redis::Client::open(url).map_err(unavailable)?;

        let retry_strategy = ExponentialBackoff::from_millis(500).map(jitter).take(3);
        let conn = Retry::spawn(retry_strategy, || {
            let client = client.clone();
            async move { ConnectionManager::new(client).await }
        })
        .await
        .map_err(unavailable)?;

        tracing::info!(url = %url, "Connected to Redis");
        Ok(Self { conn })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

fn unavailable(err: redis::RedisError) -> CoreError {
    CoreError::ServiceUnavailable(err.to_string())
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CoreError> {
        self.conn().get(key).await.map_err(unavailable)
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<(), CoreError> {
        let mut conn = self.conn();
        match ttl_secs {
            Some(ttl) => conn.set_ex::<_, _, ()>(key, value, ttl).await,
            None => conn.set::<_, _, ()>(key, value).await,
        }
        .map_err(unavailable)
    }

    async fn del(&self, key: &str) -> Result<(), CoreError> {
        self.conn().del::<_, ()>(key).await.map_err(unavailable)
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), CoreError> {
        self.conn()
            .expire::<_, ()>(key, ttl_secs as i64)
            .await
            .map_err(unavailable)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<(), CoreError> {
        self.conn()
            .sadd::<_, _, ()>(key, member)
            .await
            .map_err(unavailable)
    }

    async fn srem(&self, key: &str, member: &str) -> Result<(), CoreError> {
        self.conn()
            .srem::<_, _, ()>(key, member)
            .await
            .map_err(unavailable)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, CoreError> {
        self.conn().smembers(key).await.map_err(unavailable)
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool, CoreError> {
        self.conn()
            .sismember(key, member)
            .await
            .map_err(unavailable)
    }

    async fn scan(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<String>), CoreError> {
        // SCAN, not KEYS: bounded, non-blocking steps
        redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(count)
            .query_async::<(u64, Vec<String>)>(&mut self.conn())
            .await
            .map_err(unavailable)
    }
}
