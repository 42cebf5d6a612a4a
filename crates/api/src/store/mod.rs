//! Key/value store abstraction for session state
//!
//! The session layer talks to a shared TTL-capable key/set store through this
//! trait. Production runs Redis; the in-memory backend serves single-process
//! deployments and tests. Every call is independently atomic — there is no
//! cross-call transaction, and callers are written for that.

use async_trait::async_trait;

use pulsedesk_shared::CoreError;

pub mod memory;
pub mod redis;

pub use memory::MemoryStore;
pub use redis::RedisStore;

/// TTL-capable key/set store. GET/SET/DEL/EXPIRE plus set membership and a
/// cursor-based non-blocking SCAN.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Get a value. `None` when the key does not exist or has expired.
    async fn get(&self, key: &str) -> Result<Option<String>, CoreError>;

    /// Set a value, with an optional TTL in seconds.
    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<(), CoreError>;

    /// Delete a key. Deleting a missing key is not an error.
    async fn del(&self, key: &str) -> Result<(), CoreError>;

    /// Set the TTL on an existing key.
    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), CoreError>;

    /// Add a member to a set.
    async fn sadd(&self, key: &str, member: &str) -> Result<(), CoreError>;

    /// Remove a member from a set.
    async fn srem(&self, key: &str, member: &str) -> Result<(), CoreError>;

    /// All members of a set.
    async fn smembers(&self, key: &str) -> Result<Vec<String>, CoreError>;

    /// Set membership test.
    async fn sismember(&self, key: &str, member: &str) -> Result<bool, CoreError>;

    /// One bounded step of a cursor scan over keys matching `pattern`.
    /// Returns the next cursor (0 when the scan is complete) and a batch of
    /// keys. Batches may be empty mid-scan.
    async fn scan(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<String>), CoreError>;
}
