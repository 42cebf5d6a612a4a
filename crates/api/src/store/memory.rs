//! In-memory key/value store
//!
//! Single-process stand-in for Redis with lazy TTL enforcement: expired
//! entries are dropped when touched, the way a scan or lookup would observe
//! them gone. First-class backend, not a test-only shim.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use pulsedesk_shared::CoreError;

use super::KeyValueStore;

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Set(HashSet<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop the entry if its TTL has lapsed, mirroring Redis lazy expiry.
    fn prune(entries: &mut HashMap<String, Entry>, key: &str) {
        if entries.get(key).is_some_and(Entry::is_expired) {
            entries.remove(key);
        }
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CoreError> {
        let mut entries = self.entries.lock().await;
        Self::prune(&mut entries, key);
        match entries.get(key) {
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => Ok(Some(s.clone())),
            _ => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<(), CoreError> {
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: ttl_secs.map(|t| Instant::now() + Duration::from_secs(t)),
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), CoreError> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), CoreError> {
        let mut entries = self.entries.lock().await;
        Self::prune(&mut entries, key);
        if let Some(entry) = entries.get_mut(key) {
            entry.expires_at = Some(Instant::now() + Duration::from_secs(ttl_secs));
        }
        Ok(())
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<(), CoreError> {
        let mut entries = self.entries.lock().await;
        Self::prune(&mut entries, key);
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Set(HashSet::new()),
            expires_at: None,
        });
        if let Value::Set(set) = &mut entry.value {
            set.insert(member.to_string());
        }
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<(), CoreError> {
        let mut entries = self.entries.lock().await;
        Self::prune(&mut entries, key);
        if let Some(Entry {
            value: Value::Set(set),
            ..
        }) = entries.get_mut(key)
        {
            set.remove(member);
        }
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, CoreError> {
        let mut entries = self.entries.lock().await;
        Self::prune(&mut entries, key);
        match entries.get(key) {
            Some(Entry {
                value: Value::Set(set),
                ..
            }) => Ok(set.iter().cloned().collect()),
            _ => Ok(Vec::new()),
        }
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool, CoreError> {
        let mut entries = self.entries.lock().await;
        Self::prune(&mut entries, key);
        match entries.get(key) {
            Some(Entry {
                value: Value::Set(set),
                ..
            }) => Ok(set.contains(member)),
            _ => Ok(false),
        }
    }

    async fn scan(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<String>), CoreError> {
        let mut entries = self.entries.lock().await;
        entries.retain(|_, entry| !entry.is_expired());

        let mut keys: Vec<String> = entries
            .keys()
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect();
        keys.sort();

        let start = (cursor as usize).min(keys.len());
        let end = (start + count.max(1)).min(keys.len());
        let batch = keys[start..end].to_vec();
        let next_cursor = if end >= keys.len() { 0 } else { end as u64 };
        Ok((next_cursor, batch))
    }
}

/// Minimal glob: a single `*` wildcard, enough for the key namespaces in use.
fn glob_match(pattern: &str, key: &str) -> bool {
    match pattern.split_once('*') {
        Some((prefix, suffix)) => {
            key.len() >= prefix.len() + suffix.len()
                && key.starts_with(prefix)
                && key.ends_with(suffix)
        }
        None => pattern == key,
    }
}
