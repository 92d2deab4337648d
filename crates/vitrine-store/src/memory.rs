//! In-memory key/value backend.
//!
//! Last-resort tier when no durable backend can be opened, and the backend
//! used by tests. Supports an optional capacity limit to exercise quota
//! handling and an optional write delay to keep writes in flight.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tracing::trace;

use vitrine_core::{Error, KeyValueBackend, Result};

/// Volatile key/value backend.
#[derive(Clone)]
pub struct MemoryBackend {
    name: String,
    entries: Arc<Mutex<BTreeMap<String, String>>>,
    capacity_bytes: Option<usize>,
    write_delay: Option<Duration>,
    writes: Arc<AtomicU64>,
    write_log: Arc<Mutex<Vec<(String, String)>>>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::named("memory")
    }

    /// Create a backend with a custom name (useful when several tiers are memory-backed).
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Arc::new(Mutex::new(BTreeMap::new())),
            capacity_bytes: None,
            write_delay: None,
            writes: Arc::new(AtomicU64::new(0)),
            write_log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Reject writes that would grow total stored bytes beyond `bytes`.
    pub fn with_capacity_bytes(mut self, bytes: usize) -> Self {
        self.capacity_bytes = Some(bytes);
        self
    }

    /// Sleep this long inside every `set` before storing.
    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = Some(delay);
        self
    }

    /// Number of successful `set` calls.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Every successful `set` in order, as (key, value).
    pub fn write_log(&self) -> Vec<(String, String)> {
        self.write_log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Insert without counting as a write (test setup).
    pub fn seed(&self, key: impl Into<String>, value: impl Into<String>) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), value.into());
    }

    /// Current value for a key without going through the async API.
    pub fn peek(&self, key: &str) -> Option<String> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }
}

#[async_trait]
impl KeyValueBackend for MemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.peek(key))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        if let Some(delay) = self.write_delay {
            tokio::time::sleep(delay).await;
        }

        {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(capacity) = self.capacity_bytes {
                let used: usize = entries
                    .iter()
                    .filter(|(k, _)| k.as_str() != key)
                    .map(|(k, v)| k.len() + v.len())
                    .sum();
                let needed = used + key.len() + value.len();
                if needed > capacity {
                    return Err(Error::QuotaExceeded(format!(
                        "{} needs {} bytes, capacity is {}",
                        self.name, needed, capacity
                    )));
                }
            }
            entries.insert(key.to_string(), value.to_string());
        }

        self.writes.fetch_add(1, Ordering::SeqCst);
        self.write_log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((key.to_string(), value.to_string()));
        trace!(backend = %self.name, key, size_bytes = value.len(), "memory: set");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_delete_are_idempotent() {
        let backend = MemoryBackend::new();
        backend.set("a", "1").await.unwrap();
        backend.set("a", "1").await.unwrap();
        assert_eq!(backend.get("a").await.unwrap().as_deref(), Some("1"));

        backend.delete("a").await.unwrap();
        backend.delete("a").await.unwrap();
        assert!(backend.get("a").await.unwrap().is_none());
        assert_eq!(backend.write_count(), 2);
    }

    #[tokio::test]
    async fn test_capacity_limit_rejects_with_quota_error() {
        let backend = MemoryBackend::new().with_capacity_bytes(16);
        backend.set("k", "small").await.unwrap();

        let err = backend.set("k2", "this value is far too large").await.unwrap_err();
        assert!(err.is_quota_exceeded());
        assert!(backend.get("k2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_overwrite_does_not_double_count_capacity() {
        let backend = MemoryBackend::new().with_capacity_bytes(12);
        backend.set("key", "123456").await.unwrap();
        backend.set("key", "654321").await.unwrap();
        assert_eq!(backend.peek("key").as_deref(), Some("654321"));
    }

    #[tokio::test]
    async fn test_keys_lists_everything() {
        let backend = MemoryBackend::new();
        backend.seed("b", "2");
        backend.seed("a", "1");
        assert_eq!(backend.keys().await.unwrap(), vec!["a", "b"]);
        assert_eq!(backend.write_count(), 0);
    }
}
