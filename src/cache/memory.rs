//! In-process cache.

use super::{expiry_from, is_expired, Cache};
use crate::error::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at_ms: Option<u64>,
}

/// Process-local cache backed by a mutex-guarded map.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|e| !is_expired(e.expires_at_ms))
            .count()
    }

    /// Returns true if there are no live entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if is_expired(entry.expires_at_ms) => {
                entries.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.entries.lock().insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at_ms: expiry_from(ttl),
            },
        );
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get(key) {
            if !is_expired(entry.expires_at_ms) {
                return Ok(false);
            }
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at_ms: expiry_from(Some(ttl)),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.entries.lock().clear();
        Ok(())
    }
}
