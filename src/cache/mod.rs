//! Key-value caches with optional expiry.
//!
//! The broker keeps two kinds of state outside the chain:
//!
//! - **persistent** state that must survive restarts (the nonce counter and
//!   its lock), held in a [`FileCache`];
//! - **ephemeral** advisory state (fee counters, service info, attested
//!   signing addresses), held in a [`MemoryCache`].
//!
//! Both implement the [`Cache`] capability trait so components only depend on
//! the trait and either backend can be injected.

mod file;
mod memory;

pub use file::FileCache;
pub use memory::MemoryCache;

use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;

/// A string key-value store with per-entry expiry.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Read a live entry.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write an entry, replacing any previous value.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Write an entry only if no live entry exists.
    ///
    /// Returns `true` if the entry was written. This is the primitive the
    /// nonce lock is built on, so implementations must make it atomic with
    /// respect to every other caller sharing the backend.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Remove an entry. Removing a missing entry is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Remove every entry.
    async fn clear(&self) -> Result<()>;
}

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    let elapsed = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

fn expiry_from(ttl: Option<Duration>) -> Option<u64> {
    ttl.map(|ttl| {
        now_millis().saturating_add(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX))
    })
}

fn is_expired(expires_at_ms: Option<u64>) -> bool {
    expires_at_ms.is_some_and(|at| at <= now_millis())
}
