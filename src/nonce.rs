//! Strictly increasing request nonces.
//!
//! Nonces are derived from wall-clock milliseconds (`now_ms * 10000 + 40`) so
//! a fresh process starts well above anything a previous process issued, and
//! are forced past the persisted last value (`last + 40`) when the clock
//! stalls or regresses. The read-modify-write happens under a TTL lock in the
//! shared cache, so concurrent callers and processes never observe the same
//! counter value.

use crate::cache::{now_millis, Cache};
use crate::config::NonceConfig;
use crate::error::{Error, Result};
use crate::types::Address;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Scale applied to wall-clock milliseconds.
pub const NONCE_TIME_SCALE: u64 = 10_000;

/// Stride between consecutive nonces.
pub const NONCE_STRIDE: u64 = 40;

/// Allocates nonces for one user.
pub struct NonceAllocator {
    cache: Arc<dyn Cache>,
    counter_key: String,
    lock_key: String,
    config: NonceConfig,
}

impl NonceAllocator {
    /// Create an allocator for `user` backed by the shared `cache`.
    #[must_use]
    pub fn new(cache: Arc<dyn Cache>, user: Address, config: NonceConfig) -> Self {
        Self {
            cache,
            counter_key: format!("nonce:{user}"),
            lock_key: format!("nonce-lock:{user}"),
            config,
        }
    }

    /// Return the next nonce.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Busy`] if the lock cannot be acquired within the retry
    /// budget, or a cache error if the counter cannot be read or persisted.
    pub async fn next_nonce(&self) -> Result<u64> {
        let token = self.acquire().await?;
        let result = self.advance().await;
        self.release(&token).await?;
        result
    }

    async fn advance(&self) -> Result<u64> {
        let last = match self.cache.get(&self.counter_key).await? {
            Some(raw) => raw
                .parse::<u64>()
                .map_err(|e| Error::Cache(format!("Corrupt nonce counter {raw:?}: {e}")))?,
            None => 0,
        };

        let mut candidate = now_millis()
            .saturating_mul(NONCE_TIME_SCALE)
            .saturating_add(NONCE_STRIDE);
        if last >= candidate {
            candidate = last
                .checked_add(NONCE_STRIDE)
                .ok_or_else(|| Error::Cache("nonce counter exhausted".to_string()))?;
        }

        self.cache
            .set(&self.counter_key, &candidate.to_string(), None)
            .await?;
        trace!("Allocated nonce {candidate} (last {last})");
        Ok(candidate)
    }

    async fn acquire(&self) -> Result<String> {
        let token = format!("{:032x}", rand::random::<u128>());
        let ttl = Duration::from_millis(self.config.lock_ttl_ms);
        let interval = Duration::from_millis(self.config.poll_interval_ms);

        for attempt in 0..self.config.lock_retries {
            if self.cache.set_if_absent(&self.lock_key, &token, ttl).await? {
                if attempt > 0 {
                    debug!("Nonce lock acquired after {attempt} polls");
                }
                return Ok(token);
            }
            tokio::time::sleep(interval).await;
        }

        Err(Error::Busy(format!(
            "could not acquire {} after {} attempts",
            self.lock_key, self.config.lock_retries
        )))
    }

    async fn release(&self, token: &str) -> Result<()> {
        // Only drop the lock if it is still ours; an expired lock may have
        // been taken over by another caller.
        if self.cache.get(&self.lock_key).await?.as_deref() == Some(token) {
            self.cache.delete(&self.lock_key).await?;
        }
        Ok(())
    }
}
