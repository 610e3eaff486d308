//! File-backed cache, one file per key.
//!
//! ```text
//! {root}/{hex(key)}.entry
//! ```
//!
//! Writes go through a temp file + rename. `set_if_absent` writes a temp file
//! and hard-links it into place, which fails if the entry exists, so the entry
//! is never visible half-written and only one caller can create it. Replacing
//! an expired entry happens under an advisory lock on `{hex(key)}.guard`, so
//! the nonce lock built on this holds between independent broker processes.

use super::{expiry_from, is_expired, Cache};
use crate::error::{Error, Result};
use async_trait::async_trait;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, trace};

const ENTRY_EXTENSION: &str = "entry";
const GUARD_EXTENSION: &str = "guard";

#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    value: String,
    expires_at_ms: Option<u64>,
}

/// Persistent cache rooted in a directory.
#[derive(Debug, Clone)]
pub struct FileCache {
    root: PathBuf,
}

impl FileCache {
    /// Open (creating if needed) a cache rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .await
            .map_err(|e| Error::Cache(format!("Failed to create cache directory: {e}")))?;
        debug!("Initialized file cache at {:?}", root);
        Ok(Self { root })
    }

    /// Root directory of this cache.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.root
            .join(format!("{}.{ENTRY_EXTENSION}", hex::encode(key.as_bytes())))
    }

    fn encode(value: &str, ttl: Option<Duration>) -> Result<Vec<u8>> {
        serde_json::to_vec(&StoredEntry {
            value: value.to_string(),
            expires_at_ms: expiry_from(ttl),
        })
        .map_err(|e| Error::Serialization(format!("Failed to encode cache entry: {e}")))
    }

    async fn read_entry(path: &Path) -> Result<Option<StoredEntry>> {
        match fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| Error::Cache(format!("Corrupt cache entry {path:?}: {e}"))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Cache(format!("Failed to read cache entry: {e}"))),
        }
    }

    async fn remove(path: &Path) -> Result<()> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Cache(format!("Failed to remove cache entry: {e}"))),
        }
    }

    async fn write_temp(path: &Path, contents: &[u8]) -> Result<PathBuf> {
        let suffix: u64 = rand::random();
        let temp_path = path.with_extension(format!("{suffix:016x}.tmp"));
        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| Error::Cache(format!("Failed to create temp file: {e}")))?;
        file.write_all(contents)
            .await
            .map_err(|e| Error::Cache(format!("Failed to write cache entry: {e}")))?;
        file.flush()
            .await
            .map_err(|e| Error::Cache(format!("Failed to flush cache entry: {e}")))?;
        Ok(temp_path)
    }

    /// Publish `contents` at `path` unless an entry already exists.
    async fn try_create(path: &Path, contents: &[u8]) -> Result<bool> {
        let temp_path = Self::write_temp(path, contents).await?;
        let linked = fs::hard_link(&temp_path, path).await;
        Self::remove(&temp_path).await?;
        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(Error::Cache(format!("Failed to create cache entry: {e}"))),
        }
    }

    /// Take the replacement guard for `path` without blocking.
    ///
    /// Returns `None` if another caller holds it. The guard is released when
    /// the returned file is dropped.
    async fn try_guard(path: &Path) -> Result<Option<std::fs::File>> {
        let guard = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.with_extension(GUARD_EXTENSION))
            .await
            .map_err(|e| Error::Cache(format!("Failed to open entry guard: {e}")))?
            .into_std()
            .await;
        match guard.try_lock_exclusive() {
            Ok(()) => Ok(Some(guard)),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(e) => Err(Error::Cache(format!("Failed to lock entry guard: {e}"))),
        }
    }

    /// Whether the entry at `path` may be replaced by a new `ttl` holder.
    ///
    /// An unparsable entry counts as stale once its file is older than `ttl`.
    async fn is_stale(path: &Path, ttl: Duration) -> Result<bool> {
        match Self::read_entry(path).await {
            Ok(Some(entry)) => Ok(is_expired(entry.expires_at_ms)),
            Ok(None) => Ok(true),
            Err(e) => {
                let modified = match fs::metadata(path).await.and_then(|m| m.modified()) {
                    Ok(modified) => modified,
                    Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
                    Err(e) => {
                        return Err(Error::Cache(format!("Failed to stat cache entry: {e}")))
                    }
                };
                let age = SystemTime::now()
                    .duration_since(modified)
                    .unwrap_or_default();
                debug!("Unreadable cache entry {path:?}, {age:?} old: {e}");
                Ok(age >= ttl)
            }
        }
    }
}

#[async_trait]
impl Cache for FileCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.entry_path(key);
        match Self::read_entry(&path).await? {
            Some(entry) if is_expired(entry.expires_at_ms) => {
                trace!("Cache entry {key} expired");
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let path = self.entry_path(key);
        let contents = Self::encode(value, ttl)?;

        // Atomic write: temp file + rename
        let temp_path = Self::write_temp(&path, &contents).await?;
        fs::rename(&temp_path, &path)
            .await
            .map_err(|e| Error::Cache(format!("Failed to rename temp file: {e}")))?;
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let path = self.entry_path(key);
        let contents = Self::encode(value, Some(ttl))?;

        if Self::try_create(&path, &contents).await? {
            return Ok(true);
        }

        // Only one caller may judge and drop a stale entry at a time, and the
        // entry cannot be recreated while it exists, so nobody deletes a fresh
        // entry by mistake.
        let Some(_guard) = Self::try_guard(&path).await? else {
            return Ok(false);
        };
        if !Self::is_stale(&path, ttl).await? {
            return Ok(false);
        }

        trace!("Replacing expired cache entry {key}");
        Self::remove(&path).await?;
        Self::try_create(&path, &contents).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        Self::remove(&self.entry_path(key)).await
    }

    async fn clear(&self) -> Result<()> {
        let mut entries = fs::read_dir(&self.root)
            .await
            .map_err(|e| Error::Cache(format!("Failed to list cache directory: {e}")))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::Cache(format!("Failed to list cache directory: {e}")))?
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == ENTRY_EXTENSION) {
                Self::remove(&path).await?;
            }
        }
        Ok(())
    }
}
