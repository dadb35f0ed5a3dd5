//! Response cache storage backends

use crate::error::Result;
use crate::policy::CacheMetadata;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, trace, warn};

/// A cached response: rewritten metadata plus the body bytes
#[derive(Debug, Clone)]
pub struct CachedResponse {
    /// Rewritten cache metadata
    pub meta: CacheMetadata,
    /// Response body
    pub body: Bytes,
}

/// Response cache storage.
///
/// Implementations store already-rewritten metadata; freshness policy lives
/// in the session, not here.
#[async_trait]
pub trait CacheStore: Send + Sync + fmt::Debug {
    /// Load the entry for a URL, if present
    async fn load(&self, url: &str) -> Result<Option<CachedResponse>>;

    /// Store or replace the entry for a URL
    async fn store(&self, url: &str, meta: CacheMetadata, body: Bytes) -> Result<()>;

    /// Remove the entry for a URL; absent entries are not an error
    async fn remove(&self, url: &str) -> Result<()>;

    /// Drop every entry
    async fn clear(&self) -> Result<()>;
}

/// Disk-backed cache: one `<sha256(url)>.meta` / `<sha256(url)>.body` file
/// pair per entry, bounded by a maximum total size (0 = unbounded).
///
/// When storing pushes the directory over the bound, oldest-stored entries
/// are evicted until it fits again; the entry just stored is never evicted
/// by its own insertion.
#[derive(Debug, Clone)]
pub struct DiskCache {
    dir: PathBuf,
    max_bytes: u64,
}

impl DiskCache {
    /// Open (creating if needed) a cache directory
    pub fn new(dir: impl Into<PathBuf>, max_bytes: u64) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir, max_bytes })
    }

    /// The cache directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn key(url: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(url.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    fn meta_path(&self, url: &str) -> PathBuf {
        self.dir.join(format!("{}.meta", Self::key(url)))
    }

    fn body_path(&self, url: &str) -> PathBuf {
        self.dir.join(format!("{}.body", Self::key(url)))
    }

    async fn enforce_size_bound(&self, keep_url: &str) -> Result<()> {
        let mut total = 0u64;
        let mut bodies: Vec<(PathBuf, u64, SystemTime)> = Vec::new();

        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let meta = entry.metadata().await?;
            if !meta.is_file() {
                continue;
            }
            total += meta.len();
            if path.extension().map_or(false, |ext| ext == "body") {
                let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                bodies.push((path, meta.len(), modified));
            }
        }

        if total <= self.max_bytes {
            return Ok(());
        }

        bodies.sort_by_key(|(_, _, modified)| *modified);
        let keep = self.body_path(keep_url);
        for (path, len, _) in bodies {
            if total <= self.max_bytes {
                break;
            }
            if path == keep {
                continue;
            }
            let meta_path = path.with_extension("meta");
            let meta_len = tokio::fs::metadata(&meta_path)
                .await
                .map(|m| m.len())
                .unwrap_or(0);
            debug!(path = %path.display(), "evicting cache entry over size bound");
            let _ = tokio::fs::remove_file(&path).await;
            let _ = tokio::fs::remove_file(&meta_path).await;
            total = total.saturating_sub(len + meta_len);
        }
        Ok(())
    }
}

#[async_trait]
impl CacheStore for DiskCache {
    async fn load(&self, url: &str) -> Result<Option<CachedResponse>> {
        let meta_bytes = match tokio::fs::read(self.meta_path(url)).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let meta: CacheMetadata = match serde_json::from_slice(&meta_bytes) {
            Ok(meta) => meta,
            Err(err) => {
                // A corrupt entry is a miss, not a failure.
                warn!(%url, error = %err, "discarding unreadable cache metadata");
                self.remove(url).await?;
                return Ok(None);
            }
        };
        let body = match tokio::fs::read(self.body_path(url)).await {
            Ok(bytes) => Bytes::from(bytes),
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        trace!(%url, "disk cache hit");
        Ok(Some(CachedResponse { meta, body }))
    }

    async fn store(&self, url: &str, meta: CacheMetadata, body: Bytes) -> Result<()> {
        let meta_json =
            serde_json::to_vec(&meta).map_err(|err| crate::NetError::Cache(err.to_string()))?;
        tokio::fs::write(self.body_path(url), &body).await?;
        tokio::fs::write(self.meta_path(url), meta_json).await?;
        trace!(%url, bytes = body.len(), "stored cache entry");
        if self.max_bytes > 0 {
            self.enforce_size_bound(url).await?;
        }
        Ok(())
    }

    async fn remove(&self, url: &str) -> Result<()> {
        for path in [self.meta_path(url), self.body_path(url)] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.metadata().await?.is_file() {
                let _ = tokio::fs::remove_file(entry.path()).await;
            }
        }
        debug!(dir = %self.dir.display(), "cleared disk cache");
        Ok(())
    }
}

/// In-memory cache store, mainly for tests
#[derive(Debug, Clone, Default)]
pub struct MemoryCache {
    entries: DashMap<String, CachedResponse>,
}

impl MemoryCache {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn load(&self, url: &str) -> Result<Option<CachedResponse>> {
        Ok(self.entries.get(url).map(|entry| entry.value().clone()))
    }

    async fn store(&self, url: &str, meta: CacheMetadata, body: Bytes) -> Result<()> {
        self.entries
            .insert(url.to_string(), CachedResponse { meta, body });
        Ok(())
    }

    async fn remove(&self, url: &str) -> Result<()> {
        self.entries.remove(url);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.entries.clear();
        Ok(())
    }
}
