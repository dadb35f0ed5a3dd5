//! TTL-bounded caching fetcher
//!
//! A second, finer cache layer on top of [`HttpSession`]: completed fetches
//! are kept in memory for a configurable window so repeated lookups of the
//! same URL (the script body above all) cost nothing, and concurrent
//! requesters of a URL share one in-flight network fetch instead of
//! spawning duplicates.

use crate::error::{NetError, Result};
use crate::session::{Fetched, HttpSession};
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

/// Decides whether a completed fetch may be cached; rejected bodies yield
/// [`NetError::RejectedBody`] and are never persisted.
pub type Validator = Arc<dyn Fn(&Fetched) -> bool + Send + Sync>;

/// Fetcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetcherConfig {
    /// How long a completed fetch stays served from memory, in seconds
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,

    /// Entry-count bound; 0 exempts the cache from size-based eviction
    #[serde(default)]
    pub max_entries: usize,
}

fn default_max_age_secs() -> u64 {
    3600
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            max_age_secs: default_max_age_secs(),
            max_entries: 0,
        }
    }
}

impl FetcherConfig {
    /// Set the memory TTL
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age_secs = max_age.as_secs();
        self
    }

    /// Set the entry-count bound (0 = unbounded)
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    /// Memory TTL
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }
}

struct MemEntry {
    fetched: Fetched,
    expires_at: Instant,
}

type FetchFuture = Shared<BoxFuture<'static, Result<Fetched>>>;

struct FetcherInner {
    session: Arc<HttpSession>,
    config: FetcherConfig,
    entries: DashMap<String, MemEntry>,
    validators: parking_lot::RwLock<HashMap<String, Validator>>,
    inflight: Mutex<HashMap<String, FetchFuture>>,
}

impl FetcherInner {
    fn insert(&self, url: String, fetched: Fetched) {
        if self.config.max_entries > 0 && self.entries.len() >= self.config.max_entries {
            self.evict_one();
        }
        self.entries.insert(
            url,
            MemEntry {
                fetched,
                expires_at: Instant::now() + self.config.max_age(),
            },
        );
    }

    // Drops the soonest-expiring entry, which is also the oldest insertion.
    fn evict_one(&self) {
        let victim = self
            .entries
            .iter()
            .min_by_key(|entry| entry.value().expires_at)
            .map(|entry| entry.key().clone());
        if let Some(url) = victim {
            debug!(%url, "evicting fetch cache entry");
            self.entries.remove(&url);
        }
    }
}

/// Caching fetcher over an [`HttpSession`]
#[derive(Clone)]
pub struct CachedFetcher {
    inner: Arc<FetcherInner>,
}

impl fmt::Debug for CachedFetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedFetcher")
            .field("config", &self.inner.config)
            .field("entries", &self.inner.entries.len())
            .finish()
    }
}

impl CachedFetcher {
    /// Create a fetcher over a session
    pub fn new(session: Arc<HttpSession>, config: FetcherConfig) -> Self {
        Self {
            inner: Arc::new(FetcherInner {
                session,
                config,
                entries: DashMap::new(),
                validators: parking_lot::RwLock::new(HashMap::new()),
                inflight: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Register a cache-admission validator for a content type
    pub fn register_validator(
        &self,
        content_type: &str,
        validator: impl Fn(&Fetched) -> bool + Send + Sync + 'static,
    ) {
        self.inner
            .validators
            .write()
            .insert(content_type.to_ascii_lowercase(), Arc::new(validator));
    }

    /// The underlying session
    pub fn session(&self) -> &Arc<HttpSession> {
        &self.inner.session
    }

    /// Number of live memory entries
    pub fn entry_count(&self) -> usize {
        self.inner.entries.len()
    }

    /// Drop every memory entry
    pub fn clear(&self) {
        self.inner.entries.clear();
    }

    /// Fetch a URL, serving a fresh memory entry without a network round-trip.
    ///
    /// Concurrent calls for one URL share a single in-flight fetch.
    pub async fn get(&self, url: &str) -> Result<Fetched> {
        if let Some(entry) = self.inner.entries.get(url) {
            if entry.expires_at > Instant::now() {
                trace!(%url, "fetch cache hit");
                return Ok(entry.fetched.clone());
            }
        }
        self.inner
            .entries
            .remove_if(url, |_, entry| entry.expires_at <= Instant::now());

        let fetch = {
            let mut inflight = self.inner.inflight.lock().await;
            match inflight.get(url) {
                Some(existing) => {
                    trace!(%url, "joining in-flight fetch");
                    existing.clone()
                }
                None => {
                    trace!(%url, "fetch cache miss");
                    let fetch = Self::fetch_uncached(self.inner.clone(), url.to_string())
                        .boxed()
                        .shared();
                    inflight.insert(url.to_string(), fetch.clone());
                    fetch
                }
            }
        };

        let result = fetch.await;
        self.inner.inflight.lock().await.remove(url);
        result
    }

    async fn fetch_uncached(inner: Arc<FetcherInner>, url: String) -> Result<Fetched> {
        let fetched = inner.session.get(&url).await?;
        let validator = inner
            .validators
            .read()
            .get(&fetched.content_type.to_ascii_lowercase())
            .cloned();
        if let Some(validator) = validator {
            if !validator(&fetched) {
                warn!(%url, content_type = %fetched.content_type, "fetched body rejected by validator");
                return Err(NetError::RejectedBody { url });
            }
        }
        inner.insert(url, fetched.clone());
        Ok(fetched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionConfig;
    use crate::store::MemoryCache;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fetcher(config: FetcherConfig) -> CachedFetcher {
        let session = HttpSession::with_store(
            SessionConfig::default(),
            Arc::new(MemoryCache::new()),
        )
        .unwrap();
        CachedFetcher::new(Arc::new(session), config)
    }

    #[tokio::test]
    async fn test_second_fetch_served_from_memory() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/script.js"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw("function f(){}", "application/javascript"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = fetcher(FetcherConfig::default());
        let url = format!("{}/script.js", server.uri());

        let first = fetcher.get(&url).await.unwrap();
        let second = fetcher.get(&url).await.unwrap();
        assert_eq!(first.body, second.body);
        assert_eq!(fetcher.entry_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_fetches_share_one_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/script.js"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(Duration::from_millis(50))
                    .set_body_raw("x", "application/javascript"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = fetcher(FetcherConfig::default());
        let url = format!("{}/script.js", server.uri());

        let (a, b) = tokio::join!(fetcher.get(&url), fetcher.get(&url));
        assert!(a.is_ok());
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_empty_body_rejected_and_not_cached() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/empty.js"))
            .respond_with(ResponseTemplate::new(200).set_body_raw("", "application/javascript"))
            .mount(&server)
            .await;

        let fetcher = fetcher(FetcherConfig::default());
        fetcher.register_validator("application/javascript", |fetched| !fetched.body.is_empty());
        let url = format!("{}/empty.js", server.uri());

        let err = fetcher.get(&url).await.unwrap_err();
        assert!(matches!(err, NetError::RejectedBody { .. }));
        assert_eq!(fetcher.entry_count(), 0);
    }

    #[tokio::test]
    async fn test_validator_only_gates_matching_content_type() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/empty.txt"))
            .respond_with(ResponseTemplate::new(200).set_body_raw("", "text/plain"))
            .mount(&server)
            .await;

        let fetcher = fetcher(FetcherConfig::default());
        fetcher.register_validator("application/javascript", |fetched| !fetched.body.is_empty());
        let url = format!("{}/empty.txt", server.uri());

        // No validator registered for text/plain: empty body passes through.
        let fetched = fetcher.get(&url).await.unwrap();
        assert!(fetched.body.is_empty());
        assert_eq!(fetcher.entry_count(), 1);
    }

    #[tokio::test]
    async fn test_entry_bound_evicts_oldest() {
        let server = MockServer::start().await;
        for name in ["a.js", "b.js"] {
            Mock::given(method("GET"))
                .and(path(format!("/{name}")))
                .respond_with(ResponseTemplate::new(200).set_body_raw("x", "application/javascript"))
                .mount(&server)
                .await;
        }

        let fetcher = fetcher(FetcherConfig::default().with_max_entries(1));
        fetcher.get(&format!("{}/a.js", server.uri())).await.unwrap();
        fetcher.get(&format!("{}/b.js", server.uri())).await.unwrap();
        assert_eq!(fetcher.entry_count(), 1);
    }
}
