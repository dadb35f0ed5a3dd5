//! Cache-first HTTP session
//!
//! One session exists per script host. Every request prefers a fresh cache
//! entry over the network, injects configured default headers only where the
//! caller supplied none, follows redirects manually so a downgrade to a less
//! secure scheme can be refused, and rewrites response cache metadata before
//! persisting it.

use crate::error::{NetError, Result};
use crate::policy::CacheMetadata;
use crate::store::{CacheStore, CachedResponse, DiskCache};
use bytes::Bytes;
use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, LOCATION};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};
use url::Url;

/// Rewrites a matching `set-cookie` response value before it is exposed.
///
/// Narrow compatibility shim for origins that gate content behind a consent
/// cookie; not load-bearing for the rest of the layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CookiePatch {
    /// Applied when the cookie name contains this substring
    pub name_contains: String,
    /// Substring to replace in the cookie value
    pub from: String,
    /// Replacement
    pub to: String,
}

/// Session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Directory for the disk-backed response cache
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Maximum total size of the disk cache in bytes (0 = unbounded)
    #[serde(default = "default_max_cache_bytes")]
    pub max_cache_bytes: u64,

    /// Total-transfer timeout per request, in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Maximum redirect hops before giving up
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,

    /// Minimum retention window for cached responses, in seconds
    #[serde(default = "default_min_retention_secs")]
    pub min_retention_secs: u64,

    /// Headers added to every request that does not already carry them
    #[serde(default)]
    pub default_headers: Vec<(String, String)>,

    /// Optional set-cookie rewrite hooks
    #[serde(default)]
    pub cookie_patches: Vec<CookiePatch>,
}

fn default_cache_dir() -> PathBuf {
    std::env::temp_dir().join("remora-http-cache")
}

fn default_max_cache_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_max_redirects() -> usize {
    5
}

fn default_min_retention_secs() -> u64 {
    3600
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            max_cache_bytes: default_max_cache_bytes(),
            request_timeout_ms: default_request_timeout_ms(),
            max_redirects: default_max_redirects(),
            min_retention_secs: default_min_retention_secs(),
            default_headers: Vec::new(),
            cookie_patches: Vec::new(),
        }
    }
}

impl SessionConfig {
    /// Set the cache directory
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    /// Set the disk cache size bound
    pub fn with_max_cache_bytes(mut self, max_bytes: u64) -> Self {
        self.max_cache_bytes = max_bytes;
        self
    }

    /// Set the per-request transfer timeout
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the cached-response retention window
    pub fn with_min_retention(mut self, retention: Duration) -> Self {
        self.min_retention_secs = retention.as_secs();
        self
    }

    /// Add a default request header
    pub fn with_default_header(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.default_headers.push((name.into(), value.into()));
        self
    }

    /// Add a set-cookie rewrite hook
    pub fn with_cookie_patch(mut self, patch: CookiePatch) -> Self {
        self.cookie_patches.push(patch);
        self
    }

    /// Per-request transfer timeout
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Cached-response retention window
    pub fn min_retention(&self) -> Duration {
        Duration::from_secs(self.min_retention_secs)
    }
}

/// A completed fetch
#[derive(Debug, Clone)]
pub struct Fetched {
    /// Requested URL
    pub url: String,
    /// Response status
    pub status: u16,
    /// Content type, parameters stripped
    pub content_type: String,
    /// Response headers (after cookie patching)
    pub headers: Vec<(String, String)>,
    /// Response body
    pub body: Bytes,
}

impl Fetched {
    fn from_cached(url: &str, cached: CachedResponse) -> Self {
        Self {
            url: url.to_string(),
            status: cached.meta.status,
            content_type: cached.meta.content_type,
            headers: cached.meta.headers,
            body: cached.body,
        }
    }
}

/// Whether a redirect hop keeps at least the current level of transport
/// security (an `https` origin must never be redirected to plain `http`).
fn redirect_allowed(current: &Url, next: &Url) -> bool {
    current.scheme() != "https" || next.scheme() == "https"
}

/// Cache-first HTTP session
#[derive(Debug)]
pub struct HttpSession {
    client: reqwest::Client,
    cache: Arc<dyn CacheStore>,
    config: SessionConfig,
}

impl HttpSession {
    /// Create a session with a disk-backed cache in `config.cache_dir`
    pub fn new(config: SessionConfig) -> Result<Self> {
        let cache: Arc<dyn CacheStore> =
            Arc::new(DiskCache::new(&config.cache_dir, config.max_cache_bytes)?);
        Self::with_store(config, cache)
    }

    /// Create a session over an explicit cache store
    pub fn with_store(config: SessionConfig, cache: Arc<dyn CacheStore>) -> Result<Self> {
        // Redirects are followed manually so the scheme policy can be applied.
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|err| NetError::Request(err.to_string()))?;
        Ok(Self {
            client,
            cache,
            config,
        })
    }

    /// The underlying cache store
    pub fn cache(&self) -> &Arc<dyn CacheStore> {
        &self.cache
    }

    /// The session configuration
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// GET a URL with no caller headers
    pub async fn get(&self, url: &str) -> Result<Fetched> {
        self.request(url, HeaderMap::new()).await
    }

    /// GET a URL, preferring a fresh cache entry over the network
    pub async fn request(&self, url: &str, headers: HeaderMap) -> Result<Fetched> {
        let cached = match self.cache.load(url).await {
            Ok(cached) => cached,
            Err(err) => {
                // A broken cache must never take the network path down.
                warn!(%url, error = %err, "cache load failed");
                None
            }
        };
        if let Some(cached) = cached {
            if cached.meta.is_fresh(Utc::now()) {
                debug!(%url, "serving from cache");
                return Ok(Fetched::from_cached(url, cached));
            }
            trace!(%url, "cache entry stale, refetching");
        }
        let headers = self.inject_default_headers(url, headers);
        self.send(url, headers).await
    }

    fn inject_default_headers(&self, url: &str, mut headers: HeaderMap) -> HeaderMap {
        for (name, value) in &self.config.default_headers {
            let parsed_name = match HeaderName::from_bytes(name.as_bytes()) {
                Ok(parsed) => parsed,
                Err(_) => {
                    warn!(header = %name, "skipping invalid default header name");
                    continue;
                }
            };
            if headers.contains_key(&parsed_name) {
                debug!(%url, header = %name, "request already carries header, keeping caller value");
                continue;
            }
            match HeaderValue::from_str(value) {
                Ok(parsed_value) => {
                    headers.insert(parsed_name, parsed_value);
                }
                Err(_) => warn!(header = %name, "skipping invalid default header value"),
            }
        }
        headers
    }

    async fn send(&self, url: &str, headers: HeaderMap) -> Result<Fetched> {
        let mut current = Url::parse(url).map_err(|err| NetError::InvalidUrl {
            url: url.to_string(),
            message: err.to_string(),
        })?;

        for _ in 0..=self.config.max_redirects {
            trace!(url = %current, "sending request");
            let response = self
                .client
                .get(current.clone())
                .headers(headers.clone())
                .send()
                .await
                .map_err(|err| {
                    if err.is_timeout() {
                        NetError::Timeout(self.config.request_timeout())
                    } else {
                        NetError::Request(err.to_string())
                    }
                })?;

            let status = response.status();
            if status.is_redirection() {
                let location = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|value| value.to_str().ok())
                    .ok_or_else(|| {
                        NetError::Request(format!("redirect without location from {current}"))
                    })?;
                let next = current.join(location).map_err(|err| NetError::InvalidUrl {
                    url: location.to_string(),
                    message: err.to_string(),
                })?;
                if !redirect_allowed(&current, &next) {
                    return Err(NetError::InsecureRedirect {
                        from: current.to_string(),
                        to: next.to_string(),
                    });
                }
                debug!(from = %current, to = %next, "following redirect");
                current = next;
                continue;
            }

            if !status.is_success() {
                return Err(NetError::Status {
                    status: status.as_u16(),
                    url: current.to_string(),
                });
            }

            let mut response_headers: Vec<(String, String)> = response
                .headers()
                .iter()
                .map(|(name, value)| {
                    (
                        name.as_str().to_string(),
                        String::from_utf8_lossy(value.as_bytes()).into_owned(),
                    )
                })
                .collect();
            self.apply_cookie_patches(&mut response_headers);

            let content_type = response_headers
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
                .map(|(_, value)| value.split(';').next().unwrap_or(value).trim().to_string())
                .unwrap_or_default();

            let body = response
                .bytes()
                .await
                .map_err(|err| NetError::Request(err.to_string()))?;

            let now = Utc::now();
            let meta = CacheMetadata::from_response(
                url,
                status.as_u16(),
                &content_type,
                &response_headers,
                now,
            )
            .rewrite(now, self.config.min_retention());
            if let Err(err) = self.cache.store(url, meta, body.clone()).await {
                warn!(%url, error = %err, "failed to persist cache entry");
            }

            return Ok(Fetched {
                url: url.to_string(),
                status: status.as_u16(),
                content_type,
                headers: response_headers,
                body,
            });
        }

        Err(NetError::TooManyRedirects(url.to_string()))
    }

    fn apply_cookie_patches(&self, headers: &mut [(String, String)]) {
        if self.config.cookie_patches.is_empty() {
            return;
        }
        for (name, value) in headers.iter_mut() {
            if !name.eq_ignore_ascii_case("set-cookie") {
                continue;
            }
            for patch in &self.config.cookie_patches {
                let cookie_name = value.split('=').next().unwrap_or("");
                if cookie_name.contains(&patch.name_contains) && value.contains(&patch.from) {
                    debug!(cookie = %cookie_name, "patching cookie value");
                    *value = value.replace(&patch.from, &patch.to);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryCache;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn session_with_memory_cache(config: SessionConfig) -> (HttpSession, Arc<MemoryCache>) {
        let store = Arc::new(MemoryCache::new());
        let session = HttpSession::with_store(config, store.clone()).unwrap();
        (session, store)
    }

    #[test]
    fn test_redirect_scheme_policy() {
        let https = Url::parse("https://a.example/x").unwrap();
        let http = Url::parse("http://a.example/x").unwrap();
        let other_https = Url::parse("https://b.example/y").unwrap();

        assert!(redirect_allowed(&https, &other_https));
        assert!(redirect_allowed(&http, &https));
        assert!(redirect_allowed(&http, &http));
        assert!(!redirect_allowed(&https, &http));
    }

    #[tokio::test]
    async fn test_default_headers_do_not_overwrite_caller_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/script.js"))
            .and(header("x-app", "caller"))
            .and(header("user-agent", "remora"))
            .respond_with(ResponseTemplate::new(200).set_body_raw("ok", "text/plain"))
            .expect(1)
            .mount(&server)
            .await;

        let config = SessionConfig::default()
            .with_default_header("user-agent", "remora")
            .with_default_header("x-app", "injected");
        let (session, _) = session_with_memory_cache(config);

        let mut caller_headers = HeaderMap::new();
        caller_headers.insert("x-app", HeaderValue::from_static("caller"));

        let url = format!("{}/script.js", server.uri());
        let fetched = session.request(&url, caller_headers).await.unwrap();
        assert_eq!(fetched.status, 200);
    }

    #[tokio::test]
    async fn test_cache_first_avoids_second_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/script.js"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw("function f(){}", "application/javascript"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let (session, store) = session_with_memory_cache(SessionConfig::default());
        let url = format!("{}/script.js", server.uri());

        let first = session.get(&url).await.unwrap();
        assert_eq!(first.body, Bytes::from_static(b"function f(){}"));
        assert_eq!(store.len(), 1);

        // Second fetch is served from the rewritten (now fresh) cache entry.
        let second = session.get(&url).await.unwrap();
        assert_eq!(second.body, first.body);
        assert_eq!(second.content_type, "application/javascript");
    }

    #[tokio::test]
    async fn test_stored_metadata_is_rewritten() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/script.js"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("cache-control", "no-store, max-age=0")
                    .insert_header("pragma", "no-cache")
                    .set_body_raw("x", "application/javascript"),
            )
            .mount(&server)
            .await;

        let (session, store) = session_with_memory_cache(SessionConfig::default());
        let url = format!("{}/script.js", server.uri());
        session.get(&url).await.unwrap();

        let cached = store.load(&url).await.unwrap().expect("entry stored");
        assert!(cached.meta.is_fresh(Utc::now()));
        assert!(!cached
            .meta
            .headers
            .iter()
            .any(|(name, _)| name.eq_ignore_ascii_case("pragma")));
        assert!(cached
            .meta
            .headers
            .contains(&("cache-control".to_string(), "max-age=3600".to_string())));
    }

    #[tokio::test]
    async fn test_non_success_status_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing.js"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let (session, store) = session_with_memory_cache(SessionConfig::default());
        let url = format!("{}/missing.js", server.uri());

        let err = session.get(&url).await.unwrap_err();
        assert!(matches!(err, NetError::Status { status: 404, .. }));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_redirects_are_followed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/old.js"))
            .respond_with(ResponseTemplate::new(302).insert_header("location", "/new.js"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/new.js"))
            .respond_with(ResponseTemplate::new(200).set_body_raw("moved", "text/plain"))
            .mount(&server)
            .await;

        let (session, _) = session_with_memory_cache(SessionConfig::default());
        let url = format!("{}/old.js", server.uri());

        let fetched = session.get(&url).await.unwrap();
        assert_eq!(fetched.body, Bytes::from_static(b"moved"));
    }

    #[tokio::test]
    async fn test_transfer_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/slow.js"))
            .respond_with(
                ResponseTemplate::new(200).set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let config = SessionConfig::default().with_request_timeout(Duration::from_millis(100));
        let (session, _) = session_with_memory_cache(config);
        let url = format!("{}/slow.js", server.uri());

        let err = session.get(&url).await.unwrap_err();
        assert!(matches!(err, NetError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_cookie_patch_rewrites_pending_value() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/script.js"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("set-cookie", "CONSENT=PENDING+123; Path=/")
                    .set_body_raw("x", "application/javascript"),
            )
            .mount(&server)
            .await;

        let config = SessionConfig::default().with_cookie_patch(CookiePatch {
            name_contains: "CONSENT".into(),
            from: "PENDING".into(),
            to: "YES".into(),
        });
        let (session, _) = session_with_memory_cache(config);
        let url = format!("{}/script.js", server.uri());

        let fetched = session.get(&url).await.unwrap();
        let cookie = fetched
            .headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("set-cookie"))
            .map(|(_, value)| value.clone())
            .expect("set-cookie present");
        assert_eq!(cookie, "CONSENT=YES+123; Path=/");
    }
}
