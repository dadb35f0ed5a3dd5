//! Response cache metadata and the freshness rewrite policy
//!
//! The remote script is long-lived and must not be refetched on every run
//! merely because the origin sends short-lived cache headers. Before a
//! response is persisted its metadata is rewritten: past expiries are
//! extended forward by a retention window, origin cache directives are
//! stripped, and an explicit `max-age` reflecting the window is re-asserted.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Origin headers removed before a response is persisted, matched
/// case-insensitively.
pub const STRIPPED_DIRECTIVES: &[&str] = &["cache-control", "expires", "pragma", "etag", "vary"];

/// Metadata persisted alongside a cached response body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMetadata {
    /// Requested URL (the cache key)
    pub url: String,
    /// Response status code
    pub status: u16,
    /// Response content type, parameters stripped
    pub content_type: String,
    /// Response headers as received (rewritten before persistence)
    pub headers: Vec<(String, String)>,
    /// When the entry stops being served without revalidation
    pub expires_at: DateTime<Utc>,
    /// When the entry was stored
    pub stored_at: DateTime<Utc>,
}

impl CacheMetadata {
    /// Build metadata from a response, deriving the upstream-declared expiry.
    ///
    /// `Cache-Control: max-age` wins over `Expires`; a response declaring
    /// neither is treated as already expired, which the rewrite then extends.
    pub fn from_response(
        url: &str,
        status: u16,
        content_type: &str,
        headers: &[(String, String)],
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            url: url.to_string(),
            status,
            content_type: content_type.to_string(),
            headers: headers.to_vec(),
            expires_at: upstream_expiry(headers, now),
            stored_at: now,
        }
    }

    /// Apply the host's retention policy.
    ///
    /// A past expiry is extended forward from `now` by `retention`; an
    /// already-future expiry is never shortened. Origin cache directives are
    /// stripped and an explicit `max-age` for the window is appended.
    pub fn rewrite(mut self, now: DateTime<Utc>, retention: Duration) -> Self {
        let retention_secs = retention.as_secs();
        if self.expires_at < now {
            self.expires_at = now + ChronoDuration::seconds(retention_secs as i64);
            debug!(url = %self.url, expires_at = %self.expires_at, "extended past expiry");
        }
        self.headers.retain(|(name, value)| {
            let strip = STRIPPED_DIRECTIVES
                .iter()
                .any(|directive| name.eq_ignore_ascii_case(directive));
            if strip {
                debug!(header = %name, value = %value, "removing origin cache directive");
            }
            !strip
        });
        self.headers
            .push(("cache-control".to_string(), format!("max-age={retention_secs}")));
        self
    }

    /// Whether the entry may be served without touching the network
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Derive the expiry the origin declared, or a past instant if it didn't.
fn upstream_expiry(headers: &[(String, String)], now: DateTime<Utc>) -> DateTime<Utc> {
    for (name, value) in headers {
        if !name.eq_ignore_ascii_case("cache-control") {
            continue;
        }
        for directive in value.split(',') {
            let directive = directive.trim().to_ascii_lowercase();
            if let Some(secs) = directive.strip_prefix("max-age=") {
                if let Ok(secs) = secs.trim().parse::<i64>() {
                    return now + ChronoDuration::seconds(secs);
                }
            }
        }
    }
    for (name, value) in headers {
        if !name.eq_ignore_ascii_case("expires") {
            continue;
        }
        if let Ok(parsed) = DateTime::parse_from_rfc2822(value) {
            return parsed.with_timezone(&Utc);
        }
    }
    now - ChronoDuration::seconds(1)
}
