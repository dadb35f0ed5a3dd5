//! # Remora Network Layer
//!
//! HTTP plumbing for the Remora script host:
//!
//! - [`HttpSession`] - cache-first HTTP client that injects default headers,
//!   refuses insecure redirects and rewrites response cache metadata so the
//!   host, not the origin server, governs freshness
//! - [`CacheStore`] - pluggable response cache storage, with disk-backed
//!   ([`DiskCache`]) and in-memory ([`MemoryCache`]) implementations
//! - [`CachedFetcher`] - TTL-bounded in-memory cache over a session with
//!   content validators and in-flight request deduplication

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod error;
pub mod fetcher;
pub mod policy;
pub mod session;
pub mod store;

pub use error::{NetError, Result};
pub use fetcher::{CachedFetcher, FetcherConfig};
pub use policy::CacheMetadata;
pub use session::{CookiePatch, Fetched, HttpSession, SessionConfig};
pub use store::{CacheStore, CachedResponse, DiskCache, MemoryCache};
