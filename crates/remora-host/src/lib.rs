//! # Remora Host
//!
//! Embeds a rhai scripting runtime to run a single remote script on demand:
//! the host fetches the script through the caching network layer, evaluates
//! it, then dispatches named function calls whose results come back
//! asynchronously through per-call [`ResultChannel`]s. The script has no
//! native networking or timers; the host injects both into the engine's
//! global namespace.

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod config;
pub mod host;
pub mod timer;

mod bindings;
mod sandbox;

pub use config::{EngineLimits, HostConfig};
pub use host::ScriptHost;
pub use timer::TimerRegistry;

pub use remora_core::{CallError, CallOutcome, HostEvent, HostState, ResultChannel};

use remora_net::{CachedFetcher, FetcherConfig, HttpSession};
use std::sync::Arc;

/// Build the fetcher the host loads scripts through: near-indefinite
/// retention (the default TTL, exempt from size eviction) and a validator
/// that refuses to treat an empty body as a script.
pub fn script_fetcher(session: Arc<HttpSession>) -> CachedFetcher {
    let fetcher = CachedFetcher::new(session, FetcherConfig::default());
    for content_type in ["application/javascript", "text/javascript"] {
        fetcher.register_validator(content_type, |fetched| !fetched.body.is_empty());
    }
    fetcher
}

/// Prelude with commonly used types
pub mod prelude {
    pub use crate::config::{EngineLimits, HostConfig};
    pub use crate::host::ScriptHost;
    pub use crate::script_fetcher;
    pub use remora_core::{CallError, CallOutcome, HostEvent, HostState, ResultChannel};
    pub use remora_net::{CachedFetcher, FetcherConfig, HttpSession, SessionConfig};
}
