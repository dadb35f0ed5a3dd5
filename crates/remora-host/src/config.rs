//! Host configuration

use rhai::Engine;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Script host configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// URL of the remote script; initialization starts on spawn when set
    #[serde(default)]
    pub script_url: Option<String>,

    /// Delay between retries of calls issued before the host is ready,
    /// in milliseconds
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,

    /// Retry attempts before a queued call is failed with a not-ready error.
    ///
    /// The upstream behavior retried forever; set this to `u32::MAX` to
    /// restore that.
    #[serde(default = "default_max_call_retries")]
    pub max_call_retries: u32,

    /// Engine hardening limits
    #[serde(default)]
    pub limits: EngineLimits,
}

fn default_retry_interval_ms() -> u64 {
    1000
}

fn default_max_call_retries() -> u32 {
    60
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            script_url: None,
            retry_interval_ms: default_retry_interval_ms(),
            max_call_retries: default_max_call_retries(),
            limits: EngineLimits::default(),
        }
    }
}

impl HostConfig {
    /// Set the script URL
    pub fn with_script_url(mut self, url: impl Into<String>) -> Self {
        self.script_url = Some(url.into());
        self
    }

    /// Set the call retry interval
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the call retry budget
    pub fn with_max_call_retries(mut self, retries: u32) -> Self {
        self.max_call_retries = retries;
        self
    }

    /// Set the engine limits
    pub fn with_limits(mut self, limits: EngineLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Call retry interval
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

/// Engine hardening limits; 0 disables a limit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineLimits {
    /// Operations per evaluation before the engine aborts
    #[serde(default = "default_max_operations")]
    pub max_operations: u64,

    /// Maximum string size in bytes
    #[serde(default = "default_max_string_size")]
    pub max_string_size: usize,

    /// Maximum array length
    #[serde(default = "default_max_array_size")]
    pub max_array_size: usize,

    /// Maximum object map size
    #[serde(default = "default_max_map_size")]
    pub max_map_size: usize,

    /// Maximum expression nesting at global level
    #[serde(default = "default_max_expr_depth")]
    pub max_expr_depth: usize,

    /// Maximum expression nesting inside functions
    #[serde(default = "default_max_function_expr_depth")]
    pub max_function_expr_depth: usize,
}

fn default_max_operations() -> u64 {
    1_000_000
}

fn default_max_string_size() -> usize {
    4 * 1024 * 1024
}

fn default_max_array_size() -> usize {
    100_000
}

fn default_max_map_size() -> usize {
    100_000
}

fn default_max_expr_depth() -> usize {
    128
}

fn default_max_function_expr_depth() -> usize {
    64
}

impl Default for EngineLimits {
    fn default() -> Self {
        Self {
            max_operations: default_max_operations(),
            max_string_size: default_max_string_size(),
            max_array_size: default_max_array_size(),
            max_map_size: default_max_map_size(),
            max_expr_depth: default_max_expr_depth(),
            max_function_expr_depth: default_max_function_expr_depth(),
        }
    }
}

impl EngineLimits {
    /// Apply the limits to an engine
    pub fn apply(&self, engine: &mut Engine) {
        engine.set_max_expr_depths(self.max_expr_depth, self.max_function_expr_depth);
        engine.set_max_operations(self.max_operations);
        engine.set_max_string_size(self.max_string_size);
        engine.set_max_array_size(self.max_array_size);
        engine.set_max_map_size(self.max_map_size);
    }
}
