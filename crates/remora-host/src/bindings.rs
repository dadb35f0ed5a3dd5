//! Script-facing globals
//!
//! Installed into every freshly built engine: timers, the sandboxed
//! sub-context evaluator, asynchronous fetches through the caching layer,
//! result-channel methods and logging.

use crate::config::EngineLimits;
use crate::host::HostMsg;
use crate::sandbox;
use crate::timer::TimerRegistry;
use remora_core::{CallError, ResultChannel};
use remora_net::CachedFetcher;
use rhai::{Array, Dynamic, Engine, FnPtr, Map};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Negative delays behave like zero
fn delay_from(millis: i64) -> Duration {
    Duration::from_millis(millis.max(0) as u64)
}

pub(crate) fn install(
    engine: &mut Engine,
    tx: mpsc::WeakUnboundedSender<HostMsg>,
    fetcher: CachedFetcher,
    timers: Arc<TimerRegistry>,
    limits: EngineLimits,
    generation: u64,
) {
    engine.register_type_with_name::<ResultChannel>("ResultChannel");
    engine.register_fn("set_error", |channel: &mut ResultChannel, value: Dynamic| {
        channel.set_error(CallError::script(value.to_string()));
    });
    engine.register_fn("resolve", |channel: &mut ResultChannel, value: Dynamic| {
        match rhai::serde::from_dynamic::<Value>(&value) {
            Ok(converted) => {
                channel.resolve(converted);
            }
            Err(_) => {
                channel.resolve(Value::String(value.to_string()));
            }
        }
    });

    // The underlying timer primitive takes the extra arguments as one list;
    // the positional overloads below are the variadic collecting wrapper.
    {
        let timers = timers.clone();
        engine.register_fn("set_timeout", move |callback: FnPtr, delay: i64| -> i64 {
            timers.schedule(callback, delay_from(delay), Vec::new()) as i64
        });
    }
    {
        let timers = timers.clone();
        engine.register_fn(
            "set_timeout",
            move |callback: FnPtr, delay: i64, args: Array| -> i64 {
                timers.schedule(callback, delay_from(delay), args) as i64
            },
        );
    }
    {
        let timers = timers.clone();
        engine.register_fn(
            "set_timeout",
            move |callback: FnPtr, delay: i64, a: Dynamic| -> i64 {
                timers.schedule(callback, delay_from(delay), vec![a]) as i64
            },
        );
    }
    {
        let timers = timers.clone();
        engine.register_fn(
            "set_timeout",
            move |callback: FnPtr, delay: i64, a: Dynamic, b: Dynamic| -> i64 {
                timers.schedule(callback, delay_from(delay), vec![a, b]) as i64
            },
        );
    }
    {
        let timers = timers.clone();
        engine.register_fn(
            "set_timeout",
            move |callback: FnPtr, delay: i64, a: Dynamic, b: Dynamic, c: Dynamic| -> i64 {
                timers.schedule(callback, delay_from(delay), vec![a, b, c]) as i64
            },
        );
    }
    engine.register_fn("clear_timeout", move |id: i64| {
        timers.cancel(id as u64);
    });

    engine.register_fn("run_in_context", move |code: &str, props: Map| -> String {
        sandbox::run_in_context(code, &props, &limits)
    });

    // Completion re-enters the host loop; callbacks from a superseded engine
    // generation are dropped there.
    engine.register_fn("http_get", move |url: &str, callback: FnPtr| {
        let fetcher = fetcher.clone();
        let tx = tx.clone();
        let url = url.to_string();
        debug!(%url, "script requested fetch");
        tokio::spawn(async move {
            let result = fetcher.get(&url).await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(HostMsg::HttpDone {
                    generation,
                    callback,
                    result,
                });
            }
        });
    });

    engine.register_fn("log_debug", |msg: &str| {
        debug!(script_log = msg);
    });
    engine.register_fn("log_info", |msg: &str| {
        tracing::info!(script_log = msg);
    });
    engine.register_fn("log_warn", |msg: &str| {
        warn!(script_log = msg);
    });
}
