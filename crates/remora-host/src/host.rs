//! Script host: engine lifecycle and call protocol
//!
//! The host runs as an actor task that exclusively owns the embedded engine
//! instance (engine + compiled AST + persistent scope). Every interaction
//! with the engine - initial evaluation, function calls, timer callbacks,
//! fetch callbacks - happens on that one task, so no locking guards engine
//! state. Network fetches and timer waits run on spawned tasks and re-enter
//! the loop as mailbox messages.
//!
//! Lifecycle: `Uninitialized -> Initializing -> { Ready, Failed }`, with
//! `Ready` and `Failed` both re-entering `Initializing` on an explicit new
//! initialization. At most one initialization attempt is ever in flight.

use crate::bindings;
use crate::config::HostConfig;
use crate::timer::TimerRegistry;
use remora_core::{CallError, HostEvent, HostState, ResultChannel};
use remora_net::{CachedFetcher, Fetched, NetError};
use rhai::serde::to_dynamic;
use rhai::{CallFnOptions, Dynamic, Engine, EvalAltResult, FnAccess, FnPtr, Scope, AST};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, trace, warn};

/// A call queued for dispatch, re-enqueued while the host is not ready
#[derive(Debug)]
pub(crate) struct PendingCall {
    name: String,
    args: Vec<Value>,
    channel: ResultChannel,
    attempt: u32,
}

#[derive(Debug)]
pub(crate) enum HostMsg {
    Initialize,
    SetUrl(String),
    Call(PendingCall),
    ScriptFetched {
        generation: u64,
        result: Result<Fetched, NetError>,
    },
    HttpDone {
        generation: u64,
        callback: FnPtr,
        result: Result<Fetched, NetError>,
    },
}

/// Handle to a running script host.
///
/// Cheap to clone; all clones drive the same actor. The actor stops once
/// every handle is dropped.
#[derive(Debug, Clone)]
pub struct ScriptHost {
    tx: mpsc::UnboundedSender<HostMsg>,
    state: watch::Receiver<HostState>,
    events: broadcast::Sender<HostEvent>,
}

impl ScriptHost {
    /// Spawn a host actor on the current tokio runtime.
    ///
    /// When the configuration carries a script URL, initialization starts
    /// immediately.
    pub fn spawn(config: HostConfig, fetcher: CachedFetcher) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(HostState::Uninitialized);
        let (events_tx, _) = broadcast::channel(32);
        let (fired_tx, fired_rx) = mpsc::unbounded_channel();

        let script_url = config.script_url.clone();
        let actor = HostActor {
            timers: Arc::new(TimerRegistry::new(fired_tx)),
            config,
            fetcher,
            url: None,
            initializing: false,
            generation: 0,
            instance: None,
            state: state_tx,
            events: events_tx.clone(),
            tx: tx.downgrade(),
        };
        tokio::spawn(actor.run(rx, fired_rx));

        let host = Self {
            tx,
            state: state_rx,
            events: events_tx,
        };
        if let Some(url) = script_url {
            host.initialize(&url);
        }
        host
    }

    /// Set the script URL and trigger initialization.
    ///
    /// Idempotent while an initialization is already in flight; calling
    /// again after `Ready` or `Failed` starts a fresh attempt.
    pub fn initialize(&self, url: &str) {
        let _ = self.tx.send(HostMsg::SetUrl(url.to_string()));
    }

    /// Whether the host is ready to dispatch calls.
    ///
    /// When it is not, an initialization nudge is sent so the host makes
    /// forward progress without an explicit `initialize` call.
    pub fn is_initialized(&self) -> bool {
        if self.state.borrow().is_ready() {
            return true;
        }
        let _ = self.tx.send(HostMsg::Initialize);
        false
    }

    /// Current lifecycle state
    pub fn state(&self) -> HostState {
        *self.state.borrow()
    }

    /// Subscribe to lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.events.subscribe()
    }

    /// Invoke a named script function with `channel` prepended to `args`.
    ///
    /// Returns the same channel on every path, so continuations can be
    /// attached before the asynchronous resolution completes. Calls issued
    /// before the host is ready are retried on a fixed interval.
    pub fn call_function(
        &self,
        channel: ResultChannel,
        name: &str,
        args: Vec<Value>,
    ) -> ResultChannel {
        let call = PendingCall {
            name: name.to_string(),
            args,
            channel: channel.clone(),
            attempt: 0,
        };
        if self.tx.send(HostMsg::Call(call)).is_err() {
            warn!(name = %name, "script host task is gone");
            channel.set_error(CallError::script("script host task is gone"));
        }
        channel
    }

    /// [`call_function`](Self::call_function) with a fresh channel
    pub fn call(&self, name: &str, args: Vec<Value>) -> ResultChannel {
        self.call_function(ResultChannel::new(), name, args)
    }

    /// Wait until the state satisfies `predicate`; returns the matching state
    pub async fn wait_state<F>(&self, mut predicate: F) -> HostState
    where
        F: FnMut(HostState) -> bool,
    {
        let mut rx = self.state.clone();
        let state = match rx.wait_for(|state| predicate(*state)).await {
            Ok(state) => *state,
            Err(_) => *self.state.borrow(),
        };
        state
    }

    /// Wait until the host is ready
    pub async fn wait_ready(&self) {
        self.wait_state(|state| state.is_ready()).await;
    }
}

/// The engine instance the actor exclusively owns; replaced, never mutated
/// in place, on each (re)initialization.
struct EngineInstance {
    engine: Engine,
    ast: AST,
    scope: Scope<'static>,
}

struct HostActor {
    config: HostConfig,
    fetcher: CachedFetcher,
    timers: Arc<TimerRegistry>,
    url: Option<String>,
    initializing: bool,
    generation: u64,
    instance: Option<EngineInstance>,
    state: watch::Sender<HostState>,
    events: broadcast::Sender<HostEvent>,
    tx: mpsc::WeakUnboundedSender<HostMsg>,
}

impl HostActor {
    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<HostMsg>,
        mut fired_rx: mpsc::UnboundedReceiver<u64>,
    ) {
        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(msg) => self.handle(msg),
                    None => break,
                },
                fired = fired_rx.recv() => match fired {
                    Some(id) => self.fire_timer(id),
                    None => break,
                },
            }
        }
        self.timers.clear();
        debug!("script host task stopped");
    }

    fn handle(&mut self, msg: HostMsg) {
        match msg {
            HostMsg::SetUrl(url) => {
                self.url = Some(url);
                self.begin_initialize();
            }
            HostMsg::Initialize => self.begin_initialize(),
            HostMsg::Call(call) => self.handle_call(call),
            HostMsg::ScriptFetched { generation, result } => {
                self.finish_initialize(generation, result)
            }
            HostMsg::HttpDone {
                generation,
                callback,
                result,
            } => self.deliver_fetch(generation, callback, result),
        }
    }

    fn current_state(&self) -> HostState {
        *self.state.borrow()
    }

    fn set_state(&self, state: HostState) {
        let previous = self.current_state();
        if previous != state {
            debug!(from = %previous, to = %state, "host state changed");
        }
        self.state.send_replace(state);
    }

    fn begin_initialize(&mut self) {
        let url = match self.url.as_deref() {
            Some(url) if !url.is_empty() => url.to_string(),
            _ => {
                debug!("no script url configured");
                return;
            }
        };
        if self.initializing {
            return;
        }
        self.initializing = true;
        self.set_state(HostState::Initializing);
        debug!(%url, "initializing script host");

        // Pending timers must not outlive the engine that owns their callbacks.
        self.timers.clear();
        self.generation += 1;
        let engine = self.build_engine();
        self.instance = Some(EngineInstance {
            engine,
            ast: AST::empty(),
            scope: Scope::new(),
        });

        let fetcher = self.fetcher.clone();
        let tx = self.tx.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            let result = fetcher.get(&url).await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(HostMsg::ScriptFetched { generation, result });
            }
        });
    }

    fn build_engine(&self) -> Engine {
        let mut engine = Engine::new();
        self.config.limits.apply(&mut engine);
        bindings::install(
            &mut engine,
            self.tx.clone(),
            self.fetcher.clone(),
            self.timers.clone(),
            self.config.limits.clone(),
            self.generation,
        );
        engine
    }

    fn finish_initialize(&mut self, generation: u64, result: Result<Fetched, NetError>) {
        if generation != self.generation {
            debug!("discarding stale script fetch completion");
            return;
        }
        let fetched = match result {
            Ok(fetched) if !fetched.body.is_empty() => fetched,
            Ok(_) => {
                self.initializing = false;
                self.fail_init("cannot load script: empty body");
                return;
            }
            Err(err) => {
                self.initializing = false;
                self.fail_init(&format!("cannot load script: {err}"));
                return;
            }
        };

        let evaluated = self.evaluate_script(&fetched.body);
        self.initializing = false;
        if evaluated {
            self.set_state(HostState::Ready);
            info!(url = %fetched.url, "script host initialized");
            let _ = self.events.send(HostEvent::Initialized);
        } else {
            // No event here: evaluation failures need a new `initialize`.
            self.set_state(HostState::Failed);
        }
    }

    fn evaluate_script(&mut self, body: &[u8]) -> bool {
        let Some(instance) = self.instance.as_mut() else {
            warn!("script fetch completed without an engine instance");
            return false;
        };
        let code = String::from_utf8_lossy(body);
        let ast = match instance.engine.compile(code.as_ref()) {
            Ok(ast) => ast,
            Err(err) => {
                error!(error = %err, "script compilation failed");
                return false;
            }
        };
        match instance
            .engine
            .eval_ast_with_scope::<Dynamic>(&mut instance.scope, &ast)
        {
            Ok(_) => {
                instance.ast = ast;
                true
            }
            Err(err) => {
                log_script_error("script evaluation failed", &err);
                false
            }
        }
    }

    fn fail_init(&mut self, message: &str) {
        debug!(message = %message, "script load failed");
        self.set_state(HostState::Failed);
        let _ = self.events.send(HostEvent::InitFailed {
            message: message.to_string(),
        });
    }

    fn handle_call(&mut self, call: PendingCall) {
        if !self.current_state().is_ready() {
            debug!(name = %call.name, attempt = call.attempt, "call before ready");
            // Lazy auto-start, exactly like a failed readiness probe.
            self.begin_initialize();
            if call.attempt >= self.config.max_call_retries {
                warn!(name = %call.name, "giving up, host never became ready");
                call.channel.set_error(CallError::not_ready(call.attempt));
                return;
            }
            let tx = self.tx.clone();
            let delay = self.config.retry_interval();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Some(tx) = tx.upgrade() {
                    let _ = tx.send(HostMsg::Call(PendingCall {
                        attempt: call.attempt + 1,
                        ..call
                    }));
                }
            });
            return;
        }
        self.invoke(call);
    }

    fn invoke(&mut self, call: PendingCall) {
        let Some(instance) = self.instance.as_mut() else {
            call.channel
                .set_error(CallError::script("engine instance missing"));
            return;
        };

        // Registry lookup with a callable check, never a blind call: the
        // name must resolve to a public script function taking the channel
        // plus the caller's arguments.
        let arity = call.args.len() + 1;
        let callable = instance.ast.iter_functions().any(|function| {
            function.access == FnAccess::Public
                && function.name == call.name
                && function.params.len() == arity
        });
        if !callable {
            warn!(name = %call.name, "not callable");
            call.channel.set_error(CallError::not_callable(&call.name));
            return;
        }

        let mut fn_args: Vec<Dynamic> = Vec::with_capacity(arity);
        fn_args.push(Dynamic::from(call.channel.clone()));
        for value in &call.args {
            match to_dynamic(value) {
                Ok(dynamic) => fn_args.push(dynamic),
                Err(err) => {
                    call.channel.set_error(CallError::script(format!(
                        "argument conversion failed: {err}"
                    )));
                    return;
                }
            }
        }

        debug!(name = %call.name, "calling script function");
        // The script's global statements already ran at initialization.
        let options = CallFnOptions::new().eval_ast(false);
        if let Err(err) = instance.engine.call_fn_with_options::<Dynamic>(
            options,
            &mut instance.scope,
            &instance.ast,
            &call.name,
            fn_args,
        ) {
            let trace = error_trace(&err);
            log_script_error("script function raised", &err);
            call.channel
                .set_error(CallError::script_with_trace(err.to_string(), trace));
        }
    }

    fn fire_timer(&mut self, id: u64) {
        let Some(timer) = self.timers.take(id) else {
            trace!(id, "timer expired after removal");
            return;
        };
        let Some(instance) = self.instance.as_ref() else {
            return;
        };
        trace!(id, "timer fired");
        if let Err(err) = timer
            .callback
            .call::<Dynamic>(&instance.engine, &instance.ast, timer.args)
        {
            log_script_error("timer callback raised", &err);
        }
    }

    fn deliver_fetch(
        &mut self,
        generation: u64,
        callback: FnPtr,
        result: Result<Fetched, NetError>,
    ) {
        if generation != self.generation {
            debug!("discarding fetch completion from a superseded engine");
            return;
        }
        let Some(instance) = self.instance.as_ref() else {
            return;
        };
        let (error, body): (Dynamic, Dynamic) = match result {
            Ok(fetched) => (
                Dynamic::UNIT,
                Dynamic::from(String::from_utf8_lossy(&fetched.body).into_owned()),
            ),
            Err(err) => (Dynamic::from(err.to_string()), Dynamic::UNIT),
        };
        if let Err(err) =
            callback.call::<Dynamic>(&instance.engine, &instance.ast, vec![error, body])
        {
            log_script_error("fetch callback raised", &err);
        }
    }
}

/// Flatten a nested evaluation error into trace lines, outermost first
pub(crate) fn error_trace(err: &EvalAltResult) -> Vec<String> {
    let mut trace = Vec::new();
    let mut current = err;
    loop {
        match current {
            EvalAltResult::ErrorInFunctionCall(name, source, inner, position) => {
                if source.is_empty() {
                    trace.push(format!("in call to '{name}' @ {position}"));
                } else {
                    trace.push(format!("in call to '{name}' ({source}) @ {position}"));
                }
                current = inner.as_ref();
            }
            other => {
                trace.push(format!("{other} @ {}", other.position()));
                break;
            }
        }
    }
    trace
}

fn log_script_error(context: &str, err: &EvalAltResult) {
    warn!(error = %err, "{}", context);
    for line in error_trace(err) {
        debug!(trace = %line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use remora_net::{FetcherConfig, HttpSession, MemoryCache, SessionConfig};

    fn offline_fetcher() -> CachedFetcher {
        let session =
            HttpSession::with_store(SessionConfig::default(), Arc::new(MemoryCache::new()))
                .expect("session builds");
        CachedFetcher::new(Arc::new(session), FetcherConfig::default())
    }

    #[tokio::test]
    async fn test_spawn_without_url_stays_uninitialized() {
        let host = ScriptHost::spawn(HostConfig::default(), offline_fetcher());
        assert_eq!(host.state(), HostState::Uninitialized);

        // The readiness probe nudges initialization, which is a no-op
        // without a URL.
        assert!(!host.is_initialized());
        tokio::task::yield_now().await;
        assert_eq!(host.state(), HostState::Uninitialized);
    }

    #[tokio::test]
    async fn test_call_function_returns_the_same_channel() {
        let host = ScriptHost::spawn(HostConfig::default(), offline_fetcher());
        let channel = ResultChannel::new();
        let returned = host.call_function(channel.clone(), "noop", Vec::new());

        returned.set_error(CallError::script("resolved externally"));
        assert!(channel.is_resolved());
    }

    #[test]
    fn test_error_trace_flattens_nested_calls() {
        let inner = Box::new(EvalAltResult::ErrorRuntime(
            Dynamic::from("boom"),
            rhai::Position::NONE,
        ));
        let err = EvalAltResult::ErrorInFunctionCall(
            "greet".to_string(),
            String::new(),
            inner,
            rhai::Position::NONE,
        );

        let trace = error_trace(&err);
        assert_eq!(trace.len(), 2);
        assert!(trace[0].contains("greet"));
        assert!(trace[1].contains("boom"));
    }
}
