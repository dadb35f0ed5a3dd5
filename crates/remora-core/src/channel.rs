//! Per-call result channel

use crate::error::CallError;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Outcome of one script call: a JSON value on success, a [`CallError`] on failure.
pub type CallOutcome = Result<Value, CallError>;

/// Correlates exactly one outstanding call with exactly one outcome.
///
/// The channel is handed into the invoked script function, which resolves it
/// asynchronously; the host also uses it to report local errors. Only the
/// first resolution is honored - later attempts are logged and dropped so a
/// stray late error can never mask the script's intended result.
///
/// Cloning is cheap; all clones observe the same outcome.
#[derive(Debug, Clone)]
pub struct ResultChannel {
    outcome: Arc<watch::Sender<Option<CallOutcome>>>,
}

impl ResultChannel {
    /// Create a new, unresolved channel
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            outcome: Arc::new(tx),
        }
    }

    /// Resolve the channel with a success value.
    ///
    /// Returns `false` if an outcome was already set.
    pub fn resolve(&self, value: Value) -> bool {
        self.set(Ok(value))
    }

    /// Resolve the channel with an error.
    ///
    /// Returns `false` if an outcome was already set.
    pub fn set_error(&self, error: CallError) -> bool {
        self.set(Err(error))
    }

    /// Whether an outcome has been set
    pub fn is_resolved(&self) -> bool {
        self.outcome.borrow().is_some()
    }

    /// Snapshot of the outcome, if resolved
    pub fn outcome(&self) -> Option<CallOutcome> {
        self.outcome.borrow().clone()
    }

    /// Wait until the channel is resolved.
    ///
    /// Any number of tasks may wait concurrently; each receives a clone of
    /// the single stored outcome.
    pub async fn wait(&self) -> CallOutcome {
        let mut rx = self.outcome.subscribe();
        let outcome = match rx.wait_for(|outcome| outcome.is_some()).await {
            Ok(guard) => match guard.as_ref() {
                Some(outcome) => outcome.clone(),
                None => Err(CallError::script("result channel closed without an outcome")),
            },
            // Unreachable while `self` holds the sender, but never panic here.
            Err(_) => Err(CallError::script("result channel closed without an outcome")),
        };
        outcome
    }

    fn set(&self, outcome: CallOutcome) -> bool {
        let mut pending = Some(outcome);
        let accepted = self.outcome.send_if_modified(|current| {
            if current.is_some() {
                false
            } else {
                *current = pending.take();
                true
            }
        });
        if !accepted {
            debug!("call outcome already set, ignoring late resolution");
        }
        accepted
    }
}

impl Default for ResultChannel {
    fn default() -> Self {
        Self::new()
    }
}
