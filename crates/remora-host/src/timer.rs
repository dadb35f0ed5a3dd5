//! Pending timer registry
//!
//! Host-owned arena of single-shot, cancellable timers created by the
//! script's `set_timeout`. A timer id exists in the registry only while the
//! timer is pending: firing or cancellation removes it exactly once, and
//! cancelling an unknown or already-fired id is a logged no-op. The host
//! clears the whole registry on engine teardown so no callback can outlive
//! the script environment that defined it.

use dashmap::DashMap;
use rhai::{Dynamic, FnPtr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// A pending single-shot timer
#[derive(Debug)]
pub struct PendingTimer {
    /// Script callback invoked on expiry
    pub(crate) callback: FnPtr,
    /// Extra arguments forwarded positionally to the callback
    pub(crate) args: Vec<Dynamic>,
    handle: JoinHandle<()>,
}

/// Registry of pending timers.
///
/// Expiries are delivered as timer ids on the channel handed to
/// [`TimerRegistry::new`]; the receiver takes the timer out of the registry
/// and invokes its callback on the host loop.
#[derive(Debug)]
pub struct TimerRegistry {
    next_id: AtomicU64,
    pending: DashMap<u64, PendingTimer>,
    fired: mpsc::UnboundedSender<u64>,
}

impl TimerRegistry {
    /// Create a registry delivering expiries on `fired`
    pub fn new(fired: mpsc::UnboundedSender<u64>) -> Self {
        Self {
            // 0 is never issued, so it can safely mean "no timer" in scripts.
            next_id: AtomicU64::new(1),
            pending: DashMap::new(),
            fired,
        }
    }

    /// Arm a single-shot timer and return its fresh id immediately
    pub fn schedule(&self, callback: FnPtr, delay: Duration, args: Vec<Dynamic>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let fired = self.fired.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = fired.send(id);
        });
        self.pending.insert(
            id,
            PendingTimer {
                callback,
                args,
                handle,
            },
        );
        trace!(id, delay_ms = delay.as_millis() as u64, "armed timer");
        id
    }

    /// Cancel a pending timer; unknown ids are a no-op
    pub fn cancel(&self, id: u64) -> bool {
        match self.pending.remove(&id) {
            Some((_, timer)) => {
                timer.handle.abort();
                trace!(id, "cancelled timer");
                true
            }
            None => {
                debug!(id, "unknown timer id");
                false
            }
        }
    }

    /// Remove a timer on expiry; `None` if it was cancelled in the meantime
    pub(crate) fn take(&self, id: u64) -> Option<PendingTimer> {
        self.pending.remove(&id).map(|(_, timer)| timer)
    }

    /// Number of pending timers
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Release every pending timer
    pub fn clear(&self) {
        self.pending.retain(|_, timer| {
            timer.handle.abort();
            false
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> (TimerRegistry, mpsc::UnboundedReceiver<u64>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (TimerRegistry::new(tx), rx)
    }

    fn callback() -> FnPtr {
        FnPtr::new("cb").expect("valid function name")
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_and_is_removed_once() {
        let (registry, mut fired) = registry();

        let id = registry.schedule(callback(), Duration::from_millis(50), Vec::new());
        assert!(id > 0);
        assert_eq!(registry.pending_count(), 1);

        assert_eq!(fired.recv().await, Some(id));
        assert!(registry.take(id).is_some());
        assert!(registry.take(id).is_none());
        assert_eq!(registry.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_timer_never_fires() {
        let (registry, mut fired) = registry();

        let id = registry.schedule(callback(), Duration::from_millis(50), Vec::new());
        assert!(registry.cancel(id));
        // Double cancellation and unknown ids are no-ops.
        assert!(!registry.cancel(id));
        assert!(!registry.cancel(9999));

        let expiry = tokio::time::timeout(Duration::from_millis(200), fired.recv()).await;
        assert!(expiry.is_err(), "cancelled timer must not fire");
        assert_eq!(registry.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ids_are_unique_while_live() {
        let (registry, _fired) = registry();

        let a = registry.schedule(callback(), Duration::from_secs(10), Vec::new());
        let b = registry.schedule(callback(), Duration::from_secs(10), Vec::new());
        assert_ne!(a, b);
        assert_eq!(registry.pending_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_releases_everything() {
        let (registry, mut fired) = registry();

        registry.schedule(callback(), Duration::from_millis(10), Vec::new());
        registry.schedule(callback(), Duration::from_millis(20), Vec::new());
        registry.clear();
        assert_eq!(registry.pending_count(), 0);

        let expiry = tokio::time::timeout(Duration::from_millis(100), fired.recv()).await;
        assert!(expiry.is_err(), "cleared timers must not fire");
    }

    #[tokio::test(start_paused = true)]
    async fn test_args_are_kept_in_order() {
        let (registry, mut fired) = registry();

        let args = vec![Dynamic::from("a"), Dynamic::from("b")];
        let id = registry.schedule(callback(), Duration::from_millis(5), args);

        assert_eq!(fired.recv().await, Some(id));
        let timer = registry.take(id).expect("timer still registered");
        let forwarded: Vec<String> = timer.args.iter().map(|arg| arg.to_string()).collect();
        assert_eq!(forwarded, vec!["a", "b"]);
    }
}
