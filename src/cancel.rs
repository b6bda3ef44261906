//! Cooperative cancellation.
//!
//! A single [`CancelToken`] created at bridge start is the authoritative
//! shutdown signal: signal handlers, transport disconnect events, and the
//! user-facing handle all cancel the same token, and every worker loop
//! observes it with a bounded wait so nothing outlives cancellation by more
//! than one poll interval.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Shared state behind a token and all of its clones/children.
struct Inner {
    cancelled: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
    /// Children to propagate cancellation into.
    children: Mutex<Vec<CancelToken>>,
}

/// Clonable cancellation token.
///
/// Cloning shares the same underlying flag; [`CancelToken::child`] creates a
/// token that is cancelled when the parent is, but can also be cancelled
/// independently without affecting the parent.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    /// Create a fresh, uncancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                lock: Mutex::new(()),
                cond: Condvar::new(),
                children: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Cancel the token and every child derived from it.
    ///
    /// Idempotent; waiters are woken exactly once.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        // Wake bounded waiters.
        let _guard = self.inner.lock.lock().expect("cancel token mutex poisoned");
        self.inner.cond.notify_all();
        drop(_guard);

        let children = {
            let mut children = self
                .inner
                .children
                .lock()
                .expect("cancel token children mutex poisoned");
            std::mem::take(&mut *children)
        };
        for child in children {
            child.cancel();
        }
    }

    /// Non-blocking check, safe on any hot path.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Block until cancelled or the timeout elapses.
    ///
    /// Returns `true` if the token was cancelled (possibly before the call).
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_cancelled() {
            return true;
        }
        let deadline = Instant::now() + timeout;
        let mut guard = self.inner.lock.lock().expect("cancel token mutex poisoned");
        loop {
            if self.is_cancelled() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return self.is_cancelled();
            }
            let (next, res) = self
                .inner
                .cond
                .wait_timeout(guard, deadline - now)
                .expect("cancel token mutex poisoned");
            guard = next;
            if res.timed_out() {
                return self.is_cancelled();
            }
        }
    }

    /// Block until cancelled, polling no coarser than `interval`.
    ///
    /// The interval bound keeps the wait responsive to flags set without
    /// notification (signal handlers store through the raw atomic).
    pub fn wait(&self, interval: Duration) {
        while !self.wait_timeout(interval) {}
    }

    /// Derive a child token: cancelled when `self` is cancelled, but
    /// cancelling the child leaves the parent running.
    #[must_use]
    pub fn child(&self) -> CancelToken {
        let child = CancelToken::new();
        if self.is_cancelled() {
            child.cancel();
            return child;
        }
        let mut children = self
            .inner
            .children
            .lock()
            .expect("cancel token children mutex poisoned");
        // Racing with cancel(): re-check under the lock window.
        if self.is_cancelled() {
            child.cancel();
        } else {
            children.push(child.clone());
        }
        child
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_cancel_is_idempotent() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_clone_shares_state() {
        let token = CancelToken::new();
        let clone = token.clone();
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_wait_timeout_elapses() {
        let token = CancelToken::new();
        let start = Instant::now();
        assert!(!token.wait_timeout(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_wait_timeout_wakes_on_cancel() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = thread::spawn(move || waiter.wait_timeout(Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(10));
        token.cancel();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn test_child_follows_parent() {
        let parent = CancelToken::new();
        let child = parent.child();
        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn test_child_does_not_cancel_parent() {
        let parent = CancelToken::new();
        let child = parent.child();
        child.cancel();
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn test_child_of_cancelled_parent_starts_cancelled() {
        let parent = CancelToken::new();
        parent.cancel();
        assert!(parent.child().is_cancelled());
    }
}
