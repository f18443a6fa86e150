//! Cooperative Cancellation
//!
//! Cancellation in the runtime is cooperative: a run span that is already
//! executing synchronously runs to completion, but its result is suppressed
//! instead of delivered once its connection has been cancelled.
//!
//! # Components
//!
//! - `Cancelable`: anything that can be asked to cancel.
//! - `CancelConnection`: a LIFO stack of cancel handles. Async registrations
//!   push their own handle; cancelling the connection pops and invokes every
//!   handle in reverse order. A handle pushed after cancellation is invoked
//!   immediately.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// A handle that can be asked to cancel an in-flight operation.
///
/// Implementations must be idempotent; `cancel` may be invoked more than
/// once and from any thread.
pub trait Cancelable: Send + Sync {
    /// Request cancellation.
    fn cancel(&self);
}

/// Build a cancelable from a closure.
pub fn cancelable_fn(f: impl Fn() + Send + Sync + 'static) -> Arc<dyn Cancelable> {
    struct FnCancelable<F>(F);
    impl<F: Fn() + Send + Sync> Cancelable for FnCancelable<F> {
        fn cancel(&self) {
            (self.0)()
        }
    }
    Arc::new(FnCancelable(f))
}

/// Shared state of a connection.
#[derive(Debug)]
struct ConnectionState {
    /// Whether cancellation has been requested.
    cancelled: AtomicBool,
    /// Pending cancel handles, most recent last.
    stack: Mutex<Vec<Arc<dyn Cancelable>>>,
}

impl std::fmt::Debug for dyn Cancelable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Cancelable")
    }
}

/// A stack of cancel handles shared by one logical run.
///
/// Cloning shares the underlying state. `cancel()` is serialized against
/// `push`/`pop` by swapping the cancelled flag first and draining the stack
/// under the lock; late pushes observe the flag and cancel immediately.
#[derive(Debug, Clone)]
pub struct CancelConnection {
    state: Arc<ConnectionState>,
}

impl CancelConnection {
    /// Create a fresh, uncancelled connection.
    pub fn new() -> Self {
        Self {
            state: Arc::new(ConnectionState {
                cancelled: AtomicBool::new(false),
                stack: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Check whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
    }

    /// Push a cancel handle onto the stack.
    ///
    /// If the connection is already cancelled the handle is invoked
    /// immediately instead of being retained.
    pub fn push(&self, handle: Arc<dyn Cancelable>) {
        if self.is_cancelled() {
            handle.cancel();
            return;
        }
        let mut stack = self.state.stack.lock();
        if self.is_cancelled() {
            // Lost the race with cancel(); the drain already ran.
            drop(stack);
            handle.cancel();
            return;
        }
        stack.push(handle);
    }

    /// Pop the most recently pushed handle without invoking it.
    pub fn pop(&self) -> Option<Arc<dyn Cancelable>> {
        self.state.stack.lock().pop()
    }

    /// Cancel the connection, invoking every pending handle in LIFO order.
    ///
    /// Idempotent: only the first caller drains the stack.
    pub fn cancel(&self) {
        if self.state.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        let drained: Vec<Arc<dyn Cancelable>> = {
            let mut stack = self.state.stack.lock();
            std::mem::take(&mut *stack)
        };
        for handle in drained.into_iter().rev() {
            handle.cancel();
        }
    }
}

impl Default for CancelConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl Cancelable for CancelConnection {
    fn cancel(&self) {
        CancelConnection::cancel(self)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_cancel_invokes_handles_in_lifo_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let connection = CancelConnection::new();
        for i in 0..3 {
            let order = order.clone();
            connection.push(cancelable_fn(move || order.lock().push(i)));
        }
        connection.cancel();
        assert_eq!(*order.lock(), vec![2, 1, 0]);
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let count = Arc::new(Mutex::new(0));
        let connection = CancelConnection::new();
        let c = count.clone();
        connection.push(cancelable_fn(move || *c.lock() += 1));
        connection.cancel();
        connection.cancel();
        assert_eq!(*count.lock(), 1);
    }

    #[test]
    fn test_push_after_cancel_fires_immediately() {
        let fired = Arc::new(AtomicBool::new(false));
        let connection = CancelConnection::new();
        connection.cancel();
        let f = fired.clone();
        connection.push(cancelable_fn(move || f.store(true, Ordering::SeqCst)));
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_pop_removes_without_invoking() {
        let fired = Arc::new(AtomicBool::new(false));
        let connection = CancelConnection::new();
        let f = fired.clone();
        connection.push(cancelable_fn(move || f.store(true, Ordering::SeqCst)));
        assert!(connection.pop().is_some());
        connection.cancel();
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_clone_shares_state() {
        let connection = CancelConnection::new();
        let clone = connection.clone();
        connection.cancel();
        assert!(clone.is_cancelled());
    }
}
