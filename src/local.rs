//! Context-Local Propagation
//!
//! Key/value state that follows a logical computation across async
//! boundaries instead of staying pinned to an OS thread.
//!
//! # Overview
//!
//! A [`Local`] is a typed key into the current [`LocalContext`], a map that
//! lives in thread-local storage while a run span executes. When local
//! propagation is enabled, the run-loop snapshots the current context at
//! async submission time and reinstates that snapshot around the
//! continuation; the prior context is restored on exit. Correctness never
//! relies on ambient thread-locals surviving a thread jump.
//!
//! # Example
//!
//! ```rust,ignore
//! use monix::local::{Local, LocalContext};
//!
//! let request_id: Local<u64> = Local::new();
//! request_id.set(42);
//!
//! let snapshot = LocalContext::snapshot();
//! // ... on another thread, inside a continuation:
//! LocalContext::isolate(snapshot, || {
//!     assert_eq!(request_id.get(), Some(42));
//! });
//! ```

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Counter for generating unique local keys.
static NEXT_LOCAL_KEY: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_CONTEXT: RefCell<LocalContext> = RefCell::new(LocalContext::new());
}

/// A snapshot-able key/value map of context-local values.
///
/// Values are stored behind `Arc`, so snapshots are shallow and cheap.
#[derive(Debug, Clone, Default)]
pub struct LocalContext {
    values: HashMap<u64, Arc<dyn Any + Send + Sync>>,
}

impl LocalContext {
    /// Create an empty context.
    pub fn new() -> Self {
        Self {
            values: HashMap::new(),
        }
    }

    /// Snapshot the calling thread's current context.
    pub fn snapshot() -> LocalContext {
        CURRENT_CONTEXT.with(|cell| cell.borrow().clone())
    }

    /// Run `f` with `context` installed as the current context.
    ///
    /// The previous context is restored when `f` returns, even if `f`
    /// unwinds.
    pub fn isolate<R>(context: LocalContext, f: impl FnOnce() -> R) -> R {
        struct Restore(Option<LocalContext>);
        impl Drop for Restore {
            fn drop(&mut self) {
                if let Some(prior) = self.0.take() {
                    CURRENT_CONTEXT.with(|cell| *cell.borrow_mut() = prior);
                }
            }
        }

        let prior = CURRENT_CONTEXT.with(|cell| {
            std::mem::replace(&mut *cell.borrow_mut(), context)
        });
        let _restore = Restore(Some(prior));
        f()
    }

    /// Number of bound keys.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Check whether no keys are bound.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// A typed context-local variable.
///
/// Each `Local` owns a unique key; `get`/`set` address the calling
/// computation's current [`LocalContext`].
#[derive(Debug)]
pub struct Local<T> {
    key: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Clone + Send + Sync + 'static> Local<T> {
    /// Create a new local with a fresh key.
    pub fn new() -> Self {
        Self {
            key: NEXT_LOCAL_KEY.fetch_add(1, Ordering::Relaxed),
            _marker: PhantomData,
        }
    }

    /// Read the value bound in the current context.
    pub fn get(&self) -> Option<T> {
        CURRENT_CONTEXT.with(|cell| {
            cell.borrow()
                .values
                .get(&self.key)
                .and_then(|v| v.downcast_ref::<T>().cloned())
        })
    }

    /// Bind a value in the current context.
    pub fn set(&self, value: T) {
        CURRENT_CONTEXT.with(|cell| {
            cell.borrow_mut().values.insert(self.key, Arc::new(value));
        });
    }

    /// Remove the binding from the current context.
    pub fn clear(&self) {
        CURRENT_CONTEXT.with(|cell| {
            cell.borrow_mut().values.remove(&self.key);
        });
    }
}

impl<T: Clone + Send + Sync + 'static> Default for Local<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Run `f` under an optional snapshot.
///
/// With `None`, `f` runs in the ambient context unchanged. This is the
/// shape the run-loop uses: the snapshot is only captured when local
/// propagation is enabled.
pub(crate) fn with_snapshot<R>(snapshot: Option<LocalContext>, f: impl FnOnce() -> R) -> R {
    match snapshot {
        Some(context) => LocalContext::isolate(context, f),
        None => f(),
    }
}

// ============================================================================
// Tests
// ============================================================================
