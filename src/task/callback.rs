//! Single-Shot Callbacks
//!
//! Both delivery surfaces of the run-loop are at-most-once: the user
//! callback receives exactly one outcome, and a restart callback accepts
//! exactly one completion from an async registration. Later completions are
//! routed to the scheduler's failure reporter instead of the user.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Error;
use crate::local::{with_snapshot, LocalContext};
use crate::scheduler::Scheduler;
use crate::stack::ChunkedStack;

use super::context::Context;
use super::run_loop;
use super::{BindFrame, Boxed, Repr};

/// Erased at-most-once user callback.
pub(crate) struct OnceCallback {
    called: AtomicBool,
    f: Mutex<Option<Box<dyn FnOnce(Result<Boxed, Error>) + Send>>>,
    reporter: Arc<dyn Scheduler>,
}

pub(crate) type CallbackRef = Arc<OnceCallback>;

impl OnceCallback {
    /// Wrap a callback, reporting duplicate completions to `reporter`.
    pub fn new(
        reporter: Arc<dyn Scheduler>,
        f: Box<dyn FnOnce(Result<Boxed, Error>) + Send>,
    ) -> CallbackRef {
        Arc::new(OnceCallback {
            called: AtomicBool::new(false),
            f: Mutex::new(Some(f)),
            reporter,
        })
    }

    /// Deliver an outcome; only the first call reaches the callback.
    pub fn complete(&self, result: Result<Boxed, Error>) {
        if self.called.swap(true, Ordering::AcqRel) {
            match result {
                Err(error) => self.reporter.report_failure(&error),
                Ok(_) => self
                    .reporter
                    .report_failure(&Error::msg("callback completed more than once")),
            }
            return;
        }
        if let Some(f) = self.f.lock().take() {
            f(result);
        }
    }
}

/// State a restart callback replays when its async operation completes.
pub(crate) struct RestartState {
    pub cb: CallbackRef,
    pub b_first: Option<BindFrame>,
    pub b_rest: Option<ChunkedStack<BindFrame>>,
    pub locals: Option<LocalContext>,
}

struct RestartInner {
    ctx: Arc<Context>,
    called: AtomicBool,
    state: Mutex<Option<RestartState>>,
}

/// Re-enters the trampoline when an async registration completes.
///
/// Holds a snapshot of the bind chain taken at submission time; on
/// completion it replays the chain starting from the delivered value or
/// error, reading the context's frame ref so a synchronous completion keeps
/// the budget it left off at.
#[derive(Clone)]
pub(crate) struct RestartCallback {
    inner: Arc<RestartInner>,
}

impl RestartCallback {
    pub fn new(ctx: Arc<Context>, state: RestartState) -> Self {
        RestartCallback {
            inner: Arc::new(RestartInner {
                ctx,
                called: AtomicBool::new(false),
                state: Mutex::new(Some(state)),
            }),
        }
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.inner.ctx
    }

    /// Accept a completion; at most one call re-enters the loop.
    ///
    /// Cancellation is checked here, after the async operation finished and
    /// before anything is signalled onward.
    pub fn complete(&self, result: Result<Boxed, Error>) {
        if self.inner.called.swap(true, Ordering::AcqRel) {
            match result {
                Err(error) => self.inner.ctx.scheduler().report_failure(&error),
                Ok(_) => self
                    .inner
                    .ctx
                    .scheduler()
                    .report_failure(&Error::msg("restart callback completed more than once")),
            }
            return;
        }

        let state = match self.inner.state.lock().take() {
            Some(state) => state,
            None => return,
        };
        let ctx = self.inner.ctx.clone();
        if ctx.should_cancel() {
            return;
        }

        let frame_index = ctx.frame_ref().get();
        let RestartState {
            cb,
            b_first,
            b_rest,
            locals,
        } = state;
        with_snapshot(locals, move || match result {
            Ok(value) => run_loop::resume(ctx, cb, None, b_first, b_rest, Some(value), frame_index),
            Err(error) => run_loop::resume(
                ctx,
                cb,
                Some(Repr::Fail(error)),
                b_first,
                b_rest,
                None,
                frame_index,
            ),
        });
    }
}

/// Typed completion handle passed to [`Task::create`] registrations.
///
/// [`Task::create`]: super::Task::create
pub struct TaskCallback<A> {
    raw: RestartCallback,
    _marker: PhantomData<fn(A)>,
}

impl<A> Clone for TaskCallback<A> {
    fn clone(&self) -> Self {
        TaskCallback {
            raw: self.raw.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A: Send + 'static> TaskCallback<A> {
    pub(crate) fn new(raw: RestartCallback) -> Self {
        TaskCallback {
            raw,
            _marker: PhantomData,
        }
    }

    /// Deliver an outcome.
    pub fn complete(&self, result: Result<A, Error>) {
        self.raw.complete(result.map(|a| Box::new(a) as Boxed));
    }

    /// Deliver a success.
    pub fn success(&self, value: A) {
        self.complete(Ok(value));
    }

    /// Deliver a failure.
    pub fn error(&self, error: Error) {
        self.complete(Err(error));
    }
}
