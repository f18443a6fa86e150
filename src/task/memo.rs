//! Memoization Resolver
//!
//! A `Memoize` node shares one producer run across every caller of the
//! description. The cell is a small state machine:
//!
//! ```text
//! Empty ──claim──▶ InProgress(waiters, connection) ──complete──▶ Done(outcome)
//!   ▲                                                   │
//!   └──────────── failure with cache_errors = false ─────┘
//! ```
//!
//! The first visitor claims the cell and starts the producer through a
//! trampolined scheduler submission; later visitors park their bind chain
//! as a waiter and push the producer's cancel connection onto their own.
//! Completion stores the outcome and fires every waiter. When errors are
//! not cached, a failure resets the cell before the waiters fire, so the
//! next run claims it afresh.

use std::sync::Arc;

use crate::atomic::PaddedCell;
use crate::cancel::CancelConnection;
use crate::error::Error;
use crate::stack::ChunkedStack;

use super::callback::{CallbackRef, OnceCallback};
use super::context::Context;
use super::run_loop;
use super::{unbox, AnyValue, BindFrame, Boxed, Repr};

/// A memoized outcome that can be re-materialized for every waiter.
pub(crate) struct SharedValue(pub Arc<dyn AnyValue>);

impl Clone for SharedValue {
    fn clone(&self) -> Self {
        SharedValue(self.0.clone())
    }
}

/// A parked run span, fired when the producer completes.
type Waiter = Box<dyn FnOnce(Result<SharedValue, Error>) + Send>;

enum MemoState {
    /// No producer run has been claimed.
    Empty,
    /// A producer is in flight; waiters park here.
    InProgress {
        waiters: Vec<Waiter>,
        connection: CancelConnection,
    },
    /// The producer finished and the outcome is cached.
    Done(Result<SharedValue, Error>),
}

/// The atomic cell behind a `Memoize` node.
pub(crate) struct MemoCell {
    state: PaddedCell<MemoState>,
    producer: Repr,
    cache_errors: bool,
}

impl MemoCell {
    pub fn new(producer: Repr, cache_errors: bool) -> Self {
        MemoCell {
            state: PaddedCell::new(MemoState::Empty),
            producer,
            cache_errors,
        }
    }

    /// Hot path: read a cached outcome without parking.
    pub fn peek(&self) -> Option<Result<Boxed, Error>> {
        self.state.transition(|state| match state {
            MemoState::Done(Ok(shared)) => Some(Ok(shared.0.clone_value())),
            MemoState::Done(Err(error)) => Some(Err(error.clone())),
            _ => None,
        })
    }

    /// Store the producer's outcome and collect the parked waiters.
    ///
    /// With `cache_errors` disabled a failure resets the cell to `Empty`
    /// before any waiter observes it; in-flight waiters still receive the
    /// current failure.
    fn complete(&self, result: Result<SharedValue, Error>) {
        let waiters = self.state.transition(|state| {
            let waiters = match state {
                MemoState::InProgress { waiters, .. } => std::mem::take(waiters),
                _ => Vec::new(),
            };
            *state = match (&result, self.cache_errors) {
                (Err(_), false) => MemoState::Empty,
                _ => MemoState::Done(result.clone()),
            };
            waiters
        });
        for waiter in waiters {
            waiter(result.clone());
        }
    }
}

enum Enrolled {
    /// The cell was already done; fire the waiter inline.
    Fire(Result<SharedValue, Error>),
    /// Parked behind an in-flight producer.
    Waiting(CancelConnection),
    /// This visitor claimed the cell and must start the producer.
    Claimed(CancelConnection),
}

/// Park the current run span behind the cell, claiming it if unowned.
pub(crate) fn enroll(
    cell: &Arc<MemoCell>,
    ctx: &Arc<Context>,
    cb: CallbackRef,
    b_first: Option<BindFrame>,
    b_rest: Option<ChunkedStack<BindFrame>>,
) {
    let mut waiter = Some(make_waiter(ctx.clone(), cb, b_first, b_rest));

    let enrolled = cell.state.transition(|state| match state {
        MemoState::Done(result) => Enrolled::Fire(result.clone()),
        MemoState::InProgress {
            waiters,
            connection,
        } => {
            if let Some(waiter) = waiter.take() {
                waiters.push(waiter);
            }
            Enrolled::Waiting(connection.clone())
        }
        MemoState::Empty => {
            let connection = CancelConnection::new();
            let mut waiters = Vec::with_capacity(1);
            if let Some(waiter) = waiter.take() {
                waiters.push(waiter);
            }
            *state = MemoState::InProgress {
                waiters,
                connection: connection.clone(),
            };
            Enrolled::Claimed(connection)
        }
    });

    match enrolled {
        Enrolled::Fire(result) => {
            if let Some(waiter) = waiter.take() {
                waiter(result);
            }
        }
        Enrolled::Waiting(connection) => {
            // Cancelling this run also cancels the in-flight producer.
            ctx.connection().push(Arc::new(connection));
        }
        Enrolled::Claimed(connection) => {
            let producer_ctx = Arc::new(Context::with_connection(
                ctx.scheduler().clone(),
                ctx.options(),
                connection,
            ));
            let cell2 = cell.clone();
            let done = OnceCallback::new(
                ctx.scheduler().clone(),
                Box::new(move |result: Result<Boxed, Error>| {
                    cell2.complete(result.map(unbox::<SharedValue>));
                }),
            );
            let producer = cell.producer.clone();
            ctx.scheduler().execute_trampolined(Box::new(move || {
                run_loop::start(producer, producer_ctx, done);
            }));
        }
    }
}

fn make_waiter(
    ctx: Arc<Context>,
    cb: CallbackRef,
    b_first: Option<BindFrame>,
    b_rest: Option<ChunkedStack<BindFrame>>,
) -> Waiter {
    Box::new(move |result| {
        ctx.frame_ref().reset();
        if ctx.should_cancel() {
            return;
        }
        let frame_index = ctx.frame_ref().get();
        match result {
            Ok(shared) => run_loop::resume(
                ctx,
                cb,
                None,
                b_first,
                b_rest,
                Some(shared.0.clone_value()),
                frame_index,
            ),
            Err(error) => run_loop::resume(
                ctx,
                cb,
                Some(Repr::Fail(error)),
                b_first,
                b_rest,
                None,
                frame_index,
            ),
        }
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::super::{Options, Task};
    use crate::error::Error;
    use crate::scheduler::TrampolineScheduler;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn run_now<A: Send + 'static>(task: &Task<A>) -> Result<A, Error> {
        task.run(Arc::new(TrampolineScheduler::default()))
            .try_take()
            .expect("task did not complete synchronously")
    }

    #[test]
    fn test_memoize_runs_producer_once() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let i = invocations.clone();
        let task = Task::eval(move || {
            i.fetch_add(1, Ordering::SeqCst);
            7
        })
        .memoize();

        assert_eq!(run_now(&task).unwrap(), 7);
        assert_eq!(run_now(&task).unwrap(), 7);
        assert_eq!(run_now(&task.clone()).unwrap(), 7);
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_memoize_caches_errors() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let i = invocations.clone();
        let task: Task<i32> = Task::eval_result(move || {
            i.fetch_add(1, Ordering::SeqCst);
            Err(Error::msg("always"))
        })
        .memoize();

        assert!(run_now(&task).is_err());
        assert!(run_now(&task).is_err());
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_memoize_on_success_retries_after_failure() {
        // A producer that fails on its first invocation only.
        let invocations = Arc::new(AtomicUsize::new(0));
        let i = invocations.clone();
        let task = Task::eval_result(move || {
            if i.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(Error::msg("first run fails"))
            } else {
                Ok(3)
            }
        })
        .memoize_on_success();

        assert!(run_now(&task).is_err());
        assert_eq!(run_now(&task).unwrap(), 3);
        // The cached success is served without another invocation.
        assert_eq!(run_now(&task).unwrap(), 3);
        assert_eq!(invocations.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_memoize_shares_across_clones() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let i = invocations.clone();
        let task = Task::eval(move || {
            i.fetch_add(1, Ordering::SeqCst);
            1
        })
        .memoize();
        let clone = task.clone();

        assert_eq!(run_now(&task).unwrap(), 1);
        assert_eq!(run_now(&clone).unwrap(), 1);
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_memoize_concurrent_waiters_observe_one_run() {
        use crate::scheduler::ThreadPoolScheduler;
        let scheduler: Arc<ThreadPoolScheduler> = Arc::new(ThreadPoolScheduler::with_workers(
            4,
            crate::exec::ExecutionModel::default(),
        ));
        let invocations = Arc::new(AtomicUsize::new(0));
        let i = invocations.clone();
        let task = Task::eval(move || {
            i.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(20));
            11
        })
        .memoize();

        let handles: Vec<_> = (0..8)
            .map(|_| task.run(scheduler.clone() as Arc<dyn crate::scheduler::Scheduler>))
            .collect();
        for handle in handles {
            assert_eq!(
                handle
                    .wait_timeout(std::time::Duration::from_secs(5))
                    .expect("timed out")
                    .unwrap(),
                11
            );
        }
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }
}
