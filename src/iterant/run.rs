//! Stream Consumers and the Scope Lifecycle
//!
//! Consumers interpret the stream tree through the task runtime. They are
//! the only place where a [`ScopeNode`] is opened: acquire runs, the body is
//! built with this scope's early-stop finalizer, and a once-guarded release
//! is pushed onto the consumer's scope stack.
//!
//! Release fires exactly once per scope, on the first of three paths:
//!
//! - the stream is fully consumed (`ExitCase::Completed`),
//! - a downstream consumer stops pulling (`ExitCase::EarlyStop`, delivered
//!   through the node `stop` chains),
//! - an error surfaces (`ExitCase::Error`).
//!
//! When releases run while an error is propagating, the original error is
//! delivered and release failures are reported; on the completion path the
//! first release failure becomes the stream's error and later ones are
//! reported.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{guard_panic, Error};
use crate::task::Task;

use super::{ExitCase, Iterant, Resource, ScopeNode};

/// A once-guarded release for one opened scope.
#[derive(Clone)]
pub(crate) struct OnceRelease {
    fired: Arc<AtomicBool>,
    resource: Resource,
    release: Arc<dyn Fn(Resource, ExitCase) -> Task<()> + Send + Sync>,
}

impl OnceRelease {
    fn new(
        resource: Resource,
        release: Arc<dyn Fn(Resource, ExitCase) -> Task<()> + Send + Sync>,
    ) -> Self {
        OnceRelease {
            fired: Arc::new(AtomicBool::new(false)),
            resource,
            release,
        }
    }

    /// The release as a task; only the first run reaches the callback.
    fn task(&self, exit: ExitCase) -> Task<()> {
        let this = self.clone();
        Task::defer(move || {
            if this.fired.swap(true, Ordering::AcqRel) {
                Task::unit()
            } else {
                (this.release)(this.resource.clone(), exit.clone())
            }
        })
    }
}

type Scopes = Vec<OnceRelease>;

/// Fire every open release in LIFO order.
///
/// `first` carries the error being propagated, if any; it survives to the
/// result while later failures are reported.
fn run_releases(scopes: Scopes, exit: ExitCase, first: Option<Error>) -> Task<Option<Error>> {
    Task::defer(move || {
        let mut scopes = scopes.clone();
        let scope = match scopes.pop() {
            None => return Task::pure(first.clone()),
            Some(scope) => scope,
        };
        let exit2 = exit.clone();
        let first = first.clone();
        scope.task(exit.clone()).attempt().flat_map(move |result| {
            let scopes = scopes.clone();
            let exit = exit2.clone();
            match (first.clone(), result) {
                (first, Ok(())) => run_releases(scopes, exit, first),
                (None, Err(error)) => run_releases(scopes, exit, Some(error)),
                (Some(original), Err(secondary)) => Task::defer_action(move |ctx| {
                    ctx.scheduler().report_failure(&secondary);
                    run_releases(scopes.clone(), exit.clone(), Some(original.clone()))
                }),
            }
        })
    })
}

/// Completion path: release everything, then deliver the value.
fn finalize_completed<S: Clone + Send + Sync + 'static>(scopes: Scopes, value: S) -> Task<S> {
    run_releases(scopes, ExitCase::Completed, None).flat_map(move |pending| match pending {
        None => Task::pure(value.clone()),
        Some(error) => Task::raise(error),
    })
}

/// Error path: release everything with the error, then deliver it.
fn finalize_error<S: Send + 'static>(scopes: Scopes, error: Error) -> Task<S> {
    run_releases(scopes, ExitCase::Error(error.clone()), Some(error)).flat_map(|pending| {
        match pending {
            Some(error) => Task::raise(error),
            // The original error always survives run_releases.
            None => Task::raise(Error::msg("stream failed")),
        }
    })
}

/// A consumer failure between elements: run the branch finalizer (so
/// enclosing scopes see an early stop), report its failure if any, then
/// deliver the consumer's error.
fn stop_then_raise<S: Send + 'static>(stop: Task<()>, error: Error) -> Task<S> {
    super::run_stop_reporting(stop).flat_map(move |_| Task::raise(error.clone()))
}

// ============================================================================
// Consumers
// ============================================================================

impl<A: Clone + Send + Sync + 'static> Iterant<A> {
    /// Fold the stream left to right into a single value.
    pub fn fold_left<S: Clone + Send + Sync + 'static>(
        self,
        seed: S,
        f: impl Fn(S, A) -> S + Send + Sync + 'static,
    ) -> Task<S> {
        let f: Arc<dyn Fn(S, A) -> S + Send + Sync> = Arc::new(f);
        Task::defer(move || fold_step(self.clone(), seed.clone(), f.clone(), Vec::new()))
    }

    /// Collect every element into a vector.
    pub fn to_vec(self) -> Task<Vec<A>> {
        self.fold_left(Vec::new(), |mut acc, item| {
            acc.push(item);
            acc
        })
    }

    /// Drain the stream for its effects.
    pub fn completed(self) -> Task<()> {
        self.fold_left((), |_, _| ())
    }

    /// Pull the first element, stopping the stream early.
    pub fn head_option(self) -> Task<Option<A>> {
        Task::defer(move || head_step(self.clone(), Vec::new()))
    }
}

fn pull<A, S>(
    tail: Task<Iterant<A>>,
    acc: S,
    f: Arc<dyn Fn(S, A) -> S + Send + Sync>,
    scopes: Scopes,
) -> Task<S>
where
    A: Clone + Send + Sync + 'static,
    S: Clone + Send + Sync + 'static,
{
    tail.attempt().flat_map(move |result| match result {
        Ok(node) => fold_step(node, acc.clone(), f.clone(), scopes.clone()),
        Err(error) => finalize_error(scopes.clone(), error),
    })
}

fn fold_step<A, S>(
    node: Iterant<A>,
    acc: S,
    f: Arc<dyn Fn(S, A) -> S + Send + Sync>,
    scopes: Scopes,
) -> Task<S>
where
    A: Clone + Send + Sync + 'static,
    S: Clone + Send + Sync + 'static,
{
    match node {
        Iterant::Next { item, rest, stop } => {
            match guard_panic(|| f(acc.clone(), item)) {
                Ok(next_acc) => pull(rest, next_acc, f, scopes),
                Err(error) => stop_then_raise(stop, error),
            }
        }
        Iterant::NextCursor { cursor, rest, stop } => {
            drain_cursor(cursor, rest, stop, acc, f, scopes)
        }
        Iterant::NextBatch { batch, rest, stop } => match guard_panic(|| batch.cursor()) {
            Ok(cursor) => drain_cursor(cursor, rest, stop, acc, f, scopes),
            Err(error) => finalize_error(scopes, error),
        },
        Iterant::Suspend { rest, .. } => pull(rest, acc, f, scopes),
        Iterant::Scope(scope) => open_scope(scope, scopes, move |inner, scopes| {
            fold_step(inner, acc.clone(), f.clone(), scopes)
        }),
        Iterant::Last(item) => match guard_panic(|| f(acc.clone(), item)) {
            Ok(final_acc) => finalize_completed(scopes, final_acc),
            Err(error) => finalize_error(scopes, error),
        },
        Iterant::Halt(None) => finalize_completed(scopes, acc),
        Iterant::Halt(Some(error)) => finalize_error(scopes, error),
    }
}

/// Drain a cursor under the recommended pull budget, then yield a frame.
fn drain_cursor<A, S>(
    cursor: super::BatchCursor<A>,
    rest: Task<Iterant<A>>,
    stop: Task<()>,
    acc: S,
    f: Arc<dyn Fn(S, A) -> S + Send + Sync>,
    scopes: Scopes,
) -> Task<S>
where
    A: Clone + Send + Sync + 'static,
    S: Clone + Send + Sync + 'static,
{
    let budget = cursor.recommended_batch_size().max(1);
    let mut acc = acc;
    let mut consumed = 0usize;
    loop {
        if consumed >= budget {
            // Keep the consumer preemptible on long cursors.
            return Task::defer(move || {
                drain_cursor(
                    cursor.clone(),
                    rest.clone(),
                    stop.clone(),
                    acc.clone(),
                    f.clone(),
                    scopes.clone(),
                )
            });
        }
        match guard_panic(|| cursor.next_item()) {
            // A broken cursor fails the stream; scopes release with Error.
            Err(error) => return finalize_error(scopes, error),
            Ok(None) => return pull(rest, acc, f, scopes),
            Ok(Some(item)) => match guard_panic(|| f(acc.clone(), item)) {
                Ok(next_acc) => {
                    acc = next_acc;
                    consumed += 1;
                }
                Err(error) => return stop_then_raise(stop, error),
            },
        }
    }
}

/// Open a scope: acquire, build the finalizer-threaded body, push the
/// once-guarded release, and continue with the inner stream.
fn open_scope<A, S>(
    scope: ScopeNode<A>,
    scopes: Scopes,
    continue_with: impl Fn(Iterant<A>, Scopes) -> Task<S> + Send + Sync + 'static,
) -> Task<S>
where
    A: Clone + Send + Sync + 'static,
    S: Clone + Send + Sync + 'static,
{
    let ScopeNode {
        acquire,
        release,
        body,
    } = scope;
    acquire.attempt().flat_map(move |result| {
        match result {
            // A failed acquire opens nothing; release never runs for it.
            Err(error) => finalize_error(scopes.clone(), error),
            Ok(resource) => {
                let once = OnceRelease::new(resource.clone(), release.clone());
                let early = once.task(ExitCase::EarlyStop);
                match guard_panic(|| body(resource.clone(), early)) {
                    Err(error) => {
                        // The scope body threw: release with Error, then fail.
                        let mut scopes = scopes.clone();
                        scopes.push(once);
                        finalize_error(scopes, error)
                    }
                    Ok(inner) => {
                        let mut scopes = scopes.clone();
                        scopes.push(once);
                        continue_with(inner, scopes)
                    }
                }
            }
        }
    })
}

fn head_step<A: Clone + Send + Sync + 'static>(
    node: Iterant<A>,
    scopes: Scopes,
) -> Task<Option<A>> {
    match node {
        Iterant::Next { item, stop, .. } => {
            // Early stop: run the branch finalizer, then settle the scopes.
            stop.flat_map(move |_| {
                let item = item.clone();
                Task::pure(Some(item))
            })
            .flat_map({
                let scopes = scopes.clone();
                move |value| {
                    run_releases(scopes.clone(), ExitCase::EarlyStop, None).flat_map(
                        move |pending| match pending {
                            None => Task::pure(value.clone()),
                            Some(error) => Task::raise(error),
                        },
                    )
                }
            })
        }
        Iterant::NextCursor { cursor, rest, stop } => match guard_panic(|| cursor.next_item()) {
            Err(error) => finalize_error(scopes, error),
            Ok(Some(item)) => head_step(
                Iterant::Next {
                    item,
                    rest,
                    stop: stop.clone(),
                },
                scopes,
            ),
            Ok(None) => head_pull(rest, scopes),
        },
        Iterant::NextBatch { batch, rest, stop } => match guard_panic(|| batch.cursor()) {
            Ok(cursor) => head_step(Iterant::NextCursor { cursor, rest, stop }, scopes),
            Err(error) => finalize_error(scopes, error),
        },
        Iterant::Suspend { rest, .. } => head_pull(rest, scopes),
        Iterant::Scope(scope) => {
            open_scope(scope, scopes, move |inner, scopes| head_step(inner, scopes))
        }
        Iterant::Last(item) => finalize_completed(scopes, Some(item)),
        Iterant::Halt(None) => finalize_completed(scopes, None),
        Iterant::Halt(Some(error)) => finalize_error(scopes, error),
    }
}

fn head_pull<A: Clone + Send + Sync + 'static>(
    tail: Task<Iterant<A>>,
    scopes: Scopes,
) -> Task<Option<A>> {
    tail.attempt().flat_map(move |result| match result {
        Ok(node) => head_step(node, scopes.clone()),
        Err(error) => finalize_error(scopes.clone(), error),
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::TrampolineScheduler;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn run<A: Send + 'static>(task: Task<A>) -> Result<A, Error> {
        task.run(Arc::new(TrampolineScheduler::default()))
            .try_take()
            .expect("did not complete synchronously")
    }

    #[test]
    fn test_fold_left_accumulates_in_order() {
        let sum = Iterant::of([1, 2, 3, 4]).fold_left(0, |acc, x| acc + x);
        assert_eq!(run(sum).unwrap(), 10);
    }

    #[test]
    fn test_head_option() {
        assert_eq!(run(Iterant::of([5, 6]).head_option()).unwrap(), Some(5));
        assert_eq!(run(Iterant::<i32>::empty().head_option()).unwrap(), None);
    }

    #[test]
    fn test_completed_drains_effects() {
        let pulls = Arc::new(AtomicUsize::new(0));
        let p = pulls.clone();
        let stream = Iterant::from_cursor(super::super::BatchCursor::from_iter(
            (0..5).inspect(move |_| {
                p.fetch_add(1, Ordering::SeqCst);
            }),
        ));
        run(stream.completed()).unwrap();
        assert_eq!(pulls.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_scope_releases_completed_on_full_consumption() {
        let exits = Arc::new(Mutex::new(Vec::new()));
        let e = exits.clone();
        let stream = Iterant::scope(
            Task::eval(|| ()),
            |_r| Iterant::of([1, 2, 3]),
            move |_r, exit| {
                let e = e.clone();
                Task::eval(move || e.lock().push(exit.clone()))
            },
        );
        assert_eq!(run(stream.to_vec()).unwrap(), vec![1, 2, 3]);
        let seen = exits.lock();
        assert_eq!(seen.len(), 1);
        assert!(matches!(seen[0], ExitCase::Completed));
    }

    #[test]
    fn test_scope_acquire_failure_skips_release() {
        let releases = Arc::new(AtomicUsize::new(0));
        let r = releases.clone();
        let stream: Iterant<i32> = Iterant::scope(
            Task::<()>::raise(Error::msg("acquire failed")),
            |_r| Iterant::of([1]),
            move |_r, _exit| {
                let r = r.clone();
                Task::eval(move || {
                    r.fetch_add(1, Ordering::SeqCst);
                })
            },
        );
        assert!(run(stream.to_vec()).is_err());
        assert_eq!(releases.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_scope_body_panic_releases_with_error() {
        let exits = Arc::new(Mutex::new(Vec::new()));
        let e = exits.clone();
        let stream: Iterant<i32> = Iterant::scope(
            Task::eval(|| ()),
            |_r| panic!("use blew up"),
            move |_r, exit| {
                let e = e.clone();
                Task::eval(move || e.lock().push(exit.clone()))
            },
        );
        assert!(run(stream.to_vec()).is_err());
        let seen = exits.lock();
        assert_eq!(seen.len(), 1);
        assert!(matches!(seen[0], ExitCase::Error(_)));
    }

    #[test]
    fn test_nested_scopes_inner_release_failure_still_runs_outer() {
        let outer_ran = Arc::new(AtomicUsize::new(0));
        let o = outer_ran.clone();
        let inner = Iterant::scope(
            Task::eval(|| ()),
            |_r| Iterant::of([1]),
            |_r, _exit| Task::raise(Error::msg("inner release failed")),
        );
        let stream = Iterant::scope(
            Task::eval(|| ()),
            move |_r| inner.clone(),
            move |_r, _exit| {
                let o = o.clone();
                Task::eval(move || {
                    o.fetch_add(1, Ordering::SeqCst);
                })
            },
        );
        let result = run(stream.to_vec());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("inner release failed"));
        assert_eq!(outer_ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_head_option_releases_scope_early() {
        let exits = Arc::new(Mutex::new(Vec::new()));
        let e = exits.clone();
        let stream = Iterant::scope(
            Task::eval(|| ()),
            |_r| Iterant::of([1, 2, 3]),
            move |_r, exit| {
                let e = e.clone();
                Task::eval(move || e.lock().push(exit.clone()))
            },
        );
        assert_eq!(run(stream.head_option()).unwrap(), Some(1));
        let seen = exits.lock();
        assert_eq!(seen.len(), 1);
        assert!(matches!(seen[0], ExitCase::EarlyStop));
    }

    #[test]
    fn test_broken_cursor_inside_scope_releases_with_error() {
        let exits = Arc::new(Mutex::new(Vec::new()));
        let e = exits.clone();
        let stream = Iterant::scope(
            Task::eval(|| ()),
            |_r| {
                Iterant::from_cursor(super::super::BatchCursor::from_iter((0..5).map(|x| {
                    if x == 2 {
                        panic!("broken cursor");
                    }
                    x
                })))
            },
            move |_r, exit| {
                let e = e.clone();
                Task::eval(move || e.lock().push(exit.clone()))
            },
        );
        let result = run(stream.to_vec());
        assert!(result.unwrap_err().to_string().contains("broken cursor"));
        let seen = exits.lock();
        assert_eq!(seen.len(), 1);
        assert!(matches!(seen[0], ExitCase::Error(_)));
    }

    #[test]
    fn test_fold_function_failure_stops_stream_early() {
        let exits = Arc::new(Mutex::new(Vec::new()));
        let e = exits.clone();
        let stream = Iterant::scope(
            Task::eval(|| ()),
            |_r| Iterant::Next {
                item: 1,
                rest: Task::pure(Iterant::of([2, 3])),
                stop: Task::unit(),
            },
            move |_r, exit| {
                let e = e.clone();
                Task::eval(move || e.lock().push(exit.clone()))
            },
        );
        let folded = stream.fold_left(0, |_, _| panic!("consumer failed"));
        assert!(run(folded).is_err());
        let seen = exits.lock();
        assert_eq!(seen.len(), 1);
        assert!(matches!(seen[0], ExitCase::EarlyStop));
    }
}
