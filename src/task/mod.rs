//! # Task: Deferred Effect Descriptions
//!
//! A [`Task`] is a pure, re-runnable description of a computation that may
//! succeed with a value, fail with an [`Error`], or suspend at an
//! asynchronous boundary. Nothing happens until one of the run entry points
//! interprets the description through the trampolined run-loop.
//!
//! ## Design
//!
//! The node tree is a closed tagged union ([`Repr`]); dispatch is a tag
//! match in a single interpreter loop, which is what makes deep bind chains
//! stack-safe. Intermediate values cross continuation boundaries as
//! `Box<dyn Any + Send>` and are downcast back inside the typed wrappers,
//! so heterogeneous bind chains need no generic plumbing in the interpreter
//! itself.
//!
//! ## Example
//!
//! ```rust,ignore
//! use monix::task::Task;
//! use monix::scheduler::TrampolineScheduler;
//! use std::sync::Arc;
//!
//! let task = Task::eval(|| 1).flat_map(|x| Task::pure(x + 2));
//! let handle = task.run(Arc::new(TrampolineScheduler::default()));
//! assert_eq!(handle.wait().unwrap(), 3);
//! ```

pub mod context;
pub mod future;

mod callback;
mod memo;
mod run_loop;

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::Error;
use crate::scheduler::Scheduler;

pub use callback::TaskCallback;
pub use context::{Context, Options};
pub use future::TaskHandle;
pub use run_loop::StepOutcome;

pub(crate) use callback::{OnceCallback, RestartCallback};
pub(crate) use memo::{MemoCell, SharedValue};

/// The erased value currency of the interpreter.
pub(crate) type Boxed = Box<dyn Any + Send>;

/// A value that can be re-materialized any number of times.
///
/// `Pure` nodes hold their payload behind this trait so one description can
/// be run repeatedly; each run clones a fresh value out of the node.
pub(crate) trait AnyValue: Send + Sync {
    /// Produce an owned, boxed copy of the value.
    fn clone_value(&self) -> Boxed;
}

pub(crate) struct CloneValue<T>(pub T);

impl<T: Clone + Send + Sync + 'static> AnyValue for CloneValue<T> {
    fn clone_value(&self) -> Boxed {
        Box::new(self.0.clone())
    }
}

/// Downcast an erased value back to its concrete type.
pub(crate) fn unbox<A: 'static>(value: Boxed) -> A {
    *value
        .downcast::<A>()
        .expect("task value type mismatch")
}

/// A single entry on the bind chain.
///
/// `Plain` and `MapValue` are ordinary continuations, skipped while an
/// error unwinds; `Handler` frames are skipped on the success path and
/// consumed by the unwinder.
#[derive(Clone)]
pub(crate) enum BindFrame {
    /// A monadic continuation producing the next subtree.
    Plain(Arc<dyn Fn(Boxed) -> Repr + Send + Sync>),
    /// A value transformation applied without growing the tree.
    MapValue(Arc<dyn Fn(Boxed) -> Result<Boxed, Error> + Send + Sync>, bool),
    /// An error handler producing a replacement subtree.
    Handler(Arc<dyn Fn(Error) -> Repr + Send + Sync>),
}

/// The effect tree interpreted by the run-loop.
#[derive(Clone)]
pub(crate) enum Repr {
    /// An already-computed value.
    Pure(Arc<dyn AnyValue>),
    /// A synchronous, possibly side-effecting producer.
    Eval(Arc<dyn Fn() -> Result<Boxed, Error> + Send + Sync>),
    /// Lazily produces the next subtree.
    Suspend(Arc<dyn Fn() -> Repr + Send + Sync>),
    /// A source chained with a continuation or error handler.
    FlatMap(Box<Repr>, BindFrame),
    /// A source with a value transformation; the flag records whether the
    /// function carries its own error channel, which blocks fusion.
    Map(
        Box<Repr>,
        Arc<dyn Fn(Boxed) -> Result<Boxed, Error> + Send + Sync>,
        bool,
    ),
    /// A failure value.
    Fail(Error),
    /// An escape hatch to external asynchrony.
    Async(Arc<dyn Fn(&Arc<Context>, RestartCallback) + Send + Sync>),
    /// A memoized subtree sharing one producer run across callers.
    Memoize(Arc<MemoCell>),
}

impl Repr {
    fn tag(&self) -> &'static str {
        match self {
            Repr::Pure(_) => "Pure",
            Repr::Eval(_) => "Eval",
            Repr::Suspend(_) => "Suspend",
            Repr::FlatMap(..) => "FlatMap",
            Repr::Map(..) => "Map",
            Repr::Fail(_) => "Fail",
            Repr::Async(_) => "Async",
            Repr::Memoize(_) => "Memoize",
        }
    }
}

/// A deferred, pure description of a computation.
///
/// Cloning a `Task` clones the description, not any result; every clone can
/// be run independently and repeatedly.
pub struct Task<A> {
    pub(crate) repr: Repr,
    _marker: PhantomData<fn() -> A>,
}

impl<A> Clone for Task<A> {
    fn clone(&self) -> Self {
        Task {
            repr: self.repr.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A> fmt::Debug for Task<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Task").field(&self.repr.tag()).finish()
    }
}

impl<A> Task<A> {
    pub(crate) fn from_repr(repr: Repr) -> Self {
        Task {
            repr,
            _marker: PhantomData,
        }
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl<A: Send + 'static> Task<A> {
    /// Lift an already-computed value.
    ///
    /// The value is cloned out of the description on every run, which is
    /// what keeps the description re-runnable.
    pub fn pure(value: A) -> Self
    where
        A: Clone + Sync,
    {
        Task::from_repr(Repr::Pure(Arc::new(CloneValue(value))))
    }

    /// Defer a synchronous, possibly side-effecting producer.
    pub fn eval(f: impl Fn() -> A + Send + Sync + 'static) -> Self {
        Task::from_repr(Repr::Eval(Arc::new(move || Ok(Box::new(f()) as Boxed))))
    }

    /// Defer a fallible producer.
    pub fn eval_result(f: impl Fn() -> Result<A, Error> + Send + Sync + 'static) -> Self {
        Task::from_repr(Repr::Eval(Arc::new(move || {
            f().map(|a| Box::new(a) as Boxed)
        })))
    }

    /// Defer the construction of a whole task.
    pub fn defer(f: impl Fn() -> Task<A> + Send + Sync + 'static) -> Self {
        Task::from_repr(Repr::Suspend(Arc::new(move || f().repr)))
    }

    /// Defer construction with access to the run's [`Context`].
    pub fn defer_action(f: impl Fn(&Arc<Context>) -> Task<A> + Send + Sync + 'static) -> Self {
        Task::from_repr(Repr::Async(Arc::new(
            move |ctx: &Arc<Context>, restart: RestartCallback| {
                run_loop::start_child(f(ctx).repr, ctx, restart);
            },
        )))
    }

    /// Lift a failure.
    pub fn raise(error: Error) -> Self {
        Task::from_repr(Repr::Fail(error))
    }

    /// Create a task from an asynchronous registration.
    ///
    /// `register` receives the run's context and a single-shot callback; it
    /// must eventually complete the callback exactly once, from any thread.
    pub fn create(
        register: impl Fn(&Arc<Context>, TaskCallback<A>) + Send + Sync + 'static,
    ) -> Self {
        Task::from_repr(Repr::Async(Arc::new(
            move |ctx: &Arc<Context>, restart: RestartCallback| {
                register(ctx, TaskCallback::new(restart));
            },
        )))
    }
}

impl Task<()> {
    /// The completed unit task.
    pub fn unit() -> Task<()> {
        Task::pure(())
    }

    /// A task that reschedules its continuation onto the scheduler.
    pub fn shift() -> Task<()> {
        Task::create(|ctx, cb| {
            ctx.scheduler().execute(Box::new(move || cb.success(())));
        })
    }
}

// ============================================================================
// Combinators
// ============================================================================

impl<A: Send + 'static> Task<A> {
    /// Transform the result value.
    ///
    /// Two adjacent infallible maps fuse into a single frame.
    pub fn map<B: Send + 'static>(&self, f: impl Fn(A) -> B + Send + Sync + 'static) -> Task<B> {
        let g: Arc<dyn Fn(Boxed) -> Result<Boxed, Error> + Send + Sync> =
            Arc::new(move |value| Ok(Box::new(f(unbox::<A>(value))) as Boxed));
        match &self.repr {
            Repr::Map(source, inner, false) => {
                let inner = inner.clone();
                let fused: Arc<dyn Fn(Boxed) -> Result<Boxed, Error> + Send + Sync> =
                    Arc::new(move |value| inner(value).and_then(|v| g(v)));
                Task::from_repr(Repr::Map(source.clone(), fused, true))
            }
            _ => Task::from_repr(Repr::Map(Box::new(self.repr.clone()), g, false)),
        }
    }

    /// Chain a continuation producing the next task.
    pub fn flat_map<B: Send + 'static>(
        &self,
        f: impl Fn(A) -> Task<B> + Send + Sync + 'static,
    ) -> Task<B> {
        Task::from_repr(Repr::FlatMap(
            Box::new(self.repr.clone()),
            BindFrame::Plain(Arc::new(move |value: Boxed| f(unbox::<A>(value)).repr)),
        ))
    }

    /// Sequence another task after this one, discarding this result.
    pub fn followed_by<B: Send + 'static>(&self, next: Task<B>) -> Task<B> {
        self.flat_map(move |_| next.clone())
    }

    /// Recover from a failure with a replacement task.
    ///
    /// Plain continuations between the failure and this handler are
    /// discarded during unwinding.
    pub fn on_error_handle_with(
        &self,
        f: impl Fn(Error) -> Task<A> + Send + Sync + 'static,
    ) -> Task<A> {
        Task::from_repr(Repr::FlatMap(
            Box::new(self.repr.clone()),
            BindFrame::Handler(Arc::new(move |error: Error| f(error).repr)),
        ))
    }

    /// Materialize the error channel into the value.
    pub fn attempt(&self) -> Task<Result<A, Error>> {
        let ok = Repr::Map(
            Box::new(self.repr.clone()),
            Arc::new(|value: Boxed| Ok(Box::new(Ok::<A, Error>(unbox::<A>(value))) as Boxed)),
            false,
        );
        Task::from_repr(Repr::FlatMap(
            Box::new(ok),
            BindFrame::Handler(Arc::new(|error: Error| {
                let error = error.clone();
                Repr::Eval(Arc::new(move || {
                    Ok(Box::new(Err::<A, Error>(error.clone())) as Boxed)
                }))
            })),
        ))
    }

    /// Move the rest of the computation behind an async boundary.
    pub fn async_boundary(&self) -> Task<A> {
        let this = self.clone();
        Task::shift().flat_map(move |_| this.clone())
    }

    /// Memoize the first successful or failed outcome.
    ///
    /// The producer runs at most once; every subsequent run and every
    /// concurrent waiter observes the cached outcome.
    pub fn memoize(&self) -> Task<A>
    where
        A: Clone + Sync,
    {
        self.memoize_with(true)
    }

    /// Memoize successful outcomes only.
    ///
    /// A failed producer completes in-flight waiters with the failure and
    /// resets the cell, so the next run invokes the producer afresh.
    pub fn memoize_on_success(&self) -> Task<A>
    where
        A: Clone + Sync,
    {
        self.memoize_with(false)
    }

    fn memoize_with(&self, cache_errors: bool) -> Task<A>
    where
        A: Clone + Sync,
    {
        let producer = Repr::Map(
            Box::new(self.repr.clone()),
            Arc::new(|value: Boxed| {
                let shared = SharedValue(Arc::new(CloneValue(unbox::<A>(value))));
                Ok(Box::new(shared) as Boxed)
            }),
            false,
        );
        Task::from_repr(Repr::Memoize(Arc::new(MemoCell::new(producer, cache_errors))))
    }
}

// ============================================================================
// Run entry points
// ============================================================================

impl<A: Send + 'static> Task<A> {
    /// Interpret the task, delivering the outcome to `f` at most once.
    pub fn run_with_callback(
        &self,
        ctx: &Arc<Context>,
        f: impl FnOnce(Result<A, Error>) + Send + 'static,
    ) {
        let cb = OnceCallback::new(
            ctx.scheduler().clone(),
            Box::new(move |result| f(result.map(unbox::<A>))),
        );
        run_loop::start(self.repr.clone(), ctx.clone(), cb);
    }

    /// Interpret the task, returning a cancelable handle.
    ///
    /// If no async boundary is encountered the handle is already completed
    /// when this returns.
    pub fn run_as_future(&self, scheduler: Arc<dyn Scheduler>, options: Options) -> TaskHandle<A> {
        TaskHandle::start(self, scheduler, options)
    }

    /// Interpret with default options.
    pub fn run(&self, scheduler: Arc<dyn Scheduler>) -> TaskHandle<A> {
        self.run_as_future(scheduler, Options::default())
    }

    /// Run trampoline cycles up to the first async boundary.
    ///
    /// Returns the finished outcome, or the simplified remainder of the
    /// tree for the caller to checkpoint. No scheduler is consulted and no
    /// async registration is invoked.
    pub fn step(&self, model: crate::exec::ExecutionModel) -> StepOutcome<A> {
        run_loop::step(self.repr.clone(), model)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::TrampolineScheduler;

    fn run_now<A: Send + 'static>(task: &Task<A>) -> Result<A, Error> {
        let handle = task.run(Arc::new(TrampolineScheduler::default()));
        handle
            .try_take()
            .expect("task did not complete synchronously")
    }

    #[test]
    fn test_eval_flat_map_pure() {
        // delay(1) bound into pure(x + 2) delivers 3.
        let task = Task::eval(|| 1).flat_map(|x| Task::pure(x + 2));
        assert_eq!(run_now(&task).unwrap(), 3);
    }

    #[test]
    fn test_map_transforms_value() {
        let task = Task::pure(20).map(|x| x * 2).map(|x| x + 2);
        assert_eq!(run_now(&task).unwrap(), 42);
    }

    #[test]
    fn test_error_skips_plain_continuations() {
        let raised = Task::<i32>::raise(Error::msg("dummy"));
        let chained = raised.flat_map(|_| Task::pure(0));
        let recovered = chained.on_error_handle_with(|_| Task::pure(7));
        assert_eq!(run_now(&recovered).unwrap(), 7);
    }

    #[test]
    fn test_attempt_materializes_errors() {
        let err = Task::<i32>::raise(Error::msg("boom")).attempt();
        assert!(run_now(&err).unwrap().is_err());

        let ok = Task::pure(5).attempt();
        assert_eq!(run_now(&ok).unwrap().unwrap(), 5);
    }

    #[test]
    fn test_handler_is_skipped_on_success() {
        let task = Task::pure(1).on_error_handle_with(|_| Task::pure(99));
        assert_eq!(run_now(&task).unwrap(), 1);
    }

    #[test]
    fn test_eval_panics_become_errors() {
        let task: Task<i32> = Task::eval(|| panic!("thunk blew up"));
        let err = run_now(&task).unwrap_err();
        assert!(err.to_string().contains("thunk blew up"));
    }

    #[test]
    fn test_task_is_rerunnable() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let task = Task::eval(move || c.fetch_add(1, Ordering::SeqCst));
        assert_eq!(run_now(&task).unwrap(), 0);
        assert_eq!(run_now(&task).unwrap(), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_deep_bind_recursion_is_stack_safe() {
        // Recursion expressed through defer: the tree stays shallow while
        // the interpreter performs 200k bind reductions.
        fn count_up(x: u64, limit: u64) -> Task<u64> {
            if x == limit {
                Task::pure(x)
            } else {
                Task::defer(move || Task::pure(x + 1)).flat_map(move |n| count_up(n, limit))
            }
        }
        assert_eq!(run_now(&count_up(0, 200_000)).unwrap(), 200_000);
    }

    #[test]
    fn test_eager_bind_chain_interprets_iteratively() {
        let mut task = Task::pure(0u64);
        for _ in 0..10_000 {
            task = task.flat_map(|x| Task::pure(x + 1));
        }
        assert_eq!(run_now(&task).unwrap(), 10_000);
    }

    #[test]
    fn test_defer_builds_lazily() {
        use std::sync::atomic::{AtomicBool, Ordering};
        let built = Arc::new(AtomicBool::new(false));
        let b = built.clone();
        let task = Task::defer(move || {
            b.store(true, Ordering::SeqCst);
            Task::pure(1)
        });
        assert!(!built.load(Ordering::SeqCst));
        assert_eq!(run_now(&task).unwrap(), 1);
        assert!(built.load(Ordering::SeqCst));
    }

    #[test]
    fn test_followed_by_discards_first_result() {
        let task = Task::pure(1).followed_by(Task::pure("two"));
        assert_eq!(run_now(&task).unwrap(), "two");
    }
}
