//! # Iterant: Pull-Based Streaming
//!
//! An [`Iterant`] is a finite or infinite pull-based sequence whose tails
//! are [`Task`] values, layering bracketed resource management and error
//! recovery on top of the effect runtime.
//!
//! ## Design
//!
//! Every transformation is a total tree rewriter: a loop function that
//! pattern-matches on all node variants. Four rules keep the rewriters
//! honest:
//!
//! 1. Effect-typed tails are never pulled eagerly; they are wrapped with
//!    `tail.map(loop)`.
//! 2. Scope nodes are never dropped; rewriters descend into the scope body
//!    through [`ScopeNode::remap`], which applies the rewrite *after* the
//!    body's finalizers are wired, keeping acquire/release paired.
//! 3. A non-fatal panic inside a rewriter becomes a downstream-visible
//!    `Halt`, never an unwind out of the rewriter.
//! 4. A first step that consumes cursors or instantiates batches is
//!    suspended in `Suspend(Task::eval(..))` so the operation as a whole
//!    stays referentially transparent.
//!
//! ## Early stop
//!
//! The cons-like variants carry a `stop` task: the accumulated finalizer
//! for that branch. Builders seed it with `Task::unit()`; opening a scope
//! extends every node inside the scope body with that scope's
//! `release(_, ExitCase::EarlyStop)`, innermost first. A consumer that
//! stops pulling mid-stream runs the current node's `stop`; release tasks
//! are once-guarded, so the completion path that follows cannot fire them
//! again.

pub mod batch;

mod drop_while;
mod on_error;
mod run;
mod take;

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::error::{guard_panic, Error};
use crate::task::Task;

pub use batch::{Batch, BatchCursor};

/// Type-erased scope resource; the typed builder recovers the concrete
/// type on the way back in.
pub type Resource = Arc<dyn Any + Send + Sync>;

/// The discriminant passed to a scope's release callback.
#[derive(Debug, Clone)]
pub enum ExitCase {
    /// The stream was fully consumed.
    Completed,
    /// A downstream consumer stopped pulling early.
    EarlyStop,
    /// An error surfaced inside the scope or its descendants.
    Error(Error),
}

/// A pull-based stream node.
pub enum Iterant<A> {
    /// A single element followed by an effect-typed tail.
    Next {
        item: A,
        rest: Task<Iterant<A>>,
        stop: Task<()>,
    },
    /// A stateful cursor of elements followed by a tail.
    NextCursor {
        cursor: BatchCursor<A>,
        rest: Task<Iterant<A>>,
        stop: Task<()>,
    },
    /// A restartable batch of elements followed by a tail.
    NextBatch {
        batch: Batch<A>,
        rest: Task<Iterant<A>>,
        stop: Task<()>,
    },
    /// A purely suspended tail.
    Suspend {
        rest: Task<Iterant<A>>,
        stop: Task<()>,
    },
    /// A bracketed resource segment.
    Scope(ScopeNode<A>),
    /// The final element of the stream.
    Last(A),
    /// Stream end, normal or failed.
    Halt(Option<Error>),
}

impl<A: Clone> Clone for Iterant<A> {
    fn clone(&self) -> Self {
        match self {
            Iterant::Next { item, rest, stop } => Iterant::Next {
                item: item.clone(),
                rest: rest.clone(),
                stop: stop.clone(),
            },
            Iterant::NextCursor { cursor, rest, stop } => Iterant::NextCursor {
                cursor: cursor.clone(),
                rest: rest.clone(),
                stop: stop.clone(),
            },
            Iterant::NextBatch { batch, rest, stop } => Iterant::NextBatch {
                batch: batch.clone(),
                rest: rest.clone(),
                stop: stop.clone(),
            },
            Iterant::Suspend { rest, stop } => Iterant::Suspend {
                rest: rest.clone(),
                stop: stop.clone(),
            },
            Iterant::Scope(scope) => Iterant::Scope(scope.clone()),
            Iterant::Last(item) => Iterant::Last(item.clone()),
            Iterant::Halt(error) => Iterant::Halt(error.clone()),
        }
    }
}

impl<A> fmt::Debug for Iterant<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            Iterant::Next { .. } => "Next",
            Iterant::NextCursor { .. } => "NextCursor",
            Iterant::NextBatch { .. } => "NextBatch",
            Iterant::Suspend { .. } => "Suspend",
            Iterant::Scope(_) => "Scope",
            Iterant::Last(_) => "Last",
            Iterant::Halt(_) => "Halt",
        };
        f.debug_tuple("Iterant").field(&tag).finish()
    }
}

/// A bracketed segment: acquire a resource, stream through its body,
/// release on exactly one of the termination paths.
///
/// The body receives the resource and this scope's early-stop finalizer; it
/// returns the inner stream with that finalizer already threaded through
/// every node. Rewrites applied through [`ScopeNode::remap`] therefore see
/// finalizer-correct nodes.
pub struct ScopeNode<A> {
    pub(crate) acquire: Task<Resource>,
    pub(crate) release: Arc<dyn Fn(Resource, ExitCase) -> Task<()> + Send + Sync>,
    pub(crate) body: Arc<dyn Fn(Resource, Task<()>) -> Iterant<A> + Send + Sync>,
}

impl<A> Clone for ScopeNode<A> {
    fn clone(&self) -> Self {
        ScopeNode {
            acquire: self.acquire.clone(),
            release: self.release.clone(),
            body: self.body.clone(),
        }
    }
}

impl<A: Clone + Send + Sync + 'static> ScopeNode<A> {
    /// Apply a stream rewrite to the scope body, after finalizer wiring.
    pub(crate) fn remap<B: Clone + Send + Sync + 'static>(
        &self,
        f: Arc<dyn Fn(Iterant<A>) -> Iterant<B> + Send + Sync>,
    ) -> ScopeNode<B> {
        let body = self.body.clone();
        ScopeNode {
            acquire: self.acquire.clone(),
            release: self.release.clone(),
            body: Arc::new(move |resource: Resource, early: Task<()>| f(body(resource, early))),
        }
    }

    /// Thread an enclosing scope's early-stop finalizer through this
    /// scope's body, after this scope's own.
    pub(crate) fn extend(&self, early: Task<()>) -> ScopeNode<A> {
        let body = self.body.clone();
        ScopeNode {
            acquire: self.acquire.clone(),
            release: self.release.clone(),
            body: Arc::new(move |resource: Resource, inner_early: Task<()>| {
                extend_stop(body(resource, inner_early), early.clone())
            }),
        }
    }
}

// ============================================================================
// Builders
// ============================================================================

impl<A: Clone + Send + Sync + 'static> Iterant<A> {
    /// A stream over the given elements.
    pub fn of(items: impl IntoIterator<Item = A>) -> Self {
        Iterant::from_vec(items.into_iter().collect())
    }

    /// A stream over a vector of elements, emitted as one batch.
    pub fn from_vec(items: Vec<A>) -> Self {
        if items.is_empty() {
            return Iterant::Halt(None);
        }
        Iterant::NextBatch {
            batch: Batch::from_vec(items),
            rest: Task::pure(Iterant::Halt(None)),
            stop: Task::unit(),
        }
    }

    /// A stream over a batch.
    pub fn from_batch(batch: Batch<A>) -> Self {
        Iterant::NextBatch {
            batch,
            rest: Task::pure(Iterant::Halt(None)),
            stop: Task::unit(),
        }
    }

    /// A stream over a single cursor.
    pub fn from_cursor(cursor: BatchCursor<A>) -> Self {
        Iterant::NextCursor {
            cursor,
            rest: Task::pure(Iterant::Halt(None)),
            stop: Task::unit(),
        }
    }

    /// The empty stream.
    pub fn empty() -> Self {
        Iterant::Halt(None)
    }

    /// A single-element stream.
    pub fn last(item: A) -> Self {
        Iterant::Last(item)
    }

    /// A stream that fails immediately.
    pub fn raise_error(error: Error) -> Self {
        Iterant::Halt(Some(error))
    }

    /// A single-element stream evaluated on pull.
    pub fn eval(f: impl Fn() -> A + Send + Sync + 'static) -> Self {
        Iterant::Suspend {
            rest: Task::eval(move || Iterant::Last(f())),
            stop: Task::unit(),
        }
    }

    /// Defer the construction of a whole stream.
    pub fn suspend_with(f: impl Fn() -> Iterant<A> + Send + Sync + 'static) -> Self {
        Iterant::Suspend {
            rest: Task::eval(f),
            stop: Task::unit(),
        }
    }

    /// A bracketed stream segment.
    ///
    /// `acquire` runs when the scope is first visited; `use_fn` builds the
    /// inner stream from the resource; `release` runs exactly once with the
    /// [`ExitCase`] describing how the segment terminated. If `acquire`
    /// fails, `release` never runs.
    pub fn scope<R: Send + Sync + 'static>(
        acquire: Task<R>,
        use_fn: impl Fn(Arc<R>) -> Iterant<A> + Send + Sync + 'static,
        release: impl Fn(Arc<R>, ExitCase) -> Task<()> + Send + Sync + 'static,
    ) -> Self {
        let acquire: Task<Resource> = acquire.map(|r| Arc::new(r) as Resource);
        let release: Arc<dyn Fn(Resource, ExitCase) -> Task<()> + Send + Sync> =
            Arc::new(move |resource, exit| {
                let typed = resource
                    .downcast::<R>()
                    .ok()
                    .expect("scope resource type mismatch");
                release(typed, exit)
            });
        let body: Arc<dyn Fn(Resource, Task<()>) -> Iterant<A> + Send + Sync> =
            Arc::new(move |resource, early| {
                let typed = resource
                    .downcast::<R>()
                    .ok()
                    .expect("scope resource type mismatch");
                extend_stop(use_fn(typed), early)
            });
        Iterant::Scope(ScopeNode {
            acquire,
            release,
            body,
        })
    }

    /// The early-stop finalizer of the current node, if it carries one.
    pub(crate) fn earliest_stop(&self) -> Task<()> {
        match self {
            Iterant::Next { stop, .. }
            | Iterant::NextCursor { stop, .. }
            | Iterant::NextBatch { stop, .. }
            | Iterant::Suspend { stop, .. } => stop.clone(),
            _ => Task::unit(),
        }
    }
}

// ============================================================================
// Map
// ============================================================================

impl<A: Clone + Send + Sync + 'static> Iterant<A> {
    /// Transform every element of the stream.
    pub fn map<B: Clone + Send + Sync + 'static>(
        self,
        f: impl Fn(A) -> B + Send + Sync + 'static,
    ) -> Iterant<B> {
        map_loop(self, Arc::new(f))
    }
}

fn map_loop<A, B>(stream: Iterant<A>, f: Arc<dyn Fn(A) -> B + Send + Sync>) -> Iterant<B>
where
    A: Clone + Send + Sync + 'static,
    B: Clone + Send + Sync + 'static,
{
    match stream {
        Iterant::Next { item, rest, stop } => match guard_panic(|| f(item)) {
            Ok(mapped) => Iterant::Next {
                item: mapped,
                rest: {
                    let f = f.clone();
                    rest.map(move |node| map_loop(node, f.clone()))
                },
                stop,
            },
            Err(error) => signal_error(stop, error),
        },
        Iterant::NextCursor { cursor, rest, stop } => Iterant::NextCursor {
            cursor: cursor.map(f.clone()),
            rest: {
                let f = f.clone();
                rest.map(move |node| map_loop(node, f.clone()))
            },
            stop,
        },
        Iterant::NextBatch { batch, rest, stop } => Iterant::NextBatch {
            batch: batch.map(f.clone()),
            rest: {
                let f = f.clone();
                rest.map(move |node| map_loop(node, f.clone()))
            },
            stop,
        },
        Iterant::Suspend { rest, stop } => Iterant::Suspend {
            rest: {
                let f = f.clone();
                rest.map(move |node| map_loop(node, f.clone()))
            },
            stop,
        },
        Iterant::Scope(scope) => {
            let f = f.clone();
            Iterant::Scope(scope.remap(Arc::new(move |inner: Iterant<A>| map_loop(inner, f.clone()))))
        }
        Iterant::Last(item) => match guard_panic(|| f(item)) {
            Ok(mapped) => Iterant::Last(mapped),
            Err(error) => Iterant::Halt(Some(error)),
        },
        Iterant::Halt(error) => Iterant::Halt(error),
    }
}

// ============================================================================
// Finalizer plumbing
// ============================================================================

/// Sequence two finalizers, running the second even when the first fails.
///
/// The first failure is propagated; a second failure is reported to the
/// scheduler's failure reporter instead of replacing it.
pub(crate) fn chain_stop(first: Task<()>, second: Task<()>) -> Task<()> {
    first.attempt().flat_map(move |first_result| {
        let first_result = first_result.clone();
        second.attempt().flat_map(move |second_result| {
            match (first_result.clone(), second_result) {
                (Ok(()), Ok(())) => Task::unit(),
                (Ok(()), Err(error)) => Task::raise(error),
                (Err(error), Ok(())) => Task::raise(error),
                (Err(error), Err(secondary)) => Task::defer_action(move |ctx| {
                    ctx.scheduler().report_failure(&secondary);
                    Task::raise(error.clone())
                }),
            }
        })
    })
}

/// Run a finalizer, swallowing its failure into the failure reporter.
pub(crate) fn run_stop_reporting(stop: Task<()>) -> Task<()> {
    stop.on_error_handle_with(|error| {
        Task::defer_action(move |ctx| {
            ctx.scheduler().report_failure(&error);
            Task::unit()
        })
    })
}

/// Convert a rewriter failure into a downstream-visible halt, running the
/// failing branch's finalizer first.
pub(crate) fn signal_error<A: Clone + Send + Sync + 'static>(
    stop: Task<()>,
    error: Error,
) -> Iterant<A> {
    let halt = {
        let error = error.clone();
        Task::eval(move || Iterant::Halt(Some(error.clone())))
    };
    Iterant::Suspend {
        rest: run_stop_reporting(stop).followed_by(halt),
        stop: Task::unit(),
    }
}

/// The tail that cuts a stream early: run the branch finalizer, then halt.
///
/// Finalizer failures propagate, surfacing as the stream's error.
pub(crate) fn stop_then_halt<A: Clone + Send + Sync + 'static>(
    stop: Task<()>,
) -> Task<Iterant<A>> {
    stop.map(|_| Iterant::Halt(None))
}

/// Thread an early-stop finalizer through every node of a stream.
pub(crate) fn extend_stop<A: Clone + Send + Sync + 'static>(
    stream: Iterant<A>,
    early: Task<()>,
) -> Iterant<A> {
    match stream {
        Iterant::Next { item, rest, stop } => Iterant::Next {
            item,
            rest: {
                let early = early.clone();
                rest.map(move |node| extend_stop(node, early.clone()))
            },
            stop: chain_stop(stop, early),
        },
        Iterant::NextCursor { cursor, rest, stop } => Iterant::NextCursor {
            cursor,
            rest: {
                let early = early.clone();
                rest.map(move |node| extend_stop(node, early.clone()))
            },
            stop: chain_stop(stop, early),
        },
        Iterant::NextBatch { batch, rest, stop } => Iterant::NextBatch {
            batch,
            rest: {
                let early = early.clone();
                rest.map(move |node| extend_stop(node, early.clone()))
            },
            stop: chain_stop(stop, early),
        },
        Iterant::Suspend { rest, stop } => Iterant::Suspend {
            rest: {
                let early = early.clone();
                rest.map(move |node| extend_stop(node, early.clone()))
            },
            stop: chain_stop(stop, early),
        },
        Iterant::Scope(scope) => Iterant::Scope(scope.extend(early)),
        terminal @ Iterant::Last(_) => terminal,
        terminal @ Iterant::Halt(_) => terminal,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::TrampolineScheduler;
    use std::sync::Arc;

    fn collect<A: Clone + Send + Sync + 'static>(stream: Iterant<A>) -> Vec<A> {
        stream
            .to_vec()
            .run(Arc::new(TrampolineScheduler::default()))
            .try_take()
            .expect("stream did not complete synchronously")
            .expect("stream failed")
    }

    #[test]
    fn test_of_emits_in_order() {
        assert_eq!(collect(Iterant::of([1, 2, 3])), vec![1, 2, 3]);
    }

    #[test]
    fn test_empty_and_last() {
        assert_eq!(collect(Iterant::<i32>::empty()), Vec::<i32>::new());
        assert_eq!(collect(Iterant::last(9)), vec![9]);
    }

    #[test]
    fn test_map_transforms_elements() {
        let stream = Iterant::of([1, 2, 3]).map(|x| x * 10);
        assert_eq!(collect(stream), vec![10, 20, 30]);
    }

    #[test]
    fn test_map_over_next_nodes() {
        let stream = Iterant::Next {
            item: 1,
            rest: Task::pure(Iterant::Last(2)),
            stop: Task::unit(),
        }
        .map(|x| x + 100);
        assert_eq!(collect(stream), vec![101, 102]);
    }

    #[test]
    fn test_map_panic_becomes_halt() {
        let stream: Iterant<i32> = Iterant::Next {
            item: 1,
            rest: Task::pure(Iterant::Last(2)),
            stop: Task::unit(),
        }
        .map(|x| if x == 1 { panic!("bad element") } else { x });
        let result = stream
            .to_vec()
            .run(Arc::new(TrampolineScheduler::default()))
            .try_take()
            .unwrap();
        assert!(result.unwrap_err().to_string().contains("bad element"));
    }

    #[test]
    fn test_eval_is_lazy_until_consumed() {
        use std::sync::atomic::{AtomicBool, Ordering};
        let touched = Arc::new(AtomicBool::new(false));
        let t = touched.clone();
        let stream = Iterant::eval(move || {
            t.store(true, Ordering::SeqCst);
            5
        });
        assert!(!touched.load(Ordering::SeqCst));
        assert_eq!(collect(stream), vec![5]);
        assert!(touched.load(Ordering::SeqCst));
    }
}
