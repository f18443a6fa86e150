//! Error Interception
//!
//! Two recovery shapes over the stream spine:
//!
//! - [`Iterant::on_error_handle_with`] replaces a failed continuation with
//!   a stream built by a user handler.
//! - [`Iterant::attempt`] materializes the error channel into the elements,
//!   terminating with a single trailing `Last(Err(e))`.
//!
//! Both guard every effect-typed tail. Before a tail guard fires the user
//! handler, the failing branch's early-stop finalizer runs exactly once, so
//! enclosing scopes are released. Cursor and batch heads are materialized
//! up to the recommended batch size *before* the tail is guarded, so
//! elements that were already safely produced are not lost when pulling
//! further elements fails.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{guard_panic, Error};
use crate::task::Task;

use super::{run_stop_reporting, Batch, BatchCursor, Iterant};

/// Materialize the already-available prefix of a cursor.
///
/// Returns the buffered elements and whether the cursor has more; a
/// panicking pull surfaces as the error.
fn extract_prefix<A: Send + 'static>(cursor: &BatchCursor<A>) -> Result<(Vec<A>, bool), Error> {
    let limit = cursor.recommended_batch_size();
    let mut buffer = Vec::new();
    while buffer.len() < limit {
        match guard_panic(|| cursor.next_item())? {
            Some(item) => buffer.push(item),
            None => return Ok((buffer, false)),
        }
    }
    Ok((buffer, guard_panic(|| cursor.has_next())?))
}

// ============================================================================
// on_error_handle_with
// ============================================================================

impl<A: Clone + Send + Sync + 'static> Iterant<A> {
    /// On a non-fatal failure anywhere on the spine, continue with the
    /// stream produced by `f`.
    ///
    /// The failing branch's early-stop finalizer runs before `f`; a
    /// secondary failure inside `f` halts the stream.
    pub fn on_error_handle_with(
        self,
        f: impl Fn(Error) -> Iterant<A> + Send + Sync + 'static,
    ) -> Iterant<A> {
        handle_loop(self, Arc::new(f))
    }
}

fn recover<A: Clone + Send + Sync + 'static>(
    f: &Arc<dyn Fn(Error) -> Iterant<A> + Send + Sync>,
    error: Error,
) -> Iterant<A> {
    match guard_panic(|| f(error)) {
        Ok(replacement) => replacement,
        Err(secondary) => Iterant::Halt(Some(secondary)),
    }
}

/// Guard an effect-typed tail: on failure, run the branch finalizer once
/// and hand the error to the user handler.
fn guard_tail<A: Clone + Send + Sync + 'static>(
    tail: Task<Iterant<A>>,
    stop: Task<()>,
    f: Arc<dyn Fn(Error) -> Iterant<A> + Send + Sync>,
) -> Task<Iterant<A>> {
    tail.on_error_handle_with(move |error| {
        let f = f.clone();
        let error = error.clone();
        run_stop_reporting(stop.clone()).map(move |_| recover(&f, error.clone()))
    })
}

/// A failure observed while rebuilding the head: finalize, then recover.
fn recover_now<A: Clone + Send + Sync + 'static>(
    stop: Task<()>,
    f: Arc<dyn Fn(Error) -> Iterant<A> + Send + Sync>,
    error: Error,
) -> Iterant<A> {
    Iterant::Suspend {
        rest: run_stop_reporting(stop).map(move |_| recover(&f, error.clone())),
        stop: Task::unit(),
    }
}

fn handle_loop<A: Clone + Send + Sync + 'static>(
    stream: Iterant<A>,
    f: Arc<dyn Fn(Error) -> Iterant<A> + Send + Sync>,
) -> Iterant<A> {
    match stream {
        Iterant::Next { item, rest, stop } => Iterant::Next {
            item,
            rest: {
                let f2 = f.clone();
                guard_tail(
                    rest.map(move |node| handle_loop(node, f2.clone())),
                    stop.clone(),
                    f,
                )
            },
            stop,
        },
        Iterant::NextCursor { cursor, rest, stop } => match extract_prefix(&cursor) {
            Err(error) => recover_now(stop, f, error),
            Ok((buffer, has_more)) => {
                let tail = if has_more {
                    let f = f.clone();
                    let stop2 = stop.clone();
                    Task::eval(move || {
                        handle_loop(
                            Iterant::NextCursor {
                                cursor: cursor.clone(),
                                rest: rest.clone(),
                                stop: stop2.clone(),
                            },
                            f.clone(),
                        )
                    })
                } else {
                    let f2 = f.clone();
                    guard_tail(
                        rest.map(move |node| handle_loop(node, f2.clone())),
                        stop.clone(),
                        f,
                    )
                };
                if buffer.is_empty() {
                    Iterant::Suspend { rest: tail, stop }
                } else {
                    Iterant::NextBatch {
                        batch: Batch::from_vec(buffer),
                        rest: tail,
                        stop,
                    }
                }
            }
        },
        Iterant::NextBatch { batch, rest, stop } => match guard_panic(|| batch.cursor()) {
            Ok(cursor) => handle_loop(Iterant::NextCursor { cursor, rest, stop }, f),
            Err(error) => recover_now(stop, f, error),
        },
        Iterant::Suspend { rest, stop } => Iterant::Suspend {
            rest: {
                let f2 = f.clone();
                guard_tail(
                    rest.map(move |node| handle_loop(node, f2.clone())),
                    stop.clone(),
                    f,
                )
            },
            stop,
        },
        Iterant::Scope(scope) => {
            let f = f.clone();
            Iterant::Scope(scope.remap(Arc::new(move |inner: Iterant<A>| {
                handle_loop(inner, f.clone())
            })))
        }
        Iterant::Last(item) => Iterant::Last(item),
        Iterant::Halt(None) => Iterant::Halt(None),
        Iterant::Halt(Some(error)) => recover(&f, error),
    }
}

// ============================================================================
// attempt
// ============================================================================

impl<A: Clone + Send + Sync + 'static> Iterant<A> {
    /// Expose the error channel in the elements.
    ///
    /// Every source element becomes `Ok`; a failure terminates the stream
    /// with a single trailing `Last(Err(e))` after running the most
    /// recently observed early-stop finalizer, whose own failure is
    /// swallowed.
    pub fn attempt(self) -> Iterant<Result<A, Error>> {
        attempt_loop(self, Arc::new(Mutex::new(Task::unit())))
    }
}

type StopSlot = Arc<Mutex<Task<()>>>;

/// Guard a tail: a failing pull runs the tracked finalizer (failure
/// swallowed) and emits the error as the final element.
fn attempt_tail<A: Clone + Send + Sync + 'static>(
    tail: Task<Iterant<Result<A, Error>>>,
    slot: StopSlot,
) -> Task<Iterant<Result<A, Error>>> {
    tail.on_error_handle_with(move |error| {
        let stop = slot.lock().clone();
        let error = error.clone();
        stop.attempt()
            .map(move |_| Iterant::Last(Err(error.clone())))
    })
}

fn attempt_loop<A: Clone + Send + Sync + 'static>(
    stream: Iterant<A>,
    slot: StopSlot,
) -> Iterant<Result<A, Error>> {
    match stream {
        Iterant::Next { item, rest, stop } => {
            *slot.lock() = stop.clone();
            Iterant::Next {
                item: Ok(item),
                rest: {
                    let slot2 = slot.clone();
                    attempt_tail(rest.map(move |node| attempt_loop(node, slot2.clone())), slot)
                },
                stop,
            }
        }
        Iterant::NextCursor { cursor, rest, stop } => {
            *slot.lock() = stop.clone();
            match extract_prefix(&cursor) {
                Err(error) => attempt_emit_error(slot, error),
                Ok((buffer, has_more)) => {
                    let tail = if has_more {
                        let slot = slot.clone();
                        let stop2 = stop.clone();
                        Task::eval(move || {
                            attempt_loop(
                                Iterant::NextCursor {
                                    cursor: cursor.clone(),
                                    rest: rest.clone(),
                                    stop: stop2.clone(),
                                },
                                slot.clone(),
                            )
                        })
                    } else {
                        let slot2 = slot.clone();
                        attempt_tail(
                            rest.map(move |node| attempt_loop(node, slot2.clone())),
                            slot,
                        )
                    };
                    let wrapped: Vec<Result<A, Error>> = buffer.into_iter().map(Ok).collect();
                    if wrapped.is_empty() {
                        Iterant::Suspend { rest: tail, stop }
                    } else {
                        Iterant::NextBatch {
                            batch: Batch::from_vec(wrapped),
                            rest: tail,
                            stop,
                        }
                    }
                }
            }
        }
        Iterant::NextBatch { batch, rest, stop } => match guard_panic(|| batch.cursor()) {
            Ok(cursor) => attempt_loop(Iterant::NextCursor { cursor, rest, stop }, slot),
            Err(error) => attempt_emit_error(slot, error),
        },
        Iterant::Suspend { rest, stop } => {
            *slot.lock() = stop.clone();
            Iterant::Suspend {
                rest: {
                    let slot2 = slot.clone();
                    attempt_tail(rest.map(move |node| attempt_loop(node, slot2.clone())), slot)
                },
                stop,
            }
        }
        Iterant::Scope(scope) => {
            let slot = slot.clone();
            Iterant::Scope(scope.remap(Arc::new(move |inner: Iterant<A>| {
                attempt_loop(inner, slot.clone())
            })))
        }
        Iterant::Last(item) => Iterant::Last(Ok(item)),
        Iterant::Halt(None) => Iterant::Halt(None),
        Iterant::Halt(Some(error)) => attempt_emit_error(slot, error),
    }
}

/// Run the tracked finalizer (failure swallowed), then emit the error as
/// the stream's final element.
fn attempt_emit_error<A: Clone + Send + Sync + 'static>(
    slot: StopSlot,
    error: Error,
) -> Iterant<Result<A, Error>> {
    let stop = slot.lock().clone();
    Iterant::Suspend {
        rest: stop
            .attempt()
            .map(move |_| Iterant::Last(Err(error.clone()))),
        stop: Task::unit(),
    }
}

// ============================================================================
// Tests
// ============================================================================
