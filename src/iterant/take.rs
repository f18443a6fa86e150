//! Take: Bounded Prefix With Early Stop
//!
//! `take(n)` emits the first `n` elements and then cuts the stream. The cut
//! runs the current branch's `stop` finalizer before halting, so enclosing
//! scopes observe `ExitCase::EarlyStop` rather than a normal completion.

use std::sync::Arc;

use crate::error::guard_panic;
use crate::task::Task;

use super::{signal_error, stop_then_halt, Iterant};

impl<A: Clone + Send + Sync + 'static> Iterant<A> {
    /// Emit at most the first `n` elements, then stop early.
    pub fn take(self, n: usize) -> Iterant<A> {
        if n == 0 {
            // Nothing is wanted; stop the source before emitting anything.
            let stop = self.earliest_stop();
            return Iterant::Suspend {
                rest: stop_then_halt(stop),
                stop: Task::unit(),
            };
        }
        // The first step may consume cursors, so suspend it.
        let stop = self.earliest_stop();
        Iterant::Suspend {
            rest: Task::eval(move || take_loop(self.clone(), n)),
            stop,
        }
    }
}

fn take_loop<A: Clone + Send + Sync + 'static>(stream: Iterant<A>, n: usize) -> Iterant<A> {
    match stream {
        Iterant::Next { item, rest, stop } => {
            if n > 1 {
                Iterant::Next {
                    item,
                    rest: rest.map(move |node| take_loop(node, n - 1)),
                    stop,
                }
            } else {
                // Budget filled by this element; cut instead of pulling on.
                Iterant::Next {
                    item,
                    rest: stop_then_halt(stop.clone()),
                    stop,
                }
            }
        }
        Iterant::NextCursor { cursor, rest, stop } => {
            let mut taken = Vec::new();
            loop {
                if taken.len() == n {
                    return Iterant::NextBatch {
                        batch: super::Batch::from_vec(taken),
                        rest: stop_then_halt(stop.clone()),
                        stop,
                    };
                }
                match guard_panic(|| cursor.next_item()) {
                    Err(error) => return signal_error(stop, error),
                    Ok(None) => {
                        let remaining = n - taken.len();
                        let rest = rest.map(move |node| take_loop(node, remaining));
                        return if taken.is_empty() {
                            Iterant::Suspend { rest, stop }
                        } else {
                            Iterant::NextBatch {
                                batch: super::Batch::from_vec(taken),
                                rest,
                                stop,
                            }
                        };
                    }
                    Ok(Some(item)) => taken.push(item),
                }
            }
        }
        Iterant::NextBatch { batch, rest, stop } => match guard_panic(|| batch.cursor()) {
            Ok(cursor) => take_loop(Iterant::NextCursor { cursor, rest, stop }, n),
            Err(error) => signal_error(stop, error),
        },
        Iterant::Suspend { rest, stop } => Iterant::Suspend {
            rest: rest.map(move |node| take_loop(node, n)),
            stop,
        },
        Iterant::Scope(scope) => {
            Iterant::Scope(scope.remap(Arc::new(move |inner: Iterant<A>| take_loop(inner, n))))
        }
        Iterant::Last(item) => Iterant::Last(item),
        Iterant::Halt(error) => Iterant::Halt(error),
    }
}

// ============================================================================
// Tests
// ============================================================================
