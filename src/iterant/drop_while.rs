//! Index-Aware Drop While
//!
//! `drop_while_with_index` discards the leading elements for which a
//! predicate over `(element, index)` holds and emits everything from the
//! first non-matching element on, order preserved.
//!
//! The cursor case is the interesting one: elements are consumed in a
//! bounded inner loop, and two budget rules apply. An exhausted cursor
//! suspends on the tail with the updated index; a drop run that reaches the
//! cursor's recommended batch size re-suspends the *same* node so a large
//! batch cannot monopolize its thread.

use std::sync::Arc;

use crate::error::guard_panic;
use crate::task::Task;

use super::{signal_error, Iterant};

impl<A: Clone + Send + Sync + 'static> Iterant<A> {
    /// Drop the longest prefix where `predicate(element, index)` holds.
    pub fn drop_while_with_index(
        self,
        predicate: impl Fn(&A, usize) -> bool + Send + Sync + 'static,
    ) -> Iterant<A> {
        let predicate = Arc::new(predicate);
        let stop = self.earliest_stop();
        // The first step may consume cursors, so suspend it.
        Iterant::Suspend {
            rest: Task::eval(move || drop_loop(self.clone(), 0, predicate.clone())),
            stop,
        }
    }
}

fn drop_loop<A: Clone + Send + Sync + 'static>(
    stream: Iterant<A>,
    index: usize,
    predicate: Arc<dyn Fn(&A, usize) -> bool + Send + Sync>,
) -> Iterant<A> {
    match stream {
        Iterant::Next { item, rest, stop } => match guard_panic(|| predicate(&item, index)) {
            Err(error) => signal_error(stop, error),
            Ok(true) => Iterant::Suspend {
                rest: {
                    let predicate = predicate.clone();
                    rest.map(move |node| drop_loop(node, index + 1, predicate.clone()))
                },
                stop,
            },
            // First kept element: the node is emitted unchanged.
            Ok(false) => Iterant::Next { item, rest, stop },
        },
        Iterant::NextCursor { cursor, rest, stop } => {
            let recommended = cursor.recommended_batch_size();
            let mut index = index;
            let mut dropped = 0usize;
            loop {
                if dropped >= recommended {
                    // Yield before continuing the same node on a large batch.
                    let node = Iterant::NextCursor {
                        cursor: cursor.clone(),
                        rest: rest.clone(),
                        stop: stop.clone(),
                    };
                    let predicate = predicate.clone();
                    return Iterant::Suspend {
                        rest: Task::eval(move || {
                            drop_loop(node.clone(), index, predicate.clone())
                        }),
                        stop,
                    };
                }
                match guard_panic(|| cursor.next_item()) {
                    Err(error) => return signal_error(stop, error),
                    Ok(None) => {
                        // Cursor exhausted; continue dropping on the tail.
                        let predicate = predicate.clone();
                        return Iterant::Suspend {
                            rest: rest
                                .map(move |node| drop_loop(node, index, predicate.clone())),
                            stop,
                        };
                    }
                    Ok(Some(item)) => match guard_panic(|| predicate(&item, index)) {
                        Err(error) => return signal_error(stop, error),
                        Ok(true) => {
                            dropped += 1;
                            index += 1;
                        }
                        Ok(false) => {
                            // First kept element; the rest of the cursor is
                            // emitted verbatim behind it.
                            let tail = if cursor.has_next() {
                                let cursor = cursor.clone();
                                let rest = rest.clone();
                                let stop = stop.clone();
                                Task::eval(move || Iterant::NextCursor {
                                    cursor: cursor.clone(),
                                    rest: rest.clone(),
                                    stop: stop.clone(),
                                })
                            } else {
                                rest
                            };
                            return Iterant::Next {
                                item,
                                rest: tail,
                                stop,
                            };
                        }
                    },
                }
            }
        }
        Iterant::NextBatch { batch, rest, stop } => match guard_panic(|| batch.cursor()) {
            Ok(cursor) => drop_loop(Iterant::NextCursor { cursor, rest, stop }, index, predicate),
            Err(error) => signal_error(stop, error),
        },
        Iterant::Suspend { rest, stop } => Iterant::Suspend {
            rest: {
                let predicate = predicate.clone();
                rest.map(move |node| drop_loop(node, index, predicate.clone()))
            },
            stop,
        },
        Iterant::Scope(scope) => {
            let predicate = predicate.clone();
            Iterant::Scope(scope.remap(Arc::new(move |inner: Iterant<A>| {
                drop_loop(inner, index, predicate.clone())
            })))
        }
        Iterant::Last(item) => match guard_panic(|| predicate(&item, index)) {
            Err(error) => Iterant::Halt(Some(error)),
            Ok(true) => Iterant::Halt(None),
            Ok(false) => Iterant::Last(item),
        },
        Iterant::Halt(error) => Iterant::Halt(error),
    }
}

// ============================================================================
// Tests
// ============================================================================
