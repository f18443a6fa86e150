//! The Trampolined Run-Loop
//!
//! Drives an effect tree to a value or error through iteration instead of
//! recursion. The loop keeps five locals: the current node, a scratch slot
//! for the most recently pushed bind frame, the overflow bind stack, the
//! unboxed value produced by the last reduction, and the frame index fed to
//! the execution model after every reduction.
//!
//! ## Boundaries
//!
//! The loop leaves the current call stack in exactly three places: when the
//! execution model returns a frame index of `0` (forced boundary), when an
//! `Async` node hands control to its registration, and when a `Memoize`
//! node parks the run behind an in-flight producer. In every case the bind
//! chain travels with the continuation and the loop re-enters iteratively.

use std::sync::Arc;

use crate::error::{guard_panic, guard_panic_result, Error};
use crate::exec::ExecutionModel;
use crate::local::{with_snapshot, LocalContext};
use crate::stack::ChunkedStack;

use super::callback::{CallbackRef, RestartCallback, RestartState};
use super::context::Context;
use super::memo;
use super::{unbox, BindFrame, Boxed, Repr, Task};

/// Outcome of a single [`Task::step`] compilation cycle.
///
/// [`Task::step`]: super::Task::step
pub enum StepOutcome<A> {
    /// The tree reduced to a final outcome without leaving the stack.
    Done(Result<A, Error>),
    /// The simplified remainder; interpreting it continues where the cycle
    /// stopped.
    Suspended(Task<A>),
}

/// Begin a fresh run span.
pub(crate) fn start(repr: Repr, ctx: Arc<Context>, cb: CallbackRef) {
    let frame_start = ctx.execution_model().frame_start();
    resume(ctx, cb, Some(repr), None, None, None, frame_start);
}

/// Run a child tree on the parent's context, completing `restart` when done.
///
/// Used by `defer_action`: the child shares the parent's scheduler, options
/// and cancel connection, and its outcome re-enters the parent's bind chain.
pub(crate) fn start_child(repr: Repr, ctx: &Arc<Context>, restart: RestartCallback) {
    let cb = super::OnceCallback::new(
        ctx.scheduler().clone(),
        Box::new(move |result| restart.complete(result)),
    );
    let frame_index = ctx.frame_ref().get();
    resume(ctx.clone(), cb, Some(repr), None, None, None, frame_index);
}

/// The trampoline. Either `current` or `unboxed` holds the state to resume
/// from; both travelling at once only happens transiently inside the loop.
pub(crate) fn resume(
    ctx: Arc<Context>,
    cb: CallbackRef,
    mut current: Option<Repr>,
    mut b_first: Option<BindFrame>,
    mut b_rest: Option<ChunkedStack<BindFrame>>,
    mut unboxed: Option<Boxed>,
    mut frame_index: usize,
) {
    let em = ctx.execution_model();
    loop {
        if frame_index == 0 {
            // Budget exhausted: reschedule the whole state and yield.
            let locals = snapshot_locals(&ctx);
            ctx.frame_ref().reset();
            let scheduler = ctx.scheduler().clone();
            let ctx2 = ctx;
            scheduler.execute(Box::new(move || {
                if ctx2.should_cancel() {
                    return;
                }
                with_snapshot(locals, move || {
                    resume(ctx2, cb, current, b_first, b_rest, unboxed, 1)
                });
            }));
            return;
        }

        if let Some(node) = current.take() {
            match node {
                Repr::FlatMap(source, frame) => {
                    push_frame(&mut b_first, &mut b_rest, frame);
                    current = Some(*source);
                    continue;
                }
                Repr::Map(source, f, fallible) => {
                    push_frame(&mut b_first, &mut b_rest, BindFrame::MapValue(f, fallible));
                    current = Some(*source);
                    continue;
                }
                Repr::Pure(value) => {
                    unboxed = Some(value.clone_value());
                }
                Repr::Eval(thunk) => match guard_panic_result(|| thunk()) {
                    Ok(value) => unboxed = Some(value),
                    Err(error) => {
                        current = Some(Repr::Fail(error));
                        continue;
                    }
                },
                Repr::Suspend(thunk) => {
                    match guard_panic(|| thunk()) {
                        Ok(next) => current = Some(next),
                        Err(error) => current = Some(Repr::Fail(error)),
                    }
                    continue;
                }
                Repr::Fail(error) => {
                    match find_error_handler(&mut b_first, &mut b_rest) {
                        None => {
                            cb.complete(Err(error));
                            return;
                        }
                        Some(handler) => {
                            // A handler that itself fails replaces the error.
                            match guard_panic(|| handler(error)) {
                                Ok(next) => {
                                    frame_index = em.next_frame_index(frame_index);
                                    current = Some(next);
                                }
                                Err(second) => current = Some(Repr::Fail(second)),
                            }
                            continue;
                        }
                    }
                }
                Repr::Async(register) => {
                    // Best effort: resume with this budget if no thread jump
                    // happens before the completion arrives.
                    ctx.frame_ref().set(frame_index);
                    let locals = snapshot_locals(&ctx);
                    let restart = RestartCallback::new(
                        ctx.clone(),
                        RestartState {
                            cb,
                            b_first: b_first.take(),
                            b_rest: b_rest.take(),
                            locals,
                        },
                    );
                    if let Err(error) = guard_panic(|| register(&ctx, restart.clone())) {
                        restart.complete(Err(error));
                    }
                    return;
                }
                Repr::Memoize(cell) => match cell.peek() {
                    Some(Ok(value)) => unboxed = Some(value),
                    Some(Err(error)) => {
                        current = Some(Repr::Fail(error));
                        continue;
                    }
                    None => {
                        memo::enroll(&cell, &ctx, cb, b_first.take(), b_rest.take());
                        return;
                    }
                },
            }
        }

        if let Some(value) = unboxed.take() {
            match pop_next_bind(&mut b_first, &mut b_rest) {
                None => {
                    cb.complete(Ok(value));
                    return;
                }
                Some(NextFrame::Bind(k)) => {
                    match guard_panic(|| k(value)) {
                        Ok(next) => current = Some(next),
                        Err(error) => current = Some(Repr::Fail(error)),
                    }
                    frame_index = em.next_frame_index(frame_index);
                }
                Some(NextFrame::Transform(f)) => {
                    match guard_panic_result(|| f(value)) {
                        Ok(next_value) => unboxed = Some(next_value),
                        Err(error) => current = Some(Repr::Fail(error)),
                    }
                    frame_index = em.next_frame_index(frame_index);
                }
            }
        }
    }
}

/// Single-cycle compilation: reduce until done or until the tree needs a
/// scheduler, then repackage the remainder.
pub(crate) fn step<A: Send + 'static>(repr: Repr, model: ExecutionModel) -> StepOutcome<A> {
    let mut current = repr;
    let mut b_first: Option<BindFrame> = None;
    let mut b_rest: Option<ChunkedStack<BindFrame>> = None;
    let mut frame_index = model.frame_start();

    loop {
        if frame_index == 0 {
            return StepOutcome::Suspended(repack(current, b_first, b_rest));
        }
        match current {
            Repr::FlatMap(source, frame) => {
                push_frame(&mut b_first, &mut b_rest, frame);
                current = *source;
            }
            Repr::Map(source, f, fallible) => {
                push_frame(&mut b_first, &mut b_rest, BindFrame::MapValue(f, fallible));
                current = *source;
            }
            Repr::Pure(value) => {
                match apply_value(value.clone_value(), &mut b_first, &mut b_rest, &mut frame_index, model) {
                    ValueOutcome::Done(value) => return StepOutcome::Done(Ok(unbox::<A>(value))),
                    ValueOutcome::Continue(next) => current = next,
                }
            }
            Repr::Eval(thunk) => match guard_panic_result(|| thunk()) {
                Ok(value) => {
                    match apply_value(value, &mut b_first, &mut b_rest, &mut frame_index, model) {
                        ValueOutcome::Done(value) => return StepOutcome::Done(Ok(unbox::<A>(value))),
                        ValueOutcome::Continue(next) => current = next,
                    }
                }
                Err(error) => current = Repr::Fail(error),
            },
            Repr::Suspend(thunk) => match guard_panic(|| thunk()) {
                Ok(next) => current = next,
                Err(error) => current = Repr::Fail(error),
            },
            Repr::Fail(error) => match find_error_handler(&mut b_first, &mut b_rest) {
                None => return StepOutcome::Done(Err(error)),
                Some(handler) => {
                    frame_index = model.next_frame_index(frame_index);
                    match guard_panic(|| handler(error)) {
                        Ok(next) => current = next,
                        Err(second) => current = Repr::Fail(second),
                    }
                }
            },
            node @ Repr::Async(_) => {
                return StepOutcome::Suspended(repack(node, b_first, b_rest));
            }
            Repr::Memoize(cell) => match cell.peek() {
                Some(Ok(value)) => {
                    match apply_value(value, &mut b_first, &mut b_rest, &mut frame_index, model) {
                        ValueOutcome::Done(value) => return StepOutcome::Done(Ok(unbox::<A>(value))),
                        ValueOutcome::Continue(next) => current = next,
                    }
                }
                Some(Err(error)) => current = Repr::Fail(error),
                None => {
                    return StepOutcome::Suspended(repack(Repr::Memoize(cell), b_first, b_rest));
                }
            },
        }
    }
}

enum ValueOutcome {
    Done(Boxed),
    Continue(Repr),
}

/// Feed an unboxed value through the pending transform chain.
fn apply_value(
    mut value: Boxed,
    b_first: &mut Option<BindFrame>,
    b_rest: &mut Option<ChunkedStack<BindFrame>>,
    frame_index: &mut usize,
    model: ExecutionModel,
) -> ValueOutcome {
    loop {
        match pop_next_bind(b_first, b_rest) {
            None => return ValueOutcome::Done(value),
            Some(NextFrame::Bind(k)) => {
                *frame_index = model.next_frame_index(*frame_index);
                return match guard_panic(|| k(value)) {
                    Ok(next) => ValueOutcome::Continue(next),
                    Err(error) => ValueOutcome::Continue(Repr::Fail(error)),
                };
            }
            Some(NextFrame::Transform(f)) => {
                *frame_index = model.next_frame_index(*frame_index);
                match guard_panic_result(|| f(value)) {
                    Ok(next_value) => value = next_value,
                    Err(error) => return ValueOutcome::Continue(Repr::Fail(error)),
                }
            }
        }
    }
}

/// Fold a surviving bind chain back into a tree around `current`.
fn repack<A>(
    current: Repr,
    b_first: Option<BindFrame>,
    b_rest: Option<ChunkedStack<BindFrame>>,
) -> Task<A> {
    fn wrap(acc: Repr, frame: BindFrame) -> Repr {
        match frame {
            BindFrame::MapValue(f, fallible) => Repr::Map(Box::new(acc), f, fallible),
            other => Repr::FlatMap(Box::new(acc), other),
        }
    }

    let mut acc = current;
    if let Some(frame) = b_first {
        acc = wrap(acc, frame);
    }
    if let Some(mut stack) = b_rest {
        while let Some(frame) = stack.pop() {
            acc = wrap(acc, frame);
        }
    }
    Task::from_repr(acc)
}

// ============================================================================
// Bind-chain helpers
// ============================================================================

pub(crate) enum NextFrame {
    Bind(Arc<dyn Fn(Boxed) -> Repr + Send + Sync>),
    Transform(Arc<dyn Fn(Boxed) -> Result<Boxed, Error> + Send + Sync>),
}

/// Pop the next non-handler continuation; handlers are discarded on the
/// success path.
fn pop_next_bind(
    b_first: &mut Option<BindFrame>,
    b_rest: &mut Option<ChunkedStack<BindFrame>>,
) -> Option<NextFrame> {
    if let Some(frame) = b_first.take() {
        match frame {
            BindFrame::Plain(k) => return Some(NextFrame::Bind(k)),
            BindFrame::MapValue(f, _) => return Some(NextFrame::Transform(f)),
            BindFrame::Handler(_) => {}
        }
    }
    if let Some(stack) = b_rest.as_mut() {
        while let Some(frame) = stack.pop() {
            match frame {
                BindFrame::Plain(k) => return Some(NextFrame::Bind(k)),
                BindFrame::MapValue(f, _) => return Some(NextFrame::Transform(f)),
                BindFrame::Handler(_) => {}
            }
        }
    }
    None
}

/// Pop until the nearest error handler; plain continuations in between are
/// discarded by the unwind.
fn find_error_handler(
    b_first: &mut Option<BindFrame>,
    b_rest: &mut Option<ChunkedStack<BindFrame>>,
) -> Option<Arc<dyn Fn(Error) -> Repr + Send + Sync>> {
    if let Some(BindFrame::Handler(h)) = b_first.take() {
        return Some(h);
    }
    if let Some(stack) = b_rest.as_mut() {
        while let Some(frame) = stack.pop() {
            if let BindFrame::Handler(h) = frame {
                return Some(h);
            }
        }
    }
    None
}

/// Push onto the scratch slot, spilling the previous occupant.
fn push_frame(
    b_first: &mut Option<BindFrame>,
    b_rest: &mut Option<ChunkedStack<BindFrame>>,
    frame: BindFrame,
) {
    if let Some(previous) = b_first.take() {
        b_rest.get_or_insert_with(ChunkedStack::new).push(previous);
    }
    *b_first = Some(frame);
}

fn snapshot_locals(ctx: &Arc<Context>) -> Option<LocalContext> {
    if ctx.options().propagate_locals {
        Some(LocalContext::snapshot())
    } else {
        None
    }
}

// ============================================================================
// Tests
// ============================================================================
