//! Cancelable Run Handles
//!
//! [`TaskHandle`] is the result of [`Task::run_as_future`]: a one-shot
//! completion cell paired with the run's cancel connection. When the
//! interpreted tree contains no async boundary the cell is already filled
//! by the time the handle is returned; otherwise the handle is pending and
//! can be waited on or cancelled.
//!
//! [`Task::run_as_future`]: super::Task::run_as_future

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::cancel::CancelConnection;
use crate::error::Error;
use crate::scheduler::Scheduler;

use super::callback::OnceCallback;
use super::context::{Context, Options};
use super::{run_loop, unbox, Boxed, Task};

struct HandleCell<A> {
    state: Mutex<Option<Result<A, Error>>>,
    cond: Condvar,
}

/// A cancelable handle to one run of a task.
pub struct TaskHandle<A> {
    cell: Arc<HandleCell<A>>,
    connection: CancelConnection,
}

impl<A: Send + 'static> TaskHandle<A> {
    pub(crate) fn start(task: &Task<A>, scheduler: Arc<dyn Scheduler>, options: Options) -> Self {
        let ctx = Arc::new(Context::new(scheduler, options));
        let connection = ctx.connection().clone();
        let cell = Arc::new(HandleCell {
            state: Mutex::new(None),
            cond: Condvar::new(),
        });

        let c = cell.clone();
        let cb = OnceCallback::new(
            ctx.scheduler().clone(),
            Box::new(move |result: Result<Boxed, Error>| {
                *c.state.lock() = Some(result.map(unbox::<A>));
                c.cond.notify_all();
            }),
        );
        run_loop::start(task.repr.clone(), ctx, cb);

        TaskHandle { cell, connection }
    }

    /// Check whether an outcome has been delivered.
    pub fn is_completed(&self) -> bool {
        self.cell.state.lock().is_some()
    }

    /// Take the outcome if one has been delivered.
    ///
    /// The outcome can be taken exactly once; later calls return `None`.
    pub fn try_take(&self) -> Option<Result<A, Error>> {
        self.cell.state.lock().take()
    }

    /// Block until an outcome is delivered, then take it.
    ///
    /// A cancelled run never delivers, so callers that cancel should use
    /// [`TaskHandle::wait_timeout`] instead.
    pub fn wait(&self) -> Result<A, Error> {
        let mut state = self.cell.state.lock();
        while state.is_none() {
            self.cell.cond.wait(&mut state);
        }
        state.take().expect("outcome vanished while holding lock")
    }

    /// Block up to `timeout` for an outcome.
    ///
    /// Returns `None` on timeout, which is also the expected result for a
    /// run whose delivery was suppressed by cancellation.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<A, Error>> {
        let mut state = self.cell.state.lock();
        if state.is_none() {
            self.cell.cond.wait_for(&mut state, timeout);
        }
        state.take()
    }

    /// Request cancellation of the run.
    ///
    /// Cooperative: an in-flight synchronous span finishes, but its result
    /// is suppressed; pending async registrations are cancelled in LIFO
    /// order through the run's connection.
    pub fn cancel(&self) {
        self.connection.cancel();
    }

    /// The cancel connection backing this handle.
    pub fn connection(&self) -> &CancelConnection {
        &self.connection
    }
}

// ============================================================================
// Tests
// ============================================================================
