//! Schedulers
//!
//! The run-loop never blocks and never spawns threads on its own; every
//! departure from the current call stack goes through a [`Scheduler`]. The
//! contract is deliberately small: submit a runnable, expose the frame
//! budget, report failures that have nowhere else to go.
//!
//! # Implementations
//!
//! - [`TrampolineScheduler`]: executes on the calling thread through a
//!   thread-local run queue, so nested submissions become iteration instead
//!   of recursion. This is the small-capacity trampolined runnable used for
//!   memoization completions.
//! - [`ThreadPoolScheduler`]: a fixed pool of named worker threads fed by a
//!   shared channel.
//! - [`ManualScheduler`]: a deterministic queue drained explicitly with
//!   [`ManualScheduler::tick`], for tests and embedders that own the loop.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;

use crate::error::{guard_panic, Error};
use crate::exec::ExecutionModel;

/// A unit of work submitted to a scheduler.
pub type Runnable = Box<dyn FnOnce() + Send>;

/// The execution capability consumed by the run-loop.
pub trait Scheduler: Send + Sync + 'static {
    /// Submit a runnable for asynchronous execution.
    fn execute(&self, runnable: Runnable);

    /// The frame budgeting policy for run spans on this scheduler.
    fn execution_model(&self) -> ExecutionModel;

    /// Report a failure that cannot be delivered to any callback.
    fn report_failure(&self, error: &Error) {
        tracing::error!(error = %error, "uncaught failure reported to scheduler");
    }

    /// Submit a runnable that prefers same-thread, re-entrancy-bounded
    /// execution.
    ///
    /// The default forwards to [`Scheduler::execute`]; trampolining
    /// schedulers override this to stay on the calling thread.
    fn execute_trampolined(&self, runnable: Runnable) {
        self.execute(runnable)
    }
}

// ============================================================================
// Trampoline scheduler
// ============================================================================

thread_local! {
    static TRAMPOLINE: RefCell<TrampolineState> = RefCell::new(TrampolineState {
        running: false,
        queue: VecDeque::new(),
    });
}

struct TrampolineState {
    running: bool,
    queue: VecDeque<Runnable>,
}

/// Executes submissions immediately on the calling thread.
///
/// Re-entrant submissions are queued and drained iteratively by the
/// outermost call, which bounds stack growth the same way the run-loop
/// bounds bind-chain depth.
#[derive(Debug, Clone)]
pub struct TrampolineScheduler {
    model: ExecutionModel,
}

impl TrampolineScheduler {
    /// Create a trampoline scheduler with the given execution model.
    pub fn new(model: ExecutionModel) -> Self {
        Self { model }
    }
}

impl Default for TrampolineScheduler {
    fn default() -> Self {
        Self::new(ExecutionModel::default())
    }
}

impl Scheduler for TrampolineScheduler {
    fn execute(&self, runnable: Runnable) {
        let is_outermost = TRAMPOLINE.with(|cell| {
            let mut state = cell.borrow_mut();
            state.queue.push_back(runnable);
            if state.running {
                false
            } else {
                state.running = true;
                true
            }
        });
        if !is_outermost {
            return;
        }

        // Drain until quiescent. Work queued by running jobs lands on the
        // same queue and is picked up here instead of growing the stack.
        loop {
            let next = TRAMPOLINE.with(|cell| {
                let mut state = cell.borrow_mut();
                match state.queue.pop_front() {
                    Some(job) => Some(job),
                    None => {
                        state.running = false;
                        None
                    }
                }
            });
            match next {
                Some(job) => {
                    if let Err(error) = guard_panic(job) {
                        self.report_failure(&error);
                    }
                }
                None => break,
            }
        }
    }

    fn execution_model(&self) -> ExecutionModel {
        self.model
    }

    fn execute_trampolined(&self, runnable: Runnable) {
        self.execute(runnable)
    }
}

// ============================================================================
// Thread-pool scheduler
// ============================================================================

/// A fixed pool of worker threads fed from a shared queue.
pub struct ThreadPoolScheduler {
    sender: Mutex<Option<crossbeam_channel::Sender<Runnable>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: Arc<AtomicBool>,
    model: ExecutionModel,
}

impl ThreadPoolScheduler {
    /// Create a pool sized to the available parallelism.
    pub fn new() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self::with_workers(workers, ExecutionModel::default())
    }

    /// Create a pool with an explicit worker count and execution model.
    pub fn with_workers(num_workers: usize, model: ExecutionModel) -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded::<Runnable>();
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut handles = Vec::with_capacity(num_workers.max(1));
        for id in 0..num_workers.max(1) {
            let receiver = receiver.clone();
            let shutdown = shutdown.clone();
            let handle = std::thread::Builder::new()
                .name(format!("monix-worker-{}", id))
                .spawn(move || {
                    while let Ok(job) = receiver.recv() {
                        if shutdown.load(Ordering::Acquire) {
                            break;
                        }
                        if let Err(error) = guard_panic(job) {
                            tracing::error!(
                                error = %error,
                                "worker trapped a panicking runnable"
                            );
                        }
                    }
                })
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }

        Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(handles),
            shutdown,
            model,
        }
    }

    /// Request shutdown and join all workers.
    ///
    /// Runnables already queued before the call may still execute.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        // Disconnect the queue so blocked workers observe the shutdown.
        *self.sender.lock() = None;
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            let _ = handle.join();
        }
    }
}

impl Default for ThreadPoolScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for ThreadPoolScheduler {
    fn execute(&self, runnable: Runnable) {
        let sender = self.sender.lock();
        match sender.as_ref() {
            Some(sender) if sender.send(runnable).is_ok() => {}
            _ => tracing::warn!("runnable dropped: scheduler is shut down"),
        }
    }

    fn execution_model(&self) -> ExecutionModel {
        self.model
    }
}

impl Drop for ThreadPoolScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// Manual scheduler
// ============================================================================

/// A scheduler whose queue is drained explicitly by the caller.
///
/// Deterministic by construction: nothing runs until [`ManualScheduler::tick`]
/// or [`ManualScheduler::run_all`] is invoked on some thread.
#[derive(Clone)]
pub struct ManualScheduler {
    queue: Arc<Mutex<VecDeque<Runnable>>>,
    failures: Arc<Mutex<Vec<Error>>>,
    model: ExecutionModel,
}

impl ManualScheduler {
    /// Create a manual scheduler with the given execution model.
    pub fn new(model: ExecutionModel) -> Self {
        Self {
            queue: Arc::new(Mutex::new(VecDeque::new())),
            failures: Arc::new(Mutex::new(Vec::new())),
            model,
        }
    }

    /// Run the next queued runnable, if any.
    pub fn tick(&self) -> bool {
        let job = self.queue.lock().pop_front();
        match job {
            Some(job) => {
                if let Err(error) = guard_panic(job) {
                    self.failures.lock().push(error);
                }
                true
            }
            None => false,
        }
    }

    /// Drain the queue, including work enqueued while draining.
    ///
    /// Returns the number of runnables executed.
    pub fn run_all(&self) -> usize {
        let mut executed = 0;
        while self.tick() {
            executed += 1;
        }
        executed
    }

    /// Number of runnables currently queued.
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Failures reported through [`Scheduler::report_failure`] or trapped
    /// from runnables, in arrival order.
    pub fn reported_failures(&self) -> Vec<Error> {
        self.failures.lock().clone()
    }
}

impl Default for ManualScheduler {
    fn default() -> Self {
        Self::new(ExecutionModel::default())
    }
}

impl Scheduler for ManualScheduler {
    fn execute(&self, runnable: Runnable) {
        self.queue.lock().push_back(runnable);
    }

    fn execution_model(&self) -> ExecutionModel {
        self.model
    }

    fn report_failure(&self, error: &Error) {
        self.failures.lock().push(error.clone());
    }
}

// ============================================================================
// Tests
// ============================================================================
