//! Run Context and Options
//!
//! A [`Context`] bundles everything one logical run of a task needs: the
//! scheduler, user-visible options, the per-run frame index cell, and the
//! cancel connection that async registrations push their handles onto.

use std::sync::Arc;

use crate::cancel::CancelConnection;
use crate::exec::{ExecutionModel, FrameRef};
use crate::scheduler::Scheduler;

/// User-visible options for a run.
#[derive(Debug, Clone, Copy, Default)]
pub struct Options {
    /// Propagate context-local values across async boundaries.
    pub propagate_locals: bool,
}

impl Options {
    /// Enable local propagation.
    pub fn enable_local_propagation(mut self) -> Self {
        self.propagate_locals = true;
        self
    }

    /// Disable local propagation.
    pub fn disable_local_propagation(mut self) -> Self {
        self.propagate_locals = false;
        self
    }
}

/// Per-run state shared between the run-loop and its restart callbacks.
pub struct Context {
    scheduler: Arc<dyn Scheduler>,
    options: Options,
    frame_ref: FrameRef,
    connection: CancelConnection,
}

impl Context {
    /// Create a context with a fresh cancel connection.
    pub fn new(scheduler: Arc<dyn Scheduler>, options: Options) -> Self {
        Self::with_connection(scheduler, options, CancelConnection::new())
    }

    /// Create a context over an existing connection.
    pub fn with_connection(
        scheduler: Arc<dyn Scheduler>,
        options: Options,
        connection: CancelConnection,
    ) -> Self {
        let frame_ref = FrameRef::new(scheduler.execution_model());
        Self {
            scheduler,
            options,
            frame_ref,
            connection,
        }
    }

    /// The scheduler driving async boundaries for this run.
    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    /// The run's options.
    pub fn options(&self) -> Options {
        self.options
    }

    /// The frame budgeting policy, as exposed by the scheduler.
    pub fn execution_model(&self) -> ExecutionModel {
        self.scheduler.execution_model()
    }

    /// The per-run frame index cell.
    pub fn frame_ref(&self) -> &FrameRef {
        &self.frame_ref
    }

    /// The cancel connection for this run.
    pub fn connection(&self) -> &CancelConnection {
        &self.connection
    }

    /// Check whether delivery should be suppressed.
    pub fn should_cancel(&self) -> bool {
        self.connection.is_cancelled()
    }
}

// ============================================================================
// Tests
// ============================================================================
