//! # Monix Effect Runtime
//!
//! A purely functional effect system built on two interlocking cores:
//!
//! - **Task**: a deferred effect description evaluated by a stack-safe
//!   trampoline with explicit async boundaries, cooperative cancellation,
//!   and a frame budget that periodically yields to the scheduler.
//! - **Iterant**: a pull-based streaming engine whose tails are tasks,
//!   layering bracketed resource scopes and error recovery on top of the
//!   runtime.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                         MONIX RUNTIME                          │
//! ├────────────────────────────────────────────────────────────────┤
//! │                                                                │
//! │   ┌──────────────┐            ┌──────────────┐                 │
//! │   │   Iterant    │───────────▶│     Task     │                 │
//! │   │  (iterant/)  │   tails    │   (task/)    │                 │
//! │   └──────────────┘            └──────────────┘                 │
//! │                                      │                         │
//! │      ┌──────────────┬────────────────┼──────────────┐          │
//! │      │              │                │              │          │
//! │   ┌──────────┐ ┌──────────┐    ┌──────────┐   ┌──────────┐    │
//! │   │ Scheduler│ │   Exec   │    │  Cancel  │   │  Locals  │    │
//! │   │ + Stack  │ │  Model   │    │          │   │          │    │
//! │   └──────────┘ └──────────┘    └──────────┘   └──────────┘    │
//! │                                                                │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use monix::{Iterant, Task, TrampolineScheduler};
//!
//! let stream = Iterant::of([10, 20, 30, 40, 50])
//!     .drop_while_with_index(|x, i| *x < 30 || i < 2);
//! let handle = stream.to_vec().run(Arc::new(TrampolineScheduler::default()));
//! assert_eq!(handle.wait().unwrap(), vec![30, 40, 50]);
//! ```

#![warn(rust_2018_idioms)]

pub mod atomic;
pub mod cancel;
pub mod error;
pub mod exec;
pub mod iterant;
pub mod local;
pub mod scheduler;
pub mod stack;
pub mod task;

// Re-exports
pub use cancel::{cancelable_fn, Cancelable, CancelConnection};
pub use error::{guard_panic, non_fatal, Error, ErrorKind, Fatal};
pub use exec::{ExecutionModel, FrameRef};
pub use iterant::{Batch, BatchCursor, ExitCase, Iterant};
pub use local::{Local, LocalContext};
pub use scheduler::{ManualScheduler, Scheduler, ThreadPoolScheduler, TrampolineScheduler};
pub use stack::ChunkedStack;
pub use task::{Context, Options, StepOutcome, Task, TaskCallback, TaskHandle};

/// Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
