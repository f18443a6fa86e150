//! Execution Model and Frame Budget
//!
//! The execution model decides how many synchronous reductions a run span
//! may perform before the run-loop must yield back to the scheduler. The
//! budget is expressed through [`ExecutionModel::next_frame_index`]: the
//! run-loop feeds it the current frame index after every successful
//! reduction, and a returned `0` forces an asynchronous boundary.
//!
//! # Models
//!
//! - `Batched`: yields every `recommended_batch_size` frames (rounded up to
//!   a power of two so the budget check is a mask, not a division).
//! - `AlwaysAsync`: yields after every frame.
//! - `Synchronous`: never yields on its own; only explicit async nodes
//!   leave the current call stack.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Default number of frames executed between forced boundaries.
pub const DEFAULT_BATCH_SIZE: usize = 1024;

/// Frame budgeting policy for the run-loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionModel {
    /// Yield to the scheduler every `modulus + 1` frames.
    Batched {
        /// Power-of-two batch size minus one, used as an index mask.
        modulus: usize,
    },
    /// Yield after every single frame.
    AlwaysAsync,
    /// Never force a boundary; run until an explicit async node.
    Synchronous,
}

impl ExecutionModel {
    /// Batched execution with the given recommended batch size.
    ///
    /// The size is rounded up to the next power of two, minimum 2.
    pub fn batched(recommended_batch_size: usize) -> Self {
        let size = recommended_batch_size.max(2).next_power_of_two();
        ExecutionModel::Batched { modulus: size - 1 }
    }

    /// The recommended number of frames between boundaries.
    pub fn recommended_batch_size(&self) -> usize {
        match self {
            ExecutionModel::Batched { modulus } => modulus + 1,
            ExecutionModel::AlwaysAsync => 1,
            ExecutionModel::Synchronous => DEFAULT_BATCH_SIZE,
        }
    }

    /// Compute the next frame index.
    ///
    /// Returns `0` when the run-loop must force an async boundary. The
    /// result for a `current` of `0` is always nonzero, so a fresh run span
    /// can make progress.
    pub fn next_frame_index(&self, current: usize) -> usize {
        match self {
            ExecutionModel::Batched { modulus } => (current + 1) & modulus,
            ExecutionModel::AlwaysAsync => {
                if current == 0 {
                    1
                } else {
                    0
                }
            }
            ExecutionModel::Synchronous => 1,
        }
    }

    /// The frame index a fresh run span starts from.
    pub fn frame_start(&self) -> usize {
        self.next_frame_index(0)
    }
}

impl Default for ExecutionModel {
    fn default() -> Self {
        ExecutionModel::batched(DEFAULT_BATCH_SIZE)
    }
}

/// Per-context cell holding the current frame index.
///
/// The cell is written before handing control to an async registration so
/// that a synchronous completion resumes with the budget it left off at. A
/// real thread jump resets it to the model's start index; the cell is
/// per-context state, so no other run span can observe a stale value.
#[derive(Debug)]
pub struct FrameRef {
    start: usize,
    current: AtomicUsize,
}

impl FrameRef {
    /// Create a frame ref starting at the model's first index.
    pub fn new(model: ExecutionModel) -> Self {
        let start = model.frame_start();
        Self {
            start,
            current: AtomicUsize::new(start),
        }
    }

    /// Read the current frame index.
    pub fn get(&self) -> usize {
        self.current.load(Ordering::Acquire)
    }

    /// Record the frame index at an async hand-off.
    pub fn set(&self, value: usize) {
        self.current.store(value, Ordering::Release);
    }

    /// Reset to the start index after a real async jump.
    pub fn reset(&self) {
        self.current.store(self.start, Ordering::Release);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batched_budget_wraps_to_zero() {
        let em = ExecutionModel::batched(4);
        assert_eq!(em.recommended_batch_size(), 4);
        let mut frame = em.frame_start();
        assert_ne!(frame, 0);
        let mut steps = 0;
        while frame != 0 {
            frame = em.next_frame_index(frame);
            steps += 1;
            assert!(steps <= 4, "budget never wrapped");
        }
        assert_eq!(steps, 3);
    }

    #[test]
    fn test_batched_rounds_up_to_power_of_two() {
        let em = ExecutionModel::batched(100);
        assert_eq!(em.recommended_batch_size(), 128);
    }

    #[test]
    fn test_always_async_yields_each_frame() {
        let em = ExecutionModel::AlwaysAsync;
        let start = em.frame_start();
        assert_eq!(start, 1);
        assert_eq!(em.next_frame_index(start), 0);
    }

    #[test]
    fn test_synchronous_never_yields() {
        let em = ExecutionModel::Synchronous;
        let mut frame = em.frame_start();
        for _ in 0..10_000 {
            frame = em.next_frame_index(frame);
            assert_ne!(frame, 0);
        }
    }

    #[test]
    fn test_frame_ref_set_get_reset() {
        let em = ExecutionModel::batched(8);
        let frame_ref = FrameRef::new(em);
        assert_eq!(frame_ref.get(), em.frame_start());
        frame_ref.set(5);
        assert_eq!(frame_ref.get(), 5);
        frame_ref.reset();
        assert_eq!(frame_ref.get(), em.frame_start());
    }
}
