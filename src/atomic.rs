//! Padded State Cell
//!
//! A cache-line padded cell holding a small state machine, used by the
//! memoization resolver. Padding keeps a hot cell from false-sharing with
//! neighbouring allocations when several run spans race on the same task.

use crossbeam_utils::CachePadded;
use parking_lot::{Mutex, MutexGuard};

/// A cache-line padded cell with compare-and-set style transitions.
///
/// The cell serializes transitions through a short critical section; callers
/// keep the bounded-retry discipline of a CAS loop by re-inspecting the
/// state inside [`PaddedCell::transition`] and bailing out when another
/// thread has already moved it.
#[derive(Debug)]
pub struct PaddedCell<T> {
    inner: CachePadded<Mutex<T>>,
}

impl<T> PaddedCell<T> {
    /// Create a cell with the given initial state.
    pub fn new(initial: T) -> Self {
        Self {
            inner: CachePadded::new(Mutex::new(initial)),
        }
    }

    /// Lock the cell for inspection or mutation.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.lock()
    }

    /// Atomically inspect the state and apply a transition.
    ///
    /// The closure observes the current state and returns the caller's
    /// verdict; mutation happens in place while the cell is held.
    pub fn transition<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.inner.lock();
        f(&mut guard)
    }
}

// ============================================================================
// Tests
// ============================================================================
