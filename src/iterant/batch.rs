//! Batches and Batch Cursors
//!
//! A [`Batch`] is a restartable generator of cursors; a [`BatchCursor`] is
//! one stateful iteration over a batch, yielding a bounded prefix of
//! elements at a time.
//!
//! Cursors share their iteration state: rewriters routinely consume a few
//! elements from a cursor and then re-emit the *same* cursor in a rebuilt
//! node, so the handle is a cheap clone over locked state rather than an
//! owned iterator.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

/// Default number of elements a consumer should process from a cursor
/// before yielding.
pub const DEFAULT_RECOMMENDED_BATCH_SIZE: usize = 128;

/// One stateful iteration, behind a shareable handle.
trait Cursor<A>: Send {
    fn has_next(&mut self) -> bool;
    fn next_item(&mut self) -> Option<A>;
}

/// A shareable, stateful iterator over a bounded prefix of a batch.
pub struct BatchCursor<A> {
    inner: Arc<Mutex<dyn Cursor<A>>>,
    recommended: usize,
}

impl<A> Clone for BatchCursor<A> {
    fn clone(&self) -> Self {
        BatchCursor {
            inner: self.inner.clone(),
            recommended: self.recommended,
        }
    }
}

impl<A> std::fmt::Debug for BatchCursor<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchCursor")
            .field("recommended", &self.recommended)
            .finish()
    }
}

impl<A: Send + 'static> BatchCursor<A> {
    fn from_cursor(cursor: impl Cursor<A> + 'static, recommended: usize) -> Self {
        BatchCursor {
            inner: Arc::new(Mutex::new(cursor)),
            recommended: recommended.max(1),
        }
    }

    /// A cursor over owned elements.
    pub fn from_vec(items: Vec<A>) -> Self {
        let len = items.len();
        BatchCursor::from_cursor(
            VecCursor {
                items: items.into_iter().collect(),
            },
            len.clamp(1, DEFAULT_RECOMMENDED_BATCH_SIZE),
        )
    }

    /// A cursor over an arbitrary iterator.
    ///
    /// The iterator's panics, if any, surface at the pull site and are
    /// classified there.
    pub fn from_iter(iter: impl Iterator<Item = A> + Send + 'static) -> Self {
        let boxed: Box<dyn Iterator<Item = A> + Send> = Box::new(iter);
        BatchCursor::from_cursor(
            IterCursor {
                iter: boxed.peekable(),
            },
            DEFAULT_RECOMMENDED_BATCH_SIZE,
        )
    }

    /// Check whether another element is available.
    pub fn has_next(&self) -> bool {
        self.inner.lock().has_next()
    }

    /// Pull the next element, advancing the shared state.
    pub fn next_item(&self) -> Option<A> {
        self.inner.lock().next_item()
    }

    /// The number of elements a consumer should pull before yielding.
    pub fn recommended_batch_size(&self) -> usize {
        self.recommended
    }

    /// Transform elements lazily as they are pulled.
    pub fn map<B: Send + 'static>(
        &self,
        f: Arc<dyn Fn(A) -> B + Send + Sync>,
    ) -> BatchCursor<B> {
        BatchCursor::from_cursor(
            MappedCursor {
                inner: self.clone(),
                f,
            },
            self.recommended,
        )
    }
}

struct VecCursor<A> {
    items: VecDeque<A>,
}

impl<A: Send> Cursor<A> for VecCursor<A> {
    fn has_next(&mut self) -> bool {
        !self.items.is_empty()
    }

    fn next_item(&mut self) -> Option<A> {
        self.items.pop_front()
    }
}

struct IterCursor<A> {
    iter: std::iter::Peekable<Box<dyn Iterator<Item = A> + Send>>,
}

impl<A: Send> Cursor<A> for IterCursor<A> {
    fn has_next(&mut self) -> bool {
        self.iter.peek().is_some()
    }

    fn next_item(&mut self) -> Option<A> {
        self.iter.next()
    }
}

struct MappedCursor<A, B> {
    inner: BatchCursor<A>,
    f: Arc<dyn Fn(A) -> B + Send + Sync>,
}

impl<A: Send + 'static, B: Send> Cursor<B> for MappedCursor<A, B> {
    fn has_next(&mut self) -> bool {
        self.inner.has_next()
    }

    fn next_item(&mut self) -> Option<B> {
        self.inner.next_item().map(|a| (self.f)(a))
    }
}

/// A restartable source of cursors.
trait BatchSource<A>: Send + Sync {
    fn cursor(&self) -> BatchCursor<A>;
    fn recommended_batch_size(&self) -> usize;
}

/// A restartable generator of [`BatchCursor`]s.
pub struct Batch<A> {
    source: Arc<dyn BatchSource<A>>,
}

impl<A> Clone for Batch<A> {
    fn clone(&self) -> Self {
        Batch {
            source: self.source.clone(),
        }
    }
}

impl<A> std::fmt::Debug for Batch<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Batch")
    }
}

impl<A: Clone + Send + Sync + 'static> Batch<A> {
    /// A batch over shared, clonable elements.
    pub fn from_vec(items: Vec<A>) -> Self {
        Batch {
            source: Arc::new(VecBatch {
                items: Arc::new(items),
            }),
        }
    }

    /// A batch that builds each cursor through a factory.
    ///
    /// The factory runs once per cursor instantiation; a panicking factory
    /// is classified at the instantiation site.
    pub fn from_fn(f: impl Fn() -> BatchCursor<A> + Send + Sync + 'static) -> Self {
        Batch {
            source: Arc::new(FnBatch { f: Arc::new(f) }),
        }
    }

    /// Instantiate a fresh cursor over this batch.
    pub fn cursor(&self) -> BatchCursor<A> {
        self.source.cursor()
    }

    /// The recommended pull budget for cursors of this batch.
    pub fn recommended_batch_size(&self) -> usize {
        self.source.recommended_batch_size()
    }

    /// Transform elements lazily, preserving restartability.
    pub fn map<B: Clone + Send + Sync + 'static>(
        &self,
        f: Arc<dyn Fn(A) -> B + Send + Sync>,
    ) -> Batch<B> {
        let source = self.clone();
        Batch::from_fn(move || source.cursor().map(f.clone()))
    }
}

struct VecBatch<A> {
    items: Arc<Vec<A>>,
}

impl<A: Clone + Send + Sync + 'static> BatchSource<A> for VecBatch<A> {
    fn cursor(&self) -> BatchCursor<A> {
        let items = self.items.clone();
        let len = items.len();
        BatchCursor::from_cursor(
            IndexCursor { items, pos: 0 },
            len.clamp(1, DEFAULT_RECOMMENDED_BATCH_SIZE),
        )
    }

    fn recommended_batch_size(&self) -> usize {
        self.items.len().clamp(1, DEFAULT_RECOMMENDED_BATCH_SIZE)
    }
}

struct IndexCursor<A> {
    items: Arc<Vec<A>>,
    pos: usize,
}

impl<A: Clone + Send + Sync> Cursor<A> for IndexCursor<A> {
    fn has_next(&mut self) -> bool {
        self.pos < self.items.len()
    }

    fn next_item(&mut self) -> Option<A> {
        let item = self.items.get(self.pos).cloned();
        if item.is_some() {
            self.pos += 1;
        }
        item
    }
}

struct FnBatch<A> {
    f: Arc<dyn Fn() -> BatchCursor<A> + Send + Sync>,
}

impl<A: Send + 'static> BatchSource<A> for FnBatch<A> {
    fn cursor(&self) -> BatchCursor<A> {
        (self.f)()
    }

    fn recommended_batch_size(&self) -> usize {
        DEFAULT_RECOMMENDED_BATCH_SIZE
    }
}

// ============================================================================
// Tests
// ============================================================================
