//! Fixed-count arena pool.
//!
//! An [`Arena`] is a fixed-capacity bump allocator: allocations move an
//! offset cursor forward and the whole arena is released at once by
//! resetting the cursor. There is no per-allocation bookkeeping and no
//! growth; when the pool is exhausted, callers back off.
//!
//! The [`ArenaManager`] owns a fixed set of arenas for the process lifetime
//! and loans each one exclusively to a single request via an RAII
//! [`ArenaLease`]. Exhaustion is the gateway's backpressure signal: the
//! FastCGI reactor pauses accepting and stalls record consumption until a
//! lease is returned, and the WebSocket reactor drops messages best-effort.
//! Release observers (reactor wakers) are notified on every return so paused
//! work is re-driven promptly.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

/// A span handed out by [`Arena::alloc`]: an aligned byte range inside the
/// arena, valid until the next `reset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaSpan {
    offset: usize,
    len: usize,
}

impl ArenaSpan {
    /// Start offset within the arena.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true for zero-length spans.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// A fixed-capacity bump allocator.
#[derive(Debug)]
pub struct Arena {
    data: Box<[u8]>,
    offset: usize,
    slot: usize,
}

impl Arena {
    fn new(capacity: usize, slot: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            offset: 0,
            slot,
        }
    }

    /// Allocates `size` bytes aligned to `align` (a power of two).
    ///
    /// Returns `None` without side effects when the allocation would
    /// overflow the arena.
    pub fn alloc(&mut self, size: usize, align: usize) -> Option<ArenaSpan> {
        debug_assert!(align.is_power_of_two());
        let aligned = self.offset.checked_add(align - 1)? & !(align - 1);
        let end = aligned.checked_add(size)?;
        if end > self.data.len() {
            return None;
        }
        self.offset = end;
        Some(ArenaSpan {
            offset: aligned,
            len: size,
        })
    }

    /// Borrows the bytes of a span.
    #[must_use]
    pub fn bytes(&self, span: ArenaSpan) -> &[u8] {
        &self.data[span.offset..span.offset + span.len]
    }

    /// Mutably borrows the bytes of a span.
    pub fn bytes_mut(&mut self, span: ArenaSpan) -> &mut [u8] {
        &mut self.data[span.offset..span.offset + span.len]
    }

    /// Discards all allocations by returning the cursor to zero. Every
    /// previously handed-out span becomes stale.
    pub fn reset(&mut self) {
        self.offset = 0;
    }

    /// Total capacity in bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes consumed so far (including alignment padding).
    #[must_use]
    pub fn used(&self) -> usize {
        self.offset
    }

    /// Bytes still allocatable (ignoring alignment).
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    /// Stable slot index of this arena within its manager.
    #[must_use]
    pub fn slot(&self) -> usize {
        self.slot
    }
}

/// Observer invoked after every arena release. Reactors register their
/// wakers here so a release resumes a paused accept loop and re-drives
/// connections stalled on exhaustion.
pub trait ReleaseObserver: Send + Sync {
    /// Called after the released arena is back in the free set.
    fn arena_released(&self);
}

/// Fixed-size pool of arenas with an in-use bitmap and a lock-free
/// available count.
pub struct ArenaManager {
    arenas: Vec<Mutex<Arena>>,
    in_use: Mutex<Vec<bool>>,
    available: AtomicUsize,
    observers: Mutex<Vec<Arc<dyn ReleaseObserver>>>,
}

impl ArenaManager {
    /// Creates a pool of `count` arenas of `capacity` bytes each.
    #[must_use]
    pub fn new(count: usize, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            arenas: (0..count).map(|slot| Mutex::new(Arena::new(capacity, slot))).collect(),
            in_use: Mutex::new(vec![false; count]),
            available: AtomicUsize::new(count),
            observers: Mutex::new(Vec::new()),
        })
    }

    /// Number of arenas in the pool.
    #[must_use]
    pub fn count(&self) -> usize {
        self.arenas.len()
    }

    /// Lock-free view of the number of free arenas.
    #[must_use]
    pub fn available(&self) -> usize {
        self.available.load(Ordering::Relaxed)
    }

    /// Registers a release observer.
    pub fn add_observer(&self, observer: Arc<dyn ReleaseObserver>) {
        self.observers.lock().push(observer);
    }

    /// Claims the first free arena, or `None` when the pool is exhausted.
    ///
    /// The returned arena's cursor is already at zero (reset happened at
    /// release time). The lease returns the arena on drop.
    #[must_use]
    pub fn get(self: &Arc<Self>) -> Option<ArenaLease> {
        let mut in_use = self.in_use.lock();
        let slot = in_use.iter().position(|used| !used)?;
        in_use[slot] = true;
        self.available.fetch_sub(1, Ordering::AcqRel);
        Some(ArenaLease {
            manager: Arc::clone(self),
            slot,
        })
    }

    fn release(&self, slot: usize) {
        {
            let mut in_use = self.in_use.lock();
            debug_assert!(in_use[slot], "releasing an arena that is not in use");
            in_use[slot] = false;
        }
        self.arenas[slot].lock().reset();
        self.available.fetch_add(1, Ordering::AcqRel);

        let observers: Vec<_> = self.observers.lock().clone();
        for observer in observers {
            observer.arena_released();
        }
    }

    #[cfg(test)]
    fn in_use_count(&self) -> usize {
        self.in_use.lock().iter().filter(|used| **used).count()
    }
}

impl std::fmt::Debug for ArenaManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArenaManager")
            .field("count", &self.arenas.len())
            .field("available", &self.available())
            .finish_non_exhaustive()
    }
}

/// Exclusive loan of one arena. Dropping the lease resets the arena,
/// returns it to the free set, and notifies release observers.
pub struct ArenaLease {
    manager: Arc<ArenaManager>,
    slot: usize,
}

impl ArenaLease {
    /// The slot index of the leased arena.
    #[must_use]
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Runs a closure with exclusive access to the leased arena.
    pub fn with_arena<R>(&self, f: impl FnOnce(&mut Arena) -> R) -> R {
        f(&mut self.manager.arenas[self.slot].lock())
    }
}

impl Drop for ArenaLease {
    fn drop(&mut self) {
        self.manager.release(self.slot);
    }
}

impl std::fmt::Debug for ArenaLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArenaLease").field("slot", &self.slot).finish()
    }
}
