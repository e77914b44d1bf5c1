//! # Lock Ordering Discipline
//!
//! Every mutex in the heap carries a [`LockOrder`] tag. In debug builds each
//! thread keeps a stack of the levels it holds and acquisition panics when a
//! lock would be taken below the highest level already held.
//!
//! ## Global Lock Order
//!
//! | Level | Lock          | Description                                   |
//! |-------|---------------|-----------------------------------------------|
//! | 1     | `Cycle`       | Serialises collection cycles                  |
//! | 2     | `Registry`    | Worker list; held while the world is stopped  |
//! | 3     | `WorkerLocal` | Thread cache and gray buffer of one worker    |
//! | 4     | `Central`     | Span lists of one size class                  |
//! | 5     | `PageHeap`    | Free and busy span lists of the page heap     |
//!
//! Several locks of the same level may be held together (stopping the world
//! takes every `WorkerLocal`). Leaf locks that never acquire anything else
//! are untracked: pacer timing, the mark-done signal, collector requests,
//! arena growth, span special records, the finalizer queue and the heap
//! profile buckets.
//!
//! The page heap lock is dropped around every span sweep with
//! [`OrderedGuard::unlocked`], which also pops its level so the sweeper may
//! take a `Central` lock.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::ops::{Deref, DerefMut};

use parking_lot::{Mutex, MutexGuard};

const MAX_LOCK_DEPTH: usize = 16;

struct LockOrderState {
    stack: RefCell<Vec<u8>>,
    is_shutdown: Cell<bool>,
}

thread_local!(static LOCK_ORDER_STATE: LockOrderState = LockOrderState {
    stack: RefCell::new(Vec::with_capacity(MAX_LOCK_DEPTH)),
    is_shutdown: Cell::new(false),
});

/// Lock order tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LockOrder {
    /// Collection cycle lock (level 1).
    Cycle = 1,
    /// Worker registry (level 2).
    Registry = 2,
    /// Per-worker local state (level 3).
    WorkerLocal = 3,
    /// Per-size-class central lists (level 4).
    Central = 4,
    /// Page heap lists (level 5).
    PageHeap = 5,
}

impl LockOrder {
    /// Acquisition level of this lock.
    #[must_use]
    pub const fn level(self) -> u8 {
        self as u8
    }

    const fn from_level(level: u8) -> Option<Self> {
        match level {
            1 => Some(Self::Cycle),
            2 => Some(Self::Registry),
            3 => Some(Self::WorkerLocal),
            4 => Some(Self::Central),
            5 => Some(Self::PageHeap),
            _ => None,
        }
    }
}

/// Validates `tag` against the highest level currently held.
///
/// # Panics
///
/// Panics in debug builds if `tag` is below `held`.
#[inline]
#[cfg(debug_assertions)]
pub fn validate_lock_order(tag: LockOrder, held: Option<LockOrder>) {
    if let Some(held) = held {
        assert!(
            tag.level() >= held.level(),
            "Lock ordering violation: {tag:?} (level {}) cannot be acquired while holding {held:?} (level {})",
            tag.level(),
            held.level()
        );
    }
}

#[inline]
#[cfg(not(debug_assertions))]
pub const fn validate_lock_order(_tag: LockOrder, _held: Option<LockOrder>) {}

/// Highest lock level held by this thread.
#[must_use]
pub fn max_held_lock() -> Option<LockOrder> {
    LOCK_ORDER_STATE
        .try_with(|state| {
            if state.is_shutdown.get() {
                return None;
            }
            state
                .stack
                .borrow()
                .iter()
                .copied()
                .max()
                .and_then(LockOrder::from_level)
        })
        .ok()
        .flatten()
}

fn push_level(tag: LockOrder) {
    let _ = LOCK_ORDER_STATE.try_with(|state| {
        if !state.is_shutdown.get() {
            state.stack.borrow_mut().push(tag.level());
        }
    });
}

fn pop_level(tag: LockOrder) {
    let _ = LOCK_ORDER_STATE.try_with(|state| {
        if state.is_shutdown.get() {
            return;
        }
        let mut stack = state.stack.borrow_mut();
        if let Some(pos) = stack.iter().rposition(|&l| l == tag.level()) {
            stack.remove(pos);
        }
    });
}

/// Stops lock order tracking on this thread.
///
/// Called from thread-local destructors, where the tracking state may
/// already be gone.
pub fn enter_thread_shutdown() {
    let _ = LOCK_ORDER_STATE.try_with(|state| state.is_shutdown.set(true));
}

/// RAII record of one held lock level.
#[must_use = "LockGuard must be held for the duration of the critical section"]
pub struct LockGuard {
    tag: LockOrder,
}

impl LockGuard {
    /// Validates and records acquisition of `tag`.
    pub fn new(tag: LockOrder) -> Self {
        if cfg!(debug_assertions) {
            validate_lock_order(tag, max_held_lock());
            push_level(tag);
        }
        Self { tag }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if cfg!(debug_assertions) {
            pop_level(self.tag);
        }
    }
}

// ============================================================================
// Ordered mutex
// ============================================================================

/// A `parking_lot` mutex tagged with its place in the lock order.
pub struct OrderedMutex<T> {
    tag: LockOrder,
    inner: Mutex<T>,
}

impl<T> OrderedMutex<T> {
    /// Wraps `value` in a mutex of level `tag`.
    pub const fn new(tag: LockOrder, value: T) -> Self {
        Self {
            tag,
            inner: Mutex::new(value),
        }
    }

    /// Acquires the mutex, validating the lock order first.
    #[inline]
    pub fn lock(&self) -> OrderedGuard<'_, T> {
        let order = LockGuard::new(self.tag);
        OrderedGuard {
            guard: self.inner.lock(),
            order,
        }
    }

    /// Acquires the mutex if it is free.
    pub fn try_lock(&self) -> Option<OrderedGuard<'_, T>> {
        let order = LockGuard::new(self.tag);
        self.inner.try_lock().map(|guard| OrderedGuard {
            guard,
            order,
        })
    }

    /// Lock level of this mutex.
    pub const fn order(&self) -> LockOrder {
        self.tag
    }
}

impl<T: fmt::Debug> fmt::Debug for OrderedMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderedMutex")
            .field("tag", &self.tag)
            .field("inner", &self.inner)
            .finish()
    }
}

/// Guard of an [`OrderedMutex`].
pub struct OrderedGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    order: LockGuard,
}

impl<T> OrderedGuard<'_, T> {
    /// Releases the lock while `f` runs and reacquires it afterwards.
    pub fn unlocked<U>(this: &mut Self, f: impl FnOnce() -> U) -> U {
        let tag = this.order.tag;
        if cfg!(debug_assertions) {
            pop_level(tag);
        }
        let out = MutexGuard::unlocked(&mut this.guard, f);
        if cfg!(debug_assertions) {
            validate_lock_order(tag, max_held_lock());
            push_level(tag);
        }
        out
    }
}

impl<T> Deref for OrderedGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for OrderedGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::{max_held_lock, LockGuard, LockOrder, OrderedGuard, OrderedMutex};

    #[test]
    fn test_lock_order_levels() {
        assert_eq!(LockOrder::Cycle.level(), 1);
        assert_eq!(LockOrder::Registry.level(), 2);
        assert_eq!(LockOrder::WorkerLocal.level(), 3);
        assert_eq!(LockOrder::Central.level(), 4);
        assert_eq!(LockOrder::PageHeap.level(), 5);
    }

    #[test]
    fn test_lock_guard_valid_order() {
        let _g1 = LockGuard::new(LockOrder::Cycle);
        let _g2 = LockGuard::new(LockOrder::Registry);
        let _g3 = LockGuard::new(LockOrder::WorkerLocal);
        let _g4 = LockGuard::new(LockOrder::Central);
        let _g5 = LockGuard::new(LockOrder::PageHeap);
        assert_eq!(max_held_lock(), Some(LockOrder::PageHeap));
    }

    #[test]
    fn test_same_level_is_allowed() {
        let _g1 = LockGuard::new(LockOrder::WorkerLocal);
        let _g2 = LockGuard::new(LockOrder::WorkerLocal);
        let _g3 = LockGuard::new(LockOrder::WorkerLocal);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "Lock ordering violation")]
    fn test_lock_guard_invalid_order_should_panic() {
        let _g1 = LockGuard::new(LockOrder::PageHeap);
        let _g2 = LockGuard::new(LockOrder::Central);
    }

    #[test]
    fn test_state_restored_after_drop() {
        {
            let _g1 = LockGuard::new(LockOrder::Central);
            let _g2 = LockGuard::new(LockOrder::PageHeap);
        }
        assert_eq!(max_held_lock(), None);
        let _g3 = LockGuard::new(LockOrder::Cycle);
    }

    #[test]
    fn test_out_of_order_release() {
        let g1 = LockGuard::new(LockOrder::Registry);
        let g2 = LockGuard::new(LockOrder::WorkerLocal);
        drop(g1);
        assert_eq!(max_held_lock(), Some(LockOrder::WorkerLocal));
        drop(g2);
        assert_eq!(max_held_lock(), None);
    }

    #[test]
    fn test_unlocked_allows_lower_level() {
        let heap = OrderedMutex::new(LockOrder::PageHeap, 0u32);
        let central = OrderedMutex::new(LockOrder::Central, 0u32);
        let mut guard = heap.lock();
        OrderedGuard::unlocked(&mut guard, || {
            *central.lock() += 1;
        });
        *guard += 1;
        assert_eq!(*guard, 1);
        drop(guard);
        assert_eq!(*central.lock(), 1);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "Lock ordering violation")]
    fn test_ordered_mutex_validates() {
        let heap = OrderedMutex::new(LockOrder::PageHeap, ());
        let registry = OrderedMutex::new(LockOrder::Registry, ());
        let _h = heap.lock();
        let _r = registry.lock();
    }
}
