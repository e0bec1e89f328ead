//! Linked node shared by the MPSC and MPMC queues.
//!
//! The element slot is guarded by a small state machine instead of an
//! exchangeable reference: `LIVE -> TAKEN` is the claim that moves the
//! value out (the "element cleared to null" of a tombstone), and `BUSY` is
//! a transient gate held while a traversal borrows the value for a
//! comparison or callback. Claimants that observe `BUSY` spin; gates are
//! held only across short inspections.
//!
//! Nodes are retired through epoch deferral, so a traversal pinned before a
//! node is unlinked can keep reading it safely.

use std::cell::UnsafeCell;
use std::hint;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicU8, Ordering};

use crossbeam_epoch::Atomic;

const EMPTY: u8 = 0;
const LIVE: u8 = 1;
const BUSY: u8 = 2;
const TAKEN: u8 = 3;

pub(crate) struct Node<E> {
    state: AtomicU8,
    value: UnsafeCell<MaybeUninit<E>>,
    pub(crate) next: Atomic<Node<E>>,
}

// SAFETY: the value slot is only ever accessed by the thread that won the
// state transition guarding it.
unsafe impl<E: Send> Send for Node<E> {}
unsafe impl<E: Send> Sync for Node<E> {}

impl<E> Node<E> {
    /// An empty node used as the initial (or replacement) sentinel tail.
    pub(crate) fn sentinel() -> Self {
        Node {
            state: AtomicU8::new(EMPTY),
            value: UnsafeCell::new(MaybeUninit::uninit()),
            next: Atomic::null(),
        }
    }

    pub(crate) fn new(e: E) -> Self {
        Node {
            state: AtomicU8::new(LIVE),
            value: UnsafeCell::new(MaybeUninit::new(e)),
            next: Atomic::null(),
        }
    }

    /// Claim the element, moving it out. Returns `None` for sentinels and
    /// tombstones.
    pub(crate) fn take(&self) -> Option<E> {
        loop {
            match self
                .state
                .compare_exchange(LIVE, TAKEN, Ordering::Acquire, Ordering::Acquire)
            {
                // SAFETY: winning LIVE -> TAKEN grants exclusive ownership
                // of the initialized value.
                Ok(_) => return Some(unsafe { (*self.value.get()).assume_init_read() }),
                Err(BUSY) => hint::spin_loop(),
                Err(_) => return None,
            }
        }
    }

    /// Claim the element only if `pred` matches it. On a match the value is
    /// dropped and the node becomes a tombstone.
    pub(crate) fn take_if(&self, pred: impl FnOnce(&E) -> bool) -> bool {
        loop {
            match self
                .state
                .compare_exchange(LIVE, BUSY, Ordering::Acquire, Ordering::Acquire)
            {
                Ok(_) => {
                    // SAFETY: holding the BUSY gate excludes every other
                    // reader and claimant.
                    let matched = pred(unsafe { (*self.value.get()).assume_init_ref() });
                    if matched {
                        unsafe { ptr::drop_in_place((*self.value.get()).as_mut_ptr()) };
                        self.state.store(TAKEN, Ordering::Release);
                    } else {
                        self.state.store(LIVE, Ordering::Release);
                    }
                    return matched;
                }
                Err(BUSY) => hint::spin_loop(),
                Err(_) => return false,
            }
        }
    }

    /// Run `f` against the element under the gate. Hands the closure back
    /// when the node carries no element.
    pub(crate) fn with_value<R, F>(&self, f: F) -> Result<R, F>
    where
        F: FnOnce(&E) -> R,
    {
        loop {
            match self
                .state
                .compare_exchange(LIVE, BUSY, Ordering::Acquire, Ordering::Acquire)
            {
                Ok(_) => {
                    // SAFETY: as in `take_if`.
                    let r = f(unsafe { (*self.value.get()).assume_init_ref() });
                    self.state.store(LIVE, Ordering::Release);
                    return Ok(r);
                }
                Err(BUSY) => hint::spin_loop(),
                Err(_) => return Err(f),
            }
        }
    }

    /// Visit the element with a reusable closure; returns whether the node
    /// was live.
    pub(crate) fn visit<F>(&self, f: &mut F) -> bool
    where
        F: FnMut(&E),
    {
        self.with_value(|e| f(e)).is_ok()
    }

    pub(crate) fn has_value(&self) -> bool {
        matches!(self.state.load(Ordering::Acquire), LIVE | BUSY)
    }

    /// Borrow the element without arbitration.
    ///
    /// # Safety
    ///
    /// The node must be `LIVE` and the caller must be the only thread that
    /// can claim it for the lifetime of the borrow (the single consumer of
    /// an MPSC queue).
    pub(crate) unsafe fn value_ref(&self) -> &E {
        (*self.value.get()).assume_init_ref()
    }
}

impl<E> Drop for Node<E> {
    fn drop(&mut self) {
        if *self.state.get_mut() == LIVE {
            // SAFETY: exclusive access during drop; the value was never taken.
            unsafe { ptr::drop_in_place((*self.value.get()).as_mut_ptr()) };
        }
    }
}
