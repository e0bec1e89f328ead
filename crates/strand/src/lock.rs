//! Hybrid reentrant mutual-exclusion lock.
//!
//! Acquisition combines an atomic fast path with a chain of parked
//! waiters. The fast path CAS-claims the owner word, but only while the
//! waiter chain is empty, which keeps the lock approximately FIFO among
//! threads that reached the parked state while letting uncontended
//! acquirers through at full speed.
//!
//! A waiter's `signal` word arbitrates the races around wakeup: a releaser
//! claims a waiter by CAS `0 -> 1` before unparking it, and a waiter
//! abandoning the wait (interrupt or timeout) unregisters by CAS `0 -> -1`.
//! Exactly one side wins; a loser whose wakeup was already claimed simply
//! takes the lock and reports the interrupt through the thread's flag.
//!
//! When the last live waiter is dequeued, the releaser closes the chain by
//! appending a tagged sentinel link, so pushers that raced into the dead
//! chain restart on a fresh one.

use std::cell::Cell;
use std::hint;
use std::sync::atomic::{AtomicI8, AtomicU64, Ordering};
use std::thread::{self, Thread};
use std::time::Duration;

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use crossbeam_utils::CachePadded;

use crate::blocking::Deadline;
use crate::condition::Condition;
use crate::interrupt::{self, Interrupted};
use crate::utils::thread_id;
use crate::NotOwner;

const MAX_SPINS: usize = 100;

const READY: i8 = 0;
const CANCELED: i8 = -1;
const SIGNALED: i8 = 1;

/// Tag carried by a `next` link that closes a consumed chain.
const CLOSED: usize = 1;

pub(crate) struct Waiter {
    thread: Thread,
    id: u64,
    signal: AtomicI8,
    next: Atomic<Waiter>,
}

/// Reentrant lock with an atomic fast path and a parked waiter chain.
///
/// Unlike a guard-based mutex this lock is a bare protocol object:
/// [`lock`](Self::lock) and [`unlock`](Self::unlock) are explicit, the
/// owner may re-enter, and conditions created by
/// [`new_condition`](Self::new_condition) save and restore the full
/// reentrancy count across waits.
pub struct HybridReentrantLock {
    /// Owning thread id, 0 when unlocked. The lock word.
    owner: CachePadded<AtomicU64>,
    /// Reentrancy depth; written only by the owner.
    lock_count: Cell<usize>,
    /// First waiter in the chain, null when no thread is queued.
    head: CachePadded<Atomic<Waiter>>,
}

// SAFETY: `lock_count` is only touched by the thread that holds the owner
// word; everything else is atomic.
unsafe impl Send for HybridReentrantLock {}
unsafe impl Sync for HybridReentrantLock {}

impl Default for HybridReentrantLock {
    fn default() -> Self {
        Self::new()
    }
}

impl HybridReentrantLock {
    pub fn new() -> Self {
        HybridReentrantLock {
            owner: CachePadded::new(AtomicU64::new(0)),
            lock_count: Cell::new(0),
            head: CachePadded::new(Atomic::null()),
        }
    }

    /// Acquire, parking uninterruptibly. An interrupt observed while
    /// waiting is remembered and re-asserted on return.
    pub fn lock(&self) {
        let _ = self.acquire(1, false, None);
    }

    /// Acquire unless the thread is interrupted first (or already was;
    /// the flag is checked and cleared on entry).
    pub fn lock_interruptibly(&self) -> Result<(), Interrupted> {
        self.acquire(1, true, None).map(|_| ())
    }

    /// Try to acquire without suspending: reentrant entry, or a bounded
    /// spin on the fast path while no waiter is queued.
    pub fn try_lock(&self) -> bool {
        let me = thread_id();
        if self.owner.load(Ordering::Relaxed) == me {
            self.lock_count.set(self.lock_count.get() + 1);
            return true;
        }
        for _ in 0..MAX_SPINS {
            if self.chain_empty() && self.try_claim(me, 1) {
                return true;
            }
            hint::spin_loop();
        }
        false
    }

    /// Timed acquire; `Ok(false)` when the deadline passed first.
    pub fn try_lock_for(&self, timeout: Duration) -> Result<bool, Interrupted> {
        self.acquire(1, true, Some(Deadline::after(timeout)))
    }

    /// Release one level of the lock.
    pub fn unlock(&self) -> Result<(), NotOwner> {
        self.release(true).map(|_| ())
    }

    /// Whether the calling thread holds the lock.
    pub fn is_held_by_current_thread(&self) -> bool {
        self.owner.load(Ordering::Relaxed) == thread_id()
    }

    /// Reentrancy depth as seen by the owner; 0 for non-owners.
    pub fn hold_count(&self) -> usize {
        if self.is_held_by_current_thread() {
            self.lock_count.get()
        } else {
            0
        }
    }

    /// Create a condition bound to this lock.
    pub fn new_condition(&self) -> Condition<'_> {
        Condition::new(self)
    }

    // ---- condition support ----

    /// Fully release the lock, returning the nested count to restore.
    pub(crate) fn release_all(&self) -> Result<usize, NotOwner> {
        self.release(false)
    }

    /// Re-acquire with a saved nested count, uninterruptibly.
    pub(crate) fn relock(&self, count: usize) {
        let _ = self.acquire(count, false, None);
    }

    pub(crate) fn is_owner(&self) -> bool {
        self.is_held_by_current_thread()
    }

    // ---- internals ----

    fn chain_empty(&self) -> bool {
        let guard = epoch::pin();
        self.head.load(Ordering::SeqCst, &guard).is_null()
    }

    fn try_claim(&self, me: u64, increment: usize) -> bool {
        if self
            .owner
            .compare_exchange(0, me, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.lock_count.set(increment);
            true
        } else {
            false
        }
    }

    fn head_is(&self, w: *const Waiter) -> bool {
        let guard = epoch::pin();
        self.head.load(Ordering::SeqCst, &guard).as_raw() == w
    }

    fn acquire(
        &self,
        increment: usize,
        interruptible: bool,
        deadline: Option<Deadline>,
    ) -> Result<bool, Interrupted> {
        let me = thread_id();
        if self.owner.load(Ordering::Relaxed) == me {
            self.lock_count.set(self.lock_count.get() + increment);
            return Ok(true);
        }
        if interruptible && interrupt::interrupted() {
            return Err(Interrupted);
        }
        for _ in 0..MAX_SPINS {
            if self.chain_empty() && self.try_claim(me, increment) {
                return Ok(true);
            }
            hint::spin_loop();
        }

        let w = {
            let guard = epoch::pin();
            self.push_waiter(me, &guard)
        };
        let mut pending_interrupt = false;
        loop {
            // re-attempt right after pushing (covers a release that ran
            // before the push landed) and whenever we are first in chain
            if self.head_is(w) && self.try_claim(me, increment) {
                if pending_interrupt {
                    interrupt::set_interrupted();
                }
                return Ok(true);
            }
            if interrupt::interrupted() {
                if interruptible {
                    return self.cancel_wait(w, me, increment, true);
                }
                pending_interrupt = true;
            }
            match &deadline {
                Some(d) => match d.remaining() {
                    Some(rem) => interrupt::park_timeout(rem),
                    None => return self.cancel_wait(w, me, increment, false),
                },
                None => interrupt::park(),
            }
        }
    }

    /// Unregister after an interrupt or timeout, or consume a wakeup that
    /// was already targeted at this waiter.
    fn cancel_wait(
        &self,
        w: *const Waiter,
        me: u64,
        increment: usize,
        by_interrupt: bool,
    ) -> Result<bool, Interrupted> {
        {
            let _guard = epoch::pin();
            // SAFETY: a waiter whose signal is still READY is never
            // retired, and only this thread can move it to CANCELED.
            let waiter = unsafe { &*w };
            if waiter
                .signal
                .compare_exchange(READY, CANCELED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return if by_interrupt {
                    Err(Interrupted)
                } else {
                    Ok(false)
                };
            }
        }
        // the wakeup was consumed on our behalf; take the lock and report
        // the interrupt through the flag instead
        while !self.try_claim(me, increment) {
            hint::spin_loop();
        }
        if by_interrupt {
            interrupt::set_interrupted();
        }
        Ok(true)
    }

    fn release(&self, nested: bool) -> Result<usize, NotOwner> {
        let me = thread_id();
        if self.owner.load(Ordering::Relaxed) != me {
            return Err(NotOwner);
        }
        let count = self.lock_count.get();
        if nested && count > 1 {
            self.lock_count.set(count - 1);
            return Ok(1);
        }
        self.lock_count.set(0);
        self.owner.store(0, Ordering::SeqCst);
        self.wake_successor(me);
        Ok(count)
    }

    /// Push a waiter for the calling thread to the end of the chain,
    /// starting a fresh chain when the current one is closed.
    fn push_waiter<'g>(&self, me: u64, guard: &'g Guard) -> *const Waiter {
        let w = Owned::new(Waiter {
            thread: thread::current(),
            id: me,
            signal: AtomicI8::new(READY),
            next: Atomic::null(),
        })
        .into_shared(guard);
        loop {
            let h = self.head.load(Ordering::SeqCst, guard);
            if h.is_null() {
                if self
                    .head
                    .compare_exchange(
                        Shared::null(),
                        w,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                        guard,
                    )
                    .is_ok()
                {
                    return w.as_raw();
                }
            } else {
                let mut t = h;
                loop {
                    // SAFETY: chain nodes are retired only after the head
                    // moves past them; the pin keeps them readable.
                    let n = unsafe { t.deref() }.next.load(Ordering::Acquire, guard);
                    if n.tag() == CLOSED {
                        // chain consumed; reread head and start over
                        break;
                    }
                    if n.is_null() {
                        if unsafe { t.deref() }
                            .next
                            .compare_exchange(
                                Shared::null(),
                                w,
                                Ordering::AcqRel,
                                Ordering::Acquire,
                                guard,
                            )
                            .is_ok()
                        {
                            return w.as_raw();
                        }
                    } else {
                        t = n;
                    }
                }
            }
        }
    }

    /// Hand the lock to the first live waiter, or close the chain.
    fn wake_successor(&self, me: u64) {
        let guard = epoch::pin();
        let h = self.head.load(Ordering::SeqCst, &guard);
        if h.is_null() {
            return;
        }
        loop {
            // SAFETY: head and its successors are alive under the pin; only
            // this releaser retires them.
            let mut last = h;
            let mut n = h;
            if unsafe { h.deref() }.id == me {
                // skip our own waiter from a chain-based acquisition
                n = unsafe { h.deref() }.next.load(Ordering::Acquire, &guard);
            }
            while !n.is_null() && n.tag() != CLOSED {
                let node = unsafe { n.deref() };
                if node
                    .signal
                    .compare_exchange(READY, SIGNALED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.head.store(n, Ordering::SeqCst);
                    self.retire_range(h, n, &guard);
                    node.thread.unpark();
                    return;
                }
                last = n;
                n = node.next.load(Ordering::Acquire, &guard);
            }
            // no live waiter: close the chain so pushers start a fresh one
            let closed = Shared::null().with_tag(CLOSED);
            if unsafe { last.deref() }
                .next
                .compare_exchange(
                    Shared::null(),
                    closed,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                    &guard,
                )
                .is_ok()
            {
                self.head.store(Shared::null(), Ordering::SeqCst);
                self.retire_range(h, closed, &guard);
                return;
            }
            // a pusher appended concurrently; rescan from the same head
        }
    }

    /// Retire `[from, to)` once the head no longer reaches those nodes.
    fn retire_range<'g>(&self, from: Shared<'g, Waiter>, to: Shared<'g, Waiter>, guard: &'g Guard) {
        let mut cur = from;
        while !cur.is_null() && cur.tag() != CLOSED && cur != to {
            // SAFETY: nodes between the old and new head are unreachable to
            // new pinners; current pinners are covered by the grace period.
            let next = unsafe { cur.deref() }.next.load(Ordering::Relaxed, guard);
            unsafe { guard.defer_destroy(cur) };
            cur = next;
        }
    }
}

impl Drop for HybridReentrantLock {
    fn drop(&mut self) {
        // SAFETY: exclusive access; free whatever chain is left.
        unsafe {
            let g = epoch::unprotected();
            let mut n = self.head.load(Ordering::Relaxed, g);
            while !n.is_null() && n.tag() != CLOSED {
                let next = n.deref().next.load(Ordering::Relaxed, g);
                drop(n.into_owned());
                n = next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reentrant_acquire_and_release() {
        let lock = HybridReentrantLock::new();
        lock.lock();
        lock.lock();
        assert_eq!(lock.hold_count(), 2);
        lock.unlock().unwrap();
        assert!(lock.is_held_by_current_thread());
        lock.unlock().unwrap();
        assert!(!lock.is_held_by_current_thread());
    }

    #[test]
    fn unlock_without_holding_fails() {
        let lock = HybridReentrantLock::new();
        assert_eq!(lock.unlock(), Err(NotOwner));
    }

    #[test]
    fn try_lock_is_reentrant_and_refuses_foreign_owners() {
        let lock = HybridReentrantLock::new();
        assert!(lock.try_lock());
        assert!(lock.try_lock());
        assert_eq!(lock.hold_count(), 2);
        std::thread::scope(|s| {
            s.spawn(|| assert!(!lock.try_lock()));
        });
        lock.unlock().unwrap();
        lock.unlock().unwrap();
    }

    #[test]
    fn try_lock_for_times_out_while_held() {
        let lock = HybridReentrantLock::new();
        lock.lock();
        std::thread::scope(|s| {
            s.spawn(|| {
                let got = lock.try_lock_for(Duration::from_millis(30)).unwrap();
                assert!(!got);
            });
        });
        assert_eq!(lock.hold_count(), 1);
        lock.unlock().unwrap();
    }

    #[test]
    fn handoff_between_threads() {
        let lock = HybridReentrantLock::new();
        lock.lock();
        std::thread::scope(|s| {
            let t = s.spawn(|| {
                lock.lock();
                let held = lock.is_held_by_current_thread();
                lock.unlock().unwrap();
                held
            });
            std::thread::sleep(Duration::from_millis(50));
            lock.unlock().unwrap();
            assert!(t.join().unwrap());
        });
    }
}
