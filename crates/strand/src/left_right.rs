//! Left-right synchronization: two copies of the state, wait-free readers.
//!
//! Readers pick the visible side through two atomic indices (reader
//! indicator first, state second) and never block or CAS. A writer, alone
//! under the writer mutex, mutates the hidden copy, swaps the state index,
//! drains the readers still parked on the old side, swaps the indicator
//! index, drains again, and finally replays the mutation on the former
//! reader copy. Both copies therefore converge after every write, and a
//! reader observes exactly one consistent snapshot per critical section.
//!
//! The mutation is applied to both copies, so it must be deterministic and
//! replayable (`Fn`, not `FnMut`).

use std::cell::{RefCell, UnsafeCell};
use std::collections::HashMap;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

use crate::utils::StripedAdder;

/// Counts readers inside their critical sections and lets a writer wait
/// for the count to drain.
pub trait ReadIndicator {
    fn enter(&self);
    fn exit(&self);
    /// Spin (yielding) until no reader is inside.
    fn wait_empty(&self);
}

/// Reader indicator made of two striped adders compared for equality.
/// Simple and compact; lanes are shared between threads that hash alike.
#[derive(Default)]
pub struct AdderPair {
    enters: StripedAdder,
    exits: StripedAdder,
}

impl ReadIndicator for AdderPair {
    fn enter(&self) {
        self.enters.add(1, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.exits.add(1, Ordering::SeqCst);
    }

    fn wait_empty(&self) {
        while self.exits.sum(Ordering::SeqCst) != self.enters.sum(Ordering::SeqCst) {
            thread::yield_now();
        }
    }
}

/// Reader indicator with one cache-padded counter per registered thread.
/// Readers touch only their own entry, so entering and exiting never share
/// a cache line with another thread. Entries of dead threads are retired
/// by a thread-local destructor and expunged during `wait_empty`.
pub struct ThreadRegistry {
    id: u64,
    head: AtomicPtr<Entry>,
}

struct Entry {
    counter: CachePadded<AtomicU64>,
    retired: AtomicBool,
    next: AtomicPtr<Entry>,
}

static NEXT_REGISTRY_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static REGISTRATIONS: RefCell<Registrations> = RefCell::new(Registrations(HashMap::new()));
}

struct Registrations(HashMap<u64, Arc<Entry>>);

impl Drop for Registrations {
    fn drop(&mut self) {
        for entry in self.0.values() {
            entry.retired.store(true, Ordering::SeqCst);
        }
    }
}

impl Default for ThreadRegistry {
    fn default() -> Self {
        ThreadRegistry {
            id: NEXT_REGISTRY_ID.fetch_add(1, Ordering::Relaxed),
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

impl ThreadRegistry {
    fn entry(&self) -> Arc<Entry> {
        REGISTRATIONS.with(|r| {
            let mut regs = r.borrow_mut();
            if let Some(e) = regs.0.get(&self.id) {
                return Arc::clone(e);
            }
            let e = Arc::new(Entry {
                counter: CachePadded::new(AtomicU64::new(0)),
                retired: AtomicBool::new(false),
                next: AtomicPtr::new(ptr::null_mut()),
            });
            let raw = Arc::into_raw(Arc::clone(&e)) as *mut Entry;
            loop {
                let head = self.head.load(Ordering::Acquire);
                // SAFETY: raw is a fresh allocation owned by the chain slot
                // once the CAS succeeds.
                unsafe { (*raw).next.store(head, Ordering::Relaxed) };
                if self
                    .head
                    .compare_exchange(head, raw, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    break;
                }
            }
            regs.0.insert(self.id, Arc::clone(&e));
            e
        })
    }
}

impl ReadIndicator for ThreadRegistry {
    fn enter(&self) {
        self.entry().counter.fetch_add(1, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.entry().counter.fetch_sub(1, Ordering::SeqCst);
    }

    fn wait_empty(&self) {
        // writers are serialized, so this walk is the only chain mutator
        // besides head-insertion by registering readers
        let mut prev: *mut Entry = ptr::null_mut();
        let mut cur = self.head.load(Ordering::Acquire);
        while !cur.is_null() {
            // SAFETY: chain entries are kept alive by the chain's strong
            // reference until this walk unlinks them.
            let entry = unsafe { &*cur };
            let next = entry.next.load(Ordering::Acquire);
            if entry.retired.load(Ordering::SeqCst) {
                let unlinked = if prev.is_null() {
                    self.head
                        .compare_exchange(cur, next, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                } else {
                    // SAFETY: prev is still linked; only this walk edits
                    // interior links.
                    unsafe { (*prev).next.store(next, Ordering::Release) };
                    true
                };
                if unlinked {
                    // SAFETY: drops the chain's strong reference.
                    unsafe { drop(Arc::from_raw(cur)) };
                    cur = next;
                    continue;
                }
                // lost a head race with a registering reader; retry
                prev = ptr::null_mut();
                cur = self.head.load(Ordering::Acquire);
                continue;
            }
            while entry.counter.load(Ordering::SeqCst) > 0 {
                thread::yield_now();
            }
            prev = cur;
            cur = next;
        }
    }
}

impl Drop for ThreadRegistry {
    fn drop(&mut self) {
        let mut cur = *self.head.get_mut();
        while !cur.is_null() {
            // SAFETY: exclusive access; release each chain reference.
            unsafe {
                let next = (*cur).next.load(Ordering::Relaxed);
                drop(Arc::from_raw(cur));
                cur = next;
            }
        }
    }
}

/// Double-instance wrapper giving wait-free reads and serialized writes.
pub struct LeftRight<T, R: ReadIndicator = AdderPair> {
    states: [UnsafeCell<T>; 2],
    indicators: [R; 2],
    /// Index of the reader-visible state.
    read_idx: CachePadded<AtomicUsize>,
    /// Index of the indicator readers currently register in.
    indicator_idx: CachePadded<AtomicUsize>,
    writer: Mutex<()>,
}

// SAFETY: readers only share `&T` of the visible side while the writer
// mutates the other; the drain protocol keeps the two from overlapping.
unsafe impl<T: Send + Sync, R: ReadIndicator + Send + Sync> Sync for LeftRight<T, R> {}
unsafe impl<T: Send, R: ReadIndicator + Send> Send for LeftRight<T, R> {}

impl<T: Clone, R: ReadIndicator + Default> LeftRight<T, R> {
    /// Build both copies from one initial value.
    pub fn new(initial: T) -> Self {
        let second = initial.clone();
        Self::from_pair(initial, second)
    }
}

impl<T, R: ReadIndicator + Default> LeftRight<T, R> {
    /// Build from two pre-constructed (identical) instances.
    pub fn from_pair(left: T, right: T) -> Self {
        LeftRight {
            states: [UnsafeCell::new(left), UnsafeCell::new(right)],
            indicators: [R::default(), R::default()],
            read_idx: CachePadded::new(AtomicUsize::new(0)),
            indicator_idx: CachePadded::new(AtomicUsize::new(0)),
            writer: Mutex::new(()),
        }
    }
}

impl<T, R: ReadIndicator> LeftRight<T, R> {
    /// Run `f` against the reader-visible state. Wait-free: never blocks,
    /// never CASes. The reference must not escape `f`.
    pub fn read<F, V>(&self, f: F) -> V
    where
        F: FnOnce(&T) -> V,
    {
        // indicator first, state second; the writer swaps in the same order
        let ind = &self.indicators[self.indicator_idx.load(Ordering::SeqCst)];
        ind.enter();
        let _exit = ExitGuard(ind);
        let idx = self.read_idx.load(Ordering::SeqCst);
        // SAFETY: the writer never mutates the side it just made visible
        // while this indicator may still hold readers.
        f(unsafe { &*self.states[idx].get() })
    }

    /// Apply `f` to both copies in turn, serialized with other writers.
    /// Readers in flight keep an untouched copy until they drain.
    pub fn modify<F>(&self, f: F)
    where
        F: Fn(&mut T),
    {
        let _w = self.writer.lock();
        let read = self.read_idx.load(Ordering::SeqCst);
        let write = 1 - read;
        // SAFETY: the writer mutex grants exclusive access to the hidden
        // side; no reader can be inside it (both drains below completed
        // before it last became hidden).
        f(unsafe { &mut *self.states[write].get() });
        self.read_idx.store(write, Ordering::SeqCst);
        let ind = self.indicator_idx.load(Ordering::SeqCst);
        // readers registered in the other indicator may still be on the
        // now-hidden side
        self.indicators[1 - ind].wait_empty();
        self.indicator_idx.store(1 - ind, Ordering::SeqCst);
        self.indicators[ind].wait_empty();
        // SAFETY: every reader of the former visible side has drained.
        f(unsafe { &mut *self.states[read].get() });
    }
}

struct ExitGuard<'a, R: ReadIndicator>(&'a R);

impl<R: ReadIndicator> Drop for ExitGuard<'_, R> {
    fn drop(&mut self) {
        self.0.exit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn reads_see_writes_on_both_copies() {
        let lr: LeftRight<HashSet<i32>> = LeftRight::new(HashSet::new());
        lr.modify(|s| {
            s.insert(1);
        });
        assert!(lr.read(|s| s.contains(&1)));
        lr.modify(|s| {
            s.insert(2);
        });
        // both copies carry both writes
        assert_eq!(unsafe { &*lr.states[0].get() }, unsafe {
            &*lr.states[1].get()
        });
    }

    #[test]
    fn adder_pair_tracks_balance() {
        let p = AdderPair::default();
        p.enter();
        p.exit();
        p.wait_empty();
    }

    #[test]
    fn thread_registry_drains_cleanly() {
        let lr: LeftRight<Vec<i32>, ThreadRegistry> = LeftRight::from_pair(Vec::new(), Vec::new());
        lr.modify(|v| v.push(1));
        assert_eq!(lr.read(|v| v.len()), 1);
        std::thread::scope(|s| {
            s.spawn(|| {
                assert_eq!(lr.read(|v| v[0]), 1);
            });
        });
        // the spawned thread is gone; the next writer expunges its entry
        lr.modify(|v| v.push(2));
        assert_eq!(lr.read(|v| v.len()), 2);
    }
}
