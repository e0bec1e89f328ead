//! Unbounded and bounded multi-producer multi-consumer linked queue.
//!
//! Enqueue is the same get-and-set linearization as the MPSC queue. Dequeue
//! CAS-advances the sentinel `tail` and then claims the advanced node's
//! element; a node whose element was already claimed (a tombstone, e.g.
//! after [`MpmcQueue::remove`]) is skipped and reclaimed as the sentinel
//! moves over it. Tombstones in the middle of the chain stay linked until
//! the nodes ahead of them are consumed; they are invisible to every
//! operation.
//!
//! Inspection operations (`peek_with`, `for_each`, `contains`, `remove`)
//! borrow elements under a short per-node gate; keep the callbacks brief
//! and do not let the borrow escape.

use std::sync::atomic::Ordering;
use std::time::Duration;

use crossbeam_epoch::{self as epoch, Atomic, Owned};
use crossbeam_utils::CachePadded;

use crate::blocking::{backoff, Deadline, SleepSlot, WaitStrategy, SPINS};
use crate::bounded::BoundedState;
use crate::interrupt::{self, Interrupted};
use crate::node::Node;
use crate::{Full, PutError};

/// Lock-free multi-producer multi-consumer FIFO queue.
///
/// All operations take `&self`; share the queue behind an `Arc` (or by
/// reference from scoped threads).
pub struct MpmcQueue<E> {
    /// Sentinel of the consume side; `tail.next` is the oldest element.
    tail: CachePadded<Atomic<Node<E>>>,
    /// Most recently linked node.
    head: CachePadded<Atomic<Node<E>>>,
    bounded: Option<BoundedState>,
    strategy: WaitStrategy,
    /// Parked consumers. The registry is itself an `MpmcQueue` of sleep
    /// slots; the inner queue is built bare so the recursion ends there.
    sleepers: Option<Box<SleeperRegistry>>,
}

impl<E> MpmcQueue<E> {
    /// Unbounded queue with the default (parking) wait strategy.
    pub fn new() -> Self {
        Self::with_config(None, WaitStrategy::default())
    }

    /// Capacity-bounded queue with the default (parking) wait strategy.
    pub fn bounded(capacity: usize) -> Self {
        Self::with_config(Some(capacity), WaitStrategy::default())
    }

    /// Unbounded queue with an explicit wait strategy.
    pub fn with_strategy(strategy: WaitStrategy) -> Self {
        Self::with_config(None, strategy)
    }

    /// Capacity-bounded queue with an explicit wait strategy.
    pub fn bounded_with(capacity: usize, strategy: WaitStrategy) -> Self {
        Self::with_config(Some(capacity), strategy)
    }

    fn with_config(capacity: Option<usize>, strategy: WaitStrategy) -> Self {
        let mut q = Self::bare(capacity, strategy);
        q.sleepers = Some(Box::new(SleeperRegistry::new()));
        q
    }

    fn bare(capacity: Option<usize>, strategy: WaitStrategy) -> Self {
        let q = MpmcQueue {
            tail: CachePadded::new(Atomic::null()),
            head: CachePadded::new(Atomic::null()),
            bounded: capacity.map(BoundedState::new),
            strategy,
            sleepers: None,
        };
        {
            let guard = epoch::pin();
            let sentinel = Owned::new(Node::sentinel()).into_shared(&guard);
            q.tail.store(sentinel, Ordering::Relaxed);
            q.head.store(sentinel, Ordering::Relaxed);
        }
        q
    }

    /// Enqueue. Fails only when a capacity bound is hit, handing the
    /// element back.
    pub fn offer(&self, e: E) -> Result<(), Full<E>> {
        if let Some(b) = &self.bounded {
            if !b.try_admit() {
                return Err(Full(e));
            }
        }
        let guard = epoch::pin();
        let n = Owned::new(Node::new(e)).into_shared(&guard);
        let prev = self.head.swap(n, Ordering::AcqRel, &guard);
        // SAFETY: prev cannot be reclaimed before its `next` is published;
        // the pin taken above holds off any deferred destruction.
        unsafe { prev.deref() }.next.store(n, Ordering::Release);
        if let Some(b) = &self.bounded {
            b.note_ingress();
        }
        self.wake_consumers();
        Ok(())
    }

    /// Dequeue the oldest live element, or `None` when the queue is empty.
    ///
    /// The linearization point is the successful CAS advancing `tail`.
    pub fn poll(&self) -> Option<E> {
        let guard = epoch::pin();
        loop {
            let tail = self.tail.load(Ordering::Acquire, &guard);
            // SAFETY: the sentinel is alive under the pin.
            let next = unsafe { tail.deref() }.next.load(Ordering::Acquire, &guard);
            if next.is_null() {
                return None;
            }
            if self
                .tail
                .compare_exchange(tail, next, Ordering::AcqRel, Ordering::Acquire, &guard)
                .is_ok()
            {
                // SAFETY: winning the CAS grants the exclusive right to
                // retire the node the sentinel moved off.
                unsafe { guard.defer_destroy(tail) };
                // SAFETY: next is alive under the pin.
                if let Some(e) = unsafe { next.deref() }.take() {
                    if let Some(b) = &self.bounded {
                        b.note_egress();
                    }
                    return Some(e);
                }
                // tombstone; keep advancing
            }
        }
    }

    /// Run `f` against the oldest live element. Tombstones in front are
    /// pruned on the way.
    pub fn peek_with<R, F>(&self, f: F) -> Option<R>
    where
        F: FnOnce(&E) -> R,
    {
        let guard = epoch::pin();
        let mut f = f;
        let mut tail = self.tail.load(Ordering::Acquire, &guard);
        loop {
            // SAFETY: chain nodes are alive under the pin.
            let next = unsafe { tail.deref() }.next.load(Ordering::Acquire, &guard);
            if next.is_null() {
                return None;
            }
            match unsafe { next.deref() }.with_value(f) {
                Ok(r) => return Some(r),
                Err(back) => {
                    f = back;
                    match self.tail.compare_exchange(
                        tail,
                        next,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                        &guard,
                    ) {
                        Ok(_) => {
                            // SAFETY: exclusive retire right, as in poll().
                            unsafe { guard.defer_destroy(tail) };
                            tail = next;
                        }
                        Err(_) => tail = self.tail.load(Ordering::Acquire, &guard),
                    }
                }
            }
        }
    }

    /// Clone of the oldest live element.
    pub fn peek(&self) -> Option<E>
    where
        E: Clone,
    {
        self.peek_with(E::clone)
    }

    /// Remove the first element equal to `value`. The node is tombstoned in
    /// place and reclaimed lazily as the sentinel moves over it.
    pub fn remove(&self, value: &E) -> bool
    where
        E: PartialEq,
    {
        self.remove_by(|e| e == value)
    }

    /// Remove the first element matching `pred`.
    pub fn remove_by<F>(&self, mut pred: F) -> bool
    where
        F: FnMut(&E) -> bool,
    {
        let guard = epoch::pin();
        let tail = self.tail.load(Ordering::Acquire, &guard);
        // SAFETY: chain nodes are alive under the pin.
        let mut n = unsafe { tail.deref() }.next.load(Ordering::Acquire, &guard);
        while !n.is_null() {
            let node = unsafe { n.deref() };
            if node.take_if(&mut pred) {
                if let Some(b) = &self.bounded {
                    b.note_egress();
                }
                return true;
            }
            n = node.next.load(Ordering::Acquire, &guard);
        }
        false
    }

    /// Visit every live element oldest-first. Tombstones at the front of
    /// the chain are pruned on the way.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&E),
    {
        let guard = epoch::pin();
        let mut tail = self.tail.load(Ordering::Acquire, &guard);
        let mut at_front = true;
        // SAFETY: chain nodes are alive under the pin.
        let mut n = unsafe { tail.deref() }.next.load(Ordering::Acquire, &guard);
        while !n.is_null() {
            let node = unsafe { n.deref() };
            if node.visit(&mut f) {
                at_front = false;
            } else if at_front {
                match self
                    .tail
                    .compare_exchange(tail, n, Ordering::AcqRel, Ordering::Acquire, &guard)
                {
                    Ok(_) => {
                        // SAFETY: exclusive retire right, as in poll().
                        unsafe { guard.defer_destroy(tail) };
                        tail = n;
                    }
                    Err(_) => {
                        tail = self.tail.load(Ordering::Acquire, &guard);
                        n = unsafe { tail.deref() }.next.load(Ordering::Acquire, &guard);
                        continue;
                    }
                }
            }
            n = node.next.load(Ordering::Acquire, &guard);
        }
    }

    pub fn contains(&self, value: &E) -> bool
    where
        E: PartialEq,
    {
        let guard = epoch::pin();
        let tail = self.tail.load(Ordering::Acquire, &guard);
        // SAFETY: chain nodes are alive under the pin.
        let mut n = unsafe { tail.deref() }.next.load(Ordering::Acquire, &guard);
        while !n.is_null() {
            let node = unsafe { n.deref() };
            let mut found = false;
            node.visit(&mut |e| found = e == value);
            if found {
                return true;
            }
            n = node.next.load(Ordering::Acquire, &guard);
        }
        false
    }

    /// Number of live elements. Bounded queues answer from their counters;
    /// unbounded queues walk the chain, which is approximate under
    /// concurrent use and intended for diagnostics.
    pub fn len(&self) -> usize {
        if let Some(b) = &self.bounded {
            return b.len();
        }
        let guard = epoch::pin();
        let tail = self.tail.load(Ordering::Acquire, &guard);
        // SAFETY: chain nodes are alive under the pin.
        let mut n = unsafe { tail.deref() }.next.load(Ordering::Acquire, &guard);
        let mut count = 0;
        while !n.is_null() {
            let node = unsafe { n.deref() };
            if node.has_value() {
                count += 1;
            }
            n = node.next.load(Ordering::Acquire, &guard);
        }
        count
    }

    pub fn is_empty(&self) -> bool {
        let guard = epoch::pin();
        let tail = self.tail.load(Ordering::Acquire, &guard);
        // SAFETY: chain nodes are alive under the pin.
        let mut n = unsafe { tail.deref() }.next.load(Ordering::Acquire, &guard);
        while !n.is_null() {
            let node = unsafe { n.deref() };
            if node.has_value() {
                return false;
            }
            n = node.next.load(Ordering::Acquire, &guard);
        }
        true
    }

    pub fn capacity(&self) -> Option<usize> {
        self.bounded.as_ref().map(BoundedState::capacity)
    }

    pub fn remaining_capacity(&self) -> Option<usize> {
        self.bounded.as_ref().map(BoundedState::remaining)
    }

    /// Discard every queued element, returning how many were dropped.
    /// Drains through `poll` so the bounded ingress/egress accounting stays
    /// balanced and nodes are retired through the queue's one reclamation
    /// point. Offers racing this call may land either side of it.
    pub fn clear(&self) -> usize {
        let mut n = 0;
        while self.poll().is_some() {
            n += 1;
        }
        n
    }

    /// Move up to `max` elements into `out`; returns how many moved.
    pub fn drain_to(&self, out: &mut Vec<E>, max: usize) -> usize {
        let mut n = 0;
        while n < max {
            match self.poll() {
                Some(e) => {
                    out.push(e);
                    n += 1;
                }
                None => break,
            }
        }
        n
    }

    /// Blocking enqueue: spin, then yield until capacity frees up.
    pub fn put(&self, e: E) -> Result<(), PutError<E>> {
        let mut item = e;
        let mut c = 0;
        loop {
            match self.offer(item) {
                Ok(()) => return Ok(()),
                Err(Full(back)) => {
                    if interrupt::interrupted() {
                        return Err(PutError::Interrupted(back));
                    }
                    item = back;
                    c = backoff(c);
                }
            }
        }
    }

    /// Blocking enqueue with a deadline.
    pub fn offer_timeout(&self, e: E, timeout: Duration) -> Result<(), PutError<E>> {
        let deadline = Deadline::after(timeout);
        let mut item = e;
        let mut c = 0;
        loop {
            match self.offer(item) {
                Ok(()) => return Ok(()),
                Err(Full(back)) => {
                    if interrupt::interrupted() {
                        return Err(PutError::Interrupted(back));
                    }
                    if deadline.expired() {
                        return Err(PutError::Timeout(back));
                    }
                    item = back;
                    c = backoff(c);
                }
            }
        }
    }

    /// Blocking dequeue.
    pub fn take(&self) -> Result<E, Interrupted> {
        let mut c = 0;
        while c < SPINS {
            if let Some(e) = self.poll() {
                return Ok(e);
            }
            if interrupt::interrupted() {
                return Err(Interrupted);
            }
            c += 1;
        }
        match (&self.sleepers, self.strategy) {
            (Some(reg), WaitStrategy::Parking) => {
                let slot = reg.enlist();
                let result = loop {
                    if interrupt::interrupted() {
                        break Err(Interrupted);
                    }
                    match self.poll() {
                        Some(e) => break Ok(e),
                        None => interrupt::park(),
                    }
                };
                reg.delist(&slot);
                result
            }
            _ => loop {
                if let Some(e) = self.poll() {
                    return Ok(e);
                }
                if interrupt::interrupted() {
                    return Err(Interrupted);
                }
                std::thread::yield_now();
            },
        }
    }

    /// Blocking dequeue with a deadline; `Ok(None)` on timeout.
    pub fn poll_timeout(&self, timeout: Duration) -> Result<Option<E>, Interrupted> {
        let deadline = Deadline::after(timeout);
        let mut c = 0;
        while c < SPINS {
            if let Some(e) = self.poll() {
                return Ok(Some(e));
            }
            if interrupt::interrupted() {
                return Err(Interrupted);
            }
            if deadline.expired() {
                return Ok(None);
            }
            c += 1;
        }
        match (&self.sleepers, self.strategy) {
            (Some(reg), WaitStrategy::Parking) => {
                let slot = reg.enlist();
                let result = loop {
                    if interrupt::interrupted() {
                        break Err(Interrupted);
                    }
                    if let Some(e) = self.poll() {
                        break Ok(Some(e));
                    }
                    match deadline.remaining() {
                        Some(rem) => interrupt::park_timeout(rem),
                        None => break Ok(None),
                    }
                };
                reg.delist(&slot);
                result
            }
            _ => loop {
                if let Some(e) = self.poll() {
                    return Ok(Some(e));
                }
                if interrupt::interrupted() {
                    return Err(Interrupted);
                }
                if deadline.expired() {
                    return Ok(None);
                }
                std::thread::yield_now();
            },
        }
    }

    fn wake_consumers(&self) {
        if let Some(reg) = &self.sleepers {
            // pairs with the fence in SleeperRegistry::enlist()
            std::sync::atomic::fence(Ordering::SeqCst);
            if !reg.queue.is_empty() {
                reg.wake_all();
            }
        }
    }
}

impl<E> Default for MpmcQueue<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Drop for MpmcQueue<E> {
    fn drop(&mut self) {
        // SAFETY: exclusive access; free the remaining chain directly.
        unsafe {
            let g = epoch::unprotected();
            let mut n = self.tail.load(Ordering::Relaxed, g);
            while !n.is_null() {
                let next = n.deref().next.load(Ordering::Relaxed, g);
                drop(n.into_owned());
                n = next;
            }
        }
    }
}

/// Registry of parked consumers. The waiter list of a parking
/// multi-consumer queue is itself an MPMC queue of sleep slots.
pub(crate) struct SleeperRegistry {
    queue: MpmcQueue<std::sync::Arc<SleepSlot>>,
}

impl SleeperRegistry {
    fn new() -> Self {
        SleeperRegistry {
            queue: MpmcQueue::bare(None, WaitStrategy::Yielding),
        }
    }

    /// Register the calling thread. The caller must re-poll once after this
    /// to close the missed-wakeup race.
    fn enlist(&self) -> std::sync::Arc<SleepSlot> {
        let slot = SleepSlot::current();
        let _ = self.queue.offer(std::sync::Arc::clone(&slot));
        // pairs with the fence in wake_consumers()
        std::sync::atomic::fence(Ordering::SeqCst);
        slot
    }

    fn delist(&self, slot: &std::sync::Arc<SleepSlot>) {
        slot.retire();
        self.queue.remove_by(|s| std::sync::Arc::ptr_eq(s, slot));
    }

    fn wake_all(&self) {
        self.queue.for_each(|slot| slot.wake());
    }
}
