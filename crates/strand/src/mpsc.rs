//! Unbounded and bounded multi-producer single-consumer linked queue.
//!
//! Producers linearize through an atomic exchange of `head` (the most
//! recently linked node) and then release-publish the predecessor's `next`
//! link; enqueue is wait-free per producer. The single consumer owns the
//! sentinel `tail` and walks `next` links, so dequeue never contends.
//!
//! The consumer side is a [`Receiver`], which enforces the single-consumer
//! contract statically: it is not clonable, dequeue takes `&mut self`, and
//! it cannot be shared across threads concurrently.
//!
//! ```
//! let (tx, mut rx) = strand::mpsc::unbounded();
//! tx.offer(1).unwrap();
//! tx.offer(2).unwrap();
//! assert_eq!(rx.poll(), Some(1));
//! assert_eq!(rx.poll(), Some(2));
//! assert_eq!(rx.poll(), None);
//! ```

use std::marker::PhantomData;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_epoch::{self as epoch, Atomic, Owned};
use crossbeam_utils::CachePadded;

use crate::blocking::{backoff, Deadline, Sleeper, WaitStrategy, SPINS};
use crate::bounded::BoundedState;
use crate::interrupt::{self, Interrupted};
use crate::node::Node;
use crate::{Full, PutError};

/// Create an unbounded queue with the default (parking) wait strategy.
pub fn unbounded<E>() -> (Sender<E>, Receiver<E>) {
    with_config(None, WaitStrategy::default())
}

/// Create an unbounded queue with an explicit wait strategy.
pub fn unbounded_with<E>(strategy: WaitStrategy) -> (Sender<E>, Receiver<E>) {
    with_config(None, strategy)
}

/// Create a capacity-bounded queue with the default (parking) wait strategy.
pub fn bounded<E>(capacity: usize) -> (Sender<E>, Receiver<E>) {
    with_config(Some(capacity), WaitStrategy::default())
}

/// Create a capacity-bounded queue with an explicit wait strategy.
pub fn bounded_with<E>(capacity: usize, strategy: WaitStrategy) -> (Sender<E>, Receiver<E>) {
    with_config(Some(capacity), strategy)
}

fn with_config<E>(capacity: Option<usize>, strategy: WaitStrategy) -> (Sender<E>, Receiver<E>) {
    let inner = Arc::new(Inner {
        tail: CachePadded::new(Atomic::null()),
        head: CachePadded::new(Atomic::null()),
        bounded: capacity.map(BoundedState::new),
        sleeper: Sleeper::new(),
        strategy,
    });
    {
        let guard = epoch::pin();
        let sentinel = Owned::new(Node::sentinel()).into_shared(&guard);
        inner.tail.store(sentinel, Ordering::Relaxed);
        inner.head.store(sentinel, Ordering::Relaxed);
    }
    (
        Sender {
            inner: Arc::clone(&inner),
        },
        Receiver {
            inner,
            _single: PhantomData,
        },
    )
}

struct Inner<E> {
    /// Sentinel of the consume side. Only the consumer stores to it.
    tail: CachePadded<Atomic<Node<E>>>,
    /// Most recently linked node. Producers get-and-set it.
    head: CachePadded<Atomic<Node<E>>>,
    bounded: Option<BoundedState>,
    sleeper: Sleeper,
    strategy: WaitStrategy,
}

impl<E> Drop for Inner<E> {
    fn drop(&mut self) {
        // SAFETY: both handles are gone; nothing else references the chain.
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

/// Producer handle. Clonable and shareable across threads.
pub struct Sender<E> {
    inner: Arc<Inner<E>>,
}

impl<E> Clone for Sender<E> {
    fn clone(&self) -> Self {
        Sender {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E> Sender<E> {
    /// Enqueue. Fails only when a capacity bound is hit, handing the
    /// element back. Wait-free apart from the node allocation.
    pub fn offer(&self, e: E) -> Result<(), Full<E>> {
        if let Some(b) = &self.inner.bounded {
            if !b.try_admit() {
                return Err(Full(e));
            }
        }
        let guard = epoch::pin();
        let n = Owned::new(Node::new(e)).into_shared(&guard);
        let prev = self.inner.head.swap(n, Ordering::AcqRel, &guard);
        // SAFETY: the consumer cannot release the previous head until its
        // `next` is published below.
        unsafe { prev.deref() }.next.store(n, Ordering::Release);
        if let Some(b) = &self.inner.bounded {
            b.note_ingress();
        }
        self.inner.sleeper.wake();
        Ok(())
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

    /// Capacity of the bounded variant.
    pub fn capacity(&self) -> Option<usize> {
        self.inner.bounded.as_ref().map(BoundedState::capacity)
    }
}

/// Consumer handle. All dequeue operations must happen through this single
/// value; it is not clonable and not `Sync`.
pub struct Receiver<E> {
    inner: Arc<Inner<E>>,
    _single: PhantomData<std::cell::Cell<()>>,
}

// SAFETY: the receiver may move to another thread; exclusive consumption is
// guaranteed by `&mut self` on the dequeue operations plus `!Sync`.
unsafe impl<E: Send> Send for Receiver<E> {}

impl<E> Receiver<E> {
    /// Dequeue the oldest element, or `None` when the queue is empty.
    pub fn poll(&mut self) -> Option<E> {
        let guard = epoch::pin();
        let tail = self.inner.tail.load(Ordering::Relaxed, &guard);
        // SAFETY: the sentinel is only released by this consumer.
        let next = unsafe { tail.deref() }.next.load(Ordering::Acquire, &guard);
        if next.is_null() {
            return None;
        }
        // SAFETY: linked nodes stay alive until the consumer passes them.
        let value = unsafe { next.deref() }.take();
        self.inner.tail.store(next, Ordering::Relaxed);
        // SAFETY: the old sentinel is unreachable once tail advanced.
        unsafe { guard.defer_destroy(tail) };
        if value.is_some() {
            if let Some(b) = &self.inner.bounded {
                b.note_egress();
            }
        }
        value
    }

    /// Borrow the oldest element without removing it.
    pub fn peek(&self) -> Option<&E> {
        let guard = epoch::pin();
        let tail = self.inner.tail.load(Ordering::Relaxed, &guard);
        // SAFETY: as in poll().
        let next = unsafe { tail.deref() }.next.load(Ordering::Acquire, &guard);
        if next.is_null() {
            None
        } else {
            // SAFETY: nodes ahead of the sentinel are only released by
            // consumer operations, which need `&mut self` and are therefore
            // excluded while the returned borrow is alive.
            Some(unsafe { (*next.as_raw()).value_ref() })
        }
    }

    /// Iterate the queued elements oldest-first without consuming them.
    pub fn iter(&self) -> Iter<'_, E> {
        let guard = epoch::pin();
        let tail = self.inner.tail.load(Ordering::Relaxed, &guard);
        // SAFETY: as in poll().
        let first = unsafe { tail.deref() }.next.load(Ordering::Acquire, &guard);
        Iter {
            node: first.as_raw(),
            _recv: PhantomData,
        }
    }

    pub fn contains(&self, value: &E) -> bool
    where
        E: PartialEq,
    {
        self.iter().any(|e| e == value)
    }

    /// Number of queued elements. Bounded queues answer from their
    /// counters; unbounded queues walk the chain, which is approximate
    /// under concurrent offers and intended for diagnostics.
    pub fn len(&self) -> usize {
        if let Some(b) = &self.inner.bounded {
            return b.len();
        }
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        let guard = epoch::pin();
        let tail = self.inner.tail.load(Ordering::Relaxed, &guard);
        // SAFETY: as in poll().
        unsafe { tail.deref() }
            .next
            .load(Ordering::Acquire, &guard)
            .is_null()
    }

    pub fn capacity(&self) -> Option<usize> {
        self.inner.bounded.as_ref().map(BoundedState::capacity)
    }

    pub fn remaining_capacity(&self) -> Option<usize> {
        self.inner.bounded.as_ref().map(BoundedState::remaining)
    }

    /// Drop every currently linked element, returning how many were
    /// discarded. Offers racing this call may land either side of it.
    pub fn clear(&mut self) -> usize {
        let mut n = 0;
        while self.poll().is_some() {
            n += 1;
        }
        n
    }

    /// Move up to `max` elements into `out`; returns how many moved.
    pub fn drain_to(&mut self, out: &mut Vec<E>, max: usize) -> usize {
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

    /// Blocking dequeue.
    pub fn take(&mut self) -> Result<E, Interrupted> {
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
        match self.inner.strategy {
            WaitStrategy::Yielding => loop {
                if let Some(e) = self.poll() {
                    return Ok(e);
                }
                if interrupt::interrupted() {
                    return Err(Interrupted);
                }
                std::thread::yield_now();
            },
            WaitStrategy::Parking => {
                self.inner.sleeper.register();
                let result = loop {
                    if interrupt::interrupted() {
                        break Err(Interrupted);
                    }
                    match self.poll() {
                        Some(e) => break Ok(e),
                        None => interrupt::park(),
                    }
                };
                self.inner.sleeper.clear();
                result
            }
        }
    }

    /// Blocking dequeue with a deadline; `Ok(None)` on timeout.
    pub fn poll_timeout(&mut self, timeout: Duration) -> Result<Option<E>, Interrupted> {
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
        match self.inner.strategy {
            WaitStrategy::Yielding => loop {
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
            WaitStrategy::Parking => {
                self.inner.sleeper.register();
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
                self.inner.sleeper.clear();
                result
            }
        }
    }
}

/// Non-consuming iterator over a receiver's queued elements.
pub struct Iter<'a, E> {
    node: *const Node<E>,
    _recv: PhantomData<&'a Receiver<E>>,
}

impl<'a, E> Iterator for Iter<'a, E> {
    type Item = &'a E;

    fn next(&mut self) -> Option<&'a E> {
        if self.node.is_null() {
            return None;
        }
        // SAFETY: nodes reachable from the sentinel are only released by
        // consumer operations, which are excluded while the receiver is
        // borrowed by this iterator.
        unsafe {
            let node: &'a Node<E> = &*self.node;
            let guard = epoch::pin();
            self.node = node.next.load(Ordering::Acquire, &guard).as_raw();
            Some(node.value_ref())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offers_come_back_in_order() {
        let (tx, mut rx) = unbounded();
        for i in 0..10 {
            tx.offer(i).unwrap();
        }
        for i in 0..10 {
            assert_eq!(rx.poll(), Some(i));
        }
        assert_eq!(rx.poll(), None);
    }

    #[test]
    fn peek_does_not_consume() {
        let (tx, mut rx) = unbounded();
        assert!(rx.peek().is_none());
        tx.offer(5).unwrap();
        assert_eq!(rx.peek(), Some(&5));
        assert_eq!(rx.poll(), Some(5));
    }

    #[test]
    fn iter_walks_without_consuming() {
        let (tx, rx) = unbounded();
        for i in 0..4 {
            tx.offer(i).unwrap();
        }
        let seen: Vec<i32> = rx.iter().copied().collect();
        assert_eq!(seen, vec![0, 1, 2, 3]);
        assert_eq!(rx.len(), 4);
        assert!(rx.contains(&2));
        assert!(!rx.contains(&9));
    }

    #[test]
    fn bounded_offer_fails_at_capacity() {
        let (tx, mut rx) = bounded(2);
        tx.offer(1).unwrap();
        tx.offer(2).unwrap();
        assert_eq!(tx.offer(3), Err(Full(3)));
        assert_eq!(rx.remaining_capacity(), Some(0));
        assert_eq!(rx.poll(), Some(1));
        assert!(tx.offer(3).is_ok());
    }

    #[test]
    fn clear_discards_linked_elements() {
        let (tx, mut rx) = unbounded();
        for i in 0..8 {
            tx.offer(i).unwrap();
        }
        assert_eq!(rx.clear(), 8);
        assert!(rx.is_empty());
        tx.offer(99).unwrap();
        assert_eq!(rx.poll(), Some(99));
    }

    #[test]
    fn drain_to_respects_the_limit() {
        let (tx, mut rx) = unbounded();
        for i in 0..6 {
            tx.offer(i).unwrap();
        }
        let mut out = Vec::new();
        assert_eq!(rx.drain_to(&mut out, 4), 4);
        assert_eq!(out, vec![0, 1, 2, 3]);
        assert_eq!(rx.len(), 2);
    }

    #[test]
    fn poll_timeout_returns_none_when_empty() {
        let (_tx, mut rx) = unbounded::<i32>();
        let got = rx.poll_timeout(Duration::from_millis(10)).unwrap();
        assert_eq!(got, None);
    }

    #[test]
    fn owned_elements_are_dropped_with_the_queue() {
        let (tx, rx) = unbounded();
        tx.offer(String::from("left behind")).unwrap();
        drop(tx);
        drop(rx);
    }
}
