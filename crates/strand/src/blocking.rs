//! Blocking facade plumbing: the wait strategy, the spin/yield back-off and
//! the sleeper registration used by parking consumers.
//!
//! Every blocking operation is built from the same three pieces: a fast
//! try, a bounded spin of [`SPINS`] attempts, then cooperative back-off
//! chosen by [`WaitStrategy`]. Producers always use the yielding back-off;
//! parking applies to consumers.

use std::sync::atomic::{fence, AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

/// Number of spins before a blocking operation starts yielding or parks.
pub const SPINS: usize = 5;

/// How a blocking consumer waits once the bounded spin is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitStrategy {
    /// Yield the scheduler between attempts.
    Yielding,
    /// Park until a producer wakes the consumer.
    #[default]
    Parking,
}

/// Back off after a failed attempt: count spins up to [`SPINS`], then yield.
#[inline]
pub(crate) fn backoff(c: usize) -> usize {
    if c < SPINS {
        c + 1
    } else {
        thread::yield_now();
        c
    }
}

/// Nanosecond deadline for timed operations; the remaining time is
/// recomputed before each park.
pub(crate) struct Deadline {
    at: Instant,
}

impl Deadline {
    pub(crate) fn after(timeout: Duration) -> Self {
        Deadline {
            at: Instant::now() + timeout,
        }
    }

    pub(crate) fn expired(&self) -> bool {
        Instant::now() >= self.at
    }

    /// Time left, or `None` once the deadline has passed.
    pub(crate) fn remaining(&self) -> Option<Duration> {
        self.at
            .checked_duration_since(Instant::now())
            .filter(|d| !d.is_zero())
    }
}

/// The single suspension slot of a parking MPSC consumer.
pub(crate) struct Sleeper {
    armed: CachePadded<AtomicBool>,
    slot: Mutex<Option<Thread>>,
}

impl Sleeper {
    pub(crate) fn new() -> Self {
        Sleeper {
            armed: CachePadded::new(AtomicBool::new(false)),
            slot: Mutex::new(None),
        }
    }

    /// Register the calling thread. The caller must re-poll the queue once
    /// after registering to close the missed-wakeup race.
    pub(crate) fn register(&self) {
        *self.slot.lock() = Some(thread::current());
        self.armed.store(true, Ordering::SeqCst);
        // pairs with the fence in wake(): either the producer sees the slot
        // armed, or the re-poll after this call sees its element
        fence(Ordering::SeqCst);
    }

    pub(crate) fn clear(&self) {
        self.armed.store(false, Ordering::SeqCst);
        *self.slot.lock() = None;
    }

    /// Wake the registered consumer, if any.
    pub(crate) fn wake(&self) {
        // pairs with the fence in register()
        fence(Ordering::SeqCst);
        if self.armed.load(Ordering::SeqCst) {
            if let Some(t) = self.slot.lock().as_ref() {
                t.unpark();
            }
        }
    }
}

/// One suspended consumer in the multi-consumer registry.
pub(crate) struct SleepSlot {
    thread: Thread,
    active: AtomicBool,
}

impl SleepSlot {
    pub(crate) fn current() -> Arc<Self> {
        Arc::new(SleepSlot {
            thread: thread::current(),
            active: AtomicBool::new(true),
        })
    }

    /// Stop wakeups aimed at a consumer that already left. The registry
    /// node itself is tombstoned separately.
    pub(crate) fn retire(&self) {
        self.active.store(false, Ordering::Release);
    }

    pub(crate) fn wake(&self) {
        if self.active.load(Ordering::Acquire) {
            self.thread.unpark();
        }
    }
}
