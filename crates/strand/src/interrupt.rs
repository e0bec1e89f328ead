//! Per-thread interrupt flag with park/unpark delivery.
//!
//! Blocking operations in this crate poll the calling thread's interrupt
//! flag at every back-off boundary and before parking. Observing the flag
//! clears it and surfaces [`Interrupted`], unless a wakeup signal was
//! already consumed on the thread's behalf, in which case the operation
//! completes and the flag is re-asserted.
//!
//! Obtain an [`InterruptHandle`] *on the thread to be interrupted* and hand
//! it to whoever needs to cancel that thread's blocking calls.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, Thread};
use std::time::Duration;

use thiserror::Error;

/// A blocking operation observed the thread's interrupt request.
/// The flag has been cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("thread interrupted")]
pub struct Interrupted;

struct Flag {
    raised: AtomicBool,
    thread: Thread,
}

thread_local! {
    static CURRENT: Arc<Flag> = Arc::new(Flag {
        raised: AtomicBool::new(false),
        thread: thread::current(),
    });
}

/// Handle for interrupting the thread it was obtained on.
#[derive(Clone)]
pub struct InterruptHandle {
    flag: Arc<Flag>,
}

impl InterruptHandle {
    /// Raise the target thread's interrupt flag and unpark it so any
    /// blocked operation observes the request.
    pub fn interrupt(&self) {
        self.flag.raised.store(true, Ordering::Release);
        self.flag.thread.unpark();
    }

    /// Whether the target's flag is currently raised.
    pub fn is_interrupted(&self) -> bool {
        self.flag.raised.load(Ordering::Acquire)
    }
}

/// Handle for the calling thread.
pub fn handle() -> InterruptHandle {
    CURRENT.with(|flag| InterruptHandle {
        flag: Arc::clone(flag),
    })
}

/// Check and clear the calling thread's interrupt flag.
pub fn interrupted() -> bool {
    CURRENT.with(|flag| flag.raised.swap(false, Ordering::AcqRel))
}

/// Check the calling thread's flag without clearing it.
pub fn is_interrupted() -> bool {
    CURRENT.with(|flag| flag.raised.load(Ordering::Acquire))
}

/// Re-assert the calling thread's interrupt flag.
pub fn set_interrupted() {
    CURRENT.with(|flag| flag.raised.store(true, Ordering::Release));
}

/// Park the calling thread. Returns on unpark, interrupt or spuriously;
/// callers re-check their wait condition in a loop.
#[inline]
pub(crate) fn park() {
    thread::park();
}

/// Park with an upper bound on the wait.
#[inline]
pub(crate) fn park_timeout(timeout: Duration) {
    thread::park_timeout(timeout);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Instant;

    #[test]
    fn interrupted_clears_the_flag() {
        assert!(!interrupted());
        set_interrupted();
        assert!(is_interrupted());
        assert!(interrupted());
        assert!(!is_interrupted());
    }

    #[test]
    fn interrupt_wakes_a_parked_thread() {
        let (tx, rx) = mpsc::channel();
        let t = thread::spawn(move || {
            tx.send(handle()).unwrap();
            let start = Instant::now();
            while !interrupted() {
                park_timeout(Duration::from_secs(5));
            }
            start.elapsed()
        });
        let h = rx.recv().unwrap();
        thread::sleep(Duration::from_millis(50));
        h.interrupt();
        let waited = t.join().unwrap();
        assert!(waited < Duration::from_secs(5));
    }
}
