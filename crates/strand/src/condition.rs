//! Condition variables for the hybrid lock, bridged through an auxiliary
//! monitor.
//!
//! A condition never touches the lock's waiter chain. Waiting threads
//! register in the condition's own list, guarded by a small auxiliary
//! mutex (the monitor M), then fully release the lock, including any
//! nested counts, and park. Signalling verifies ownership of the lock,
//! claims registered waiters under M and unparks them. Every exit path of
//! a wait re-acquires the lock with the saved nested count.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, Thread};
use std::time::Duration;

use parking_lot::Mutex;

use crate::blocking::Deadline;
use crate::interrupt::{self, Interrupted};
use crate::lock::HybridReentrantLock;
use crate::{NotOwner, WaitError};

const WAITING: u8 = 0;
const SIGNALED: u8 = 1;
const CANCELED: u8 = 2;

struct CondWaiter {
    thread: Thread,
    state: AtomicU8,
}

impl CondWaiter {
    fn current() -> Arc<Self> {
        Arc::new(CondWaiter {
            thread: thread::current(),
            state: AtomicU8::new(WAITING),
        })
    }

    fn claim(&self) -> bool {
        self.state
            .compare_exchange(WAITING, SIGNALED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn cancel(&self) -> bool {
        self.state
            .compare_exchange(WAITING, CANCELED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// A condition bound to a [`HybridReentrantLock`].
pub struct Condition<'l> {
    lock: &'l HybridReentrantLock,
    /// The auxiliary monitor: registrations and signals serialize here,
    /// independent of the lock's own waiter chain.
    monitor: Mutex<VecDeque<Arc<CondWaiter>>>,
}

impl<'l> Condition<'l> {
    pub(crate) fn new(lock: &'l HybridReentrantLock) -> Self {
        Condition {
            lock,
            monitor: Mutex::new(VecDeque::new()),
        }
    }

    /// Wait until signalled. Releases the lock in full (saving the nested
    /// count) and regains it before returning, also on interrupt.
    pub fn await_(&self) -> Result<(), WaitError> {
        if !self.lock.is_owner() {
            return Err(NotOwner.into());
        }
        let me = CondWaiter::current();
        self.monitor.lock().push_back(Arc::clone(&me));
        // a signaller must own the lock, so no signal can race between the
        // registration above and the release below
        let count = match self.lock.release_all() {
            Ok(c) => c,
            Err(e) => {
                self.forget(&me);
                return Err(e.into());
            }
        };
        let mut result = Ok(());
        loop {
            match me.state.load(Ordering::Acquire) {
                SIGNALED => break,
                WAITING => {
                    if interrupt::interrupted() {
                        if me.cancel() {
                            result = Err(Interrupted.into());
                            break;
                        }
                        // the signal won; complete normally, flag restored
                        interrupt::set_interrupted();
                    } else {
                        interrupt::park();
                    }
                }
                _ => break,
            }
        }
        self.forget(&me);
        self.lock.relock(count);
        result
    }

    /// Wait, treating interrupts as spurious wakeups; the flag is restored
    /// on return.
    pub fn await_uninterruptibly(&self) -> Result<(), NotOwner> {
        if !self.lock.is_owner() {
            return Err(NotOwner);
        }
        let me = CondWaiter::current();
        self.monitor.lock().push_back(Arc::clone(&me));
        let count = match self.lock.release_all() {
            Ok(c) => c,
            Err(e) => {
                self.forget(&me);
                return Err(e);
            }
        };
        let mut pending_interrupt = false;
        while me.state.load(Ordering::Acquire) == WAITING {
            if interrupt::interrupted() {
                pending_interrupt = true;
            }
            interrupt::park();
        }
        self.forget(&me);
        self.lock.relock(count);
        if pending_interrupt {
            interrupt::set_interrupted();
        }
        Ok(())
    }

    /// Timed wait; `Ok(false)` when the deadline passed without a signal.
    pub fn await_timeout(&self, timeout: Duration) -> Result<bool, WaitError> {
        if !self.lock.is_owner() {
            return Err(NotOwner.into());
        }
        let deadline = Deadline::after(timeout);
        let me = CondWaiter::current();
        self.monitor.lock().push_back(Arc::clone(&me));
        let count = match self.lock.release_all() {
            Ok(c) => c,
            Err(e) => {
                self.forget(&me);
                return Err(e.into());
            }
        };
        let mut result = Ok(true);
        loop {
            match me.state.load(Ordering::Acquire) {
                SIGNALED => break,
                WAITING => {
                    if interrupt::interrupted() {
                        if me.cancel() {
                            result = Err(Interrupted.into());
                            break;
                        }
                        interrupt::set_interrupted();
                        continue;
                    }
                    match deadline.remaining() {
                        Some(rem) => interrupt::park_timeout(rem),
                        None => {
                            if me.cancel() {
                                result = Ok(false);
                                break;
                            }
                            // signalled at the wire; count it as a wakeup
                        }
                    }
                }
                _ => break,
            }
        }
        self.forget(&me);
        self.lock.relock(count);
        result
    }

    /// Wake one waiting thread. The caller must own the lock.
    pub fn signal(&self) -> Result<(), NotOwner> {
        if !self.lock.is_owner() {
            return Err(NotOwner);
        }
        let mut waiters = self.monitor.lock();
        while let Some(w) = waiters.pop_front() {
            if w.claim() {
                w.thread.unpark();
                break;
            }
        }
        Ok(())
    }

    /// Wake every waiting thread. The caller must own the lock.
    pub fn signal_all(&self) -> Result<(), NotOwner> {
        if !self.lock.is_owner() {
            return Err(NotOwner);
        }
        let mut waiters = self.monitor.lock();
        for w in waiters.drain(..) {
            if w.claim() {
                w.thread.unpark();
            }
        }
        Ok(())
    }

    /// Drop a waiter's registration if it is still listed (cancel paths;
    /// signalled waiters were already popped).
    fn forget(&self, me: &Arc<CondWaiter>) {
        self.monitor.lock().retain(|w| !Arc::ptr_eq(w, me));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_requires_ownership() {
        let lock = HybridReentrantLock::new();
        let cond = lock.new_condition();
        assert_eq!(cond.signal(), Err(NotOwner));
        lock.lock();
        assert!(cond.signal().is_ok());
        lock.unlock().unwrap();
    }

    #[test]
    fn await_requires_ownership() {
        let lock = HybridReentrantLock::new();
        let cond = lock.new_condition();
        assert!(matches!(cond.await_(), Err(WaitError::NotOwner(_))));
    }

    #[test]
    fn await_timeout_expires_and_regains_the_lock() {
        let lock = HybridReentrantLock::new();
        let cond = lock.new_condition();
        lock.lock();
        lock.lock();
        let signalled = cond.await_timeout(Duration::from_millis(20)).unwrap();
        assert!(!signalled);
        assert_eq!(lock.hold_count(), 2);
        lock.unlock().unwrap();
        lock.unlock().unwrap();
    }
}
