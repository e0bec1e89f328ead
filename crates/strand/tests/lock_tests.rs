//! Contention, fairness, interruption and condition behavior of the hybrid
//! reentrant lock.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use strand::{HybridReentrantLock, Interrupted, NotOwner, WaitError};

#[test]
fn mutual_exclusion_under_contention() {
    let lock = Arc::new(HybridReentrantLock::new());
    let inside = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    for _ in 0..8 {
        let lock = Arc::clone(&lock);
        let inside = Arc::clone(&inside);
        handles.push(thread::spawn(move || {
            for _ in 0..10_000 {
                lock.lock();
                let now = inside.fetch_add(1, Ordering::SeqCst);
                assert_eq!(now, 0, "two threads inside the critical section");
                inside.fetch_sub(1, Ordering::SeqCst);
                lock.unlock().unwrap();
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
}

#[test]
fn acquisitions_are_roughly_fair_under_contention() {
    const THREADS: usize = 16;
    const TOTAL: usize = 32_000;

    let lock = Arc::new(HybridReentrantLock::new());
    let remaining = Arc::new(AtomicUsize::new(TOTAL));
    let mut handles = Vec::new();
    for _ in 0..THREADS {
        let lock = Arc::clone(&lock);
        let remaining = Arc::clone(&remaining);
        handles.push(thread::spawn(move || {
            let mut mine = 0usize;
            loop {
                lock.lock();
                let done = remaining.load(Ordering::Relaxed) == 0;
                if !done {
                    remaining.fetch_sub(1, Ordering::Relaxed);
                    mine += 1;
                }
                lock.unlock().unwrap();
                if done {
                    return mine;
                }
            }
        }));
    }
    let counts: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let max = *counts.iter().max().unwrap();
    let min = *counts.iter().min().unwrap();
    assert!(min > 0, "a thread was starved outright: {counts:?}");
    // soft fairness bound among threads that reached the parked chain
    assert!(
        max < min * 3,
        "acquisition spread too wide: min {min}, max {max} ({counts:?})"
    );
}

#[test]
fn interrupting_a_blocked_acquirer_leaves_the_holder_intact() {
    let lock = Arc::new(HybridReentrantLock::new());
    lock.lock();
    lock.lock();
    assert_eq!(lock.hold_count(), 2);

    let (htx, hrx) = mpsc::channel();
    let contender = {
        let lock = Arc::clone(&lock);
        thread::spawn(move || {
            htx.send(strand::interrupt::handle()).unwrap();
            lock.lock_interruptibly()
        })
    };
    let handle = hrx.recv().unwrap();
    thread::sleep(Duration::from_millis(100));
    handle.interrupt();
    assert_eq!(contender.join().unwrap(), Err(Interrupted));

    assert_eq!(lock.hold_count(), 2);
    lock.unlock().unwrap();
    lock.unlock().unwrap();
    assert_eq!(lock.hold_count(), 0);
}

#[test]
fn timed_acquisition_succeeds_after_release() {
    let lock = Arc::new(HybridReentrantLock::new());
    lock.lock();
    let t = {
        let lock = Arc::clone(&lock);
        thread::spawn(move || {
            let got = lock.try_lock_for(Duration::from_secs(5)).unwrap();
            if got {
                lock.unlock().unwrap();
            }
            got
        })
    };
    thread::sleep(Duration::from_millis(50));
    lock.unlock().unwrap();
    assert!(t.join().unwrap());
}

#[test]
fn reentrancy_requires_matching_unlocks() {
    let lock = Arc::new(HybridReentrantLock::new());
    lock.lock();
    lock.lock();
    lock.lock();
    lock.unlock().unwrap();
    lock.unlock().unwrap();
    // still held; another thread cannot get in
    let blocked = {
        let lock = Arc::clone(&lock);
        thread::spawn(move || lock.try_lock())
    };
    assert!(!blocked.join().unwrap());
    lock.unlock().unwrap();
    let free = {
        let lock = Arc::clone(&lock);
        thread::spawn(move || {
            let got = lock.try_lock();
            if got {
                lock.unlock().unwrap();
            }
            got
        })
    };
    assert!(free.join().unwrap());
}

#[test]
fn condition_passes_elements_between_threads() {
    let lock = Arc::new(HybridReentrantLock::new());
    let ready = Arc::new(AtomicBool::new(false));
    let consumer = {
        let lock = Arc::clone(&lock);
        let ready = Arc::clone(&ready);
        thread::spawn(move || {
            let cond = lock.new_condition();
            lock.lock();
            lock.lock();
            while !ready.load(Ordering::Acquire) {
                // hold the lock twice to prove nested counts survive waits
                cond.await_timeout(Duration::from_millis(10)).unwrap();
            }
            let depth = lock.hold_count();
            lock.unlock().unwrap();
            lock.unlock().unwrap();
            depth
        })
    };
    thread::sleep(Duration::from_millis(50));
    ready.store(true, Ordering::Release);
    assert_eq!(consumer.join().unwrap(), 2);
}

#[test]
fn condition_signal_wakes_a_waiter() {
    let lock = HybridReentrantLock::new();
    let cond = lock.new_condition();
    let waiting = AtomicBool::new(false);
    thread::scope(|s| {
        let waiter = s.spawn(|| {
            lock.lock();
            waiting.store(true, Ordering::Release);
            // the signaller cannot take the lock before await_ releases it,
            // so the registration below cannot miss the signal
            let r = cond.await_();
            let still_held = lock.hold_count();
            lock.unlock().unwrap();
            (r, still_held)
        });
        while !waiting.load(Ordering::Acquire) {
            thread::yield_now();
        }
        thread::sleep(Duration::from_millis(50));
        lock.lock();
        cond.signal().unwrap();
        lock.unlock().unwrap();
        let (r, held) = waiter.join().unwrap();
        assert!(r.is_ok());
        assert_eq!(held, 1);
    });
}

#[test]
fn signalling_without_the_lock_is_rejected() {
    let lock = HybridReentrantLock::new();
    let cond = lock.new_condition();
    assert_eq!(cond.signal_all(), Err(NotOwner));
    assert!(matches!(cond.await_(), Err(WaitError::NotOwner(_))));
}
