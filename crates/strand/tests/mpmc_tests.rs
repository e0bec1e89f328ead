//! Multi-threaded contracts of the MPMC queue: at-most-once consumption,
//! disjoint consumer sets, removal under contention and the parking facade.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use strand::MpmcQueue;

const PRODUCERS: u32 = 4;
const CONSUMERS: usize = 4;
const PER_PRODUCER: u32 = 50_000;

#[test]
fn each_offer_is_consumed_exactly_once() {
    let queue = Arc::new(MpmcQueue::new());
    let done = Arc::new(AtomicBool::new(false));

    let mut producers = Vec::new();
    for p in 0..PRODUCERS {
        let queue = Arc::clone(&queue);
        producers.push(thread::spawn(move || {
            for i in 0..PER_PRODUCER {
                queue.offer(p * PER_PRODUCER + i).unwrap();
            }
        }));
    }

    let mut consumers = Vec::new();
    for _ in 0..CONSUMERS {
        let queue = Arc::clone(&queue);
        let done = Arc::clone(&done);
        consumers.push(thread::spawn(move || {
            let mut seen = Vec::new();
            loop {
                match queue.poll() {
                    Some(v) => seen.push(v),
                    None => {
                        if done.load(Ordering::Acquire) && queue.is_empty() {
                            break;
                        }
                        thread::yield_now();
                    }
                }
            }
            seen
        }));
    }

    for p in producers {
        p.join().unwrap();
    }
    done.store(true, Ordering::Release);

    let sets: Vec<Vec<u32>> = consumers.into_iter().map(|c| c.join().unwrap()).collect();
    let total: usize = sets.iter().map(Vec::len).sum();
    assert_eq!(total, (PRODUCERS * PER_PRODUCER) as usize);

    let mut union = HashSet::new();
    for set in &sets {
        for &v in set {
            assert!(union.insert(v), "value {v} was consumed twice");
        }
    }
    let expected: HashSet<u32> = (0..PRODUCERS * PER_PRODUCER).collect();
    assert_eq!(union, expected);
}

#[test]
fn concurrent_removal_claims_each_value_at_most_once() {
    let queue = Arc::new(MpmcQueue::new());
    for i in 0..1_000 {
        queue.offer(i).unwrap();
    }
    let mut removers = Vec::new();
    for _ in 0..4 {
        let queue = Arc::clone(&queue);
        removers.push(thread::spawn(move || {
            let mut removed = 0usize;
            for i in 0..1_000 {
                if queue.remove(&i) {
                    removed += 1;
                }
            }
            removed
        }));
    }
    let removed: usize = removers.into_iter().map(|r| r.join().unwrap()).sum();
    assert_eq!(removed, 1_000);
    assert!(queue.is_empty());
    assert_eq!(queue.poll(), None);
}

#[test]
fn parked_consumers_are_woken_by_offers() {
    let queue: Arc<MpmcQueue<u32>> = Arc::new(MpmcQueue::new());
    let mut consumers = Vec::new();
    for _ in 0..3 {
        let queue = Arc::clone(&queue);
        consumers.push(thread::spawn(move || queue.take().unwrap()));
    }
    thread::sleep(Duration::from_millis(100));
    for i in 0..3 {
        queue.offer(i).unwrap();
    }
    let mut got: Vec<u32> = consumers.into_iter().map(|c| c.join().unwrap()).collect();
    got.sort_unstable();
    assert_eq!(got, vec![0, 1, 2]);
}

#[test]
fn take_timeout_expires_without_a_producer() {
    let queue: MpmcQueue<u32> = MpmcQueue::new();
    assert_eq!(queue.poll_timeout(Duration::from_millis(30)).unwrap(), None);
}

#[test]
fn bounded_put_blocks_until_a_poll() {
    let queue = Arc::new(MpmcQueue::bounded(1));
    queue.offer(1u32).unwrap();
    let q = Arc::clone(&queue);
    let t = thread::spawn(move || q.put(2).unwrap());
    thread::sleep(Duration::from_millis(50));
    assert_eq!(queue.poll(), Some(1));
    t.join().unwrap();
    assert_eq!(queue.take().unwrap(), 2);
}

#[test]
fn for_each_observes_a_consistent_prefix_under_contention() {
    let queue = Arc::new(MpmcQueue::new());
    for i in 0..10_000 {
        queue.offer(i).unwrap();
    }
    let q = Arc::clone(&queue);
    let poller = thread::spawn(move || {
        let mut n = 0;
        while q.poll().is_some() {
            n += 1;
        }
        n
    });
    // traversal runs while a consumer races it; values it yields are live
    // at visit time and strictly increasing
    let mut last = -1i64;
    queue.for_each(|&v| {
        assert!(v as i64 > last);
        last = v as i64;
    });
    let polled = poller.join().unwrap();
    assert!(polled <= 10_000);
}
