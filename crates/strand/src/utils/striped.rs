use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

use crate::utils::thread_id;

/// Stripe-sharded monotonic `u64` counter backed by cache-line padded lanes.
///
/// Spreads increment contention across multiple atomics; the lane is chosen
/// by the caller's thread id. The lane count must be a power of two so the
/// selection is a single mask.
#[derive(Debug)]
pub struct StripedAdder {
    lanes: Box<[CachePadded<AtomicU64>]>,
    mask: usize,
}

impl StripedAdder {
    pub const DEFAULT_LANES: usize = 16;

    /// Creates an adder with the given number of lanes.
    ///
    /// # Panics
    ///
    /// Panics if `lanes` is zero or not a power of two.
    pub fn new(lanes: usize) -> Self {
        assert!(lanes > 0, "lane count must be non-zero");
        assert!(lanes.is_power_of_two(), "lane count must be a power of two");

        let mut v = Vec::with_capacity(lanes);
        for _ in 0..lanes {
            v.push(CachePadded::new(AtomicU64::new(0)));
        }
        Self {
            lanes: v.into_boxed_slice(),
            mask: lanes - 1,
        }
    }

    /// Adds `n` to the calling thread's lane.
    #[inline]
    pub fn add(&self, n: u64, ordering: Ordering) {
        let lane = thread_id() as usize & self.mask;
        self.lanes[lane].fetch_add(n, ordering);
    }

    /// Adds one to the calling thread's lane with relaxed ordering.
    #[inline]
    pub fn increment(&self) {
        self.add(1, Ordering::Relaxed);
    }

    /// Sum of all lanes. The result is a snapshot only if no increments are
    /// in flight.
    #[inline]
    pub fn sum(&self, ordering: Ordering) -> u64 {
        self.lanes.iter().map(|lane| lane.load(ordering)).sum()
    }
}

impl Default for StripedAdder {
    fn default() -> Self {
        Self::new(Self::DEFAULT_LANES)
    }
}

#[cfg(test)]
mod tests {
    use super::StripedAdder;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn counts_from_a_single_thread() {
        let adder = StripedAdder::new(8);
        for _ in 0..64 {
            adder.increment();
        }
        assert_eq!(adder.sum(Ordering::Relaxed), 64);
    }

    #[test]
    fn counts_across_threads() {
        let adder = Arc::new(StripedAdder::default());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let adder = Arc::clone(&adder);
            handles.push(thread::spawn(move || {
                for _ in 0..10_000 {
                    adder.increment();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(adder.sum(Ordering::Acquire), 40_000);
    }

    #[test]
    #[should_panic(expected = "power of two")]
    fn rejects_non_power_of_two_lanes() {
        let _ = StripedAdder::new(6);
    }
}
