//! Small shared helpers: dense thread ids and the striped adder.

pub mod striped;

pub use striped::StripedAdder;

use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_ID: u64 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
}

/// Dense id of the calling thread. Ids start at 1; 0 never names a thread,
/// so it can stand for "no owner" in atomic owner words.
#[inline]
pub fn thread_id() -> u64 {
    THREAD_ID.with(|id| *id)
}
