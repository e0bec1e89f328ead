//! # strand
//!
//! Concurrency primitives for shared-memory multithreading:
//!
//! - **MPSC / MPMC linked queues** ([`mpsc`], [`mpmc`]): lock-free enqueue
//!   and non-blocking dequeue over a sentinel-tailed linked list, with
//!   bounded (ingress/egress counted) and blocking (spin/yield or
//!   park/unpark) variants.
//! - **Hybrid reentrant lock** ([`lock`]): an atomic fast path combined
//!   with a chain of parked waiters for approximate FIFO fairness,
//!   interruptible and timed acquisition, and condition variables bridged
//!   through an auxiliary monitor ([`condition`]).
//! - **Left-right wrapper** ([`left_right`]): a pair of state instances
//!   swapped under a writer mutex so that reads are wait-free and never
//!   observe a partial mutation.
//! - **Ordered task wrapper** ([`ordered`]): per-key serialization of
//!   otherwise unordered task executions on any executor.
//!
//! Blocking operations cooperate with the per-thread interrupt facility in
//! [`interrupt`]; see that module for the cancellation contract.

pub mod blocking;
pub mod condition;
pub mod interrupt;
pub mod left_right;
pub mod lock;
pub mod mpmc;
pub mod mpsc;
pub mod ordered;
pub mod utils;

mod bounded;
mod node;

pub use blocking::WaitStrategy;
pub use condition::Condition;
pub use interrupt::{InterruptHandle, Interrupted};
pub use left_right::{AdderPair, LeftRight, ReadIndicator, ThreadRegistry};
pub use lock::HybridReentrantLock;
pub use mpmc::MpmcQueue;
pub use ordered::{Executor, OrderedTask, OrderedTaskWrapper};

use thiserror::Error;

/// The queue is at capacity. The rejected element is handed back.
#[derive(Debug, PartialEq, Eq, Error)]
#[error("queue is at capacity")]
pub struct Full<E>(pub E);

/// A blocking enqueue gave up. The element is handed back either way.
#[derive(PartialEq, Eq, Error)]
pub enum PutError<E> {
    /// The deadline passed before capacity freed up.
    #[error("timed out waiting for queue capacity")]
    Timeout(E),
    /// The thread's interrupt flag was observed (and cleared).
    #[error("interrupted while waiting for queue capacity")]
    Interrupted(E),
}

impl<E> std::fmt::Debug for PutError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PutError::Timeout(_) => f.debug_tuple("Timeout").field(&"..").finish(),
            PutError::Interrupted(_) => f.debug_tuple("Interrupted").field(&"..").finish(),
        }
    }
}

impl<E> PutError<E> {
    /// Recover the element that was not enqueued.
    pub fn into_inner(self) -> E {
        match self {
            PutError::Timeout(e) | PutError::Interrupted(e) => e,
        }
    }
}

/// The calling thread does not hold the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("lock is not held by the current thread")]
pub struct NotOwner;

/// Failure of a condition wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WaitError {
    #[error(transparent)]
    NotOwner(#[from] NotOwner),
    #[error(transparent)]
    Interrupted(#[from] Interrupted),
}
