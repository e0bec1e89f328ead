//! Per-key serialization of tasks over an arbitrary executor.
//!
//! [`OrderedTaskWrapper::wrap`] turns a task plus a key into an
//! [`OrderedTask`] that may be run from anywhere, in any order, on any
//! thread; for each key, the wrapped tasks still execute serially in wrap
//! order. The executor is free to reorder the wrappers, but each wrapper
//! must run exactly once (`run` consumes it).
//!
//! A wrapper whose predecessor is still pending merely flips its state
//! when run; the thread that finishes the predecessor picks it up. The
//! handoff of `next` is a volatile publish with a brief consumer-side
//! spin; the chain runner never parks.

use std::any::Any;
use std::cell::UnsafeCell;
use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU8, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::blocking::backoff;

const FIRST: u8 = 0;
const CHAINED: u8 = 1;
const TRIGGERED: u8 = 2;

/// A sink that runs tasks, typically a thread pool. Submission order
/// carries no execution-order guarantee; that is the point of wrapping.
pub trait Executor {
    fn execute(&self, task: Box<dyn FnOnce() + Send + 'static>);
}

type TaskFn = Box<dyn FnOnce() + Send + 'static>;

struct TaskNode<K> {
    key: K,
    /// Taken exactly once, by the chain runner.
    task: UnsafeCell<Option<TaskFn>>,
    state: AtomicU8,
    /// Published successor; carries one strong reference.
    next: AtomicPtr<TaskNode<K>>,
}

// SAFETY: the task slot is read by at most one thread, arbitrated by the
// FIRST/CHAINED/TRIGGERED state machine.
unsafe impl<K: Send + Sync> Send for TaskNode<K> {}
unsafe impl<K: Send + Sync> Sync for TaskNode<K> {}

impl<K> Drop for TaskNode<K> {
    fn drop(&mut self) {
        let next = *self.next.get_mut();
        if !next.is_null() {
            // SAFETY: an unconsumed handoff still owns its reference.
            unsafe { drop(Arc::from_raw(next)) };
        }
    }
}

/// Wraps tasks so that executions sharing a key happen serially in wrap
/// order, on whatever threads the executor provides.
pub struct OrderedTaskWrapper<K: Eq + Hash> {
    inner: Arc<Inner<K>>,
}

struct Inner<K: Eq + Hash> {
    /// Key to the most recently wrapped task; entries remove themselves
    /// when their chain runs dry.
    last: DashMap<K, Arc<TaskNode<K>>>,
}

impl<K: Eq + Hash> Default for OrderedTaskWrapper<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash> Clone for OrderedTaskWrapper<K> {
    fn clone(&self) -> Self {
        OrderedTaskWrapper {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: Eq + Hash> OrderedTaskWrapper<K> {
    pub fn new() -> Self {
        OrderedTaskWrapper {
            inner: Arc::new(Inner {
                last: DashMap::new(),
            }),
        }
    }
}

impl<K> OrderedTaskWrapper<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    /// Wrap `task` under `key`. The returned wrapper must be run exactly
    /// once; dropping it unrun stalls the key's chain, exactly as a lost
    /// executor submission would.
    pub fn wrap(&self, key: K, task: impl FnOnce() + Send + 'static) -> OrderedTask<K> {
        let node = Arc::new(TaskNode {
            key: key.clone(),
            task: UnsafeCell::new(Some(Box::new(task))),
            state: AtomicU8::new(FIRST),
            next: AtomicPtr::new(ptr::null_mut()),
        });
        if let Some(prev) = self.inner.last.insert(key, Arc::clone(&node)) {
            // chain behind the unfinished predecessor; the state must be
            // set before the publication makes the node reachable
            node.state.store(CHAINED, Ordering::Release);
            let raw = Arc::into_raw(Arc::clone(&node)) as *mut TaskNode<K>;
            prev.next.store(raw, Ordering::Release);
        }
        OrderedTask {
            node,
            inner: Arc::clone(&self.inner),
        }
    }

    /// Wrap and immediately hand the wrapper to `executor`.
    pub fn submit<E>(&self, key: K, task: impl FnOnce() + Send + 'static, executor: &E)
    where
        E: Executor + ?Sized,
    {
        let wrapped = self.wrap(key, task);
        executor.execute(Box::new(move || wrapped.run()));
    }
}

/// A wrapped task. Running it either executes the whole ready part of its
/// key's chain, or, when a predecessor is still pending, just marks it
/// triggered for the predecessor's thread to pick up.
pub struct OrderedTask<K: Eq + Hash> {
    node: Arc<TaskNode<K>>,
    inner: Arc<Inner<K>>,
}

impl<K> OrderedTask<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    pub fn run(self) {
        if self.node.state.swap(TRIGGERED, Ordering::AcqRel) != FIRST {
            // a predecessor still owns the chain; it will run this task
            return;
        }
        let mut current = Arc::clone(&self.node);
        let mut first_panic: Option<Box<dyn Any + Send>> = None;
        loop {
            // SAFETY: only the chain owner reaches this slot, once.
            let task = unsafe { (*current.task.get()).take() };
            if let Some(task) = task {
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
                    if first_panic.is_none() {
                        first_panic = Some(payload);
                    } else {
                        tracing::error!(
                            panic = panic_message(&payload),
                            "suppressed panic in ordered task chain"
                        );
                    }
                }
            }
            let removed = self
                .inner
                .last
                .remove_if(&current.key, |_, v| Arc::ptr_eq(v, &current))
                .is_some();
            if removed {
                break;
            }
            // a successor exists; spin briefly until its publication lands
            let mut c = 0;
            let raw = loop {
                let p = current.next.swap(ptr::null_mut(), Ordering::Acquire);
                if !p.is_null() {
                    break p;
                }
                c = backoff(c);
            };
            // SAFETY: the publication handed over one strong reference.
            let next = unsafe { Arc::from_raw(raw as *const TaskNode<K>) };
            let prior = next.state.swap(FIRST, Ordering::AcqRel);
            current = next;
            if prior != TRIGGERED {
                // not yet run by the executor; its own run() continues
                break;
            }
        }
        if let Some(payload) = first_panic {
            panic::resume_unwind(payload);
        }
    }
}

fn panic_message(payload: &Box<dyn Any + Send>) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("opaque panic payload")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Inline;

    impl Executor for Inline {
        fn execute(&self, task: Box<dyn FnOnce() + Send + 'static>) {
            task();
        }
    }

    #[test]
    fn inline_execution_runs_in_wrap_order() {
        let wrapper = OrderedTaskWrapper::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let log = Arc::clone(&log);
            wrapper.submit("k", move || log.lock().unwrap().push(i), &Inline);
        }
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn chain_entry_is_cleaned_up() {
        let wrapper: OrderedTaskWrapper<u32> = OrderedTaskWrapper::new();
        let t = wrapper.wrap(1, || {});
        assert_eq!(wrapper.inner.last.len(), 1);
        t.run();
        assert_eq!(wrapper.inner.last.len(), 0);
    }

    #[test]
    fn deferred_trigger_runs_when_the_chain_head_finishes() {
        let wrapper = OrderedTaskWrapper::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let l1 = Arc::clone(&log);
        let l2 = Arc::clone(&log);
        let a = wrapper.wrap("k", move || l1.lock().unwrap().push(1));
        let b = wrapper.wrap("k", move || l2.lock().unwrap().push(2));
        // running the successor first only marks it triggered
        b.run();
        assert!(log.lock().unwrap().is_empty());
        a.run();
        assert_eq!(*log.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn panic_propagates_after_the_chain_drains() {
        let wrapper = OrderedTaskWrapper::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let l = Arc::clone(&log);
        let a = wrapper.wrap("k", || panic!("boom"));
        let b = wrapper.wrap("k", move || l.lock().unwrap().push("ran"));
        b.run();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| a.run()));
        assert!(outcome.is_err());
        // the successor still ran before the panic resurfaced
        assert_eq!(*log.lock().unwrap(), vec!["ran"]);
    }
}
