//! Cross-thread immediate-work signaling.
//!
//! The staging list is the only lock-guarded resource in the crate: producers
//! on any thread append queue ids to it, and the owning domain drains it into
//! its deduplicating updatable set on the next `update_work_queues` pass.
//! Producers hold an [`ImmediateWorkSignal`], a cloneable handle that exposes
//! nothing but the thread-safe registration call, so thread affinity is
//! visible in the type system rather than enforced only by runtime asserts.

use std::sync::{Arc, Mutex, MutexGuard};

use log::trace;

use crate::domain::WakeupObserver;
use crate::queue::TaskQueueId;

/// Lock-guarded list of queues flagged as having immediate work.
///
/// Guarantees only eventual draining; duplicates are tolerated and collapse
/// on drain by the domain's set semantics.
#[derive(Debug, Default)]
pub struct StagingList {
    entries: Mutex<Vec<TaskQueueId>>,
}

impl StagingList {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Appends a registration. Any thread.
    pub fn push(&self, queue: TaskQueueId) {
        self.lock().push(queue);
    }

    /// Takes everything staged so far.
    pub fn drain(&self) -> Vec<TaskQueueId> {
        std::mem::take(&mut *self.lock())
    }

    /// Removes every staged entry for `queue`; returns whether any existed.
    pub fn purge(&self, queue: TaskQueueId) -> bool {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|&q| q != queue);
        before != entries.len()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<TaskQueueId>> {
        // a poisoned staging list means a producer panicked mid-push of a
        // plain id; the list itself is still structurally sound
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Producer-side handle to one domain's staging list.
///
/// Clone it onto any thread; `notify` appends to the staging list and fires
/// the observer's immediate-work callback right away, before any drain.
#[derive(Clone)]
pub struct ImmediateWorkSignal {
    staging: Arc<StagingList>,
    observer: Arc<dyn WakeupObserver>,
}

impl ImmediateWorkSignal {
    pub(crate) fn new(staging: Arc<StagingList>, observer: Arc<dyn WakeupObserver>) -> Self {
        Self { staging, observer }
    }

    /// Registers `queue` as updatable. Callable from any thread.
    pub fn notify(&self, queue: TaskQueueId) {
        trace!("staging immediate work for queue {queue:?}");
        self.staging.push(queue);
        self.observer.on_immediate_work_available(queue);
    }
}

#[cfg(test)]
mod staging_tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use super::*;

    fn qid(n: u32) -> TaskQueueId {
        TaskQueueId::for_tests(n)
    }

    #[derive(Default)]
    struct CountingObserver {
        immediate: AtomicUsize,
    }

    impl WakeupObserver for CountingObserver {
        fn on_immediate_work_available(&self, _queue: TaskQueueId) {
            self.immediate.fetch_add(1, Ordering::SeqCst);
        }

        fn on_delayed_work_available(&self, _queue: TaskQueueId) {}
    }

    #[test]
    fn push_drain_purge() {
        let list = StagingList::new();
        list.push(qid(0));
        list.push(qid(1));
        list.push(qid(0));

        assert!(list.purge(qid(0))); // removes both duplicates
        assert!(!list.purge(qid(0)));
        assert_eq!(list.drain(), vec![qid(1)]);
        assert!(list.drain().is_empty());
    }

    #[test]
    fn signal_notifies_before_any_drain() {
        let staging = Arc::new(StagingList::new());
        let observer = Arc::new(CountingObserver::default());
        let signal = ImmediateWorkSignal::new(Arc::clone(&staging), observer.clone());

        signal.notify(qid(3));
        assert_eq!(observer.immediate.load(Ordering::SeqCst), 1);
        assert_eq!(staging.drain(), vec![qid(3)]);
    }

    #[test]
    fn producers_on_many_threads() {
        let staging = Arc::new(StagingList::new());
        let observer = Arc::new(CountingObserver::default());
        let signal = ImmediateWorkSignal::new(Arc::clone(&staging), observer.clone());

        let handles: Vec<_> = (0..4u32)
            .map(|i| {
                let signal = signal.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        signal.notify(qid(i));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(observer.immediate.load(Ordering::SeqCst), 400);
        let mut drained = staging.drain();
        drained.sort();
        assert_eq!(drained.len(), 400);
        for i in 0..4u32 {
            assert_eq!(drained.iter().filter(|&&q| q == qid(i)).count(), 100);
        }
    }
}
