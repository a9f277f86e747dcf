//! Time domains: a clock abstraction plus the set of task queues
//! synchronized to it.
//!
//! A `TimeDomain` owns one [`WakeupHeap`], the deduplicating updatable-queue
//! set, and a handle to the cross-thread staging list. It coalesces every
//! registered queue's delayed-work requests into at most one outstanding host
//! timer request, promotes due queues when the host fires, and merges
//! cross-thread immediate-work registrations on the owner thread.
//!
//! All heap and updatable-set mutation is owner-thread only, asserted against
//! the thread that constructed the domain. The one cross-thread entry point
//! is [`TimeDomain::register_as_updatable_task_queue`] (and the
//! [`ImmediateWorkSignal`] handle wrapping it), which only ever appends to
//! the lock-guarded staging list.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use log::{debug, trace};

use crate::heap::{Ticks, WakeupHeap};
use crate::queue::{TaskQueueId, TaskQueueRegistry};
use crate::staging::{ImmediateWorkSignal, StagingList};
use crate::{contract, Violation};

/// Stable identity of a time domain. Assigned by the embedder; must be unique
/// among domains sharing one registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DomainId(pub u32);

/// The clock a domain schedules against.
pub trait DomainClock {
    /// Current time. Monotonic within this domain.
    fn now(&self) -> Ticks;

    /// Arranges for the host to call back into
    /// [`TimeDomain::update_work_queues`] after `delay` ticks. The mechanism
    /// (OS timer, event-loop timer) is the host's business.
    fn request_wakeup(&mut self, now: Ticks, delay: Ticks);
}

/// Work-availability callbacks, implemented by the run loop owner.
///
/// Both calls are synchronous and re-entrant-safe: the domain holds no locks
/// relevant to the caller while invoking them. `on_immediate_work_available`
/// may arrive from any producer thread.
pub trait WakeupObserver: Send + Sync {
    fn on_immediate_work_available(&self, queue: TaskQueueId);
    fn on_delayed_work_available(&self, queue: TaskQueueId);
}

/// One clock domain and its scheduling state.
pub struct TimeDomain<C: DomainClock> {
    id: DomainId,
    owner: ThreadId,
    clock: C,
    heap: WakeupHeap,
    /// Queues with staged immediate work, drained from `staging`. BTreeSet
    /// both deduplicates and gives deterministic iteration order.
    updatable: BTreeSet<TaskQueueId>,
    staging: Arc<StagingList>,
    observer: Arc<dyn WakeupObserver>,
}

impl<C: DomainClock> TimeDomain<C> {
    /// Creates a domain owned by the calling thread.
    pub fn new(id: DomainId, clock: C, observer: Arc<dyn WakeupObserver>) -> Self {
        Self {
            id,
            owner: thread::current().id(),
            clock,
            heap: WakeupHeap::new(),
            updatable: BTreeSet::new(),
            staging: Arc::new(StagingList::new()),
            observer,
        }
    }

    pub fn id(&self) -> DomainId {
        self.id
    }

    pub fn now(&self) -> Ticks {
        self.clock.now()
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn clock_mut(&mut self) -> &mut C {
        &mut self.clock
    }

    /// A cloneable producer handle for cross-thread immediate-work
    /// registration.
    pub fn immediate_work_signal(&self) -> ImmediateWorkSignal {
        ImmediateWorkSignal::new(Arc::clone(&self.staging), Arc::clone(&self.observer))
    }

    /// Attaches `queue` to this domain. No heap effect until a wakeup is
    /// scheduled. Fatal if the queue is already registered somewhere.
    pub fn register_queue<T>(&mut self, registry: &mut TaskQueueRegistry<T>, queue: TaskQueueId) {
        self.assert_on_owner_thread();
        let record = registry.queue_mut(queue);
        if record.domain.is_some() {
            contract(Violation::AlreadyRegistered(queue));
        }
        record.domain = Some(self.id);
        debug!("queue {queue:?} registered with domain {:?}", self.id);
    }

    /// Detaches `queue`: drops it from the updatable set and staging list and
    /// cancels any pending heap entry. The heap cancellation is an idempotent
    /// no-op when no wakeup is pending; unregistering a queue that is not
    /// registered here is fatal.
    pub fn unregister_queue<T>(&mut self, registry: &mut TaskQueueRegistry<T>, queue: TaskQueueId) {
        self.assert_on_owner_thread();
        let record = registry.queue_mut(queue);
        if record.domain != Some(self.id) {
            contract(Violation::NotRegisteredHere(queue));
        }
        record.domain = None;
        record.pending_wakeup = None;
        let slot = record.heap_slot;
        if let Some(slot) = slot {
            self.heap.remove(slot, queue, registry);
        }
        self.take_updatable_flag(queue);
        debug!("queue {queue:?} unregistered from domain {:?}", self.id);
    }

    /// Atomically transfers `queue` to `dest`: registration, the pending
    /// wakeup (recomputed against `dest`'s clock), and the immediate-work
    /// flag. Fatal if `queue` is not registered here. The re-schedule in
    /// `dest` notifies `on_delayed_work_available` exactly once; the
    /// immediate-work flag moves silently because its callback already fired
    /// at registration time, so no callback is dropped or duplicated.
    pub fn migrate_queue<T, D: DomainClock>(
        &mut self,
        registry: &mut TaskQueueRegistry<T>,
        queue: TaskQueueId,
        dest: &mut TimeDomain<D>,
    ) {
        self.assert_on_owner_thread();
        let record = registry.queue_mut(queue);
        if record.domain != Some(self.id) {
            contract(Violation::NotRegisteredHere(queue));
        }
        let pending = record.pending_wakeup.take();
        let slot = record.heap_slot;
        record.domain = Some(dest.id);

        if let Some(slot) = slot {
            self.heap.remove(slot, queue, registry);
        }
        if self.take_updatable_flag(queue) {
            dest.updatable.insert(queue);
        }
        if let Some(run_time) = pending {
            let dest_now = dest.clock.now();
            dest.schedule_delayed_work(registry, queue, run_time, dest_now);
        }
        debug!(
            "queue {queue:?} migrated from domain {:?} to {:?} (pending wakeup {pending:?})",
            self.id, dest.id
        );
    }

    /// Arranges for `queue` to be woken at `run_time`. A queue has at most
    /// one heap entry, so a second schedule replaces the first
    /// (insert-or-change-key). Requests a host wakeup only when the entry
    /// lands at the heap minimum, keeping at most one outstanding timer
    /// request per domain; always notifies `on_delayed_work_available` so
    /// external bookkeeping stays accurate regardless of coalescing.
    pub fn schedule_delayed_work<T>(
        &mut self,
        registry: &mut TaskQueueRegistry<T>,
        queue: TaskQueueId,
        run_time: Ticks,
        now: Ticks,
    ) {
        self.assert_on_owner_thread();
        let record = registry.queue_mut(queue);
        if record.domain != Some(self.id) {
            contract(Violation::NotRegisteredHere(queue));
        }
        record.pending_wakeup = Some(run_time);
        match record.heap_slot {
            Some(slot) => {
                self.heap.change_key(slot, queue, run_time, registry);
            }
            None => {
                self.heap.insert(run_time, queue, registry);
            }
        }

        let is_new_minimum = self
            .heap
            .peek_min()
            .map_or(false, |min| min.queue == queue && min.time == run_time);
        if is_new_minimum {
            let delay = run_time.saturating_sub(now);
            trace!(
                "domain {:?}: queue {queue:?} is the new minimum, requesting wakeup in {delay}",
                self.id
            );
            self.clock.request_wakeup(now, delay);
        }
        self.observer.on_delayed_work_available(queue);
    }

    /// Parks `payload` on `queue` until `run_time` and schedules a wakeup for
    /// the queue's earliest pending delayed task. Convenience composition of
    /// [`crate::queue::TaskQueue::push_delayed_task`] and
    /// [`TimeDomain::schedule_delayed_work`].
    pub fn post_delayed_task<T>(
        &mut self,
        registry: &mut TaskQueueRegistry<T>,
        queue: TaskQueueId,
        payload: T,
        run_time: Ticks,
        now: Ticks,
    ) {
        self.assert_on_owner_thread();
        let record = registry.queue_mut(queue);
        record.push_delayed_task(payload, run_time);
        if let Some(earliest) = record.next_delayed_run_time() {
            self.schedule_delayed_work(registry, queue, earliest, now);
        }
    }

    /// Flags `queue` as having immediate work. Callable from **any** thread;
    /// appends to the staging list and fires the immediate-work callback
    /// right away, before any drain.
    pub fn register_as_updatable_task_queue(&self, queue: TaskQueueId) {
        self.staging.push(queue);
        self.observer.on_immediate_work_available(queue);
    }

    /// Drops `queue` from the updatable set and purges every duplicate from
    /// the staging list. Owner thread only. Returns whether the queue was
    /// present in either place; calling it again right away returns `false`.
    pub fn unregister_as_updatable_task_queue(&mut self, queue: TaskQueueId) -> bool {
        self.assert_on_owner_thread();
        self.take_updatable_flag(queue)
    }

    /// One scheduling pass, in order: promote every due delayed queue, drain
    /// the staging list into the updatable set, then have each updatable
    /// queue promote its staged immediate work, self-pruning queues that
    /// report none left.
    pub fn update_work_queues<T>(&mut self, registry: &mut TaskQueueRegistry<T>, now: Ticks) {
        self.assert_on_owner_thread();
        self.wake_up_ready_delayed_queues(registry, now);

        self.updatable.extend(self.staging.drain());
        let snapshot: Vec<TaskQueueId> = self.updatable.iter().copied().collect();
        for queue in snapshot {
            if !registry.queue_mut(queue).reload_immediate_work() {
                self.updatable.remove(&queue);
            }
        }
    }

    /// Pops every heap entry due at `now` and wakes its queue, possibly many
    /// in one pass, in deterministic `(time, id)` order. A woken queue
    /// returns to the no-wakeup state; if it still holds later delayed tasks
    /// it asks for a re-arm, which is performed here on its behalf (and never
    /// automatically otherwise).
    pub fn wake_up_ready_delayed_queues<T>(
        &mut self,
        registry: &mut TaskQueueRegistry<T>,
        now: Ticks,
    ) {
        self.assert_on_owner_thread();
        let mut woken = 0usize;
        while self.heap.peek_min().map_or(false, |min| min.time <= now) {
            let entry = match self.heap.pop_min(registry) {
                Some(entry) => entry,
                None => break,
            };
            let record = registry.queue_mut(entry.queue);
            record.pending_wakeup = None;
            let rearm = record.wake_up_for_delayed_work(now);
            woken += 1;
            if let Some(run_time) = rearm {
                self.schedule_delayed_work(registry, entry.queue, run_time, now);
            }
        }
        if woken > 0 {
            trace!("domain {:?}: woke {woken} delayed queue(s) at {now}", self.id);
        }
    }

    /// Earliest pending wakeup time across all queues, `None` when the heap
    /// is empty. O(1).
    pub fn next_scheduled_run_time(&self) -> Option<Ticks> {
        self.assert_on_owner_thread();
        self.heap.peek_min().map(|min| min.time)
    }

    /// The queue holding the earliest pending wakeup. O(1).
    pub fn next_scheduled_task_queue(&self) -> Option<TaskQueueId> {
        self.assert_on_owner_thread();
        self.heap.peek_min().map(|min| min.queue)
    }

    fn take_updatable_flag(&mut self, queue: TaskQueueId) -> bool {
        let in_set = self.updatable.remove(&queue);
        let staged = self.staging.purge(queue);
        in_set || staged
    }

    fn assert_on_owner_thread(&self) {
        let actual = thread::current().id();
        if actual != self.owner {
            contract(Violation::WrongThread {
                owner: self.owner,
                actual,
            });
        }
    }
}
