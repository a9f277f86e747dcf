//! The per-queue scheduling contract and the queue arena.
//!
//! A [`TaskQueue`] is the record a time domain manages: priority, enabled
//! flag, fence state, owning-domain back-reference, pending-wakeup time, and
//! the cached heap slot. Queues live in a [`TaskQueueRegistry`] arena keyed by
//! stable integer ids; the registry is passed explicitly to every domain
//! operation, never held in module-level state.
//!
//! Priority, the enabled flag, and the fence are tracked here but interpreted
//! only by an external selector; a disabled or fenced queue keeps its
//! scheduled wakeups.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, VecDeque};

use log::debug;

use crate::domain::DomainId;
use crate::heap::{SlotCache, Ticks};
use crate::{contract, Violation};

/// Stable identity of a task queue within one registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskQueueId(u32);

impl TaskQueueId {
    #[cfg(test)]
    pub(crate) fn for_tests(raw: u32) -> Self {
        TaskQueueId(raw)
    }
}

/// Queue priority, in urgency order: `Control` outranks `High`, which
/// outranks `Normal`, which outranks `BestEffort`. Stored here, consumed by
/// the external selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Control,
    High,
    Normal,
    BestEffort,
}

/// Where a fence is inserted in the queue's task order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FencePosition {
    /// Blocks every task enqueued after the current point.
    FromNow,
    /// Blocks every task, including already-enqueued ones.
    FromBeginning,
}

/// A task surfaced to the external run loop.
#[derive(Debug, PartialEq, Eq)]
pub struct Task<T> {
    pub payload: T,
    /// Enqueue order within the queue. Immediate tasks are sequenced at post
    /// time; delayed tasks at promotion time, so a `FromNow` fence also
    /// blocks delayed work promoted after the fence went in.
    pub sequence: u64,
    /// The originally requested run time, for delayed tasks.
    pub run_time: Option<Ticks>,
}

/// A not-yet-due task parked in the queue's delayed heap.
#[derive(Debug)]
struct DelayedTask<T> {
    run_time: Ticks,
    /// Post order, for deterministic promotion of equal run times.
    post_order: u64,
    payload: T,
}

impl<T> PartialEq for DelayedTask<T> {
    fn eq(&self, other: &Self) -> bool {
        self.run_time == other.run_time && self.post_order == other.post_order
    }
}

impl<T> Eq for DelayedTask<T> {}

impl<T> PartialOrd for DelayedTask<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for DelayedTask<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.run_time, self.post_order).cmp(&(other.run_time, other.post_order))
    }
}

/// The record a [`crate::domain::TimeDomain`] manages.
#[derive(Debug)]
pub struct TaskQueue<T> {
    id: TaskQueueId,
    name: String,
    priority: Priority,
    enabled: bool,
    /// Sequence barrier: tasks with `sequence >= fence` are withheld from
    /// visibility. `FromBeginning` is a fence at sequence 0.
    fence: Option<u64>,
    /// Owning time domain; `None` while unregistered.
    pub(crate) domain: Option<DomainId>,
    /// Wakeup state machine: `None` = NoWakeup, `Some(t)` = WakeupPending(t).
    pub(crate) pending_wakeup: Option<Ticks>,
    /// Cached position of this queue's entry in the owning domain's wakeup
    /// heap. Valid only while a wakeup is pending.
    pub(crate) heap_slot: Option<usize>,
    next_sequence: u64,
    next_post_order: u64,
    /// Staged immediate tasks, merged into `work` by `reload_immediate_work`.
    incoming: VecDeque<Task<T>>,
    /// The immediately-runnable sequence the external run loop drains.
    work: VecDeque<Task<T>>,
    delayed: BinaryHeap<Reverse<DelayedTask<T>>>,
}

impl<T> TaskQueue<T> {
    fn new(id: TaskQueueId, name: String, priority: Priority) -> Self {
        Self {
            id,
            name,
            priority,
            enabled: true,
            fence: None,
            domain: None,
            pending_wakeup: None,
            heap_slot: None,
            next_sequence: 0,
            next_post_order: 0,
            incoming: VecDeque::new(),
            work: VecDeque::new(),
            delayed: BinaryHeap::new(),
        }
    }

    pub fn id(&self) -> TaskQueueId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn set_priority(&mut self, priority: Priority) {
        self.priority = priority;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Disabling hides this queue's tasks from selection; it never cancels a
    /// scheduled wakeup.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// The pending wakeup time, if one is scheduled.
    pub fn pending_wakeup(&self) -> Option<Ticks> {
        self.pending_wakeup
    }

    pub fn owning_domain(&self) -> Option<DomainId> {
        self.domain
    }

    /// Posts a task to the incoming immediate sequence. Owner thread only;
    /// cross-thread producers signal through
    /// [`crate::staging::ImmediateWorkSignal`] after their own delivery
    /// mechanism has made the work available.
    pub fn post_immediate_task(&mut self, payload: T) {
        let sequence = self.bump_sequence();
        self.incoming.push_back(Task {
            payload,
            sequence,
            run_time: None,
        });
    }

    /// Parks a task until `run_time`. The caller still has to arrange the
    /// wakeup through the owning domain; see
    /// [`crate::domain::TimeDomain::post_delayed_task`] for the composed form.
    pub fn push_delayed_task(&mut self, payload: T, run_time: Ticks) {
        let post_order = self.next_post_order;
        self.next_post_order += 1;
        self.delayed.push(Reverse(DelayedTask {
            run_time,
            post_order,
            payload,
        }));
    }

    /// Earliest run time still parked in the delayed heap.
    pub fn next_delayed_run_time(&self) -> Option<Ticks> {
        self.delayed.peek().map(|e| e.0.run_time)
    }

    /// Moves every delayed task with `run_time <= now` into the
    /// immediately-runnable sequence and returns the next remaining delayed
    /// run time, which the queue wants re-armed (re-arming is never
    /// automatic; the owning domain performs it on the queue's behalf).
    pub fn wake_up_for_delayed_work(&mut self, now: Ticks) -> Option<Ticks> {
        while self.delayed.peek().is_some_and(|e| e.0.run_time <= now) {
            if let Some(Reverse(task)) = self.delayed.pop() {
                let sequence = self.bump_sequence();
                self.work.push_back(Task {
                    payload: task.payload,
                    sequence,
                    run_time: Some(task.run_time),
                });
            }
        }
        self.next_delayed_run_time()
    }

    /// Promotes staged immediate tasks into the runnable sequence. Returns
    /// whether any staged work is left, so the domain's updatable set can
    /// self-prune.
    pub fn reload_immediate_work(&mut self) -> bool {
        self.work.append(&mut self.incoming);
        !self.incoming.is_empty()
    }

    /// Inserts a fence. `FromNow` blocks everything posted after this call;
    /// `FromBeginning` blocks everything. A new fence replaces the old one.
    pub fn insert_fence(&mut self, position: FencePosition) {
        let fence = match position {
            FencePosition::FromNow => self.next_sequence,
            FencePosition::FromBeginning => 0,
        };
        debug!("queue {:?} ({}): fence at sequence {fence}", self.id, self.name);
        self.fence = Some(fence);
    }

    pub fn remove_fence(&mut self) {
        debug!("queue {:?} ({}): fence removed", self.id, self.name);
        self.fence = None;
    }

    pub fn has_fence(&self) -> bool {
        self.fence.is_some()
    }

    /// Whether an active fence is withholding at least one enqueued task.
    pub fn blocked_by_fence(&self) -> bool {
        match self.fence {
            Some(fence) => self
                .work
                .iter()
                .chain(self.incoming.iter())
                .any(|t| t.sequence >= fence),
            None => false,
        }
    }

    /// Runnable tasks in front of the fence, in queue order. The minimal seam
    /// a selector needs; combined with [`TaskQueue::priority`] and
    /// [`TaskQueue::is_enabled`], it leaves the selection algorithm entirely
    /// to the caller.
    pub fn visible_tasks(&self) -> impl Iterator<Item = &Task<T>> {
        let fence = self.fence;
        self.work
            .iter()
            .filter(move |t| fence.map_or(true, |f| t.sequence < f))
    }

    pub fn has_visible_work(&self) -> bool {
        self.visible_tasks().next().is_some()
    }

    /// Pops the front runnable task if the fence does not withhold it.
    pub fn take_next_visible_task(&mut self) -> Option<Task<T>> {
        let front = self.work.front()?;
        if self.fence.is_some_and(|f| front.sequence >= f) {
            return None;
        }
        self.work.pop_front()
    }

    fn bump_sequence(&mut self) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        sequence
    }
}

/// Arena owning every task queue, keyed by [`TaskQueueId`].
///
/// Passed explicitly to the domain operations that need it; a queue must be
/// unregistered from its domain before it can be removed here.
#[derive(Debug, Default)]
pub struct TaskQueueRegistry<T> {
    queues: Vec<Option<TaskQueue<T>>>,
}

impl<T> TaskQueueRegistry<T> {
    pub fn new() -> Self {
        Self { queues: Vec::new() }
    }

    /// Creates a queue, unregistered and enabled, and returns its id.
    pub fn create_queue(&mut self, name: impl Into<String>, priority: Priority) -> TaskQueueId {
        let id = TaskQueueId(self.queues.len() as u32);
        self.queues.push(Some(TaskQueue::new(id, name.into(), priority)));
        id
    }

    /// Fatal if `id` does not name a live queue.
    pub fn queue(&self, id: TaskQueueId) -> &TaskQueue<T> {
        match self.queues.get(id.0 as usize).and_then(Option::as_ref) {
            Some(queue) => queue,
            None => contract(Violation::UnknownQueue(id)),
        }
    }

    /// Fatal if `id` does not name a live queue.
    pub fn queue_mut(&mut self, id: TaskQueueId) -> &mut TaskQueue<T> {
        match self.queues.get_mut(id.0 as usize).and_then(Option::as_mut) {
            Some(queue) => queue,
            None => contract(Violation::UnknownQueue(id)),
        }
    }

    /// Removes a queue from the arena. Fatal while it is still registered
    /// with a time domain.
    pub fn remove_queue(&mut self, id: TaskQueueId) -> TaskQueue<T> {
        let slot = match self.queues.get_mut(id.0 as usize) {
            Some(slot) => slot,
            None => contract(Violation::UnknownQueue(id)),
        };
        match slot.take() {
            Some(queue) if queue.domain.is_some() => {
                contract(Violation::RemovedWhileRegistered(id))
            }
            Some(queue) => queue,
            None => contract(Violation::UnknownQueue(id)),
        }
    }

    pub fn contains(&self, id: TaskQueueId) -> bool {
        self.queues
            .get(id.0 as usize)
            .is_some_and(Option::is_some)
    }
}

impl<T> SlotCache for TaskQueueRegistry<T> {
    fn set_heap_slot(&mut self, queue: TaskQueueId, slot: Option<usize>) {
        self.queue_mut(queue).heap_slot = slot;
    }
}

#[cfg(test)]
mod task_queue_tests {
    use super::*;

    fn registry() -> (TaskQueueRegistry<&'static str>, TaskQueueId) {
        let mut registry = TaskQueueRegistry::new();
        let q = registry.create_queue("test", Priority::Normal);
        (registry, q)
    }

    #[test]
    fn immediate_tasks_flow_incoming_to_work() {
        let (mut registry, q) = registry();
        let queue = registry.queue_mut(q);

        queue.post_immediate_task("a");
        queue.post_immediate_task("b");
        assert!(!queue.has_visible_work()); // still staged

        assert!(!queue.reload_immediate_work()); // nothing left staged
        let order: Vec<_> = queue.visible_tasks().map(|t| t.payload).collect();
        assert_eq!(order, vec!["a", "b"]);

        assert_eq!(queue.take_next_visible_task().unwrap().payload, "a");
        assert_eq!(queue.take_next_visible_task().unwrap().payload, "b");
        assert!(queue.take_next_visible_task().is_none());
    }

    #[test]
    fn delayed_promotion_respects_due_time_and_post_order() {
        let (mut registry, q) = registry();
        let queue = registry.queue_mut(q);

        queue.push_delayed_task("late", 100);
        queue.push_delayed_task("early-1", 30);
        queue.push_delayed_task("early-2", 30);
        assert_eq!(queue.next_delayed_run_time(), Some(30));

        // only the due tasks move; equal run times promote in post order
        let remaining = queue.wake_up_for_delayed_work(50);
        assert_eq!(remaining, Some(100));
        let promoted: Vec<_> = queue.visible_tasks().map(|t| t.payload).collect();
        assert_eq!(promoted, vec!["early-1", "early-2"]);

        assert_eq!(queue.wake_up_for_delayed_work(100), None);
        assert_eq!(queue.visible_tasks().count(), 3);
    }

    #[test]
    fn from_now_fence_blocks_later_tasks_only() {
        let (mut registry, q) = registry();
        let queue = registry.queue_mut(q);

        queue.post_immediate_task("before-1");
        queue.post_immediate_task("before-2");
        queue.insert_fence(FencePosition::FromNow);
        queue.post_immediate_task("after");
        queue.reload_immediate_work();

        assert!(queue.has_fence());
        assert!(queue.blocked_by_fence());
        let visible: Vec<_> = queue.visible_tasks().map(|t| t.payload).collect();
        assert_eq!(visible, vec!["before-1", "before-2"]);

        queue.remove_fence();
        assert!(!queue.blocked_by_fence());
        assert_eq!(queue.visible_tasks().count(), 3);
    }

    #[test]
    fn fence_applies_to_staged_tasks_too() {
        let (mut registry, q) = registry();
        let queue = registry.queue_mut(q);

        queue.insert_fence(FencePosition::FromNow);
        queue.post_immediate_task("staged");
        // blocked even before the staged task is reloaded
        assert!(queue.blocked_by_fence());
    }

    #[test]
    fn from_beginning_fence_blocks_everything() {
        let (mut registry, q) = registry();
        let queue = registry.queue_mut(q);

        queue.post_immediate_task("a");
        queue.reload_immediate_work();
        queue.insert_fence(FencePosition::FromBeginning);

        assert!(queue.blocked_by_fence());
        assert!(!queue.has_visible_work());
        assert!(queue.take_next_visible_task().is_none());

        queue.remove_fence();
        assert_eq!(queue.take_next_visible_task().unwrap().payload, "a");
    }

    #[test]
    fn from_now_fence_blocks_delayed_tasks_promoted_later() {
        let (mut registry, q) = registry();
        let queue = registry.queue_mut(q);

        queue.push_delayed_task("delayed", 10);
        queue.insert_fence(FencePosition::FromNow);
        queue.wake_up_for_delayed_work(10);

        // promotion sequenced the task after the fence point
        assert!(queue.blocked_by_fence());
        assert!(!queue.has_visible_work());
    }

    #[test]
    fn empty_fenced_queue_is_not_blocked() {
        let (mut registry, q) = registry();
        let queue = registry.queue_mut(q);
        queue.insert_fence(FencePosition::FromBeginning);
        assert!(!queue.blocked_by_fence());
    }

    #[test]
    fn disabling_keeps_tasks_and_wakeup_state() {
        let (mut registry, q) = registry();
        let queue = registry.queue_mut(q);

        queue.post_immediate_task("a");
        queue.reload_immediate_work();
        queue.set_enabled(false);

        // the queue only records the flag; visibility filtering is the
        // selector's job, and pending state is untouched
        assert!(!queue.is_enabled());
        assert!(queue.has_visible_work());
    }

    #[test]
    fn priority_urgency_order() {
        assert!(Priority::Control < Priority::High);
        assert!(Priority::High < Priority::Normal);
        assert!(Priority::Normal < Priority::BestEffort);
    }

    #[test]
    #[should_panic(expected = "scheduling contract violated")]
    fn unknown_queue_lookup_is_fatal() {
        let (registry, q) = registry();
        assert!(registry.contains(q));
        assert!(!registry.contains(TaskQueueId::for_tests(42)));
        registry.queue(TaskQueueId::for_tests(42));
    }

    #[test]
    #[should_panic(expected = "scheduling contract violated")]
    fn double_remove_is_fatal() {
        let (mut registry, q) = registry();
        registry.remove_queue(q);
        registry.remove_queue(q);
    }
}
