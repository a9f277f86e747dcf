//! Keyed min-heap ordering task queues by their next due time.
//!
//! `WakeupHeap` holds at most one `(time, queue)` entry per task queue, ordered
//! by time with ties broken by queue identity so iteration is reproducible.
//! Entries are addressed by their current array index ("slot"); every mutation
//! that moves an entry writes the new index back through the [`SlotCache`]
//! seam, so the authoritative slot always lives on the queue record rather
//! than in a pointer shared between the two structures.

use crate::queue::TaskQueueId;
use crate::{contract, Violation};

/// Monotonic per-domain time, in domain units.
pub type Ticks = u64;

/// One pending wakeup: `queue` wants to be woken at `time`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WakeupEntry {
    pub time: Ticks,
    pub queue: TaskQueueId,
}

impl WakeupEntry {
    fn key(&self) -> (Ticks, TaskQueueId) {
        (self.time, self.queue)
    }
}

/// Receiver for heap-slot write-backs.
///
/// Implemented by the queue arena: `set_heap_slot(q, Some(i))` records that
/// q's entry currently sits at index `i`, `None` that q has no entry.
pub trait SlotCache {
    fn set_heap_slot(&mut self, queue: TaskQueueId, slot: Option<usize>);
}

/// Binary min-heap over [`WakeupEntry`], keyed by `(time, queue)`.
#[derive(Debug, Default)]
pub struct WakeupHeap {
    entries: Vec<WakeupEntry>,
}

impl WakeupHeap {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The earliest pending wakeup, without removal. O(1).
    pub fn peek_min(&self) -> Option<&WakeupEntry> {
        self.entries.first()
    }

    /// Inserts a new entry and returns its slot. O(log n).
    ///
    /// The caller guarantees `queue` has no entry in this heap yet; the
    /// single-entry-per-queue invariant is enforced one level up via
    /// [`WakeupHeap::change_key`].
    pub fn insert(&mut self, time: Ticks, queue: TaskQueueId, cache: &mut impl SlotCache) -> usize {
        let slot = self.entries.len();
        self.entries.push(WakeupEntry { time, queue });
        cache.set_heap_slot(queue, Some(slot));
        self.sift_up(slot, cache)
    }

    /// Re-keys the entry at `slot` to `new_time` and returns its new slot.
    /// O(log n). Fatal if `slot` does not hold `queue`'s entry.
    pub fn change_key(
        &mut self,
        slot: usize,
        queue: TaskQueueId,
        new_time: Ticks,
        cache: &mut impl SlotCache,
    ) -> usize {
        self.check_slot(slot, queue);
        let old_time = self.entries[slot].time;
        self.entries[slot].time = new_time;
        if new_time < old_time {
            self.sift_up(slot, cache)
        } else {
            self.sift_down(slot, cache)
        }
    }

    /// Removes the entry at `slot`. O(log n). Fatal if `slot` does not hold
    /// `queue`'s entry.
    pub fn remove(&mut self, slot: usize, queue: TaskQueueId, cache: &mut impl SlotCache) {
        self.check_slot(slot, queue);
        let last = self.entries.len() - 1;
        self.entries.swap(slot, last);
        self.entries.truncate(last);
        cache.set_heap_slot(queue, None);
        if slot < self.entries.len() {
            cache.set_heap_slot(self.entries[slot].queue, Some(slot));
            if self.sift_up(slot, cache) == slot {
                self.sift_down(slot, cache);
            }
        }
    }

    /// Removes and returns the earliest pending wakeup. O(log n).
    pub fn pop_min(&mut self, cache: &mut impl SlotCache) -> Option<WakeupEntry> {
        let min = *self.entries.first()?;
        self.remove(0, min.queue, cache);
        Some(min)
    }

    fn check_slot(&self, slot: usize, queue: TaskQueueId) {
        if slot >= self.entries.len() || self.entries[slot].queue != queue {
            contract(Violation::ForeignHeapSlot { slot, queue });
        }
    }

    fn swap(&mut self, a: usize, b: usize, cache: &mut impl SlotCache) {
        self.entries.swap(a, b);
        cache.set_heap_slot(self.entries[a].queue, Some(a));
        cache.set_heap_slot(self.entries[b].queue, Some(b));
    }

    fn sift_up(&mut self, mut slot: usize, cache: &mut impl SlotCache) -> usize {
        while slot > 0 {
            let parent = (slot - 1) / 2;
            if self.entries[slot].key() >= self.entries[parent].key() {
                break;
            }
            self.swap(slot, parent, cache);
            slot = parent;
        }
        slot
    }

    fn sift_down(&mut self, mut slot: usize, cache: &mut impl SlotCache) -> usize {
        loop {
            let left = 2 * slot + 1;
            if left >= self.entries.len() {
                break;
            }
            let right = left + 1;
            let mut smallest = left;
            if right < self.entries.len() && self.entries[right].key() < self.entries[left].key() {
                smallest = right;
            }
            if self.entries[slot].key() <= self.entries[smallest].key() {
                break;
            }
            self.swap(slot, smallest, cache);
            slot = smallest;
        }
        slot
    }
}
