//! Time-domain task-wakeup scheduling primitives.
//!
//! This crate provides the core of a cooperative delayed-work scheduler: many
//! independent task queues hand their "wake me at time T" requests to a
//! [`domain::TimeDomain`], which coalesces them through a keyed min-heap
//! ([`heap::WakeupHeap`]) into a minimal set of host timer requests. Producers
//! on any thread can flag a queue as having immediate work through a
//! lock-guarded staging list ([`staging::ImmediateWorkSignal`]), and pending
//! wakeups migrate atomically between clock domains.
//!
//! The run loop that actually drains queues, the priority-based selector, and
//! the OS timer mechanism all live outside this crate; they plug in through
//! the [`domain::DomainClock`] and [`domain::WakeupObserver`] traits and the
//! visibility accessors on [`queue::TaskQueue`].

use std::thread::ThreadId;

use thiserror::Error;

use crate::queue::TaskQueueId;

pub mod domain;
pub mod heap;
pub mod queue;
pub mod staging;

/// Contract violations recognized by this crate.
///
/// None of these are recoverable: each one means the caller broke a structural
/// invariant (wrong thread, unknown or unregistered queue, stale heap slot),
/// and continuing would corrupt the heap or the registration state. They are
/// raised through [`contract`] as panics, never returned as `Result`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Violation {
    #[error("operation ran on thread {actual:?}, but the time domain is owned by {owner:?}")]
    WrongThread { owner: ThreadId, actual: ThreadId },
    #[error("task queue {0:?} does not exist in the registry")]
    UnknownQueue(TaskQueueId),
    #[error("task queue {0:?} is not registered with this time domain")]
    NotRegisteredHere(TaskQueueId),
    #[error("task queue {0:?} is already registered with a time domain")]
    AlreadyRegistered(TaskQueueId),
    #[error("task queue {0:?} removed from the registry while still registered with a time domain")]
    RemovedWhileRegistered(TaskQueueId),
    #[error("heap slot {slot} does not hold an entry for task queue {queue:?}")]
    ForeignHeapSlot { slot: usize, queue: TaskQueueId },
}

/// Aborts on a broken scheduling contract.
///
/// Every fatal path funnels through here so the panic message is uniform and
/// greppable.
pub(crate) fn contract(violation: Violation) -> ! {
    panic!("scheduling contract violated: {violation}")
}
