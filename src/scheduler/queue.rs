//! Ready and retry queues for the download scheduler.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use tokio::time::Instant;

use crate::models::{Priority, TaskId};

#[derive(Debug, PartialEq, Eq)]
struct ReadyEntry {
    priority: Priority,
    seq: u64,
    task_id: TaskId,
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap: higher priority first, then lower sequence number (FIFO)
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Queued tasks ordered by priority, ties broken by submission order.
///
/// Entries are removed lazily: a popped id whose task is no longer `Queued`
/// (paused or cancelled in the meantime) is simply skipped by the caller.
#[derive(Debug, Default)]
pub(crate) struct ReadyQueue {
    heap: BinaryHeap<ReadyEntry>,
}

impl ReadyQueue {
    pub fn push(&mut self, priority: Priority, seq: u64, task_id: TaskId) {
        self.heap.push(ReadyEntry {
            priority,
            seq,
            task_id,
        });
    }

    pub fn pop(&mut self) -> Option<TaskId> {
        self.heap.pop().map(|entry| entry.task_id)
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

/// Delay-ordered retry entries, drained by a single timer task.
#[derive(Debug, Default)]
pub(crate) struct RetryQueue {
    heap: BinaryHeap<Reverse<(Instant, TaskId)>>,
}

impl RetryQueue {
    pub fn push(&mut self, deadline: Instant, task_id: TaskId) {
        self.heap.push(Reverse((deadline, task_id)));
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse((deadline, _))| *deadline)
    }

    pub fn pop(&mut self) -> Option<(Instant, TaskId)> {
        self.heap.pop().map(|Reverse(entry)| entry)
    }
}
