//! Priority-ordered bounded intake queue
//!
//! Orders by `(priority desc, enqueue time asc, sequence asc)`: high
//! priority first, FIFO inside a priority class, with a monotonic
//! sequence breaking enqueue-time ties. Enqueue blocks while full,
//! dequeue blocks while empty, and `complete()` lets dequeuers drain
//! what is left before they see `None`.

use std::{cmp::Ordering, collections::BinaryHeap};

use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use apiary_common::{Priority, Task};

use super::QueueClosed;

struct ReadyEntry {
    priority: Priority,
    enqueued_at: DateTime<Utc>,
    seq: u64,
    task: Task,
}

impl PartialEq for ReadyEntry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for ReadyEntry {}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority wins, then earlier enqueue, then
        // earlier sequence.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.enqueued_at.cmp(&self.enqueued_at))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Inner {
    heap: BinaryHeap<ReadyEntry>,
    next_seq: u64,
    closed: bool,
}

/// Bounded, priority-aware ready queue
pub struct PriorityReadyQueue {
    inner: parking_lot::Mutex<Inner>,
    not_empty: Notify,
    not_full: Notify,
    capacity: usize,
}

impl PriorityReadyQueue {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: parking_lot::Mutex::new(Inner {
                heap: BinaryHeap::new(),
                next_seq: 0,
                closed: false,
            }),
            not_empty: Notify::new(),
            not_full: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    /// Enqueue a task, waiting while the queue is full
    ///
    /// # Errors
    ///
    /// Returns the task if the queue has been closed.
    pub async fn enqueue(&self, task: Task) -> Result<(), QueueClosed> {
        loop {
            {
                let mut inner = self.inner.lock();
                if inner.closed {
                    return Err(QueueClosed(task));
                }
                if inner.heap.len() < self.capacity {
                    let seq = inner.next_seq;
                    inner.next_seq += 1;
                    inner.heap.push(ReadyEntry {
                        priority: task.priority,
                        enqueued_at: task.enqueued_at,
                        seq,
                        task,
                    });
                    drop(inner);
                    self.not_empty.notify_waiters();
                    return Ok(());
                }
            }

            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let inner = self.inner.lock();
                if inner.closed || inner.heap.len() < self.capacity {
                    continue;
                }
            }
            notified.await;
        }
    }

    /// Dequeue the highest-priority task, waiting while the queue is empty
    ///
    /// Returns `None` once the queue is closed and drained.
    pub async fn dequeue(&self) -> Option<Task> {
        loop {
            {
                let mut inner = self.inner.lock();
                if let Some(entry) = inner.heap.pop() {
                    drop(inner);
                    self.not_full.notify_waiters();
                    return Some(entry.task);
                }
                if inner.closed {
                    return None;
                }
            }

            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let inner = self.inner.lock();
                if inner.closed || !inner.heap.is_empty() {
                    continue;
                }
            }
            notified.await;
        }
    }

    /// Close the queue: enqueues fail, dequeuers drain and then get `None`
    pub fn complete(&self) {
        self.inner.lock().closed = true;
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().heap.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().heap.is_empty()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}
