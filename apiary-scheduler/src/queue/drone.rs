//! Bounded FIFO queue feeding one drone's dispatch worker

use std::collections::VecDeque;

use tokio::sync::Notify;

use apiary_common::Task;

use super::QueueClosed;

struct Inner {
    items: VecDeque<Task>,
    closed: bool,
}

/// Per-drone dispatch queue
///
/// Strict FIFO: priority only matters on the ready queue, once a task is
/// routed to a drone it runs in arrival order. Requeued tasks go to the
/// back.
pub struct DroneQueue {
    inner: parking_lot::Mutex<Inner>,
    not_empty: Notify,
    not_full: Notify,
    capacity: usize,
}

impl DroneQueue {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: parking_lot::Mutex::new(Inner {
                items: VecDeque::new(),
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
                if inner.items.len() < self.capacity {
                    inner.items.push_back(task);
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
                if inner.closed || inner.items.len() < self.capacity {
                    continue;
                }
            }
            notified.await;
        }
    }

    /// Dequeue the next task in arrival order
    ///
    /// Returns `None` once the queue is closed and drained.
    pub async fn dequeue(&self) -> Option<Task> {
        loop {
            {
                let mut inner = self.inner.lock();
                if let Some(task) = inner.items.pop_front() {
                    drop(inner);
                    self.not_full.notify_waiters();
                    return Some(task);
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
                if inner.closed || !inner.items.is_empty() {
                    continue;
                }
            }
            notified.await;
        }
    }

    /// Close the queue and take whatever was still waiting
    ///
    /// The worker reading this queue exits on its next dequeue.
    pub fn close_and_drain(&self) -> Vec<Task> {
        let drained = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.items.drain(..).collect()
        };
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
        drained
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn task(id: &str) -> Task {
        Task::new(id, "navigate", "p1")
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = DroneQueue::new(10);
        for id in ["a", "b", "c"] {
            queue.enqueue(task(id)).await.ok();
        }

        assert_eq!(queue.dequeue().await.map(|t| t.command_id), Some("a".into()));
        assert_eq!(queue.dequeue().await.map(|t| t.command_id), Some("b".into()));
        assert_eq!(queue.dequeue().await.map(|t| t.command_id), Some("c".into()));
    }

    #[tokio::test]
    async fn test_close_and_drain() {
        let queue = DroneQueue::new(10);
        queue.enqueue(task("a")).await.ok();
        queue.enqueue(task("b")).await.ok();

        let drained = queue.close_and_drain();
        assert_eq!(drained.len(), 2);
        assert!(queue.enqueue(task("c")).await.is_err());
        assert!(queue.dequeue().await.is_none());
    }

    #[tokio::test]
    async fn test_close_wakes_waiting_worker() {
        let queue = Arc::new(DroneQueue::new(10));
        let worker = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue().await })
        };

        tokio::task::yield_now().await;
        queue.close_and_drain();
        assert_eq!(worker.await.ok(), Some(None));
    }
}
