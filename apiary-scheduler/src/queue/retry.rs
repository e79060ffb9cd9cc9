//! Persona-missing retry queue
//!
//! Time-ordered buffer for tasks whose persona could not be loaded. A
//! single scheduler fiber pops entries as their due time arrives and puts
//! them back on the ready queue.

use std::{
    cmp::{Ordering, Reverse},
    collections::{BinaryHeap, binary_heap::PeekMut},
    time::Duration,
};

use rand::Rng;
use tokio::{sync::Notify, time::Instant};

use apiary_common::Task;

/// Calculate the delay before the next persona retry
///
/// # Formula
/// `delay = clamp(base * 2^(attempt - 1), base, max_backoff) * jitter`
/// with jitter drawn uniformly from `[0.75, 1.25]`.
///
/// `attempt` is 1-indexed; a zero-second base is bumped to one second and
/// the backoff cap never drops below the base.
#[must_use]
pub fn next_retry_delay(attempt: u32, base_delay_secs: u64, max_backoff_secs: u64) -> Duration {
    let base = base_delay_secs.max(1);
    let max_backoff = max_backoff_secs.max(base);

    let exponent = attempt.saturating_sub(1);
    let delay = if exponent >= 63 {
        max_backoff
    } else {
        base.saturating_mul(1_u64 << exponent)
            .clamp(base, max_backoff)
    };

    #[allow(clippy::cast_precision_loss)]
    let jittered = (delay as f64) * rand::rng().random_range(0.75..=1.25);
    Duration::from_secs_f64(jittered)
}

struct RetryEntry {
    due_at: Instant,
    seq: u64,
    task: Task,
}

impl PartialEq for RetryEntry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for RetryEntry {}

impl PartialOrd for RetryEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RetryEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.due_at
            .cmp(&other.due_at)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

struct Inner {
    heap: BinaryHeap<Reverse<RetryEntry>>,
    next_seq: u64,
}

/// Time-ordered retry buffer
#[derive(Default)]
pub struct RetryQueue {
    inner: parking_lot::Mutex<Inner>,
    notify: Notify,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }
}

impl RetryQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule a task for retry after `delay`
    pub fn schedule(&self, task: Task, delay: Duration) {
        {
            let mut inner = self.inner.lock();
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.heap.push(Reverse(RetryEntry {
                due_at: Instant::now() + delay,
                seq,
                task,
            }));
        }
        self.notify.notify_waiters();
    }

    /// Wait for the next task whose due time has arrived
    ///
    /// Pends forever while the queue is empty; the caller races this
    /// against shutdown.
    pub async fn next_due(&self) -> Task {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let deadline = {
                let mut inner = self.inner.lock();
                let now = Instant::now();
                if let Some(top) = inner.heap.peek_mut() {
                    if top.0.due_at <= now {
                        return PeekMut::pop(top).0.task;
                    }
                    Some(top.0.due_at)
                } else {
                    None
                }
            };

            match deadline {
                Some(at) => {
                    tokio::select! {
                        () = tokio::time::sleep_until(at) => {}
                        () = &mut notified => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().heap.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_backoff_doubles_within_bounds() {
        // Jitter is ±25%, so assert against the jittered envelope.
        let first = next_retry_delay(1, 4, 120);
        assert!(first >= Duration::from_secs(3) && first <= Duration::from_secs(5));

        let second = next_retry_delay(2, 4, 120);
        assert!(second >= Duration::from_secs(6) && second <= Duration::from_secs(10));

        let third = next_retry_delay(3, 4, 120);
        assert!(third >= Duration::from_secs(12) && third <= Duration::from_secs(20));
    }

    #[test]
    fn test_backoff_caps_at_max() {
        let capped = next_retry_delay(30, 5, 60);
        assert!(capped <= Duration::from_secs(75));
        assert!(capped >= Duration::from_secs(45));
    }

    #[test]
    fn test_backoff_floors_base_at_one_second() {
        let delay = next_retry_delay(1, 0, 0);
        assert!(delay >= Duration::from_millis(750));
        assert!(delay <= Duration::from_millis(1250));
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_pop_in_due_order() {
        let queue = RetryQueue::new();
        queue.schedule(Task::new("later", "navigate", "p1"), Duration::from_secs(10));
        queue.schedule(Task::new("sooner", "navigate", "p1"), Duration::from_secs(2));

        let first = queue.next_due().await;
        assert_eq!(first.command_id, "sooner");

        let second = queue.next_due().await;
        assert_eq!(second.command_id, "later");
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_picks_up_earlier_schedule() {
        let queue = Arc::new(RetryQueue::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next_due().await })
        };

        tokio::task::yield_now().await;
        queue.schedule(Task::new("c1", "navigate", "p1"), Duration::from_secs(1));

        let task = waiter.await.ok();
        assert_eq!(task.map(|t| t.command_id), Some("c1".to_string()));
    }
}
