//! Command lifecycle tracking
//!
//! Correlates dispatch → acknowledgement → completion/failure for every
//! in-flight command, and owns the resources a dispatch acquired: the
//! drone's pacing permit and the domain lease. Both are released exactly
//! once, by whichever terminal signal arrives first; later signals for the
//! same command are ignored.

use std::{sync::Arc, time::Duration};

use dashmap::{DashMap, mapref::entry::Entry};
use thiserror::Error;
use tokio::sync::{Notify, OwnedSemaphorePermit};

use apiary_common::Task;
use apiary_metrics::SchedulerMetrics;

use crate::limiter::DomainLease;

/// Structured acknowledgement outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckResult {
    Acknowledged,
    Failed(String),
    Timeout,
}

/// Errors from lifecycle registration
#[derive(Debug, Error)]
pub enum TrackerError {
    /// A command with this id is already in flight
    #[error("Command already tracked: {0}")]
    AlreadyTracked(String),
}

/// Resolved acknowledgement value; `Timeout` is never stored, it is an
/// observation the waiter makes on its own clock.
#[derive(Debug, Clone)]
enum AckValue {
    Acknowledged,
    Failed(String),
}

impl From<AckValue> for AckResult {
    fn from(value: AckValue) -> Self {
        match value {
            AckValue::Acknowledged => Self::Acknowledged,
            AckValue::Failed(reason) => Self::Failed(reason),
        }
    }
}

/// One-shot completion cell that any number of waiters can await
///
/// Unlike a oneshot channel, waiting does not consume anything: a waiter
/// that times out leaves the cell untouched for the next signal.
#[derive(Debug, Default)]
struct AckCell {
    value: parking_lot::Mutex<Option<AckValue>>,
    notify: Notify,
}

impl AckCell {
    /// Resolve the cell; only the first resolution sticks.
    ///
    /// Returns `true` if this call resolved the cell.
    fn resolve(&self, value: AckValue) -> bool {
        {
            let mut slot = self.value.lock();
            if slot.is_some() {
                return false;
            }
            *slot = Some(value);
        }
        self.notify.notify_waiters();
        true
    }

    async fn wait(&self) -> AckValue {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(value) = self.value.lock().clone() {
                return value;
            }

            notified.await;
        }
    }
}

/// State held for one in-flight command
#[derive(Debug)]
struct CommandState {
    drone_id: String,
    pacing: Option<OwnedSemaphorePermit>,
    lease: Option<DomainLease>,
    ack: Arc<AckCell>,
    /// The dispatched task, handed back on failure so the caller can
    /// apply its requeue policy
    task: Task,
}

/// Tracks every in-flight command and releases its resources exactly once
#[derive(Debug, Default)]
pub struct CommandLifecycleTracker {
    states: DashMap<String, CommandState>,
    /// Terminal results posted for waiters that arrive late
    completions: DashMap<String, AckResult>,
    metrics: Option<Arc<SchedulerMetrics>>,
}

impl CommandLifecycleTracker {
    #[must_use]
    pub fn new(metrics: Option<Arc<SchedulerMetrics>>) -> Self {
        Self {
            states: DashMap::new(),
            completions: DashMap::new(),
            metrics,
        }
    }

    /// Register a dispatched command under `task.command_id`, transferring
    /// ownership of its pacing permit, domain lease and the task itself
    ///
    /// Any stale completion result for the id is cleared.
    ///
    /// # Errors
    ///
    /// Returns an error if the id is already tracked; the permit and lease
    /// passed in are released on the way out.
    pub fn register_dispatch(
        &self,
        drone_id: &str,
        pacing: OwnedSemaphorePermit,
        lease: Option<DomainLease>,
        task: Task,
    ) -> Result<(), TrackerError> {
        match self.states.entry(task.command_id.clone()) {
            Entry::Occupied(_) => Err(TrackerError::AlreadyTracked(task.command_id.clone())),
            Entry::Vacant(entry) => {
                self.completions.remove(&task.command_id);
                entry.insert(CommandState {
                    drone_id: drone_id.to_string(),
                    pacing: Some(pacing),
                    lease,
                    ack: Arc::new(AckCell::default()),
                    task,
                });
                Ok(())
            }
        }
    }

    /// Wait for the command's acknowledgement, up to `timeout`
    ///
    /// A call for an untracked command returns the posted completion
    /// result if there is one, and `Acknowledged` otherwise (the caller
    /// arrived after the whole lifecycle finished). A timeout mutates
    /// nothing; the caller decides what happens next.
    pub async fn wait_for_acknowledgement(&self, command_id: &str, timeout: Duration) -> AckResult {
        let cell = match self.states.get(command_id) {
            Some(state) => state.ack.clone(),
            None => {
                return self
                    .completions
                    .remove(command_id)
                    .map_or(AckResult::Acknowledged, |(_, result)| result);
            }
        };

        tokio::select! {
            value = cell.wait() => value.into(),
            () = tokio::time::sleep(timeout) => AckResult::Timeout,
        }
    }

    /// Resolve the command's acknowledgement
    ///
    /// Returns `true` if this call resolved it (used to count the ack once
    /// even when the bus delivers twice).
    pub fn mark_acknowledged(&self, command_id: &str, drone_id: &str) -> bool {
        let Some(state) = self.states.get(command_id) else {
            tracing::debug!(command_id, drone_id, "Acknowledgement for untracked command");
            return false;
        };

        if state.drone_id != drone_id {
            tracing::warn!(
                command_id,
                expected = %state.drone_id,
                acknowledged_by = %drone_id,
                "Acknowledgement from unexpected drone"
            );
        }

        state.ack.resolve(AckValue::Acknowledged)
    }

    /// Terminal success; releases the lease, then the pacing permit
    pub fn complete(&self, command_id: &str, drone_id: &str) {
        self.finish(command_id, drone_id, AckValue::Acknowledged);
    }

    /// Terminal failure; releases the lease, then the pacing permit
    ///
    /// Returns the dispatched task when this call was the one that
    /// finished the command, so the caller owns the requeue decision.
    pub fn fail(&self, command_id: &str, drone_id: &str, reason: &str) -> Option<Task> {
        self.finish(command_id, drone_id, AckValue::Failed(reason.to_string()))
    }

    /// Fail every command currently tracked for a drone
    ///
    /// Used on disconnect; pending acknowledgement waiters resolve to
    /// `Failed(reason)` and their watchers own any requeue, so the tasks
    /// handed back by `fail` are dropped here.
    pub fn fail_all(&self, drone_id: &str, reason: &str) {
        let ids: Vec<String> = self
            .states
            .iter()
            .filter(|entry| entry.value().drone_id == drone_id)
            .map(|entry| entry.key().clone())
            .collect();

        for command_id in ids {
            self.fail(&command_id, drone_id, reason);
        }
    }

    /// Whether a command is currently tracked
    #[must_use]
    pub fn tracked(&self, command_id: &str) -> bool {
        self.states.contains_key(command_id)
    }

    /// Number of in-flight commands
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.states.len()
    }

    fn finish(&self, command_id: &str, drone_id: &str, value: AckValue) -> Option<Task> {
        let Some((_, mut state)) = self.states.remove(command_id) else {
            // Later signals for an already-terminal command are ignored.
            tracing::debug!(command_id, drone_id, "Terminal signal for untracked command");
            return None;
        };

        let result: AckResult = value.clone().into();
        state.ack.resolve(value);

        // Lease before pacing permit, each exactly once.
        if let Some(lease) = state.lease.take() {
            lease.release();
        }
        drop(state.pacing.take());

        if let Some(metrics) = &self.metrics {
            match &result {
                AckResult::Failed(_) => metrics.record_failed(&state.drone_id),
                _ => metrics.record_completed(&state.drone_id),
            }
        }

        self.completions.insert(command_id.to_string(), result);
        Some(state.task)
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::Semaphore;

    use super::*;

    fn tracker() -> CommandLifecycleTracker {
        CommandLifecycleTracker::new(None)
    }

    fn task(command_id: &str) -> Task {
        Task::new(command_id, "navigate", "p1")
    }

    fn permit() -> OwnedSemaphorePermit {
        match Arc::new(Semaphore::new(1)).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => unreachable!("fresh semaphore always has a permit"),
        }
    }

    #[tokio::test]
    async fn test_register_rejects_duplicates() {
        let tracker = tracker();
        assert!(tracker
            .register_dispatch("d1", permit(), None, task("c1"))
            .is_ok());
        assert!(matches!(
            tracker.register_dispatch("d1", permit(), None, task("c1")),
            Err(TrackerError::AlreadyTracked(_))
        ));
    }

    #[tokio::test]
    async fn test_ack_resolves_waiter() {
        let tracker = Arc::new(tracker());
        tracker
            .register_dispatch("d1", permit(), None, task("c1"))
            .ok();

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move {
                tracker
                    .wait_for_acknowledgement("c1", Duration::from_secs(5))
                    .await
            })
        };

        tokio::task::yield_now().await;
        assert!(tracker.mark_acknowledged("c1", "d1"));
        // A duplicate delivery does not resolve twice.
        assert!(!tracker.mark_acknowledged("c1", "d1"));

        assert_eq!(waiter.await.ok(), Some(AckResult::Acknowledged));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out_without_mutating() {
        let tracker = tracker();
        tracker
            .register_dispatch("d1", permit(), None, task("c1"))
            .ok();

        let result = tracker
            .wait_for_acknowledgement("c1", Duration::from_secs(1))
            .await;
        assert_eq!(result, AckResult::Timeout);

        // State is untouched; a later failure still resolves normally and
        // hands the dispatched task back.
        assert!(tracker.tracked("c1"));
        let failed = tracker.fail("c1", "d1", "ack_timeout");
        assert_eq!(failed.map(|t| t.command_id), Some("c1".to_string()));
        assert!(!tracker.tracked("c1"));

        // A repeat failure has nothing left to hand back.
        assert!(tracker.fail("c1", "d1", "ack_timeout").is_none());
    }

    #[tokio::test]
    async fn test_late_waiter_gets_posted_completion() {
        let tracker = tracker();
        tracker
            .register_dispatch("d1", permit(), None, task("c1"))
            .ok();
        tracker.fail("c1", "d1", "boom");

        let result = tracker
            .wait_for_acknowledgement("c1", Duration::from_secs(1))
            .await;
        assert_eq!(result, AckResult::Failed("boom".to_string()));

        // Entirely unknown commands read as acknowledged.
        let result = tracker
            .wait_for_acknowledgement("never-registered", Duration::from_secs(1))
            .await;
        assert_eq!(result, AckResult::Acknowledged);
    }

    #[tokio::test]
    async fn test_complete_releases_pacing_permit() {
        let tracker = tracker();
        let semaphore = Arc::new(Semaphore::new(1));
        let Ok(permit) = semaphore.clone().try_acquire_owned() else {
            unreachable!()
        };

        tracker
            .register_dispatch("d1", permit, None, task("c1"))
            .ok();
        assert_eq!(semaphore.available_permits(), 0);

        tracker.complete("c1", "d1");
        assert_eq!(semaphore.available_permits(), 1);

        // A second terminal signal is a no-op.
        tracker.fail("c1", "d1", "late");
        assert_eq!(semaphore.available_permits(), 1);
    }

    #[tokio::test]
    async fn test_fail_all_resolves_pending_waiters() {
        let tracker = Arc::new(tracker());
        tracker
            .register_dispatch("d1", permit(), None, task("c1"))
            .ok();
        tracker
            .register_dispatch("d1", permit(), None, task("c2"))
            .ok();
        tracker
            .register_dispatch("d2", permit(), None, task("c3"))
            .ok();

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move {
                tracker
                    .wait_for_acknowledgement("c2", Duration::from_secs(5))
                    .await
            })
        };
        tokio::task::yield_now().await;

        tracker.fail_all("d1", "drone_disconnected");

        assert_eq!(
            waiter.await.ok(),
            Some(AckResult::Failed("drone_disconnected".to_string()))
        );
        assert!(!tracker.tracked("c1"));
        assert!(!tracker.tracked("c2"));
        assert!(tracker.tracked("c3"));
    }
}
