//! The per-task dispatch sequence
//!
//! Runs under one drone's worker. The admission gate is two-stage: the
//! drone's pacing token first, the domain lease second, both non-blocking.
//! Once the command is published, ownership of both moves to the lifecycle
//! tracker and an ack-timeout watcher takes over.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use serde_json::json;

use apiary_bus::{CommandPayload, DeadLetterCommand, HubMessage, OperatorNotice};
use apiary_common::{Task, outgoing};

use crate::{
    error::DispatchError,
    queue::{QueueClosed, drone::DroneQueue, retry::next_retry_delay},
    scheduler::{SOFT_RETRY_DELAY, Scheduler},
    tracker::AckResult,
};

/// Failure reason recorded when a command's acknowledgement never came
pub(crate) const ACK_TIMEOUT_REASON: &str = "ack_timeout";

/// Failure reason a disconnect resolves pending acknowledgements with
pub(crate) const DISCONNECT_REASON: &str = "drone_disconnected";

/// Dead-letter reason for tasks whose persona never materialised
pub(crate) const MISSING_PERSONA_REASON: &str = "missing_persona";

impl Scheduler {
    /// Dispatch one task to one drone, recovering per the error taxonomy
    pub(crate) async fn dispatch(&self, drone_id: &str, queue: &Arc<DroneQueue>, task: Task) {
        match self.try_dispatch(drone_id, &task).await {
            Ok(()) => {}
            Err(error) => self.recover(drone_id, queue, task, error).await,
        }
    }

    async fn try_dispatch(&self, drone_id: &str, task: &Task) -> Result<(), DispatchError> {
        let inner = &self.inner;

        // Admission stage one: the pacing token, without waiting. An
        // unavailable token means the drone has its fill in flight.
        let Some(token) = inner.registry.try_acquire_pacing(drone_id) else {
            return Err(DispatchError::PacingBusy);
        };

        // A fresh snapshot: the queue routing decision may be stale.
        let Some(info) = inner.registry.snapshot(drone_id) else {
            return Err(DispatchError::DroneMissing);
        };
        if !info.status.is_idle() {
            return Err(DispatchError::DroneNotIdle);
        }

        // Admission stage two: the domain lease, also without waiting.
        let lease = match &task.domain {
            Some(domain) => Some(
                inner
                    .limiter
                    .try_acquire(drone_id, domain)
                    .map_err(DispatchError::DomainDenied)?,
            ),
            None => None,
        };

        let persona = match inner.personas.load(&task.persona_id).await {
            Ok(Some(persona)) => persona,
            Ok(None) => return Err(DispatchError::PersonaMissing(task.persona_id.clone())),
            Err(e) => return Err(DispatchError::PersonaStore(e.to_string())),
        };

        let payload = CommandPayload {
            command_id: task.command_id.clone(),
            kind: task.kind.clone(),
            parameters: task.parameters.clone(),
            persona: persona.traits,
            session: task.session.clone(),
            timeout_secs: task.timeout_secs,
        };

        inner
            .transport
            .publish_to_drone(drone_id, HubMessage::ExecuteCommand(payload))
            .await?;

        outgoing!(
            level = DEBUG,
            "Published command {} to drone {drone_id}",
            task.command_id
        );

        inner.registry.command_started(drone_id, &task.command_id);
        inner.registry.record_assignment(drone_id);

        // Ownership of the token, lease and task moves to the tracker;
        // the terminal signal releases the first two and hands the task
        // back to whoever decides the requeue.
        if inner
            .tracker
            .register_dispatch(drone_id, token, lease, task.clone())
            .is_err()
        {
            inner.registry.command_finished(drone_id);
            return Err(DispatchError::AlreadyTracked(task.command_id.clone()));
        }

        if let Some(metrics) = &inner.metrics {
            metrics.record_dispatched(drone_id);
        }

        self.spawn_ack_watcher(drone_id.to_string(), task.clone());
        Ok(())
    }

    /// Map a dispatch error to its requeue policy
    async fn recover(
        &self,
        drone_id: &str,
        queue: &Arc<DroneQueue>,
        task: Task,
        error: DispatchError,
    ) {
        match error {
            DispatchError::PacingBusy => {
                self.requeue_drone(queue, task).await;
                tokio::time::sleep(Duration::from_millis(
                    self.inner.config.dispatch_loop_delay_ms,
                ))
                .await;
            }
            DispatchError::DroneMissing => {
                tracing::warn!(drone_id, "Drone vanished before dispatch, tearing down");
                self.drone_disconnected(drone_id).await;
                self.requeue_ready(task).await;
            }
            DispatchError::DroneNotIdle => {
                self.requeue_ready(task).await;
            }
            DispatchError::DomainDenied(reason) => {
                tracing::debug!(
                    command_id = %task.command_id,
                    drone_id,
                    %reason,
                    "Domain lease denied, retrying shortly"
                );
                tokio::time::sleep(SOFT_RETRY_DELAY).await;
                self.requeue_drone(queue, task).await;
            }
            DispatchError::PersonaMissing(_) => {
                self.persona_backoff(task).await;
            }
            DispatchError::PersonaStore(e) => {
                tracing::warn!(command_id = %task.command_id, error = %e, "Persona store failed");
                self.requeue_drone(queue, task).await;
            }
            DispatchError::Transport(e) => {
                tracing::warn!(
                    command_id = %task.command_id,
                    drone_id,
                    error = %e,
                    "Publish failed, retrying on the drone queue"
                );
                self.requeue_drone(queue, task).await;
            }
            DispatchError::AlreadyTracked(command_id) => {
                // A duplicate id cannot be requeued without looping forever.
                tracing::error!(command_id, "Duplicate command id reached dispatch, dropping");
            }
        }
    }

    /// Watch one published command for its acknowledgement
    fn spawn_ack_watcher(&self, drone_id: String, task: Task) {
        let scheduler = self.clone();
        let timeout = Duration::from_secs(self.inner.config.ack_timeout_secs);

        tokio::spawn(async move {
            let command_id = task.command_id.clone();
            let result = scheduler
                .inner
                .tracker
                .wait_for_acknowledgement(&command_id, timeout)
                .await;

            match result {
                AckResult::Acknowledged => {}
                AckResult::Failed(reason) if reason == DISCONNECT_REASON => {
                    tracing::info!(
                        command_id,
                        drone_id,
                        "Drone disconnected before acknowledgement, requeueing"
                    );
                    scheduler.requeue_ready(task).await;
                }
                AckResult::Failed(reason) => {
                    // Whoever failed the command owns the requeue policy.
                    tracing::debug!(command_id, drone_id, reason, "Command failed before ack");
                }
                AckResult::Timeout => {
                    tracing::warn!(command_id, drone_id, "Acknowledgement timed out");
                    if let Some(metrics) = &scheduler.inner.metrics {
                        metrics.record_ack_timeout(&drone_id);
                    }

                    let failed = scheduler
                        .inner
                        .tracker
                        .fail(&command_id, &drone_id, ACK_TIMEOUT_REASON);
                    scheduler.inner.registry.record_error(&drone_id);
                    scheduler.inner.registry.mark_idle(&drone_id);

                    // `None` means a terminal signal won the race after the
                    // timeout fired; the command finished, nothing to requeue.
                    if let Some(task) = failed {
                        scheduler.requeue_ready(task).await;
                    }
                }
            }
        });
    }

    /// Persona-missing backoff: retry with exponential delay, dead-letter
    /// once the retries are spent
    pub(crate) async fn persona_backoff(&self, mut task: Task) {
        task.persona_retry_count += 1;
        let attempts = task.persona_retry_count;
        let config = &self.inner.config;

        if attempts > config.persona_missing_max_retries {
            tracing::warn!(
                command_id = %task.command_id,
                persona_id = %task.persona_id,
                attempts,
                "Persona retries exhausted, dead-lettering"
            );

            if let Some(metrics) = &self.inner.metrics {
                metrics.record_persona_failed();
            }

            let record = DeadLetterCommand {
                command_id: task.command_id.clone(),
                reason: MISSING_PERSONA_REASON.to_string(),
                persona_id: Some(task.persona_id.clone()),
                drone_id: None,
                retry_count: attempts,
                failed_at_utc: Utc::now(),
                metadata: json!({
                    "type": task.kind,
                    "enqueuedAt": task.enqueued_at,
                }),
            };
            if let Err(e) = self.inner.dead_letters.publish(record).await {
                tracing::warn!(command_id = %task.command_id, error = %e, "Dead-letter publish failed");
            }

            let notice = OperatorNotice {
                command_id: task.command_id.clone(),
                drone_id: None,
                kind: "DeadLetter".to_string(),
                reason: MISSING_PERSONA_REASON.to_string(),
                requested_at_utc: Utc::now(),
                metadata: json!({
                    "personaId": task.persona_id,
                    "attempts": attempts,
                }),
            };
            if let Err(e) = self.inner.notifier.notify(notice).await {
                tracing::warn!(command_id = %task.command_id, error = %e, "Operator notify failed");
            }
            return;
        }

        let delay = next_retry_delay(
            attempts,
            config.persona_missing_base_delay_secs,
            config.persona_missing_max_backoff_secs,
        );

        tracing::info!(
            command_id = %task.command_id,
            persona_id = %task.persona_id,
            attempt = attempts,
            delay_ms = delay.as_millis(),
            "Persona missing, scheduling retry"
        );

        if let Some(metrics) = &self.inner.metrics {
            metrics.record_persona_retry();
        }
        self.inner.retries.schedule(task, delay);
    }

    pub(crate) async fn requeue_drone(&self, queue: &Arc<DroneQueue>, task: Task) {
        if let Err(QueueClosed(task)) = queue.enqueue(task).await {
            self.requeue_ready(task).await;
        }
    }
}
