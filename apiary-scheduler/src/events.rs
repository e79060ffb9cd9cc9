//! Inbound bus event routing
//!
//! Drone → hub messages drive the lifecycle tracker and the registry.
//! Sink failures are logged and swallowed; nothing a sink does may stall
//! the pipeline.

use chrono::Utc;
use serde_json::json;

use apiary_bus::{
    CommandErrorPayload, CommandResultPayload, DroneMessage, InterventionPayload, OperatorMessage,
    OperatorNotice, route_artifact,
};
use apiary_common::incoming;

use crate::scheduler::Scheduler;

impl Scheduler {
    /// Route one drone → hub message
    ///
    /// `drone_id` is the sender identity the transport attached to the
    /// message, which may disagree with ids inside the payload; the
    /// tracker logs such mismatches.
    pub async fn handle_drone_message(&self, drone_id: &str, message: DroneMessage) {
        match message {
            DroneMessage::RegisterDrone(payload) => {
                self.inner.registry.register(payload);
            }
            DroneMessage::AcknowledgeCommand(command_id) => {
                incoming!(
                    level = DEBUG,
                    "Command {command_id} acknowledged by {drone_id}"
                );
                if self.inner.tracker.mark_acknowledged(&command_id, drone_id) {
                    if let Some(metrics) = &self.inner.metrics {
                        metrics.record_acknowledged(drone_id);
                    }
                }
            }
            DroneMessage::ReportResult(payload) => {
                self.handle_result(drone_id, payload).await;
            }
            DroneMessage::ReportError(payload) => {
                self.handle_error(drone_id, payload).await;
            }
            DroneMessage::ReportStatus(payload) => {
                self.inner.registry.heartbeat(drone_id, &payload);
            }
            DroneMessage::RequireIntervention(payload) => {
                self.handle_intervention_request(drone_id, payload).await;
            }
            DroneMessage::QueryResponse(payload) => {
                incoming!(
                    level = DEBUG,
                    "Query response {} from {drone_id}",
                    payload.query_id
                );
            }
        }
    }

    async fn handle_result(&self, drone_id: &str, payload: CommandResultPayload) {
        incoming!(
            level = DEBUG,
            "Result for {} from {drone_id} with {} artifacts",
            payload.command_id,
            payload.artifacts.len()
        );

        for artifact in payload.artifacts {
            let kind = artifact.kind.clone();
            if let Err(e) = route_artifact(&*self.inner.artifacts, artifact).await {
                tracing::warn!(
                    command_id = %payload.command_id,
                    artifact_type = %kind,
                    error = %e,
                    "Artifact store failed"
                );
            }
        }

        if let (Some(lease_id), Some(state)) = (&payload.session_lease_id, payload.session_state) {
            if let Err(e) = self.inner.sessions.update_session_state(lease_id, state).await {
                tracing::warn!(lease_id = %lease_id, error = %e, "Session state update failed");
            }
        }

        self.inner.tracker.complete(&payload.command_id, drone_id);
        self.inner.registry.command_finished(drone_id);
    }

    async fn handle_error(&self, drone_id: &str, payload: CommandErrorPayload) {
        incoming!(
            level = DEBUG,
            "Error for {} from {drone_id}: {} (type {}, can_retry {})",
            payload.command_id,
            payload.error,
            payload.error_type,
            payload.can_retry
        );

        let failed = self
            .inner
            .tracker
            .fail(&payload.command_id, drone_id, &payload.error);
        self.inner.registry.record_error(drone_id);
        self.inner.registry.command_finished(drone_id);

        if !payload.can_retry {
            // Terminal per the drone's own judgement; nothing to requeue.
            return;
        }

        if let Some(task) = failed {
            tracing::info!(
                command_id = %payload.command_id,
                drone_id,
                "Drone reported a retryable error, requeueing"
            );
            self.requeue_ready(task).await;
        }
    }

    /// Fan a drone's intervention request out to the operator surfaces
    ///
    /// The intervention manager itself is driven by the host, which sees
    /// the same inbound message; this path only handles notification.
    async fn handle_intervention_request(&self, drone_id: &str, payload: InterventionPayload) {
        tracing::info!(
            command_id = %payload.command_id,
            drone_id,
            kind = %payload.kind,
            "Drone requires intervention"
        );

        let notice = OperatorNotice {
            command_id: payload.command_id,
            drone_id: Some(drone_id.to_string()),
            kind: payload.kind,
            reason: "drone_requested".to_string(),
            requested_at_utc: Utc::now(),
            metadata: json!({
                "data": payload.data,
                "resumeToken": payload.resume_token,
            }),
        };

        for message in [
            OperatorMessage::RequireIntervention(notice.clone()),
            OperatorMessage::InterventionRequested(notice.clone()),
        ] {
            if let Err(e) = self.inner.transport.publish_to_operators(message).await {
                tracing::warn!(error = %e, "Operator broadcast failed");
            }
        }

        if let Err(e) = self.inner.notifier.notify(notice).await {
            tracing::warn!(error = %e, "Operator notify failed");
        }
    }
}
