//! Bus payload types
//!
//! Everything here crosses the wire as JSON with camelCase field names.
//! Hub → drone messages are published to the drone's own group; drone →
//! hub messages arrive tagged with the sending drone's identity by the
//! transport layer.

use std::collections::HashSet;

use apiary_common::SessionRef;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Messages the hub publishes to a drone's group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum HubMessage {
    ExecuteCommand(CommandPayload),
    ExecuteQuery(QueryPayload),
}

/// A command for a drone to execute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandPayload {
    pub command_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub parameters: Value,
    /// Resolved persona traits, not just the id
    #[serde(default)]
    pub persona: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionRef>,
    #[serde(rename = "timeoutSec")]
    pub timeout_secs: u64,
}

impl CommandPayload {
    /// Deep copy with the id suffixed, used for intervention replay
    #[must_use]
    pub fn replayable(&self) -> Self {
        let mut replay = self.clone();
        replay.command_id = format!("{}_replay", self.command_id);
        replay
    }
}

/// A read-only query for a drone to answer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryPayload {
    pub query_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub parameters: Value,
}

/// Messages a drone sends to the hub
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DroneMessage {
    RegisterDrone(DroneRegistrationPayload),
    AcknowledgeCommand(String),
    ReportResult(CommandResultPayload),
    ReportError(CommandErrorPayload),
    ReportStatus(StatusPayload),
    RequireIntervention(InterventionPayload),
    QueryResponse(QueryResponsePayload),
}

/// Registration announcement from a drone
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DroneRegistrationPayload {
    pub drone_id: String,
    pub connection_id: String,
    pub version: String,
    #[serde(default)]
    pub static_capabilities: HashSet<String>,
}

/// Successful command outcome with any produced artifacts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResultPayload {
    pub command_id: String,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_lease_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_state: Option<Value>,
}

/// A produced artifact, routed to a store by its `type` label
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Failed command outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandErrorPayload {
    pub command_id: String,
    pub error: String,
    #[serde(default)]
    pub error_type: String,
    #[serde(default)]
    pub can_retry: bool,
}

/// Periodic drone status heartbeat
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusPayload {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_usage: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_usage: Option<f64>,
}

/// A drone asking for a human operator to take over
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterventionPayload {
    pub command_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<String>,
}

/// Answer to a previously published query
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponsePayload {
    pub query_id: String,
    #[serde(default)]
    pub result: Value,
}

/// Broadcast to the operators group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OperatorMessage {
    RequireIntervention(OperatorNotice),
    InterventionRequested(OperatorNotice),
}

/// Operator-facing notification payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorNotice {
    pub command_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drone_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    pub reason: String,
    pub requested_at_utc: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Value,
}

/// Record published for a command the pipeline could not progress
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterCommand {
    pub command_id: String,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drone_id: Option<String>,
    pub retry_count: u32,
    pub failed_at_utc: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Value,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_command_payload_wire_shape() {
        let payload = CommandPayload {
            command_id: "c1".to_string(),
            kind: "navigate".to_string(),
            parameters: json!({"url": "https://example.com"}),
            persona: json!({"locale": "de-DE"}),
            session: None,
            timeout_secs: 30,
        };

        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["commandId"], "c1");
        assert_eq!(value["type"], "navigate");
        assert_eq!(value["timeoutSec"], 30);
    }

    #[test]
    fn test_replayable_suffixes_id_and_keeps_payload() {
        let payload = CommandPayload {
            command_id: "c1".to_string(),
            kind: "navigate".to_string(),
            parameters: json!({"url": "https://example.com"}),
            persona: json!({}),
            session: None,
            timeout_secs: 30,
        };

        let replay = payload.replayable();
        assert_eq!(replay.command_id, "c1_replay");
        assert_eq!(replay.kind, payload.kind);
        assert_eq!(replay.parameters, payload.parameters);

        // Round-trips through the wire to the same payload.
        let encoded = serde_json::to_string(&replay).unwrap();
        let decoded: CommandPayload = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, replay);
    }

    #[test]
    fn test_result_payload_defaults() {
        let payload: CommandResultPayload =
            serde_json::from_str(r#"{"commandId": "c1"}"#).unwrap();
        assert!(payload.artifacts.is_empty());
        assert!(payload.session_lease_id.is_none());
    }
}
