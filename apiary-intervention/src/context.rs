//! Session context types

use serde_json::Value;
use tokio::time::Instant;

use apiary_bus::CommandPayload;

/// One operator step recorded during a session
#[derive(Debug, Clone)]
pub struct InterventionStep {
    pub command_type: String,
    pub timestamp: Instant,
    pub command: CommandPayload,
}

/// Everything known about the active intervention session
#[derive(Debug, Clone)]
pub struct InterventionContext {
    /// Session id; identical to the parent command's id
    pub command_id: String,
    pub parent_command_id: String,
    pub reason: String,
    pub start_time: Instant,
    pub last_step_time: Instant,
    /// The command the operator took over from
    pub parent_command: CommandPayload,
    /// Deep copy of the parent with its id suffixed `_replay`, executed
    /// on resume
    pub replayable_action: CommandPayload,
    pub screenshot_path: Option<String>,
    pub url: Option<String>,
    pub dom_context: Value,
    pub steps: Vec<InterventionStep>,
}

impl InterventionContext {
    pub(crate) fn new(reason: String, parent: CommandPayload) -> Self {
        let now = Instant::now();
        Self {
            command_id: parent.command_id.clone(),
            parent_command_id: parent.command_id.clone(),
            reason,
            start_time: now,
            last_step_time: now,
            replayable_action: parent.replayable(),
            parent_command: parent,
            screenshot_path: None,
            url: None,
            dom_context: Value::Null,
            steps: Vec::new(),
        }
    }
}
