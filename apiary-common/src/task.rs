//! Task model for the dispatch pipeline

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Domain;

/// Ready-queue priority
///
/// Ordering is `Low < Normal < High`; the ready queue serves higher
/// priorities first.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    /// Numeric rank used by the drone-selection score
    #[must_use]
    pub const fn ordinal(self) -> u8 {
        match self {
            Self::Low => 0,
            Self::Normal => 1,
            Self::High => 2,
        }
    }
}

/// Browser-session reference carried opaquely from submission to the drone
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<Value>,
}

/// A unit of browser-automation work submitted to the orchestrator
///
/// Everything except `priority`, `enqueued_at` and `persona_retry_count`
/// is immutable once submitted; those three are maintained by the
/// scheduler as the task moves through requeues and retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Globally unique command identifier
    pub command_id: String,

    /// Command kind label understood by the drone
    #[serde(rename = "type")]
    pub kind: String,

    /// Persona the drone should assume while executing
    pub persona_id: String,

    /// Capabilities a drone must advertise to be eligible
    #[serde(default)]
    pub required_capabilities: HashSet<String>,

    /// Registrable destination domain, when the task targets a site
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<Domain>,

    /// Free-form command parameters forwarded to the drone
    #[serde(default)]
    pub parameters: Value,

    /// Browser-session reference, when the task resumes one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionRef>,

    /// Execution timeout handed to the drone
    pub timeout_secs: u64,

    #[serde(default)]
    pub priority: Priority,

    /// Last time the task entered the ready queue; reset on requeue
    #[serde(default = "Utc::now")]
    pub enqueued_at: DateTime<Utc>,

    /// Number of persona-missing retries performed so far
    #[serde(default)]
    pub persona_retry_count: u32,
}

impl Task {
    /// Create a task with defaults for everything the submitter left open
    #[must_use]
    pub fn new(
        command_id: impl Into<String>,
        kind: impl Into<String>,
        persona_id: impl Into<String>,
    ) -> Self {
        Self {
            command_id: command_id.into(),
            kind: kind.into(),
            persona_id: persona_id.into(),
            required_capabilities: HashSet::new(),
            domain: None,
            parameters: Value::Null,
            session: None,
            timeout_secs: 0,
            priority: Priority::Normal,
            enqueued_at: Utc::now(),
            persona_retry_count: 0,
        }
    }

    /// Reset the enqueue timestamp, used whenever the task re-enters the
    /// ready queue
    pub fn touch_enqueued_at(&mut self) {
        self.enqueued_at = Utc::now();
    }
}
