//! In-process collaborators for running the orchestrator standalone
//!
//! The production host wires a real bus transport, persona store and
//! artifact/session/dead-letter persistence. Until then (and in tests)
//! these log-only implementations let the binary come up and the pipeline
//! be exercised end to end.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use apiary_bus::{
    Artifact, ArtifactSink, CommandPayload, DeadLetterCommand, DeadLetterSink, HubMessage,
    InterventionNotifier, OperatorMessage, OperatorNotice, Persona, PersonaStore, SessionRegistry,
    Transport, TransportError, drone_group,
};
use apiary_common::{outgoing, suffix::PublicSuffixIndex};
use apiary_intervention::{BrowserController, CommandExecutor};
use apiary_scheduler::ExternalServices;

/// Transport that logs every publish instead of sending it anywhere
#[derive(Debug, Default)]
pub struct LogTransport;

#[async_trait]
impl Transport for LogTransport {
    async fn publish_to_drone(
        &self,
        drone_id: &str,
        message: HubMessage,
    ) -> Result<(), TransportError> {
        outgoing!(
            level = INFO,
            "Publish to {} (standalone, dropped): {message:?}",
            drone_group(drone_id)
        );
        Ok(())
    }

    async fn publish_to_operators(&self, message: OperatorMessage) -> Result<(), TransportError> {
        outgoing!(
            level = INFO,
            "Operator broadcast (standalone, dropped): {message:?}"
        );
        Ok(())
    }
}

/// Persona store backed by an in-memory map
#[derive(Debug, Default)]
pub struct MemoryPersonas {
    personas: parking_lot::RwLock<std::collections::HashMap<String, Value>>,
}

impl MemoryPersonas {
    pub fn insert(&self, persona_id: impl Into<String>, traits: Value) {
        self.personas.write().insert(persona_id.into(), traits);
    }
}

#[async_trait]
impl PersonaStore for MemoryPersonas {
    async fn load(&self, persona_id: &str) -> anyhow::Result<Option<Persona>> {
        Ok(self.personas.read().get(persona_id).map(|traits| Persona {
            id: persona_id.to_string(),
            traits: traits.clone(),
        }))
    }
}

/// Artifact sink that logs what it would have stored
#[derive(Debug, Default)]
pub struct LogArtifacts;

#[async_trait]
impl ArtifactSink for LogArtifacts {
    async fn store_facts(&self, facts: Vec<Value>) -> anyhow::Result<()> {
        tracing::info!(count = facts.len(), "Facts received (standalone, dropped)");
        Ok(())
    }

    async fn store_snippets(&self, snippets: Vec<Value>) -> anyhow::Result<()> {
        tracing::info!(count = snippets.len(), "Snippets received (standalone, dropped)");
        Ok(())
    }

    async fn store_artifact(&self, artifact: Artifact) -> anyhow::Result<()> {
        tracing::info!(kind = %artifact.kind, "Artifact received (standalone, dropped)");
        Ok(())
    }
}

/// Session registry that logs updates
#[derive(Debug, Default)]
pub struct LogSessions;

#[async_trait]
impl SessionRegistry for LogSessions {
    async fn update_session_state(&self, lease_id: &str, _state: Value) -> anyhow::Result<()> {
        tracing::info!(lease_id, "Session state update (standalone, dropped)");
        Ok(())
    }
}

/// Dead-letter sink that logs records
#[derive(Debug, Default)]
pub struct LogDeadLetters;

#[async_trait]
impl DeadLetterSink for LogDeadLetters {
    async fn publish(&self, command: DeadLetterCommand) -> anyhow::Result<()> {
        tracing::warn!(
            command_id = %command.command_id,
            reason = %command.reason,
            retry_count = command.retry_count,
            "Dead letter"
        );
        Ok(())
    }
}

/// Operator notifier that logs notices
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl InterventionNotifier for LogNotifier {
    async fn notify(&self, notice: OperatorNotice) -> anyhow::Result<()> {
        tracing::info!(
            command_id = %notice.command_id,
            reason = %notice.reason,
            "Operator notice (standalone, dropped)"
        );
        Ok(())
    }
}

/// Browser controller with no browser behind it
#[derive(Debug, Default)]
pub struct HeadlessBrowser;

#[async_trait]
impl BrowserController for HeadlessBrowser {
    async fn screenshot(&self) -> anyhow::Result<String> {
        anyhow::bail!("No browser attached")
    }

    async fn current_url(&self) -> Option<String> {
        None
    }

    async fn dom_context(&self) -> Value {
        Value::Null
    }

    async fn set_operator_interaction(&self, enabled: bool) {
        tracing::info!(enabled, "Operator interaction toggled (standalone)");
    }
}

/// Command executor that logs and reports success
#[derive(Debug, Default)]
pub struct LogExecutor;

#[async_trait]
impl CommandExecutor for LogExecutor {
    async fn execute(&self, command: CommandPayload) -> anyhow::Result<Value> {
        tracing::info!(
            command_id = %command.command_id,
            kind = %command.kind,
            "Execute (standalone, no-op)"
        );
        Ok(json!({"executed": command.command_id}))
    }
}

/// The full standalone service bundle
#[must_use]
pub fn services() -> ExternalServices {
    ExternalServices {
        transport: Arc::new(LogTransport),
        personas: Arc::new(MemoryPersonas::default()),
        artifacts: Arc::new(LogArtifacts),
        sessions: Arc::new(LogSessions),
        dead_letters: Arc::new(LogDeadLetters),
        notifier: Arc::new(LogNotifier),
        suffixes: Arc::new(PublicSuffixIndex::from_env()),
    }
}
