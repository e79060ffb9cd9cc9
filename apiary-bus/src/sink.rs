//! Outbound sink interfaces
//!
//! Artifact, session and dead-letter persistence, operator notification
//! and the persona store are all external collaborators. Failures from any
//! of them are logged by callers and never block the pipeline.

use async_trait::async_trait;
use serde_json::Value;

use crate::payload::{Artifact, DeadLetterCommand, OperatorNotice};

/// A behavioural profile fetched from the persona store
#[derive(Debug, Clone)]
pub struct Persona {
    pub id: String,
    /// Free-form trait tree; intervention rules walk this
    pub traits: Value,
}

/// Read access to the persona store
#[async_trait]
pub trait PersonaStore: Send + Sync {
    /// Load a persona by id; `Ok(None)` means the persona does not exist
    ///
    /// # Errors
    ///
    /// Returns an error if the store itself cannot be reached.
    async fn load(&self, persona_id: &str) -> anyhow::Result<Option<Persona>>;
}

/// Persistence for artifacts produced by drone commands
#[async_trait]
pub trait ArtifactSink: Send + Sync {
    /// Store a batch of extracted facts
    ///
    /// # Errors
    ///
    /// Returns an error if the batch cannot be persisted.
    async fn store_facts(&self, facts: Vec<Value>) -> anyhow::Result<()>;

    /// Store a batch of extracted snippets
    ///
    /// # Errors
    ///
    /// Returns an error if the batch cannot be persisted.
    async fn store_snippets(&self, snippets: Vec<Value>) -> anyhow::Result<()>;

    /// Store any other artifact as-is
    ///
    /// # Errors
    ///
    /// Returns an error if the artifact cannot be persisted.
    async fn store_artifact(&self, artifact: Artifact) -> anyhow::Result<()>;
}

/// Persistence for browser-session state reported with command results
#[async_trait]
pub trait SessionRegistry: Send + Sync {
    /// Record the latest state for a session lease
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be persisted.
    async fn update_session_state(&self, lease_id: &str, state: Value) -> anyhow::Result<()>;
}

/// Terminal sink for commands the pipeline cannot progress
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Publish a dead-letter record
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be published.
    async fn publish(&self, command: DeadLetterCommand) -> anyhow::Result<()>;
}

/// Side-channel for operator notifications outside the bus broadcast
#[async_trait]
pub trait InterventionNotifier: Send + Sync {
    /// Deliver a notice to whatever the host wired up (chat, pager, ...)
    ///
    /// # Errors
    ///
    /// Returns an error if the notice cannot be delivered.
    async fn notify(&self, notice: OperatorNotice) -> anyhow::Result<()>;
}

/// Route one artifact to the matching store method by its `type` label
///
/// `"facts"` and `"snippets"` are unwrapped into their element batches
/// (a non-array `data` becomes a batch of one); everything else is stored
/// verbatim.
///
/// # Errors
///
/// Returns whatever the underlying store returned.
pub async fn route_artifact(sink: &dyn ArtifactSink, artifact: Artifact) -> anyhow::Result<()> {
    match artifact.kind.as_str() {
        "facts" => sink.store_facts(into_batch(artifact.data)).await,
        "snippets" => sink.store_snippets(into_batch(artifact.data)).await,
        _ => sink.store_artifact(artifact).await,
    }
}

fn into_batch(data: Value) -> Vec<Value> {
    match data {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        other => vec![other],
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        facts: Mutex<Vec<Value>>,
        snippets: Mutex<Vec<Value>>,
        other: Mutex<Vec<Artifact>>,
    }

    #[async_trait]
    impl ArtifactSink for RecordingSink {
        async fn store_facts(&self, facts: Vec<Value>) -> anyhow::Result<()> {
            self.facts.lock().unwrap().extend(facts);
            Ok(())
        }

        async fn store_snippets(&self, snippets: Vec<Value>) -> anyhow::Result<()> {
            self.snippets.lock().unwrap().extend(snippets);
            Ok(())
        }

        async fn store_artifact(&self, artifact: Artifact) -> anyhow::Result<()> {
            self.other.lock().unwrap().push(artifact);
            Ok(())
        }
    }

    fn artifact(kind: &str, data: Value) -> Artifact {
        Artifact {
            kind: kind.to_string(),
            data,
            metadata: None,
        }
    }

    #[tokio::test]
    async fn test_facts_routed_as_batch() {
        let sink = RecordingSink::default();
        route_artifact(&sink, artifact("facts", json!([{"k": 1}, {"k": 2}])))
            .await
            .unwrap();

        assert_eq!(*sink.facts.lock().unwrap(), vec![json!({"k": 1}), json!({"k": 2})]);
        assert!(sink.other.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_single_fact_wrapped() {
        let sink = RecordingSink::default();
        route_artifact(&sink, artifact("facts", json!({"k": 1})))
            .await
            .unwrap();

        assert_eq!(*sink.facts.lock().unwrap(), vec![json!({"k": 1})]);
    }

    #[tokio::test]
    async fn test_unknown_kind_stored_verbatim() {
        let sink = RecordingSink::default();
        route_artifact(&sink, artifact("screenshot", json!("base64...")))
            .await
            .unwrap();

        assert!(sink.facts.lock().unwrap().is_empty());
        assert_eq!(sink.other.lock().unwrap().len(), 1);
        assert_eq!(sink.other.lock().unwrap()[0].kind, "screenshot");
    }
}
