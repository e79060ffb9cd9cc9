//! Contracts to the drone-side browser
//!
//! The concrete controller and executor live with the transport; the
//! manager only needs these seams.

use async_trait::async_trait;
use serde_json::Value;

use apiary_bus::CommandPayload;

/// Browser-level access used while a session is set up and torn down
#[async_trait]
pub trait BrowserController: Send + Sync {
    /// Capture a screenshot, returning where it was stored
    ///
    /// # Errors
    ///
    /// Returns an error if the capture fails; the session continues
    /// without a screenshot.
    async fn screenshot(&self) -> anyhow::Result<String>;

    /// The page URL at the moment of the call
    async fn current_url(&self) -> Option<String>;

    /// A DOM summary for the operator's context panel
    async fn dom_context(&self) -> Value;

    /// Enable or disable direct operator interaction with the browser
    async fn set_operator_interaction(&self, enabled: bool);
}

/// Executes commands on the drone (operator steps and the resume replay)
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Execute a command and return its result payload
    ///
    /// # Errors
    ///
    /// Returns an error if execution fails.
    async fn execute(&self, command: CommandPayload) -> anyhow::Result<Value>;
}
