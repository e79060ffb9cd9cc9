//! Transport seam between the orchestrator and the message bus
//!
//! The concrete bus (and the drone registration/auth handshake riding on
//! it) lives in the host process. The orchestrator only needs group
//! publishing, so that is all the trait exposes.

use async_trait::async_trait;
use thiserror::Error;

use crate::payload::{HubMessage, OperatorMessage};

/// Group every operator-facing broadcast goes to
pub const OPERATORS_GROUP: &str = "operators";

/// Group a drone subscribes to for its own commands
#[must_use]
pub fn drone_group(drone_id: &str) -> String {
    format!("drone_{drone_id}")
}

/// Errors surfaced by a transport implementation
#[derive(Debug, Error)]
pub enum TransportError {
    /// A publish did not reach the bus
    #[error("Publish failed: {0}")]
    Publish(String),

    /// The connection to the bus is gone
    #[error("Transport closed")]
    Closed,
}

/// Group-based pub/sub publisher
///
/// Delivery is at-least-once; the lifecycle tracker tolerates duplicate
/// acknowledgements and results, so implementations do not need to
/// de-duplicate.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Publish a message to `drone_{drone_id}`
    ///
    /// # Errors
    ///
    /// Returns an error if the message cannot be handed to the bus.
    async fn publish_to_drone(
        &self,
        drone_id: &str,
        message: HubMessage,
    ) -> Result<(), TransportError>;

    /// Broadcast a message to the operators group
    ///
    /// # Errors
    ///
    /// Returns an error if the message cannot be handed to the bus.
    async fn publish_to_operators(&self, message: OperatorMessage) -> Result<(), TransportError>;
}

/// Check a presented `X-API-Key` header against the configured server key
///
/// Transports call this while accepting a connection; a mismatch (or a
/// missing header) refuses the connection.
#[must_use]
pub fn api_key_matches(configured: &str, presented: Option<&str>) -> bool {
    presented.is_some_and(|key| key == configured)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drone_group() {
        assert_eq!(drone_group("d1"), "drone_d1");
    }

    #[test]
    fn test_api_key_matches() {
        assert!(api_key_matches("secret", Some("secret")));
        assert!(!api_key_matches("secret", Some("wrong")));
        assert!(!api_key_matches("secret", None));
        assert!(!api_key_matches("secret", Some("")));
    }
}
