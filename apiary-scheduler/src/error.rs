//! Typed error handling for dispatch operations.
//!
//! The dispatch loop never propagates errors upward; each variant maps to
//! a requeue policy:
//! - Soft, per-drone: the task goes back on the same drone's queue
//! - Soft, ready: the task goes back on the ready queue
//! - Backoff: the task enters the persona retry queue
//! - Drop: the task cannot be progressed on this path

use thiserror::Error;

use apiary_bus::TransportError;

use crate::limiter::DenyReason;

/// Reasons a single dispatch attempt did not publish a command.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The drone's pacing token is held by an in-flight command.
    #[error("No pacing token available")]
    PacingBusy,

    /// The drone vanished from the registry between selection and dispatch.
    #[error("Drone not registered")]
    DroneMissing,

    /// The drone is not idle; someone else got there first.
    #[error("Drone not idle")]
    DroneNotIdle,

    /// The domain limiter denied a lease.
    #[error("Domain lease denied: {0}")]
    DomainDenied(DenyReason),

    /// The persona store has no persona under the task's id.
    #[error("Persona not found: {0}")]
    PersonaMissing(String),

    /// The persona store itself failed.
    #[error("Persona store error: {0}")]
    PersonaStore(String),

    /// The bus rejected the publish.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// A command with this id is already in flight.
    #[error("Command already tracked: {0}")]
    AlreadyTracked(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = DispatchError::DomainDenied(DenyReason::Cooldown);
        assert_eq!(error.to_string(), "Domain lease denied: cooldown");

        let error = DispatchError::PersonaMissing("p1".to_string());
        assert_eq!(error.to_string(), "Persona not found: p1");
    }
}
