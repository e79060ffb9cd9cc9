//! Message bus contracts for the apiary drone orchestrator
//!
//! The orchestrator talks to the outside world through a group-based
//! pub/sub bus and a handful of outbound sinks. This crate defines the
//! payload types that cross the bus and the traits the host wires concrete
//! implementations into; it contains no transport code of its own.

pub mod payload;
pub mod sink;
pub mod transport;

pub use payload::{
    Artifact, CommandErrorPayload, CommandPayload, CommandResultPayload, DeadLetterCommand,
    DroneMessage, DroneRegistrationPayload, HubMessage, InterventionPayload, OperatorMessage,
    OperatorNotice, QueryPayload, QueryResponsePayload, StatusPayload,
};
pub use sink::{
    ArtifactSink, DeadLetterSink, InterventionNotifier, Persona, PersonaStore, SessionRegistry,
    route_artifact,
};
pub use transport::{OPERATORS_GROUP, Transport, TransportError, api_key_matches, drone_group};
