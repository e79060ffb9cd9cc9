pub mod domain;
pub mod logging;
pub mod params;
pub mod suffix;
pub mod task;

pub use domain::Domain;
pub use suffix::PublicSuffixIndex;
pub use task::{Priority, SessionRef, Task};
pub use tracing;

/// Broadcast payload for orchestrator-wide shutdown.
#[derive(Debug, Clone, Copy)]
pub enum Signal {
    Shutdown,
    Finalised,
}
