//! Task dispatch pipeline for the apiary drone orchestrator
//!
//! A single orchestrator instance owns all state here; nothing survives a
//! crash and nothing is coordinated across nodes. The pipeline is:
//!
//! ```text
//! submit → ready queue → drone selection → per-drone queue → worker
//!        → pacing token → domain lease → persona → publish → tracker
//! ```
//!
//! Acknowledgements, results and errors come back over the bus and drive
//! the [`tracker::CommandLifecycleTracker`], which releases the pacing
//! token and domain lease exactly once per command.

pub mod error;
pub mod events;
pub mod limiter;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod tracker;

pub use error::DispatchError;
pub use limiter::{DenyReason, DomainLease, DomainLimiter, LimitConfig};
pub use registry::{DroneInfo, DroneRegistry, DroneStatus};
pub use scheduler::{ExternalServices, Scheduler, SchedulerConfig};
pub use tracker::{AckResult, CommandLifecycleTracker, TrackerError};
