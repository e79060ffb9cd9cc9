//! Operator intervention sessions
//!
//! An intervention pauses automated execution on a drone so a human
//! operator can drive the browser directly. At most one session is active
//! at any time. While active, only whitelisted commands tagged for the
//! session are executed; on resume the stored replayable action re-runs
//! and normal dispatch continues. Window and step timers bound how long a
//! session (and a silence inside it) may last.

pub mod context;
pub mod manager;
pub mod rules;
pub mod traits;
pub mod whitelist;

pub use context::{InterventionContext, InterventionStep};
pub use manager::{
    CommandOutcome, InterventionConfig, InterventionError, InterventionManager, ResumeOptions,
    ResumeReport,
};
pub use rules::check_for_intervention;
pub use traits::{BrowserController, CommandExecutor};
