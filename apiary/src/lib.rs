//! Host composition for the apiary drone orchestrator

pub mod config;
pub mod orchestrator;
pub mod standalone;

pub use config::{OrchestratorConfig, ServerConfig, find_config_file};
pub use orchestrator::{BrowserServices, Orchestrator, SHUTDOWN_BROADCAST};
pub use tracing;
