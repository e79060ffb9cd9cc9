//! Top-level controller
//!
//! Owns the shutdown broadcast, wires the scheduler and the intervention
//! manager to the host-provided collaborators, and runs everything under
//! one `select` until a signal arrives.

use std::sync::{Arc, LazyLock};

use tokio::sync::broadcast;

use apiary_common::{Signal, internal, logging};
use apiary_intervention::{BrowserController, CommandExecutor, InterventionManager};
use apiary_scheduler::{ExternalServices, Scheduler};

use crate::config::OrchestratorConfig;

/// Process-wide shutdown channel; every subsystem subscribes
pub static SHUTDOWN_BROADCAST: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

async fn shutdown() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!(level = INFO, "CTRL+C entered -- Enter it again to force shutdown");
        }
        _ = terminate.recv() => {
            internal!(level = INFO, "Terminate signal received, shutting down");
        }
    };

    let mut receiver = SHUTDOWN_BROADCAST.subscribe();

    SHUTDOWN_BROADCAST
        .send(Signal::Shutdown)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Interrupted, e.to_string()))?;

    loop {
        tokio::select! {
            sig = receiver.recv() => {
                match sig {
                    Ok(s) => tracing::debug!("Received {s:?}"),
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(e) => tracing::debug!("Received: {e:?}"),
                }
            }

            _ = tokio::signal::ctrl_c() => {
                break;
            }
        }
    }

    Ok(())
}

/// Drone-side collaborators for the intervention manager
pub struct BrowserServices {
    pub controller: Arc<dyn BrowserController>,
    pub executor: Arc<dyn CommandExecutor>,
}

/// The orchestrator: configuration plus the collaborators the host wired
pub struct Orchestrator {
    config: OrchestratorConfig,
    scheduler: Scheduler,
    interventions: Arc<InterventionManager>,
}

impl Orchestrator {
    /// Compose the subsystems from configuration and host collaborators
    ///
    /// Logging and metrics come up first so every instrument the
    /// subsystems create binds to the installed meter provider.
    #[must_use]
    pub fn new(
        config: OrchestratorConfig,
        services: ExternalServices,
        browser: BrowserServices,
    ) -> Self {
        logging::init();

        if let Err(e) = apiary_metrics::init_metrics(&config.metrics) {
            tracing::warn!(error = %e, "Metrics disabled");
        }

        let interventions = InterventionManager::new(
            config.intervention.clone(),
            browser.controller,
            browser.executor,
            services.notifier.clone(),
        );

        let scheduler = Scheduler::new(
            config.scheduler.clone(),
            config.limits.clone(),
            services,
        );

        Self {
            config,
            scheduler,
            interventions,
        }
    }

    /// The dispatch pipeline, for the host's submission and bus surfaces
    #[must_use]
    pub fn scheduler(&self) -> Scheduler {
        self.scheduler.clone()
    }

    /// The intervention manager, for the host's operator surface
    #[must_use]
    pub fn interventions(&self) -> Arc<InterventionManager> {
        self.interventions.clone()
    }

    /// The loaded configuration (the transport reads `server.api_key`)
    #[must_use]
    pub const fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Run until a shutdown signal
    ///
    /// # Errors
    ///
    /// Returns an error if signal installation fails.
    pub async fn run(self) -> anyhow::Result<()> {
        internal!(level = INFO, "Orchestrator running");

        let ret = tokio::select! {
            r = self.scheduler.serve(SHUTDOWN_BROADCAST.subscribe()) => {
                r
            }
            r = shutdown() => {
                r
            }
        };

        internal!(level = INFO, "Shutting down...");

        ret
    }
}
