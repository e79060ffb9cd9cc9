#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

#[cfg(not(any(target_os = "macos", unix)))]
compile_error!("Only macos and unix are currently supported");

use std::sync::Arc;

use apiary::{BrowserServices, Orchestrator};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = apiary::config::load()?;

    let orchestrator = Orchestrator::new(
        config,
        apiary::standalone::services(),
        BrowserServices {
            controller: Arc::new(apiary::standalone::HeadlessBrowser),
            executor: Arc::new(apiary::standalone::LogExecutor),
        },
    );

    orchestrator.run().await
}
