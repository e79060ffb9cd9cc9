//! Subscriber setup and the flow-scoped event macros
//!
//! Every log line the orchestrator emits belongs to one of three flows:
//! traffic arriving from drones (`incoming!`), traffic leaving for drones
//! or operators (`outgoing!`), and the orchestrator's own lifecycle
//! (`internal!`). The flow name becomes the enclosing span, so a log
//! pipeline can split traffic by direction without parsing messages.

use tracing::metadata::LevelFilter;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Emit one event inside a named flow span; the directional macros all
/// route through here.
#[macro_export]
macro_rules! flow {
    ($flow:literal, $level:ident, $($arg:tt)+) => {{
        let span = $crate::tracing::span!(
            target: "apiary",
            $crate::tracing::Level::$level,
            $flow
        );
        let _guard = span.enter();
        $crate::tracing::event!(target: "apiary", $crate::tracing::Level::$level, $($arg)+)
    }};
}

/// Log traffic arriving from a drone or operator
#[macro_export]
macro_rules! incoming {
    (level = $level:ident, $($arg:tt)+) => {
        $crate::flow!("incoming", $level, $($arg)+)
    };

    ($($arg:tt)+) => {
        $crate::flow!("incoming", TRACE, $($arg)+)
    };
}

/// Log traffic leaving for a drone or operator
#[macro_export]
macro_rules! outgoing {
    (level = $level:ident, $($arg:tt)+) => {
        $crate::flow!("outgoing", $level, $($arg)+)
    };

    ($($arg:tt)+) => {
        $crate::flow!("outgoing", TRACE, $($arg)+)
    };
}

/// Log orchestrator lifecycle events
#[macro_export]
macro_rules! internal {
    (level = $level:ident, $($arg:tt)+) => {
        $crate::flow!("internal", $level, $($arg)+)
    };

    ($($arg:tt)+) => {
        $crate::flow!("internal", TRACE, $($arg)+)
    };
}

/// Install the global subscriber
///
/// A `RUST_LOG` directive set wins outright. Otherwise only `apiary`
/// targets are logged, at the level `LOG_LEVEL` names (debug builds
/// default to `debug`, release builds to `info`).
pub fn init() {
    let filter = std::env::var("RUST_LOG").map_or_else(
        |_| EnvFilter::new(format!("apiary={}", default_level())),
        EnvFilter::new,
    );

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .compact()
                .with_target(false)
                .with_timer(fmt::time::uptime()),
        )
        .init();
}

fn default_level() -> LevelFilter {
    std::env::var("LOG_LEVEL")
        .ok()
        .and_then(|raw| raw.parse::<LevelFilter>().ok())
        .unwrap_or(if cfg!(debug_assertions) {
            LevelFilter::DEBUG
        } else {
            LevelFilter::INFO
        })
}
