//! Host configuration
//!
//! One RON file configures every subsystem. Lookup precedence:
//! 1. `APIARY_CONFIG` environment variable
//! 2. `./apiary.config.ron`
//! 3. `/etc/apiary/apiary.config.ron`

use serde::Deserialize;

use apiary_intervention::InterventionConfig;
use apiary_metrics::MetricsConfig;
use apiary_scheduler::{LimitConfig, SchedulerConfig};

/// Server-level settings
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerConfig {
    /// Key every drone connection must present in `X-API-Key`; the
    /// transport refuses connections that do not match
    #[serde(default)]
    pub api_key: String,
}

/// Everything the orchestrator reads at startup
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(alias = "scheduler", default)]
    pub scheduler: SchedulerConfig,

    #[serde(alias = "limits", default)]
    pub limits: LimitConfig,

    #[serde(alias = "intervention", default)]
    pub intervention: InterventionConfig,

    #[serde(alias = "metrics", default)]
    pub metrics: MetricsConfig,

    #[serde(alias = "server", default)]
    pub server: ServerConfig,
}

/// Find the configuration file using the documented precedence
///
/// # Errors
///
/// Returns an error if `APIARY_CONFIG` points at a missing file, or no
/// file exists at any default location.
pub fn find_config_file() -> anyhow::Result<std::path::PathBuf> {
    if let Ok(env_path) = std::env::var("APIARY_CONFIG") {
        let path = std::path::PathBuf::from(env_path);
        if path.exists() {
            return Ok(path);
        }
        anyhow::bail!(
            "APIARY_CONFIG points to non-existent file: {}",
            path.display()
        );
    }

    let default_paths = vec![
        std::path::PathBuf::from("./apiary.config.ron"),
        std::path::PathBuf::from("/etc/apiary/apiary.config.ron"),
    ];

    for path in &default_paths {
        if path.exists() {
            return Ok(path.clone());
        }
    }

    let paths_tried = default_paths
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");

    anyhow::bail!(
        "No configuration file found. Tried:\n  - APIARY_CONFIG environment variable\n{paths_tried}"
    )
}

/// Load configuration from the resolved file
///
/// # Errors
///
/// Returns an error if no file is found or it does not parse.
pub fn load() -> anyhow::Result<OrchestratorConfig> {
    let path = find_config_file()?;
    let contents = std::fs::read_to_string(&path)
        .map_err(|e| anyhow::anyhow!("Failed to read config from {}: {}", path.display(), e))?;
    Ok(ron::from_str(&contents)?)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: OrchestratorConfig = ron::from_str("()").unwrap();
        assert_eq!(config.scheduler.ready_queue_capacity, 1000);
        assert_eq!(config.scheduler.per_drone_queue_capacity, 10);
        assert_eq!(config.limits.max_concurrent_sessions, 25);
        assert_eq!(config.intervention.window_ttl_secs, 120);
        assert!(config.server.api_key.is_empty());
    }

    #[test]
    fn test_partial_config_overrides() {
        let config: OrchestratorConfig = ron::from_str(
            r#"(
                scheduler: (
                    ack_timeout_secs: 5,
                ),
                limits: (
                    qps_per_drone: 4.0,
                ),
                server: (
                    api_key: "hive-key",
                ),
            )"#,
        )
        .unwrap();

        assert_eq!(config.scheduler.ack_timeout_secs, 5);
        assert_eq!(config.scheduler.heartbeat_expect_secs, 30);
        assert!((config.limits.qps_per_drone - 4.0).abs() < f64::EPSILON);
        assert_eq!(config.server.api_key, "hive-key");
    }
}
