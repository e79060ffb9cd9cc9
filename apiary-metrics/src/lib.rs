//! OpenTelemetry metrics for the apiary drone orchestrator
//!
//! This crate provides observability instrumentation using OpenTelemetry.
//! It exports metrics via OTLP to an OpenTelemetry Collector, which can
//! expose them in Prometheus format for scraping.
//!
//! # Features
//!
//! - **Scheduler metrics**: queue lengths, dispatch/requeue counts, command
//!   lifecycle outcomes, persona-retry activity
//! - **Domain metrics**: active leases per registrable domain
//! - **Intervention metrics**: session counts, durations, timeouts
//! - **OTLP export**: push metrics to an OpenTelemetry Collector
//!
//! # Usage
//!
//! ```rust,no_run
//! use apiary_metrics::{MetricsConfig, init_metrics};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = MetricsConfig {
//!     enabled: true,
//!     endpoint: "http://localhost:4318/v1/metrics".to_string(),
//! };
//!
//! init_metrics(&config)?;
//! # Ok(())
//! # }
//! ```
//!
//! Components hold their own instrument containers
//! ([`SchedulerMetrics`], [`DomainMetrics`], [`InterventionMetrics`]);
//! instruments built before `init_metrics` runs record into a no-op meter,
//! so construction order never matters in tests.

mod config;
mod domain;
mod error;
mod intervention;
mod scheduler;

pub use config::MetricsConfig;
pub use domain::DomainMetrics;
pub use error::MetricsError;
pub use intervention::InterventionMetrics;
use once_cell::sync::OnceCell;
use opentelemetry::metrics::Meter;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
pub use scheduler::SchedulerMetrics;

/// Global metrics instance
static METRICS_INSTANCE: OnceCell<Metrics> = OnceCell::new();

/// Root metrics container
#[derive(Debug)]
pub struct Metrics {
    pub scheduler: SchedulerMetrics,
    pub domain: DomainMetrics,
    pub intervention: InterventionMetrics,
}

/// The meter every apiary instrument is created from
#[must_use]
pub fn meter() -> Meter {
    opentelemetry::global::meter("apiary")
}

/// Initialize the metrics system
///
/// This must be called once at startup before any metrics are recorded.
/// If metrics are disabled in the config, this is a no-op.
///
/// # Errors
///
/// Returns an error if metrics initialization fails or if called multiple
/// times.
pub fn init_metrics(config: &MetricsConfig) -> Result<(), MetricsError> {
    if !config.enabled {
        tracing::info!("Metrics collection is disabled");
        return Ok(());
    }

    tracing::info!(
        endpoint = %config.endpoint,
        "Initializing OpenTelemetry metrics with OTLP exporter"
    );

    install_otlp_provider(&config.endpoint)?;

    let metrics = Metrics {
        scheduler: SchedulerMetrics::new()?,
        domain: DomainMetrics::new()?,
        intervention: InterventionMetrics::new()?,
    };

    METRICS_INSTANCE
        .set(metrics)
        .map_err(|_| MetricsError::AlreadyInitialized)?;

    tracing::info!("Metrics collection initialized successfully");

    Ok(())
}

/// Build the OTLP push pipeline and install it as the process-wide meter
/// provider. Metrics flow to a Collector over HTTP, which exposes them
/// for Prometheus to scrape.
fn install_otlp_provider(endpoint: &str) -> Result<(), MetricsError> {
    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_http()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| MetricsError::OpenTelemetry(e.to_string()))?;

    opentelemetry::global::set_meter_provider(
        SdkMeterProvider::builder()
            .with_reader(PeriodicReader::builder(exporter).build())
            .build(),
    );

    Ok(())
}

/// Get a reference to the global metrics instance, if initialized
#[must_use]
pub fn try_metrics() -> Option<&'static Metrics> {
    METRICS_INSTANCE.get()
}

/// Check if metrics are enabled
#[must_use]
pub fn is_enabled() -> bool {
    METRICS_INSTANCE.get().is_some()
}
