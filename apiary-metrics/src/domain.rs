//! Domain limiter metrics

use opentelemetry::{KeyValue, metrics::UpDownCounter};

use crate::{MetricsError, meter};

/// Domain limiter metrics collector
#[derive(Debug)]
pub struct DomainMetrics {
    /// Number of currently held domain leases, by registrable domain
    sessions_active: UpDownCounter<i64>,
}

impl DomainMetrics {
    /// Create a new domain limiter metrics collector
    ///
    /// # Errors
    ///
    /// Returns an error if metric instruments cannot be created.
    pub fn new() -> Result<Self, MetricsError> {
        let sessions_active = meter()
            .i64_up_down_counter("apiary.domain.sessions.active")
            .with_description("Number of currently held domain leases")
            .build();

        Ok(Self { sessions_active })
    }

    pub fn record_lease_acquired(&self, domain: &str) {
        self.sessions_active
            .add(1, &[KeyValue::new("domain", domain.to_string())]);
    }

    pub fn record_lease_released(&self, domain: &str) {
        self.sessions_active
            .add(-1, &[KeyValue::new("domain", domain.to_string())]);
    }
}
