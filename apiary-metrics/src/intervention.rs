//! Intervention session metrics

use opentelemetry::{
    KeyValue,
    metrics::{Counter, Histogram},
};

use crate::{MetricsError, meter};

/// Intervention session metrics collector
#[derive(Debug)]
pub struct InterventionMetrics {
    /// Sessions started, by reason
    interventions_total: Counter<u64>,

    /// Distribution of session durations, in milliseconds
    window_ms: Histogram<f64>,

    /// Sessions ended by the window timer
    timeouts: Counter<u64>,

    /// Sessions ended by the step timer
    step_timeouts: Counter<u64>,
}

impl InterventionMetrics {
    /// Create a new intervention metrics collector
    ///
    /// # Errors
    ///
    /// Returns an error if metric instruments cannot be created.
    pub fn new() -> Result<Self, MetricsError> {
        let meter = meter();

        let interventions_total = meter
            .u64_counter("apiary.intervention.sessions.total")
            .with_description("Intervention sessions started, by reason")
            .build();

        let window_ms = meter
            .f64_histogram("apiary.intervention.window.milliseconds")
            .with_description("Distribution of intervention session durations")
            .build();

        let timeouts = meter
            .u64_counter("apiary.intervention.timeouts.total")
            .with_description("Intervention sessions ended by the window timer")
            .build();

        let step_timeouts = meter
            .u64_counter("apiary.intervention.step_timeouts.total")
            .with_description("Intervention sessions ended by the step timer")
            .build();

        Ok(Self {
            interventions_total,
            window_ms,
            timeouts,
            step_timeouts,
        })
    }

    pub fn record_started(&self, reason: &str) {
        self.interventions_total
            .add(1, &[KeyValue::new("reason", reason.to_string())]);
    }

    pub fn record_window(&self, duration_ms: f64) {
        self.window_ms.record(duration_ms, &[]);
    }

    pub fn record_timeout(&self) {
        self.timeouts.add(1, &[]);
    }

    pub fn record_step_timeout(&self) {
        self.step_timeouts.add(1, &[]);
    }
}
