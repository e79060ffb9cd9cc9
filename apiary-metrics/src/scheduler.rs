//! Dispatch pipeline metrics
//!
//! Tracks tasks through the pipeline:
//! - Submission, per-drone routing, dispatch, requeue counts
//! - Command lifecycle outcomes (ack, ack timeout, complete, fail)
//! - Persona-missing retry activity
//! - Queue lengths (global ready queue and per-drone queues)

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use dashmap::DashMap;
use opentelemetry::{
    KeyValue,
    metrics::Counter,
};

use crate::{MetricsError, meter};

/// Dispatch pipeline metrics collector
#[derive(Debug)]
pub struct SchedulerMetrics {
    /// Tasks accepted by the submission endpoint
    tasks_enqueued: Counter<u64>,

    /// Tasks routed onto a per-drone queue, by drone
    tasks_queued: Counter<u64>,

    /// Commands published to a drone, by drone
    tasks_dispatched: Counter<u64>,

    /// Tasks sent back to the ready queue for another pass
    tasks_requeued: Counter<u64>,

    /// Commands that produced no acknowledgement in time, by drone
    commands_ack_timeout: Counter<u64>,

    /// Commands acknowledged, by drone
    commands_acknowledged: Counter<u64>,

    /// Commands completed, by drone
    commands_completed: Counter<u64>,

    /// Commands failed, by drone
    commands_failed: Counter<u64>,

    /// Persona-missing retries scheduled
    persona_retry: Counter<u64>,

    /// Tasks dead-lettered after exhausting persona retries
    persona_failed: Counter<u64>,

    /// Persona retries whose due time arrived and re-entered the ready queue
    persona_requeued: Counter<u64>,

    /// Ready-queue length (read by an observable gauge)
    queue_global_length: Arc<AtomicU64>,

    /// Per-drone queue lengths (read by an observable gauge)
    queue_per_drone_length: Arc<DashMap<String, u64>>,
}

impl SchedulerMetrics {
    /// Create a new dispatch pipeline metrics collector
    ///
    /// # Errors
    ///
    /// Returns an error if metric instruments cannot be created.
    pub fn new() -> Result<Self, MetricsError> {
        let meter = meter();

        let tasks_enqueued = meter
            .u64_counter("apiary.scheduler.tasks.enqueued.total")
            .with_description("Tasks accepted by the submission endpoint")
            .build();

        let tasks_queued = meter
            .u64_counter("apiary.scheduler.tasks.queued.total")
            .with_description("Tasks routed onto a per-drone queue")
            .build();

        let tasks_dispatched = meter
            .u64_counter("apiary.scheduler.tasks.dispatched.total")
            .with_description("Commands published to a drone")
            .build();

        let tasks_requeued = meter
            .u64_counter("apiary.scheduler.tasks.requeued.total")
            .with_description("Tasks sent back to the ready queue")
            .build();

        let commands_ack_timeout = meter
            .u64_counter("apiary.scheduler.commands.ack_timeout.total")
            .with_description("Commands that produced no acknowledgement in time")
            .build();

        let commands_acknowledged = meter
            .u64_counter("apiary.scheduler.commands.acknowledged.total")
            .with_description("Commands acknowledged by a drone")
            .build();

        let commands_completed = meter
            .u64_counter("apiary.scheduler.commands.completed.total")
            .with_description("Commands reported complete by a drone")
            .build();

        let commands_failed = meter
            .u64_counter("apiary.scheduler.commands.failed.total")
            .with_description("Commands that reached a failure terminal state")
            .build();

        let persona_retry = meter
            .u64_counter("apiary.scheduler.tasks.persona_missing.retry.total")
            .with_description("Persona-missing retries scheduled")
            .build();

        let persona_failed = meter
            .u64_counter("apiary.scheduler.tasks.persona_missing.failed.total")
            .with_description("Tasks dead-lettered after exhausting persona retries")
            .build();

        let persona_requeued = meter
            .u64_counter("apiary.scheduler.tasks.persona_missing.requeued.total")
            .with_description("Persona retries that re-entered the ready queue")
            .build();

        // Queue lengths are sampled by the metrics reporter; observable
        // gauges read the sampled values from shared state.
        let queue_global_ref = Arc::new(AtomicU64::new(0));
        let global_clone = queue_global_ref.clone();
        meter
            .u64_observable_gauge("apiary.scheduler.queue.global.length")
            .with_description("Current ready-queue length")
            .with_callback(move |observer| {
                observer.observe(global_clone.load(Ordering::Relaxed), &[]);
            })
            .build();

        let per_drone_ref: Arc<DashMap<String, u64>> = Arc::new(DashMap::new());
        let per_drone_clone = per_drone_ref.clone();
        meter
            .u64_observable_gauge("apiary.scheduler.queue.per_drone.length")
            .with_description("Current per-drone queue lengths")
            .with_callback(move |observer| {
                for entry in per_drone_clone.iter() {
                    observer.observe(
                        *entry.value(),
                        &[KeyValue::new("drone_id", entry.key().clone())],
                    );
                }
            })
            .build();

        Ok(Self {
            tasks_enqueued,
            tasks_queued,
            tasks_dispatched,
            tasks_requeued,
            commands_ack_timeout,
            commands_acknowledged,
            commands_completed,
            commands_failed,
            persona_retry,
            persona_failed,
            persona_requeued,
            queue_global_length: queue_global_ref,
            queue_per_drone_length: per_drone_ref,
        })
    }

    pub fn record_enqueued(&self) {
        self.tasks_enqueued.add(1, &[]);
    }

    pub fn record_queued(&self, drone_id: &str) {
        self.tasks_queued.add(1, &[drone_attr(drone_id)]);
    }

    pub fn record_dispatched(&self, drone_id: &str) {
        self.tasks_dispatched.add(1, &[drone_attr(drone_id)]);
    }

    pub fn record_requeued(&self) {
        self.tasks_requeued.add(1, &[]);
    }

    pub fn record_ack_timeout(&self, drone_id: &str) {
        self.commands_ack_timeout.add(1, &[drone_attr(drone_id)]);
    }

    pub fn record_acknowledged(&self, drone_id: &str) {
        self.commands_acknowledged.add(1, &[drone_attr(drone_id)]);
    }

    pub fn record_completed(&self, drone_id: &str) {
        self.commands_completed.add(1, &[drone_attr(drone_id)]);
    }

    pub fn record_failed(&self, drone_id: &str) {
        self.commands_failed.add(1, &[drone_attr(drone_id)]);
    }

    pub fn record_persona_retry(&self) {
        self.persona_retry.add(1, &[]);
    }

    pub fn record_persona_failed(&self) {
        self.persona_failed.add(1, &[]);
    }

    pub fn record_persona_requeued(&self) {
        self.persona_requeued.add(1, &[]);
    }

    /// Update the sampled ready-queue length
    pub fn set_global_queue_length(&self, length: u64) {
        self.queue_global_length.store(length, Ordering::Relaxed);
    }

    /// Update the sampled length of one drone's queue
    pub fn set_drone_queue_length(&self, drone_id: &str, length: u64) {
        self.queue_per_drone_length
            .insert(drone_id.to_string(), length);
    }

    /// Stop reporting a drone's queue after teardown
    pub fn drop_drone_queue(&self, drone_id: &str) {
        self.queue_per_drone_length.remove(drone_id);
    }
}

fn drone_attr(drone_id: &str) -> KeyValue {
    KeyValue::new("drone_id", drone_id.to_string())
}
