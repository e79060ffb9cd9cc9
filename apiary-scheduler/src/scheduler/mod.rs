//! The scheduler: validation, routing, drone selection and the worker
//! fleet around the per-drone queues
//!
//! One reader drains the ready queue and routes each task to the best
//! eligible drone's queue. One dedicated worker per drone runs the
//! dispatch sequence; a supervisor restarts a crashed worker while its
//! queue is open. Sibling fibers run the persona retry timer, the
//! heartbeat monitor, the limiter sweeper and the queue-length reporter,
//! all racing one shutdown receiver.

mod dispatch;

use std::{
    cmp::Ordering,
    collections::HashSet,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering as AtomicOrdering},
    },
    time::Duration,
};

use dashmap::DashMap;
use serde::Deserialize;
use tokio::sync::broadcast;

use apiary_bus::{
    ArtifactSink, DeadLetterSink, HubMessage, InterventionNotifier, PersonaStore, QueryPayload,
    SessionRegistry, Transport,
};
use apiary_common::{PublicSuffixIndex, Signal, Task, internal};
use apiary_metrics::SchedulerMetrics;

use crate::{
    limiter::{DomainLimiter, LimitConfig},
    queue::{QueueClosed, drone::DroneQueue, ready::PriorityReadyQueue, retry::RetryQueue},
    registry::{DroneInfo, DroneRegistry},
    tracker::CommandLifecycleTracker,
};

/// Delay before retrying a task that found no eligible drone, and before
/// re-offering a task whose domain lease was denied.
const SOFT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// How often the queue-length reporter samples.
const METRICS_SAMPLE_INTERVAL: Duration = Duration::from_secs(10);

/// Scheduling configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Ready-queue capacity
    #[serde(default = "default_ready_queue_capacity")]
    pub ready_queue_capacity: usize,

    /// Per-drone queue capacity
    #[serde(default = "default_per_drone_queue_capacity")]
    pub per_drone_queue_capacity: usize,

    /// Pacing-token permits per drone
    #[serde(default = "default_max_in_flight_per_drone")]
    pub max_in_flight_per_drone: usize,

    /// How long a published command may wait for its acknowledgement
    #[serde(default = "default_ack_timeout_secs")]
    pub ack_timeout_secs: u64,

    /// Expected heartbeat interval from a drone
    #[serde(default = "default_heartbeat_expect_secs")]
    pub heartbeat_expect_secs: u64,

    /// Silence beyond the heartbeat expectation tolerated before a drone
    /// is treated as disconnected
    #[serde(default = "default_disconnect_grace_secs")]
    pub disconnect_grace_secs: u64,

    /// Pause between dispatch attempts when the pacing token is busy
    #[serde(default = "default_dispatch_loop_delay_ms")]
    pub dispatch_loop_delay_ms: u64,

    /// Persona-missing retries before dead-lettering
    #[serde(default = "default_persona_missing_max_retries")]
    pub persona_missing_max_retries: u32,

    /// Base delay for persona-missing backoff
    #[serde(default = "default_persona_missing_base_delay_secs")]
    pub persona_missing_base_delay_secs: u64,

    /// Backoff cap for persona-missing retries
    #[serde(default = "default_persona_missing_max_backoff_secs")]
    pub persona_missing_max_backoff_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            ready_queue_capacity: default_ready_queue_capacity(),
            per_drone_queue_capacity: default_per_drone_queue_capacity(),
            max_in_flight_per_drone: default_max_in_flight_per_drone(),
            ack_timeout_secs: default_ack_timeout_secs(),
            heartbeat_expect_secs: default_heartbeat_expect_secs(),
            disconnect_grace_secs: default_disconnect_grace_secs(),
            dispatch_loop_delay_ms: default_dispatch_loop_delay_ms(),
            persona_missing_max_retries: default_persona_missing_max_retries(),
            persona_missing_base_delay_secs: default_persona_missing_base_delay_secs(),
            persona_missing_max_backoff_secs: default_persona_missing_max_backoff_secs(),
        }
    }
}

const fn default_ready_queue_capacity() -> usize {
    1000
}

const fn default_per_drone_queue_capacity() -> usize {
    10
}

const fn default_max_in_flight_per_drone() -> usize {
    1
}

const fn default_ack_timeout_secs() -> u64 {
    20
}

const fn default_heartbeat_expect_secs() -> u64 {
    30
}

const fn default_disconnect_grace_secs() -> u64 {
    60
}

const fn default_dispatch_loop_delay_ms() -> u64 {
    100
}

const fn default_persona_missing_max_retries() -> u32 {
    5
}

const fn default_persona_missing_base_delay_secs() -> u64 {
    5
}

const fn default_persona_missing_max_backoff_secs() -> u64 {
    120
}

/// External collaborators the host wires in
pub struct ExternalServices {
    pub transport: Arc<dyn Transport>,
    pub personas: Arc<dyn PersonaStore>,
    pub artifacts: Arc<dyn ArtifactSink>,
    pub sessions: Arc<dyn SessionRegistry>,
    pub dead_letters: Arc<dyn DeadLetterSink>,
    pub notifier: Arc<dyn InterventionNotifier>,
    pub suffixes: Arc<PublicSuffixIndex>,
}

pub(crate) struct Inner {
    pub(crate) config: SchedulerConfig,
    pub(crate) ready: PriorityReadyQueue,
    pub(crate) queues: DashMap<String, Arc<DroneQueue>>,
    pub(crate) registry: Arc<DroneRegistry>,
    pub(crate) limiter: Arc<DomainLimiter>,
    pub(crate) tracker: Arc<CommandLifecycleTracker>,
    pub(crate) retries: RetryQueue,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) personas: Arc<dyn PersonaStore>,
    pub(crate) artifacts: Arc<dyn ArtifactSink>,
    pub(crate) sessions: Arc<dyn SessionRegistry>,
    pub(crate) dead_letters: Arc<dyn DeadLetterSink>,
    pub(crate) notifier: Arc<dyn InterventionNotifier>,
    pub(crate) suffixes: Arc<PublicSuffixIndex>,
    pub(crate) metrics: Option<Arc<SchedulerMetrics>>,
    pub(crate) stopping: AtomicBool,
}

/// Task dispatch scheduler
#[derive(Clone)]
pub struct Scheduler {
    pub(crate) inner: Arc<Inner>,
}

impl Scheduler {
    #[must_use]
    pub fn new(config: SchedulerConfig, limits: LimitConfig, services: ExternalServices) -> Self {
        let metrics = match SchedulerMetrics::new() {
            Ok(metrics) => Some(Arc::new(metrics)),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to initialize scheduler metrics");
                None
            }
        };

        let registry = Arc::new(DroneRegistry::new(config.max_in_flight_per_drone));
        let limiter = Arc::new(DomainLimiter::new(limits));
        let tracker = Arc::new(CommandLifecycleTracker::new(metrics.clone()));
        let ready = PriorityReadyQueue::new(config.ready_queue_capacity);

        Self {
            inner: Arc::new(Inner {
                config,
                ready,
                queues: DashMap::new(),
                registry,
                limiter,
                tracker,
                retries: RetryQueue::new(),
                transport: services.transport,
                personas: services.personas,
                artifacts: services.artifacts,
                sessions: services.sessions,
                dead_letters: services.dead_letters,
                notifier: services.notifier,
                suffixes: services.suffixes,
                metrics,
                stopping: AtomicBool::new(false),
            }),
        }
    }

    /// The drone registry, shared with the host's registration path
    #[must_use]
    pub fn registry(&self) -> Arc<DroneRegistry> {
        self.inner.registry.clone()
    }

    /// The command lifecycle tracker
    #[must_use]
    pub fn tracker(&self) -> Arc<CommandLifecycleTracker> {
        self.inner.tracker.clone()
    }

    /// The domain limiter
    #[must_use]
    pub fn limiter(&self) -> Arc<DomainLimiter> {
        self.inner.limiter.clone()
    }

    /// Submit a task to the pipeline
    ///
    /// Tasks missing an id, persona or kind are rejected. A set domain is
    /// reduced to its registrable form here so nothing downstream has to
    /// re-normalise.
    pub async fn submit(&self, mut task: Task) -> bool {
        if task.command_id.is_empty() || task.persona_id.is_empty() || task.kind.is_empty() {
            tracing::warn!(
                command_id = %task.command_id,
                "Rejecting task with missing command id, persona id or type"
            );
            return false;
        }

        if let Some(domain) = task.domain.take() {
            task.domain = self.inner.suffixes.registrable_domain(domain.as_str());
        }

        task.touch_enqueued_at();

        if self.inner.ready.enqueue(task).await.is_err() {
            return false;
        }

        if let Some(metrics) = &self.inner.metrics {
            metrics.record_enqueued();
        }
        true
    }

    /// Publish a fire-and-forget query to a drone
    pub async fn publish_query(&self, drone_id: &str, query: QueryPayload) {
        if let Err(e) = self
            .inner
            .transport
            .publish_to_drone(drone_id, HubMessage::ExecuteQuery(query))
            .await
        {
            tracing::warn!(drone_id, error = %e, "Failed to publish query");
        }
    }

    /// Run the scheduler until shutdown
    ///
    /// # Errors
    ///
    /// Never fails today; the `Result` keeps the `serve` signature uniform
    /// across subsystems.
    pub async fn serve(&self, mut shutdown: broadcast::Receiver<Signal>) -> anyhow::Result<()> {
        internal!(level = INFO, "Scheduler starting");

        tokio::select! {
            () = self.ready_loop() => {}
            () = self.retry_loop() => {}
            () = self.heartbeat_loop() => {}
            () = self.metrics_loop() => {}
            () = self.inner.limiter.sweep_loop() => {}
            sig = shutdown.recv() => {
                match sig {
                    Ok(_) => internal!(level = INFO, "Scheduler shutting down"),
                    Err(e) => tracing::error!(error = %e, "Scheduler shutdown channel error"),
                }
            }
        }

        self.shutdown_cascade();
        Ok(())
    }

    /// Tear down a drone: drain its queue back to the ready queue, drop
    /// its registry record and pacing semaphore, and fail everything it
    /// had in flight
    ///
    /// Commands awaiting acknowledgement resolve to
    /// `Failed("drone_disconnected")`, which their watchers turn into a
    /// requeue; commands already past acknowledgement are failed without
    /// one.
    pub async fn drone_disconnected(&self, drone_id: &str) {
        tracing::warn!(drone_id, "Drone disconnected, failing in-flight commands");

        if let Some((_, queue)) = self.inner.queues.remove(drone_id) {
            for task in queue.close_and_drain() {
                self.requeue_ready(task).await;
            }
        }

        self.inner.registry.remove(drone_id);
        self.inner
            .tracker
            .fail_all(drone_id, dispatch::DISCONNECT_REASON);

        if let Some(metrics) = &self.inner.metrics {
            metrics.drop_drone_queue(drone_id);
        }
    }

    /// Single reader draining the ready queue
    async fn ready_loop(&self) {
        while let Some(task) = self.inner.ready.dequeue().await {
            self.route(task).await;
        }
    }

    async fn route(&self, task: Task) {
        let eligible = self.inner.registry.eligible(&task.required_capabilities);
        if eligible.is_empty() {
            tracing::debug!(
                command_id = %task.command_id,
                "No eligible drone, retrying shortly"
            );
            tokio::time::sleep(SOFT_RETRY_DELAY).await;
            self.requeue_ready(task).await;
            return;
        }

        let Some(selected) = select_drone(&eligible, &task) else {
            self.requeue_ready(task).await;
            return;
        };
        let drone_id = selected.drone_id.clone();
        let queue = self.drone_queue(&drone_id);

        match queue.enqueue(task).await {
            Ok(()) => {
                if let Some(metrics) = &self.inner.metrics {
                    metrics.record_queued(&drone_id);
                }
            }
            Err(QueueClosed(task)) => {
                // The drone went away while we were routing.
                self.requeue_ready(task).await;
            }
        }
    }

    /// Get or lazily create the drone's queue, spawning its worker
    fn drone_queue(&self, drone_id: &str) -> Arc<DroneQueue> {
        if let Some(queue) = self.inner.queues.get(drone_id) {
            return queue.clone();
        }

        let queue = Arc::new(DroneQueue::new(self.inner.config.per_drone_queue_capacity));
        let existing = self
            .inner
            .queues
            .entry(drone_id.to_string())
            .or_insert_with(|| queue.clone())
            .clone();

        if Arc::ptr_eq(&existing, &queue) {
            self.spawn_worker(drone_id.to_string(), queue.clone());
        }
        existing
    }

    /// Supervised dispatch worker: one per drone queue, restarted on
    /// crash while the queue is open and the scheduler is running
    fn spawn_worker(&self, drone_id: String, queue: Arc<DroneQueue>) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            loop {
                let handle = tokio::spawn({
                    let scheduler = scheduler.clone();
                    let queue = queue.clone();
                    let drone_id = drone_id.clone();
                    async move { scheduler.worker_loop(&drone_id, &queue).await }
                });

                match handle.await {
                    Ok(()) => break,
                    Err(e) => {
                        if queue.is_closed() || scheduler.stopping() {
                            break;
                        }
                        tracing::warn!(
                            drone_id = %drone_id,
                            error = %e,
                            "Dispatch worker crashed, restarting"
                        );
                    }
                }
            }
        });
    }

    async fn worker_loop(&self, drone_id: &str, queue: &Arc<DroneQueue>) {
        while let Some(task) = queue.dequeue().await {
            self.dispatch(drone_id, queue, task).await;
        }
        tracing::debug!(drone_id, "Dispatch worker exiting");
    }

    /// Single fiber feeding due persona retries back to the ready queue
    async fn retry_loop(&self) {
        loop {
            let mut task = self.inner.retries.next_due().await;
            task.touch_enqueued_at();

            if let Some(metrics) = &self.inner.metrics {
                metrics.record_persona_requeued();
            }

            if self.inner.ready.enqueue(task).await.is_err() {
                break;
            }
        }
    }

    /// Disconnect drones whose heartbeats stopped
    async fn heartbeat_loop(&self) {
        let expect = Duration::from_secs(self.inner.config.heartbeat_expect_secs);
        let grace = Duration::from_secs(self.inner.config.disconnect_grace_secs);
        let mut timer =
            tokio::time::interval(Duration::from_secs(self.inner.config.heartbeat_expect_secs.div_ceil(2).max(1)));
        timer.tick().await;

        loop {
            timer.tick().await;
            for drone_id in self.inner.registry.stale(expect, grace) {
                self.drone_disconnected(&drone_id).await;
            }
        }
    }

    /// Queue-length reporter
    async fn metrics_loop(&self) {
        let mut timer = tokio::time::interval(METRICS_SAMPLE_INTERVAL);
        timer.tick().await;

        loop {
            timer.tick().await;
            if let Some(metrics) = &self.inner.metrics {
                metrics.set_global_queue_length(self.inner.ready.len() as u64);
                for entry in self.inner.queues.iter() {
                    metrics.set_drone_queue_length(entry.key(), entry.value().len() as u64);
                }
            }
        }
    }

    /// The stop-token cascade: close the ready queue, close every
    /// per-drone queue, and let workers drain out
    fn shutdown_cascade(&self) {
        self.inner.stopping.store(true, AtomicOrdering::SeqCst);
        self.inner.ready.complete();

        for entry in self.inner.queues.iter() {
            let dropped = entry.value().close_and_drain();
            if !dropped.is_empty() {
                tracing::info!(
                    drone_id = %entry.key(),
                    dropped = dropped.len(),
                    "Dropping queued tasks on shutdown"
                );
            }
        }
    }

    pub(crate) fn stopping(&self) -> bool {
        self.inner.stopping.load(AtomicOrdering::SeqCst)
    }

    pub(crate) async fn requeue_ready(&self, mut task: Task) {
        task.touch_enqueued_at();

        if let Some(metrics) = &self.inner.metrics {
            metrics.record_requeued();
        }

        if let Err(QueueClosed(task)) = self.inner.ready.enqueue(task).await {
            tracing::debug!(
                command_id = %task.command_id,
                "Ready queue closed, dropping task"
            );
        }
    }
}

/// Selection score; higher is better, used as the final tiebreak
fn selection_score(info: &DroneInfo, task: &Task) -> f64 {
    #[allow(clippy::cast_precision_loss)]
    let overlap = info
        .static_capabilities
        .intersection(&task.required_capabilities)
        .count() as f64;
    let idle_bonus = (0.01 * info.idle_minutes()).min(0.5);

    1.0 + 0.1 * overlap + idle_bonus - 0.2 * f64::from(info.current_load)
        + 0.3 * f64::from(task.priority.ordinal())
}

/// Pick the drone to dispatch to: least loaded first, then idle longest,
/// then highest score
fn select_drone<'a>(eligible: &'a [DroneInfo], task: &Task) -> Option<&'a DroneInfo> {
    let mut candidates: Vec<&DroneInfo> = eligible.iter().collect();
    candidates.sort_by(|a, b| {
        a.current_load
            .cmp(&b.current_load)
            .then_with(|| match (a.last_task_assigned_at, b.last_task_assigned_at) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (Some(x), Some(y)) => x.cmp(&y),
            })
            .then_with(|| selection_score(b, task).total_cmp(&selection_score(a, task)))
    });
    candidates.first().copied()
}

/// Capability filter used by routing, re-exported for the host's
/// diagnostics surface
#[must_use]
pub fn capability_match(info: &DroneInfo, required: &HashSet<String>) -> bool {
    info.satisfies(required)
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use apiary_common::Priority;

    use crate::registry::DroneStatus;

    use super::*;

    fn drone(id: &str, load: u32, assigned_secs_ago: Option<u64>) -> DroneInfo {
        DroneInfo {
            drone_id: id.to_string(),
            connection_id: format!("conn-{id}"),
            version: "1.0.0".to_string(),
            static_capabilities: HashSet::new(),
            status: DroneStatus::Idle,
            last_heartbeat: Instant::now(),
            last_task_assigned_at: assigned_secs_ago.map(|secs| {
                Instant::now()
                    .checked_sub(Duration::from_secs(secs))
                    .unwrap_or_else(Instant::now)
            }),
            current_load: load,
            error_count: 0,
        }
    }

    #[test]
    fn test_selection_prefers_lower_load() {
        let task = Task::new("c1", "navigate", "p1");
        let eligible = vec![drone("busy", 2, Some(10)), drone("free", 0, Some(10))];

        let selected = select_drone(&eligible, &task);
        assert_eq!(selected.map(|d| d.drone_id.as_str()), Some("free"));
    }

    #[test]
    fn test_selection_prefers_longest_idle() {
        let task = Task::new("c1", "navigate", "p1");
        let eligible = vec![drone("recent", 0, Some(5)), drone("stale", 0, Some(120))];

        let selected = select_drone(&eligible, &task);
        assert_eq!(selected.map(|d| d.drone_id.as_str()), Some("stale"));
    }

    #[test]
    fn test_selection_never_assigned_wins() {
        let task = Task::new("c1", "navigate", "p1");
        let eligible = vec![drone("assigned", 0, Some(1)), drone("fresh", 0, None)];

        let selected = select_drone(&eligible, &task);
        assert_eq!(selected.map(|d| d.drone_id.as_str()), Some("fresh"));
    }

    #[test]
    fn test_selection_score_rewards_capability_overlap() {
        let mut task = Task::new("c1", "navigate", "p1");
        task.required_capabilities = ["stealth".to_string()].into_iter().collect();
        task.priority = Priority::High;

        let mut plain = drone("plain", 1, Some(10));
        plain.static_capabilities = ["browser".to_string()].into_iter().collect();
        let mut capable = drone("capable", 1, Some(10));
        capable.static_capabilities =
            ["browser".to_string(), "stealth".to_string()].into_iter().collect();

        assert!(selection_score(&capable, &task) > selection_score(&plain, &task));
    }

    #[test]
    fn test_idle_bonus_is_capped() {
        let task = Task::new("c1", "navigate", "p1");
        // Idle for a week; the bonus caps at 0.5.
        let week = drone("week", 0, Some(7 * 24 * 3600));
        let hour = drone("hour", 0, Some(3600));

        let diff = selection_score(&week, &task) - selection_score(&hour, &task);
        assert!(diff <= 0.5);
    }
}
