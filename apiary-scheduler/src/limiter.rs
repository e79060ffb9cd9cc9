//! Per-domain lease limiting
//!
//! Guards destination sites against impolite traffic. A dispatch may only
//! proceed once it holds a lease for `(drone, registrable domain)`, and a
//! lease is only granted while every rule holds:
//!
//! - global concurrent sessions for the domain under the global cap
//! - per-drone concurrency for the domain under the per-drone cap
//! - per-drone request rate inside the 1-second QPS window
//! - the drone is not cooling down after a burst
//!
//! Acquisition never waits; a denial tells the caller why, and requeueing
//! is the caller's business. Callers pass an already-registrable domain
//! (the scheduler derives it at submission time); the limiter only
//! lower-cases.

use std::{
    collections::VecDeque,
    fmt::{self, Display},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use dashmap::DashMap;
use serde::Deserialize;

use apiary_common::Domain;
use apiary_metrics::DomainMetrics;

/// Configuration for per-domain lease limits
#[derive(Debug, Clone, Deserialize)]
pub struct LimitConfig {
    /// Maximum concurrent sessions per domain across all drones
    #[serde(default = "default_max_concurrent_sessions")]
    pub max_concurrent_sessions: usize,

    /// Maximum concurrent sessions per (drone, domain)
    #[serde(default = "default_concurrency_per_drone")]
    pub concurrency_per_drone: usize,

    /// Maximum lease grants per second per (drone, domain)
    #[serde(default = "default_qps_per_drone")]
    pub qps_per_drone: f64,

    /// Grants within the cooldown window that trigger a cooldown; 0 disables
    #[serde(default = "default_burst_limit")]
    pub burst_limit: u32,

    /// Cooldown length, and the width of the burst window
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,

    /// Idle domain state is dropped after this long
    #[serde(default = "default_domain_state_ttl_secs")]
    pub domain_state_ttl_secs: u64,
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: default_max_concurrent_sessions(),
            concurrency_per_drone: default_concurrency_per_drone(),
            qps_per_drone: default_qps_per_drone(),
            burst_limit: default_burst_limit(),
            cooldown_secs: default_cooldown_secs(),
            domain_state_ttl_secs: default_domain_state_ttl_secs(),
        }
    }
}

const fn default_max_concurrent_sessions() -> usize {
    25
}

const fn default_concurrency_per_drone() -> usize {
    1
}

const fn default_qps_per_drone() -> f64 {
    2.0
}

const fn default_burst_limit() -> u32 {
    3
}

const fn default_cooldown_secs() -> u64 {
    30
}

const fn default_domain_state_ttl_secs() -> u64 {
    600
}

/// Width of the request-rate window
const QPS_WINDOW: Duration = Duration::from_secs(1);

/// Why a lease was denied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// The (drone, domain) pair is cooling down after a burst
    Cooldown,
    /// The domain is at its global session cap
    GlobalConcurrency,
    /// The (drone, domain) pair is at its session cap
    PerDroneConcurrency,
    /// The (drone, domain) pair is at its request rate cap
    PerDroneQps,
}

impl Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Cooldown => "cooldown",
            Self::GlobalConcurrency => "global_concurrency",
            Self::PerDroneConcurrency => "per_drone_concurrency",
            Self::PerDroneQps => "per_drone_qps",
        })
    }
}

/// Domain-wide state, shared by every drone touching the domain
#[derive(Debug)]
struct GlobalState {
    concurrency: usize,
    last_touched: Instant,
}

/// Per-(drone, domain) state
#[derive(Debug)]
struct DroneState {
    concurrency: usize,
    /// Grant timestamps inside the QPS window
    recent_requests: VecDeque<Instant>,
    /// Grant timestamps inside the burst window
    burst_window: VecDeque<Instant>,
    cooldown_until: Option<Instant>,
    last_touched: Instant,
}

impl DroneState {
    fn new(now: Instant) -> Self {
        Self {
            concurrency: 0,
            recent_requests: VecDeque::new(),
            burst_window: VecDeque::new(),
            cooldown_until: None,
            last_touched: now,
        }
    }
}

/// One unit of domain-concurrency credit
///
/// Releasing decrements both the global and the per-drone concurrency for
/// the domain, exactly once; releasing again (or dropping after an explicit
/// release) is a no-op.
#[derive(Debug)]
pub struct DomainLease {
    drone_id: String,
    domain: Domain,
    global: Arc<parking_lot::Mutex<GlobalState>>,
    drone: Arc<parking_lot::Mutex<DroneState>>,
    released: AtomicBool,
    metrics: Option<Arc<DomainMetrics>>,
}

impl DomainLease {
    /// The drone the lease was granted to
    #[must_use]
    pub fn drone_id(&self) -> &str {
        &self.drone_id
    }

    /// The registrable domain the lease covers
    #[must_use]
    pub const fn domain(&self) -> &Domain {
        &self.domain
    }

    /// Release the lease; idempotent
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }

        let now = Instant::now();
        {
            // Same order as acquisition: global first, then drone.
            let mut global = self.global.lock();
            global.concurrency = global.concurrency.saturating_sub(1);
            global.last_touched = now;
        }
        {
            let mut drone = self.drone.lock();
            drone.concurrency = drone.concurrency.saturating_sub(1);
            drone.last_touched = now;
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_lease_released(self.domain.as_str());
        }

        tracing::trace!(
            drone_id = %self.drone_id,
            domain = %self.domain,
            "Domain lease released"
        );
    }
}

impl Drop for DomainLease {
    fn drop(&mut self) {
        self.release();
    }
}

/// Per-domain lease manager
#[derive(Debug)]
pub struct DomainLimiter {
    config: LimitConfig,
    global: DashMap<Domain, Arc<parking_lot::Mutex<GlobalState>>>,
    per_drone: DashMap<(String, Domain), Arc<parking_lot::Mutex<DroneState>>>,
    metrics: Option<Arc<DomainMetrics>>,
}

impl DomainLimiter {
    /// Create a new limiter with the given limits
    #[must_use]
    pub fn new(config: LimitConfig) -> Self {
        let metrics = match DomainMetrics::new() {
            Ok(metrics) => Some(Arc::new(metrics)),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to initialize domain metrics");
                None
            }
        };

        Self {
            config,
            global: DashMap::new(),
            per_drone: DashMap::new(),
            metrics,
        }
    }

    /// Try to acquire a lease for `(drone_id, domain)` without waiting
    ///
    /// The caller is expected to pass an already-registrable domain; the
    /// only normalisation applied here is lower-casing (which `Domain`
    /// guarantees by construction).
    ///
    /// # Errors
    ///
    /// Returns the rule that denied the lease.
    pub fn try_acquire(&self, drone_id: &str, domain: &Domain) -> Result<DomainLease, DenyReason> {
        let global_slot = self
            .global
            .entry(domain.clone())
            .or_insert_with(|| {
                Arc::new(parking_lot::Mutex::new(GlobalState {
                    concurrency: 0,
                    last_touched: Instant::now(),
                }))
            })
            .clone();

        let drone_slot = self
            .per_drone
            .entry((drone_id.to_string(), domain.clone()))
            .or_insert_with(|| Arc::new(parking_lot::Mutex::new(DroneState::new(Instant::now()))))
            .clone();

        let now = Instant::now();

        // Paired locks, global before drone, and never held across an await.
        let mut global = global_slot.lock();
        let mut drone = drone_slot.lock();

        while drone
            .recent_requests
            .front()
            .is_some_and(|&t| now.duration_since(t) > QPS_WINDOW)
        {
            drone.recent_requests.pop_front();
        }

        if let Some(until) = drone.cooldown_until {
            if now < until {
                return Err(DenyReason::Cooldown);
            }
            drone.cooldown_until = None;
        }

        if global.concurrency >= self.config.max_concurrent_sessions {
            return Err(DenyReason::GlobalConcurrency);
        }

        if drone.concurrency >= self.config.concurrency_per_drone {
            return Err(DenyReason::PerDroneConcurrency);
        }

        #[allow(clippy::cast_precision_loss)]
        if drone.recent_requests.len() as f64 >= self.config.qps_per_drone {
            return Err(DenyReason::PerDroneQps);
        }

        drone.recent_requests.push_back(now);

        if self.config.burst_limit > 0 {
            let window = Duration::from_secs(self.config.cooldown_secs);
            while drone
                .burst_window
                .front()
                .is_some_and(|&t| now.duration_since(t) > window)
            {
                drone.burst_window.pop_front();
            }

            drone.burst_window.push_back(now);
            if drone.burst_window.len() >= self.config.burst_limit as usize {
                drone.cooldown_until = Some(now + window);
                drone.burst_window.clear();
                tracing::debug!(
                    drone_id = %drone_id,
                    domain = %domain,
                    cooldown_secs = self.config.cooldown_secs,
                    "Burst limit reached, entering cooldown"
                );
            }
        }

        global.concurrency += 1;
        global.last_touched = now;
        drone.concurrency += 1;
        drone.last_touched = now;

        drop(drone);
        drop(global);

        if let Some(metrics) = &self.metrics {
            metrics.record_lease_acquired(domain.as_str());
        }

        Ok(DomainLease {
            drone_id: drone_id.to_string(),
            domain: domain.clone(),
            global: global_slot,
            drone: drone_slot,
            released: AtomicBool::new(false),
            metrics: self.metrics.clone(),
        })
    }

    /// Drop idle state older than the configured TTL
    pub fn sweep(&self) {
        let ttl = Duration::from_secs(self.config.domain_state_ttl_secs);

        self.global.retain(|_, slot| {
            let state = slot.lock();
            state.concurrency > 0 || state.last_touched.elapsed() <= ttl
        });

        self.per_drone.retain(|_, slot| {
            let state = slot.lock();
            state.concurrency > 0 || state.last_touched.elapsed() <= ttl
        });
    }

    /// Periodic sweeping; cancelled by the caller on shutdown
    pub async fn sweep_loop(&self) {
        let interval = Duration::from_secs((self.config.domain_state_ttl_secs / 4).clamp(1, 60));
        let mut timer = tokio::time::interval(interval);
        timer.tick().await;

        loop {
            timer.tick().await;
            self.sweep();
        }
    }

    /// Number of tracked domains, for diagnostics
    #[must_use]
    pub fn tracked_domains(&self) -> usize {
        self.global.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(config: LimitConfig) -> DomainLimiter {
        DomainLimiter::new(config)
    }

    fn relaxed_burst() -> LimitConfig {
        LimitConfig {
            burst_limit: 0,
            ..LimitConfig::default()
        }
    }

    #[test]
    fn test_acquire_and_release() {
        let limiter = limiter(relaxed_burst());
        let domain = Domain::new("example.com");

        let lease = limiter.try_acquire("d1", &domain);
        assert!(lease.is_ok());
    }

    #[test]
    fn test_per_drone_concurrency_cap() {
        let config = LimitConfig {
            concurrency_per_drone: 1,
            qps_per_drone: 100.0,
            burst_limit: 0,
            ..LimitConfig::default()
        };
        let limiter = limiter(config);
        let domain = Domain::new("example.com");

        let first = limiter.try_acquire("d1", &domain);
        assert!(first.is_ok());
        match limiter.try_acquire("d1", &domain) {
            Err(DenyReason::PerDroneConcurrency) => {}
            other => panic!("expected per-drone denial, got {other:?}"),
        }

        // Another drone is unaffected by d1's cap.
        assert!(limiter.try_acquire("d2", &domain).is_ok());

        // Releasing frees the slot.
        drop(first);
        assert!(limiter.try_acquire("d1", &domain).is_ok());
    }

    #[test]
    fn test_global_concurrency_cap() {
        let config = LimitConfig {
            max_concurrent_sessions: 2,
            concurrency_per_drone: 5,
            qps_per_drone: 100.0,
            burst_limit: 0,
            ..LimitConfig::default()
        };
        let limiter = limiter(config);
        let domain = Domain::new("example.com");

        let _l1 = limiter.try_acquire("d1", &domain);
        let _l2 = limiter.try_acquire("d2", &domain);
        match limiter.try_acquire("d3", &domain) {
            Err(DenyReason::GlobalConcurrency) => {}
            other => panic!("expected global concurrency denial, got {other:?}"),
        }

        // A different domain has its own global budget.
        assert!(limiter.try_acquire("d3", &Domain::new("other.com")).is_ok());
    }

    #[test]
    fn test_qps_window_denies() {
        let config = LimitConfig {
            concurrency_per_drone: 100,
            qps_per_drone: 2.0,
            burst_limit: 0,
            ..LimitConfig::default()
        };
        let limiter = limiter(config);
        let domain = Domain::new("example.com");

        assert!(limiter.try_acquire("d1", &domain).is_ok());
        assert!(limiter.try_acquire("d1", &domain).is_ok());
        match limiter.try_acquire("d1", &domain) {
            Err(DenyReason::PerDroneQps) => {}
            other => panic!("expected qps denial, got {other:?}"),
        }
    }

    #[test]
    #[cfg_attr(miri, ignore = "Time-based test not compatible with Miri")]
    fn test_burst_cooldown() {
        let config = LimitConfig {
            concurrency_per_drone: 100,
            qps_per_drone: 100.0,
            burst_limit: 3,
            cooldown_secs: 1,
            ..LimitConfig::default()
        };
        let limiter = limiter(config);
        let domain = Domain::new("example.com");

        // First three grants succeed; the third trips the cooldown.
        assert!(limiter.try_acquire("d1", &domain).is_ok());
        assert!(limiter.try_acquire("d1", &domain).is_ok());
        assert!(limiter.try_acquire("d1", &domain).is_ok());

        match limiter.try_acquire("d1", &domain) {
            Err(DenyReason::Cooldown) => {}
            other => panic!("expected cooldown denial, got {other:?}"),
        }

        // After the cooldown elapses, grants succeed again (the burst
        // window was cleared on cooldown entry).
        std::thread::sleep(Duration::from_millis(1100));
        assert!(limiter.try_acquire("d1", &domain).is_ok());
    }

    #[test]
    fn test_lease_release_is_idempotent() {
        let config = LimitConfig {
            concurrency_per_drone: 1,
            qps_per_drone: 100.0,
            burst_limit: 0,
            ..LimitConfig::default()
        };
        let limiter = limiter(config);
        let domain = Domain::new("example.com");

        let lease = match limiter.try_acquire("d1", &domain) {
            Ok(lease) => lease,
            Err(reason) => panic!("unexpected denial: {reason}"),
        };

        lease.release();
        lease.release();
        drop(lease);

        // Exactly one unit of concurrency was returned; double release
        // would have underflowed and the next acquire would still fail.
        assert!(limiter.try_acquire("d1", &domain).is_ok());
        match limiter.try_acquire("d1", &domain) {
            Err(DenyReason::PerDroneConcurrency) => {}
            other => panic!("expected per-drone denial, got {other:?}"),
        }
    }

    #[test]
    fn test_sweep_keeps_active_state() {
        let config = LimitConfig {
            domain_state_ttl_secs: 0,
            concurrency_per_drone: 2,
            qps_per_drone: 100.0,
            burst_limit: 0,
            ..LimitConfig::default()
        };
        let limiter = limiter(config);
        let domain = Domain::new("example.com");

        let held = limiter.try_acquire("d1", &domain);
        assert!(held.is_ok());

        // TTL of zero reaps everything idle, but the held lease keeps the
        // domain's state alive.
        limiter.sweep();
        assert_eq!(limiter.tracked_domains(), 1);

        drop(held);
        std::thread::sleep(Duration::from_millis(10));
        limiter.sweep();
        assert_eq!(limiter.tracked_domains(), 0);
    }
}
