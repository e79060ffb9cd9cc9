//! Drone registry
//!
//! Owns the authoritative `DroneInfo` record for every connected drone,
//! plus the per-drone pacing semaphore that gates in-flight commands.
//! The scheduler only ever reads snapshots; every mutation goes through a
//! method here.

use std::{
    collections::HashSet,
    sync::Arc,
    time::{Duration, Instant},
};

use dashmap::DashMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use apiary_bus::{DroneRegistrationPayload, StatusPayload};

/// Connection state of a drone
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DroneStatus {
    Idle,
    Busy { current_command: String },
    Disconnected,
    Error,
}

impl DroneStatus {
    #[must_use]
    pub const fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }
}

/// Snapshot of one drone's registry record
#[derive(Debug, Clone)]
pub struct DroneInfo {
    pub drone_id: String,
    pub connection_id: String,
    pub version: String,
    pub static_capabilities: HashSet<String>,
    pub status: DroneStatus,
    pub last_heartbeat: Instant,
    pub last_task_assigned_at: Option<Instant>,
    pub current_load: u32,
    pub error_count: u32,
}

impl DroneInfo {
    /// Whether the drone advertises every required capability
    #[must_use]
    pub fn satisfies(&self, required: &HashSet<String>) -> bool {
        required.is_subset(&self.static_capabilities)
    }

    /// Minutes since the last assignment, saturating at zero for drones
    /// that were never assigned
    #[must_use]
    pub fn idle_minutes(&self) -> f64 {
        self.last_task_assigned_at
            .map_or(f64::MAX, |at| at.elapsed().as_secs_f64() / 60.0)
    }
}

/// Registry of connected drones and their pacing semaphores
pub struct DroneRegistry {
    drones: DashMap<String, DroneInfo>,
    pacing: DashMap<String, Arc<Semaphore>>,
    max_in_flight: usize,
}

impl DroneRegistry {
    #[must_use]
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            drones: DashMap::new(),
            pacing: DashMap::new(),
            max_in_flight: max_in_flight.max(1),
        }
    }

    /// Register (or re-register) a drone from its announcement
    pub fn register(&self, payload: DroneRegistrationPayload) {
        tracing::info!(
            drone_id = %payload.drone_id,
            version = %payload.version,
            capabilities = payload.static_capabilities.len(),
            "Drone registered"
        );

        self.pacing
            .entry(payload.drone_id.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(self.max_in_flight)));

        self.drones.insert(
            payload.drone_id.clone(),
            DroneInfo {
                drone_id: payload.drone_id,
                connection_id: payload.connection_id,
                version: payload.version,
                static_capabilities: payload.static_capabilities,
                status: DroneStatus::Idle,
                last_heartbeat: Instant::now(),
                last_task_assigned_at: None,
                current_load: 0,
                error_count: 0,
            },
        );
    }

    /// Snapshot one drone's record
    #[must_use]
    pub fn snapshot(&self, drone_id: &str) -> Option<DroneInfo> {
        self.drones.get(drone_id).map(|entry| entry.clone())
    }

    /// Snapshot every connected drone satisfying the capability requirement
    #[must_use]
    pub fn eligible(&self, required: &HashSet<String>) -> Vec<DroneInfo> {
        self.drones
            .iter()
            .filter(|entry| entry.status != DroneStatus::Disconnected)
            .filter(|entry| entry.satisfies(required))
            .map(|entry| entry.clone())
            .collect()
    }

    /// Take the drone's pacing token without waiting
    #[must_use]
    pub fn try_acquire_pacing(&self, drone_id: &str) -> Option<OwnedSemaphorePermit> {
        let semaphore = self
            .pacing
            .entry(drone_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.max_in_flight)))
            .clone();

        semaphore.try_acquire_owned().ok()
    }

    /// Record a published command: bump load, mark busy
    pub fn command_started(&self, drone_id: &str, command_id: &str) {
        if let Some(mut entry) = self.drones.get_mut(drone_id) {
            entry.current_load += 1;
            entry.status = DroneStatus::Busy {
                current_command: command_id.to_string(),
            };
        }
    }

    /// Record a finished command: drop load, idle when nothing is left
    pub fn command_finished(&self, drone_id: &str) {
        if let Some(mut entry) = self.drones.get_mut(drone_id) {
            entry.current_load = entry.current_load.saturating_sub(1);
            if entry.current_load == 0 && entry.status != DroneStatus::Disconnected {
                entry.status = DroneStatus::Idle;
            }
        }
    }

    /// Force a drone back to idle (ack timeout gives up on the command)
    pub fn mark_idle(&self, drone_id: &str) {
        if let Some(mut entry) = self.drones.get_mut(drone_id) {
            entry.current_load = entry.current_load.saturating_sub(1);
            entry.status = DroneStatus::Idle;
        }
    }

    pub fn record_error(&self, drone_id: &str) {
        if let Some(mut entry) = self.drones.get_mut(drone_id) {
            entry.error_count += 1;
        }
    }

    /// Stamp the fairness clock on successful assignment
    pub fn record_assignment(&self, drone_id: &str) {
        if let Some(mut entry) = self.drones.get_mut(drone_id) {
            entry.last_task_assigned_at = Some(Instant::now());
        }
    }

    /// Refresh the heartbeat clock from a status report
    pub fn heartbeat(&self, drone_id: &str, status: &StatusPayload) {
        if let Some(mut entry) = self.drones.get_mut(drone_id) {
            entry.last_heartbeat = Instant::now();
            if status.status.eq_ignore_ascii_case("error") {
                entry.status = DroneStatus::Error;
            }
        }
    }

    /// Drones silent for longer than the heartbeat expectation plus grace
    #[must_use]
    pub fn stale(&self, expect: Duration, grace: Duration) -> Vec<String> {
        let cutoff = expect + grace;
        self.drones
            .iter()
            .filter(|entry| entry.status != DroneStatus::Disconnected)
            .filter(|entry| entry.last_heartbeat.elapsed() > cutoff)
            .map(|entry| entry.drone_id.clone())
            .collect()
    }

    /// Remove a drone entirely, dropping its pacing semaphore
    pub fn remove(&self, drone_id: &str) -> Option<DroneInfo> {
        self.pacing.remove(drone_id);
        self.drones.remove(drone_id).map(|(_, info)| info)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.drones.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.drones.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration(drone_id: &str, capabilities: &[&str]) -> DroneRegistrationPayload {
        DroneRegistrationPayload {
            drone_id: drone_id.to_string(),
            connection_id: format!("conn-{drone_id}"),
            version: "1.0.0".to_string(),
            static_capabilities: capabilities.iter().map(ToString::to_string).collect(),
        }
    }

    #[test]
    fn test_capability_subset_match() {
        let registry = DroneRegistry::new(1);
        registry.register(registration("d1", &["browser", "stealth"]));
        registry.register(registration("d2", &["browser"]));

        let required: HashSet<String> = ["stealth".to_string()].into_iter().collect();
        let eligible = registry.eligible(&required);
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].drone_id, "d1");

        // An empty requirement matches every drone.
        assert_eq!(registry.eligible(&HashSet::new()).len(), 2);
    }

    #[test]
    fn test_pacing_token_is_single_permit() {
        let registry = DroneRegistry::new(1);
        registry.register(registration("d1", &[]));

        let token = registry.try_acquire_pacing("d1");
        assert!(token.is_some());
        assert!(registry.try_acquire_pacing("d1").is_none());

        drop(token);
        assert!(registry.try_acquire_pacing("d1").is_some());
    }

    #[test]
    fn test_command_lifecycle_updates_status() {
        let registry = DroneRegistry::new(1);
        registry.register(registration("d1", &[]));

        registry.command_started("d1", "c1");
        let info = registry.snapshot("d1");
        assert!(matches!(
            info.map(|i| i.status),
            Some(DroneStatus::Busy { current_command }) if current_command == "c1"
        ));

        registry.command_finished("d1");
        let info = registry.snapshot("d1");
        assert!(info.is_some_and(|i| i.status.is_idle() && i.current_load == 0));
    }

    #[test]
    fn test_stale_detection() {
        let registry = DroneRegistry::new(1);
        registry.register(registration("d1", &[]));

        assert!(registry
            .stale(Duration::from_secs(30), Duration::from_secs(60))
            .is_empty());

        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(registry.stale(Duration::ZERO, Duration::ZERO).len(), 1);
    }

    #[test]
    fn test_remove_drops_pacing() {
        let registry = DroneRegistry::new(1);
        registry.register(registration("d1", &[]));

        let _held = registry.try_acquire_pacing("d1");
        assert!(registry.remove("d1").is_some());

        // A fresh semaphore appears on next use, with its full permit.
        assert!(registry.try_acquire_pacing("d1").is_some());
    }
}
