//! Aggregated health reporting.
//!
//! Combines the engine's `health_check()` with a per-service view of the
//! destination pools into a single [`DaemonHealth`] report.
//!
//! # Aggregation Rule
//!
//! - Engine Unhealthy -> Unhealthy
//! - Engine Degraded, or any service without a schedulable destination -> Degraded(reason)
//! - Otherwise -> Healthy

use serde::Serialize;

use ipvs_core::pipeline::HealthStatus;
use ipvs_engine::LoadBalancerState;

const NO_SCHEDULABLE: &str = "no schedulable destination";

/// Aggregated health report for the entire daemon.
#[derive(Debug, Clone, Serialize)]
pub struct DaemonHealth {
    /// Overall daemon health status.
    pub status: HealthStatus,
    /// Daemon uptime in seconds since start.
    pub uptime_secs: u64,
    /// Engine lifecycle state ("initialized", "running", "stopped").
    pub engine_state: String,
    /// Entries in the connection table, templates included.
    pub connections: usize,
    /// Per-service reports.
    pub services: Vec<ServiceHealth>,
}

/// Health of a single virtual service.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    /// Service key (e.g. "TCP 10.0.0.1:80", "FWM 100").
    pub name: String,
    pub scheduler: String,
    /// Destinations in the pool.
    pub destinations: usize,
    /// Destinations that can receive new connections.
    pub schedulable: usize,
    pub active_conns: u64,
    pub inactive_conns: u64,
}

impl ServiceHealth {
    pub fn is_serving(&self) -> bool {
        self.schedulable > 0
    }
}

/// Collect a [`ServiceHealth`] for every registered service, sorted by name.
pub fn service_health(state: &LoadBalancerState) -> Vec<ServiceHealth> {
    let mut services: Vec<ServiceHealth> = state
        .services
        .services()
        .iter()
        .map(|svc| {
            let pool = svc.pool();
            ServiceHealth {
                name: svc.key.to_string(),
                scheduler: svc.scheduler().name().to_owned(),
                destinations: pool.len(),
                schedulable: pool.iter().filter(|d| d.is_schedulable()).count(),
                active_conns: pool.iter().map(|d| u64::from(d.active_conns())).sum(),
                inactive_conns: pool.iter().map(|d| u64::from(d.inactive_conns())).sum(),
            }
        })
        .collect();
    services.sort_by(|a, b| a.name.cmp(&b.name));
    services
}

/// Combine the engine status with the service reports.
///
/// Returns the worst status found: Unhealthy > Degraded > Healthy.
pub fn aggregate_status(engine: &HealthStatus, services: &[ServiceHealth]) -> HealthStatus {
    if engine.is_unhealthy() {
        return engine.clone();
    }

    let mut reasons = Vec::new();
    if let HealthStatus::Degraded(reason) = engine {
        reasons.push(reason.clone());
    }
    let idle: Vec<&str> = services
        .iter()
        .filter(|s| !s.is_serving())
        .map(|s| s.name.as_str())
        .collect();
    // the engine already names idle services in its own reason
    let reported = reasons.iter().any(|r| r.contains(NO_SCHEDULABLE));
    if !idle.is_empty() && !reported {
        reasons.push(format!("{NO_SCHEDULABLE}: {}", idle.join(", ")));
    }

    if reasons.is_empty() {
        HealthStatus::Healthy
    } else {
        HealthStatus::Degraded(reasons.join("; "))
    }
}
