//! Service health tracking.
//!
//! Each monitoring cycle probes every service once and folds the outcomes
//! into a new snapshot. The state machine per service is
//! `UNKNOWN -> OK -> DEGRADED -> DOWN`:
//!
//! - a hard failure increments the consecutive failure count; the service
//!   is `DEGRADED` after one and `DOWN` at the failure threshold,
//! - a slow success, or a probe that reached the service but found a
//!   problem, is a soft failure: `DEGRADED` with the failure count reset,
//! - a fast success is `OK`.
//!
//! Snapshots are replaced wholesale, so readers always see one coherent
//! cycle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::client::{ProbeResult, ProbeStatus};

/// Alerts kept before the oldest are dropped.
const MAX_ALERTS: usize = 256;

/// Health of one service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthState {
    /// Not probed yet
    #[default]
    Unknown,
    Ok,
    Degraded,
    Down,
}

impl HealthState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Ok => "OK",
            Self::Degraded => "DEGRADED",
            Self::Down => "DOWN",
        }
    }
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// Latest known health of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub service: String,
    pub status: HealthState,
    /// Round trip of the last probe
    pub latency_ms: Option<u64>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl HealthStatus {
    /// Status of a service that has never been probed.
    pub fn unknown(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            status: HealthState::Unknown,
            latency_ms: None,
            last_checked_at: None,
            consecutive_failures: 0,
            last_error: None,
        }
    }

    pub fn is_down(&self) -> bool {
        self.status == HealthState::Down
    }
}

/// Health monitoring settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthPolicy {
    /// Seconds between monitoring cycles
    pub interval_secs: u64,
    /// Timeout of a single probe
    pub probe_timeout_ms: u64,
    /// Timeout of a whole cycle
    pub aggregate_timeout_ms: u64,
    /// Probes slower than this count as soft failures
    pub latency_threshold_ms: u64,
    /// Consecutive failures before a service is DOWN
    pub failure_threshold: u32,
    /// Cycles a service may stay DOWN before the alert is repeated
    pub alert_repeat_after: u32,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            probe_timeout_ms: 5000,
            aggregate_timeout_ms: 10_000,
            latency_threshold_ms: 2000,
            failure_threshold: 3,
            alert_repeat_after: 10,
        }
    }
}

impl HealthPolicy {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn aggregate_timeout(&self) -> Duration {
        Duration::from_millis(self.aggregate_timeout_ms.max(self.probe_timeout_ms))
    }
}

/// What one probe of one service found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub status: ProbeStatus,
    pub latency: Duration,
    pub error: Option<String>,
}

impl ProbeOutcome {
    pub fn from_probe(result: ProbeResult, latency: Duration) -> Self {
        Self { status: result.status, latency, error: result.error }
    }

    /// A probe that did not finish in time.
    pub fn timed_out(after: Duration) -> Self {
        Self {
            status: ProbeStatus::Unhealthy,
            latency: after,
            error: Some(format!("health check timed out after {}ms", after.as_millis())),
        }
    }
}

/// Why an alert was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// The service just went DOWN
    Down,
    /// The service has stayed DOWN for another `alert_repeat_after` cycles
    StillDown,
}

/// A health alert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthAlert {
    pub id: Uuid,
    pub service: String,
    pub kind: AlertKind,
    pub raised_at: DateTime<Utc>,
    pub consecutive_failures: u32,
    pub message: String,
}

/// Fold one probe outcome into a service's status.
pub fn next_status(
    previous: &HealthStatus,
    outcome: &ProbeOutcome,
    policy: &HealthPolicy,
    now: DateTime<Utc>,
) -> HealthStatus {
    let latency_ms = outcome.latency.as_millis() as u64;
    let slow = latency_ms > policy.latency_threshold_ms;

    let (status, consecutive_failures, last_error) = match outcome.status {
        ProbeStatus::Unhealthy => {
            let failures = previous.consecutive_failures.saturating_add(1);
            let status = if failures >= policy.failure_threshold.max(1) {
                HealthState::Down
            } else {
                HealthState::Degraded
            };
            (status, failures, outcome.error.clone())
        }
        ProbeStatus::Degraded => (HealthState::Degraded, 0, outcome.error.clone()),
        ProbeStatus::Healthy if slow => (
            HealthState::Degraded,
            0,
            Some(format!(
                "slow response: {}ms exceeds {}ms",
                latency_ms, policy.latency_threshold_ms
            )),
        ),
        ProbeStatus::Healthy => (HealthState::Ok, 0, None),
    };

    HealthStatus {
        service: previous.service.clone(),
        status,
        latency_ms: Some(latency_ms),
        last_checked_at: Some(now),
        consecutive_failures,
        last_error,
    }
}

/// Health snapshots and alerts for a set of services.
#[derive(Debug)]
pub struct HealthMonitor {
    policy: HealthPolicy,
    snapshot: RwLock<Arc<HashMap<String, HealthStatus>>>,
    alerts: Mutex<Vec<HealthAlert>>,
    /// Cycles spent DOWN since the last alert, per service
    down_cycles: Mutex<HashMap<String, u32>>,
    /// Held while a cycle is folded in; cycles apply one at a time
    cycle: Mutex<()>,
}

impl HealthMonitor {
    /// Create a monitor with every service `UNKNOWN`.
    pub fn new<I, S>(policy: HealthPolicy, services: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let statuses = services
            .into_iter()
            .map(|s| {
                let name = s.into();
                (name.clone(), HealthStatus::unknown(name))
            })
            .collect();

        Self {
            policy,
            snapshot: RwLock::new(Arc::new(statuses)),
            alerts: Mutex::new(Vec::new()),
            down_cycles: Mutex::new(HashMap::new()),
            cycle: Mutex::new(()),
        }
    }

    pub fn policy(&self) -> &HealthPolicy {
        &self.policy
    }

    /// The latest snapshot.
    pub fn snapshot(&self) -> Arc<HashMap<String, HealthStatus>> {
        Arc::clone(&self.snapshot.read())
    }

    pub fn status(&self, service: &str) -> Option<HealthStatus> {
        self.snapshot.read().get(service).cloned()
    }

    pub fn is_down(&self, service: &str) -> bool {
        self.snapshot.read().get(service).is_some_and(HealthStatus::is_down)
    }

    /// Outstanding alerts, oldest first.
    pub fn alerts(&self) -> Vec<HealthAlert> {
        self.alerts.lock().clone()
    }

    /// Publish the result of one monitoring cycle.
    ///
    /// Services without an outcome count as timed out. Returns the alerts
    /// raised by this cycle.
    pub fn apply_cycle(&self, mut outcomes: HashMap<String, ProbeOutcome>) -> Vec<HealthAlert> {
        let _cycle = self.cycle.lock();
        let now = Utc::now();
        let previous = self.snapshot();

        let next: HashMap<String, HealthStatus> = previous
            .iter()
            .map(|(name, prev)| {
                let outcome = outcomes
                    .remove(name)
                    .unwrap_or_else(|| ProbeOutcome::timed_out(self.policy.aggregate_timeout()));
                (name.clone(), next_status(prev, &outcome, &self.policy, now))
            })
            .collect();

        let next = Arc::new(next);
        *self.snapshot.write() = Arc::clone(&next);

        let mut raised = Vec::new();
        let mut down_cycles = self.down_cycles.lock();
        let mut alerts = self.alerts.lock();

        for (name, status) in next.iter() {
            let was = previous.get(name).map_or(HealthState::Unknown, |s| s.status);
            if was != status.status {
                log_transition(name, was, status);
            }

            match status.status {
                HealthState::Down if was != HealthState::Down => {
                    down_cycles.insert(name.clone(), 0);
                    raised.push(alert(status, AlertKind::Down, now));
                }
                HealthState::Down => {
                    let cycles = down_cycles.entry(name.clone()).or_insert(0);
                    *cycles += 1;
                    if self.policy.alert_repeat_after > 0 && *cycles >= self.policy.alert_repeat_after
                    {
                        *cycles = 0;
                        raised.push(alert(status, AlertKind::StillDown, now));
                    }
                }
                HealthState::Ok => {
                    down_cycles.remove(name);
                    alerts.retain(|a| &a.service != name);
                }
                HealthState::Degraded | HealthState::Unknown => {
                    down_cycles.remove(name);
                }
            }
        }

        alerts.extend(raised.iter().cloned());
        let overflow = alerts.len().saturating_sub(MAX_ALERTS);
        alerts.drain(..overflow);

        raised
    }
}

fn alert(status: &HealthStatus, kind: AlertKind, now: DateTime<Utc>) -> HealthAlert {
    let message = match kind {
        AlertKind::Down => format!(
            "{} is down after {} consecutive failed health checks",
            status.service, status.consecutive_failures
        ),
        AlertKind::StillDown => format!(
            "{} is still down ({} consecutive failed health checks)",
            status.service, status.consecutive_failures
        ),
    };
    HealthAlert {
        id: Uuid::new_v4(),
        service: status.service.clone(),
        kind,
        raised_at: now,
        consecutive_failures: status.consecutive_failures,
        message,
    }
}

fn log_transition(service: &str, from: HealthState, to: &HealthStatus) {
    match to.status {
        HealthState::Down => tracing::warn!(
            service = %service,
            from = %from,
            failures = to.consecutive_failures,
            error = ?to.last_error,
            "Service is down"
        ),
        HealthState::Degraded => tracing::info!(
            service = %service,
            from = %from,
            error = ?to.last_error,
            "Service degraded"
        ),
        HealthState::Ok => tracing::info!(service = %service, from = %from, "Service healthy"),
        HealthState::Unknown => {}
    }
}
