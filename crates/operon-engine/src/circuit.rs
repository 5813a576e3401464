//! Circuit breaker for a flaky upstream dependency.
//!
//! Tracks call outcomes per named service and opens to shed load when
//! failures cluster, so a struggling dependency is not hammered while it
//! recovers.
//!
//! # State machine
//!
//! ```text
//! closed --(failure threshold or windowed rate)--> open
//! open --(cooldown elapsed)--> half_open
//! half_open --(successful probe)--> closed
//! half_open --(failed probe)--> open
//! any --(force_reset)--> closed
//! ```
//!
//! Every transition into `open` notifies the operator through the
//! [`AdminAlerter`]; the alerter's own cooldown keeps a flapping breaker
//! from becoming a notification storm.

use std::{
    collections::HashMap,
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use operon_core::Clock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::alerts::AdminAlerter;

/// Only failures inside this window count as "recent" in stats output.
const RECENT_FAILURE_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Circuit breaker tuning shared by all protected services.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// Consecutive failures that trip the breaker.
    pub failure_threshold: u32,

    /// Minimum requests before the failure rate is considered.
    pub min_requests_for_rate: u32,

    /// Failure rate (0.0 to 1.0) that trips the breaker.
    pub failure_rate_threshold: f64,

    /// Time to wait in `open` before admitting a probe.
    pub open_cooldown: Duration,

    /// Successful probes needed to close from `half_open`.
    pub success_threshold: u32,

    /// Probes admitted while `half_open`.
    pub half_open_max_probes: u32,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            min_requests_for_rate: 10,
            failure_rate_threshold: 0.5,
            open_cooldown: Duration::from_secs(30),
            success_threshold: 1,
            half_open_max_probes: 1,
        }
    }
}

/// Current state of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, calls pass through.
    Closed,
    /// Dependency unhealthy, calls rejected immediately.
    Open,
    /// Testing recovery with a limited probe.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Public statistics snapshot for one service's breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    /// Current state.
    pub state: CircuitState,
    /// Consecutive failures since the last success.
    pub failures: u32,
    /// Failures inside the recent window.
    pub recent_failures: u32,
    /// Requests observed in the current measurement window.
    pub total_requests: u32,
    /// Failed requests in the current measurement window.
    pub failed_requests: u32,
    /// Most recent failure message.
    pub last_error: Option<String>,
}

impl CircuitBreakerStats {
    /// Failure rate (0.0 to 1.0) over the current window.
    pub fn failure_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            f64::from(self.failed_requests) / f64::from(self.total_requests)
        }
    }
}

#[derive(Debug, Clone)]
struct CircuitEntry {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    total_requests: u32,
    failed_requests: u32,
    recent_failures: Vec<DateTime<Utc>>,
    last_error: Option<String>,
    last_opened_at: Option<Instant>,
    half_open_probes: u32,
}

impl CircuitEntry {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            total_requests: 0,
            failed_requests: 0,
            recent_failures: Vec::new(),
            last_error: None,
            last_opened_at: None,
            half_open_probes: 0,
        }
    }

    fn failure_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            f64::from(self.failed_requests) / f64::from(self.total_requests)
        }
    }

    fn reset_counters(&mut self) {
        self.total_requests = 0;
        self.failed_requests = 0;
        self.consecutive_failures = 0;
        self.consecutive_successes = 0;
        self.half_open_probes = 0;
    }

    fn prune_recent(&mut self, now: DateTime<Utc>) {
        let cutoff = now
            - chrono::Duration::from_std(RECENT_FAILURE_WINDOW)
                .unwrap_or_else(|_| chrono::Duration::zero());
        self.recent_failures.retain(|t| *t >= cutoff);
    }
}

/// Thread-safe circuit breaker manager for named services.
///
/// One breaker per protected dependency, keyed by service name. Shared by
/// delivery workers through internal locking.
pub struct CircuitBreakerManager {
    config: CircuitConfig,
    circuits: Mutex<HashMap<String, CircuitEntry>>,
    clock: Arc<dyn Clock>,
    alerter: Option<Arc<AdminAlerter>>,
}

impl CircuitBreakerManager {
    /// Creates a manager without alerting wired in.
    pub fn new(config: CircuitConfig, clock: Arc<dyn Clock>) -> Self {
        Self { config, circuits: Mutex::new(HashMap::new()), clock, alerter: None }
    }

    /// Creates a manager that notifies the operator on every open.
    pub fn with_alerter(
        config: CircuitConfig,
        clock: Arc<dyn Clock>,
        alerter: Arc<AdminAlerter>,
    ) -> Self {
        Self { config, circuits: Mutex::new(HashMap::new()), clock, alerter: Some(alerter) }
    }

    /// Whether a call to the service should proceed.
    ///
    /// Returns `false` while `open` with an unexpired cooldown. An expired
    /// cooldown moves the breaker to `half_open`, admitting a probe.
    pub async fn allow_request(&self, service: &str) -> bool {
        let now = self.clock.now();
        let mut circuits = self.circuits.lock().await;
        let entry = circuits.entry(service.to_string()).or_insert_with(CircuitEntry::new);

        if entry.state == CircuitState::Open {
            let cooled_down = entry
                .last_opened_at
                .is_some_and(|opened_at| now.duration_since(opened_at) >= self.config.open_cooldown);
            if cooled_down {
                tracing::info!(service, "circuit breaker transitioning to half-open");
                entry.state = CircuitState::HalfOpen;
                entry.half_open_probes = 0;
                entry.consecutive_successes = 0;
            }
        }

        match entry.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => entry.half_open_probes < self.config.half_open_max_probes,
        }
    }

    /// Records a successful call outcome for the service.
    ///
    /// A single successful probe closes the breaker from `half_open`.
    pub async fn record_success(&self, service: &str) {
        let mut circuits = self.circuits.lock().await;
        let entry = circuits.entry(service.to_string()).or_insert_with(CircuitEntry::new);

        entry.total_requests += 1;
        entry.consecutive_failures = 0;

        match entry.state {
            CircuitState::Closed => {},
            CircuitState::Open => {
                tracing::warn!(service, "recorded success while circuit open");
            },
            CircuitState::HalfOpen => {
                entry.consecutive_successes += 1;
                entry.half_open_probes += 1;

                if entry.consecutive_successes >= self.config.success_threshold {
                    tracing::info!(service, "circuit breaker closing, dependency recovered");
                    entry.state = CircuitState::Closed;
                    entry.reset_counters();
                    entry.last_error = None;
                }
            },
        }
    }

    /// Records a failed call outcome for the service.
    ///
    /// May trip the breaker; a trip notifies the operator through the
    /// configured alerter.
    pub async fn record_failure(&self, service: &str, error: &str) {
        let opened = {
            let now_utc = self.clock.now_utc();
            let mut circuits = self.circuits.lock().await;
            let entry = circuits.entry(service.to_string()).or_insert_with(CircuitEntry::new);

            entry.total_requests += 1;
            entry.failed_requests += 1;
            entry.consecutive_failures += 1;
            entry.consecutive_successes = 0;
            entry.last_error = Some(error.to_string());
            entry.recent_failures.push(now_utc);
            entry.prune_recent(now_utc);

            let tripped = match entry.state {
                CircuitState::Closed => self.should_open(entry),
                CircuitState::Open => false,
                CircuitState::HalfOpen => {
                    entry.half_open_probes += 1;
                    true
                },
            };

            if tripped {
                tracing::warn!(
                    service,
                    consecutive_failures = entry.consecutive_failures,
                    failure_rate = entry.failure_rate(),
                    "circuit breaker opening"
                );
                entry.state = CircuitState::Open;
                entry.last_opened_at = Some(self.clock.now());
                Some((entry.consecutive_failures, entry.last_error.clone()))
            } else {
                None
            }
        };

        if let (Some((failures, last_error)), Some(alerter)) = (opened, &self.alerter) {
            alerter
                .alert_circuit_breaker_open(service, failures, last_error.as_deref())
                .await;
        }
    }

    /// Current state for a service; `closed` when never seen.
    pub async fn state(&self, service: &str) -> CircuitState {
        let circuits = self.circuits.lock().await;
        circuits.get(service).map_or(CircuitState::Closed, |entry| entry.state)
    }

    /// Statistics snapshot for a service.
    pub async fn stats(&self, service: &str) -> Option<CircuitBreakerStats> {
        let now_utc = self.clock.now_utc();
        let mut circuits = self.circuits.lock().await;
        let entry = circuits.get_mut(service)?;
        entry.prune_recent(now_utc);

        Some(CircuitBreakerStats {
            state: entry.state,
            failures: entry.consecutive_failures,
            recent_failures: u32::try_from(entry.recent_failures.len()).unwrap_or(u32::MAX),
            total_requests: entry.total_requests,
            failed_requests: entry.failed_requests,
            last_error: entry.last_error.clone(),
        })
    }

    /// Unconditionally returns the breaker to `closed`, clearing counters.
    ///
    /// Operator action for manual recovery after the underlying issue is
    /// resolved.
    pub async fn force_reset(&self, service: &str) {
        let mut circuits = self.circuits.lock().await;
        let entry = circuits.entry(service.to_string()).or_insert_with(CircuitEntry::new);

        tracing::info!(service, "circuit breaker force reset by operator");
        entry.state = CircuitState::Closed;
        entry.reset_counters();
        entry.recent_failures.clear();
        entry.last_error = None;
        entry.last_opened_at = None;
    }

    fn should_open(&self, entry: &CircuitEntry) -> bool {
        if entry.consecutive_failures >= self.config.failure_threshold {
            return true;
        }

        entry.total_requests >= self.config.min_requests_for_rate
            && entry.failure_rate() >= self.config.failure_rate_threshold
    }
}
