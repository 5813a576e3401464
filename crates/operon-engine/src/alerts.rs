//! Deduplicated, rate-limited operator alerting.
//!
//! One human-readable notification per noteworthy condition, with a
//! cooldown per alert signature so sustained failures do not become
//! notification storms. Every dispatched alert is also persisted for
//! audit; persistence failure never blocks dispatch. The failure-rate
//! monitor feeding the high-failure-rate trigger lives here too.
//!
//! The suppression map and failure window are process-local by intent:
//! multiple replicas may each rate-limit and alert independently, which is
//! an accepted imprecision of this layer.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use chrono::{DateTime, Utc};
use operon_core::{
    models::Metadata, AdminNotification, AlertSeverity, AlertType, Clock,
};
use uuid::Uuid;

use crate::{
    executor::NotificationSink, storage::EngineStorage, truncate_chars, ALERT_ERROR_MAX_CHARS,
};

/// Tuning for alert suppression and failure-rate monitoring.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertConfig {
    /// Minimum spacing between alerts with the same signature.
    pub cooldown: Duration,

    /// Sliding window for the failure-rate monitor.
    pub failure_window: Duration,

    /// Failure percentage (0-100) that triggers a high-failure-rate alert.
    pub failure_rate_threshold: f64,

    /// Requests the window must hold before the rate is meaningful.
    pub min_requests_for_alert: u32,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(5 * 60),
            failure_window: Duration::from_secs(15 * 60),
            failure_rate_threshold: 30.0,
            min_requests_for_alert: 10,
        }
    }
}

/// Parameters for one alert.
#[derive(Debug, Clone)]
pub struct AlertParams {
    /// Alert kind; part of the suppression signature.
    pub alert_type: AlertType,
    /// Short title shown in the notification subject.
    pub title: String,
    /// Full message body.
    pub message: String,
    /// Severity; rendered into the subject prefix.
    pub severity: AlertSeverity,
    /// Context rendered as key/value lines; a `service` entry joins the
    /// suppression signature.
    pub metadata: Metadata,
}

/// Snapshot of the failure-rate window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FailureRateStats {
    /// Requests observed in the current window.
    pub requests: u32,
    /// Failures observed in the current window.
    pub failures: u32,
    /// Failure percentage (0-100).
    pub failure_rate: f64,
    /// Window length in minutes.
    pub window_minutes: u64,
}

#[derive(Debug)]
struct FailureRateWindow {
    requests: u32,
    failures: u32,
    window_start: DateTime<Utc>,
}

/// Deduplicated alert dispatcher with failure-rate monitoring.
pub struct AdminAlerter {
    config: AlertConfig,
    notifier: Arc<dyn NotificationSink>,
    storage: Arc<dyn EngineStorage>,
    clock: Arc<dyn Clock>,
    recent: Mutex<HashMap<String, DateTime<Utc>>>,
    window: Mutex<FailureRateWindow>,
}

impl AdminAlerter {
    /// Creates an alerter with the given collaborators.
    pub fn new(
        config: AlertConfig,
        notifier: Arc<dyn NotificationSink>,
        storage: Arc<dyn EngineStorage>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let window_start = clock.now_utc();
        Self {
            config,
            notifier,
            storage,
            clock,
            recent: Mutex::new(HashMap::new()),
            window: Mutex::new(FailureRateWindow { requests: 0, failures: 0, window_start }),
        }
    }

    /// Sends one alert; returns whether it was actually dispatched.
    ///
    /// Duplicates of the same signature inside the cooldown are dropped
    /// before formatting. A failed dispatch does not arm the cooldown, so
    /// the next occurrence retries the send.
    pub async fn send_alert(&self, params: AlertParams) -> bool {
        let key = alert_key(params.alert_type, &params.metadata);
        let now = self.clock.now_utc();

        if !self.can_send(&key, now) {
            tracing::debug!(alert_key = %key, "suppressing duplicate alert");
            return false;
        }

        self.persist(&params, now).await;

        let title = format!("[{}] {}", severity_tag(params.severity), params.title);
        let content = format_alert_content(&params, now);

        let dispatched = self.notifier.notify(&title, &content).await;
        if dispatched {
            self.mark_sent(key, now);
            tracing::info!(alert_type = %params.alert_type, title = %params.title, "alert sent");
        } else {
            tracing::warn!(
                alert_type = %params.alert_type,
                title = %params.title,
                "alert dispatch failed"
            );
        }

        dispatched
    }

    /// Alert fired when a circuit breaker opens. Always critical.
    pub async fn alert_circuit_breaker_open(
        &self,
        service: &str,
        failure_count: u32,
        last_error: Option<&str>,
    ) -> bool {
        let mut metadata = Metadata::new();
        metadata.insert("service".to_string(), serde_json::Value::from(service));
        metadata.insert("failure_count".to_string(), serde_json::Value::from(failure_count));
        if let Some(error) = last_error {
            metadata.insert(
                "last_error".to_string(),
                serde_json::Value::from(truncate_chars(error, ALERT_ERROR_MAX_CHARS)),
            );
        }

        self.send_alert(AlertParams {
            alert_type: AlertType::CircuitBreakerOpen,
            title: format!("Circuit Breaker Opened: {service}"),
            message: format!(
                "The circuit breaker for {service} has opened after repeated failures. \
                 Calls are being shed to prevent cascading failures; manual intervention \
                 may be required."
            ),
            severity: AlertSeverity::Critical,
            metadata,
        })
        .await
    }

    /// Alert fired when the failure-rate window crosses its threshold.
    ///
    /// Critical above 50%, warning otherwise.
    pub async fn alert_high_failure_rate(
        &self,
        failure_rate: f64,
        threshold: f64,
        window_minutes: u64,
    ) -> bool {
        let severity =
            if failure_rate > 50.0 { AlertSeverity::Critical } else { AlertSeverity::Warning };

        let mut metadata = Metadata::new();
        metadata.insert("failure_rate".to_string(), serde_json::Value::from(failure_rate));
        metadata.insert("threshold".to_string(), serde_json::Value::from(threshold));
        metadata.insert("window_minutes".to_string(), serde_json::Value::from(window_minutes));

        self.send_alert(AlertParams {
            alert_type: AlertType::HighFailureRate,
            title: format!("High Failure Rate Detected: {failure_rate:.1}%"),
            message: format!(
                "The analysis failure rate has exceeded the threshold of {threshold}%. \
                 {failure_rate:.1}% of requests in the last {window_minutes} minutes have \
                 failed. Please investigate the root cause."
            ),
            severity,
            metadata,
        })
        .await
    }

    /// Alert for unrecoverable system errors. Always critical.
    pub async fn alert_critical_error(
        &self,
        error_type: &str,
        message: &str,
        context: Metadata,
    ) -> bool {
        let mut metadata = context;
        metadata.insert("error_type".to_string(), serde_json::Value::from(error_type));

        self.send_alert(AlertParams {
            alert_type: AlertType::CriticalError,
            title: format!("Critical Error: {error_type}"),
            message: message.to_string(),
            severity: AlertSeverity::Critical,
            metadata,
        })
        .await
    }

    /// Generic system-issue alert with caller-specified severity.
    pub async fn alert_system_issue(
        &self,
        title: &str,
        message: &str,
        severity: AlertSeverity,
        metadata: Metadata,
    ) -> bool {
        self.send_alert(AlertParams {
            alert_type: AlertType::SystemAlert,
            title: title.to_string(),
            message: message.to_string(),
            severity,
            metadata,
        })
        .await
    }

    /// Feeds one request outcome into the failure-rate window.
    ///
    /// When the window holds enough requests and the failure percentage
    /// reaches the threshold, a high-failure-rate alert fires on a spawned
    /// task; its outcome never reaches the caller.
    pub fn record_request_outcome(self: &Arc<Self>, success: bool) {
        let now = self.clock.now_utc();
        let should_alert = {
            let mut window = self.lock_window();

            let age = (now - window.window_start).to_std().unwrap_or_default();
            if age > self.config.failure_window {
                window.requests = 0;
                window.failures = 0;
                window.window_start = now;
            }

            window.requests += 1;
            if !success {
                window.failures += 1;
            }

            window.requests >= self.config.min_requests_for_alert
                && rate_percent(window.failures, window.requests)
                    >= self.config.failure_rate_threshold
        };

        if should_alert {
            let alerter = Arc::clone(self);
            let stats = self.failure_rate_stats();
            let threshold = self.config.failure_rate_threshold;
            tokio::spawn(async move {
                alerter
                    .alert_high_failure_rate(stats.failure_rate, threshold, stats.window_minutes)
                    .await;
            });
        }
    }

    /// Current failure-rate window snapshot.
    pub fn failure_rate_stats(&self) -> FailureRateStats {
        let window = self.lock_window();
        FailureRateStats {
            requests: window.requests,
            failures: window.failures,
            failure_rate: rate_percent(window.failures, window.requests),
            window_minutes: self.config.failure_window.as_secs() / 60,
        }
    }

    fn can_send(&self, key: &str, now: DateTime<Utc>) -> bool {
        let recent = self.lock_recent();
        match recent.get(key) {
            None => true,
            Some(last_sent) => {
                let elapsed = (now - *last_sent).to_std().unwrap_or_default();
                elapsed >= self.config.cooldown
            },
        }
    }

    fn mark_sent(&self, key: String, now: DateTime<Utc>) {
        let mut recent = self.lock_recent();
        recent.insert(key, now);

        // Drop entries old enough that they can never suppress again.
        let cutoff = now
            - chrono::Duration::from_std(self.config.cooldown * 2)
                .unwrap_or_else(|_| chrono::Duration::zero());
        recent.retain(|_, sent_at| *sent_at >= cutoff);
    }

    async fn persist(&self, params: &AlertParams, now: DateTime<Utc>) {
        let notification = AdminNotification {
            id: Uuid::new_v4(),
            notification_type: params.alert_type,
            title: params.title.clone(),
            message: params.message.clone(),
            severity: params.severity,
            metadata: sqlx::types::Json(params.metadata.clone()),
            created_at: now,
        };

        if let Err(error) = self.storage.insert_alert(&notification).await {
            tracing::warn!(
                alert_type = %params.alert_type,
                error = %error,
                "failed to persist alert for audit"
            );
        }
    }

    fn lock_recent(&self) -> MutexGuard<'_, HashMap<String, DateTime<Utc>>> {
        self.recent.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_window(&self) -> MutexGuard<'_, FailureRateWindow> {
        self.window.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Suppression signature: alert type, qualified by the `service` metadata
/// entry when present so different services are not conflated.
fn alert_key(alert_type: AlertType, metadata: &Metadata) -> String {
    match metadata.get("service").and_then(|v| v.as_str()) {
        Some(service) => format!("{alert_type}:{service}"),
        None => alert_type.to_string(),
    }
}

fn severity_tag(severity: AlertSeverity) -> String {
    severity.to_string().to_uppercase()
}

fn rate_percent(failures: u32, requests: u32) -> f64 {
    if requests == 0 {
        0.0
    } else {
        f64::from(failures) / f64::from(requests) * 100.0
    }
}

fn format_alert_content(params: &AlertParams, now: DateTime<Utc>) -> String {
    let mut lines = vec![
        format!("Alert Type: {}", params.alert_type),
        format!("Severity: {}", params.severity),
        String::new(),
        params.message.clone(),
    ];

    if !params.metadata.is_empty() {
        lines.push(String::new());
        lines.push("Details:".to_string());
        let mut keys: Vec<_> = params.metadata.keys().collect();
        keys.sort();
        for key in keys {
            lines.push(format!("- {key}: {}", params.metadata[key]));
        }
    }

    lines.push(String::new());
    lines.push(format!("Timestamp: {}", now.to_rfc3339()));

    lines.join("\n")
}
