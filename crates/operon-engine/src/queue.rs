//! Durable retry queue for failed analysis jobs.
//!
//! Failed jobs are parked here and re-driven by the background processor
//! with exponential backoff until they succeed, exhaust their retries, or
//! are cancelled. The queue degrades instead of crashing: every operation
//! survives a lost store by reporting failure or empty results, so the
//! surrounding job pipeline keeps running in a non-persistent mode.

use std::sync::Arc;

use operon_core::{
    models::Metadata, Clock, QueueStats, QueueStatus, RetryPriority, RetryQueueItem, SessionId,
    Tier,
};
use uuid::Uuid;

use crate::{
    alerts::AdminAlerter,
    retry::{RetryDecision, RetryPolicy},
    storage::EngineStorage,
    truncate_chars, ALERT_ERROR_MAX_CHARS, STORED_ERROR_MAX_CHARS,
};

/// Request to park a failed job for redrive.
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    /// Session to redrive. Required.
    pub session_id: SessionId,
    /// Tier of the failed job. Required.
    pub tier: Tier,
    /// Opaque payload the executor needs. Required, non-empty.
    pub problem_statement: String,
    /// Notification address for the purchasing user.
    pub email: Option<String>,
    /// Dequeue priority; defaults to medium.
    pub priority: Option<RetryPriority>,
    /// Attempt budget; defaults to 5.
    pub max_retries: Option<i32>,
}

impl EnqueueRequest {
    /// Creates a request with defaults for the optional fields.
    pub fn new(session_id: SessionId, tier: Tier, problem_statement: impl Into<String>) -> Self {
        Self {
            session_id,
            tier,
            problem_statement: problem_statement.into(),
            email: None,
            priority: None,
            max_retries: None,
        }
    }
}

/// Outcome of [`RetryQueue::mark_for_retry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// The item was rescheduled with backoff.
    WillRetry,
    /// The item will not be retried (exhausted, missing, or store lost).
    WillNotRetry,
}

impl RetryOutcome {
    /// Whether another attempt is scheduled.
    pub fn will_retry(self) -> bool {
        matches!(self, Self::WillRetry)
    }
}

/// Durable holding area for failed jobs awaiting a backed-off re-attempt.
pub struct RetryQueue {
    storage: Arc<dyn EngineStorage>,
    alerter: Arc<AdminAlerter>,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl RetryQueue {
    /// Creates a queue over the given storage and alerting collaborators.
    pub fn new(
        storage: Arc<dyn EngineStorage>,
        alerter: Arc<AdminAlerter>,
        policy: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { storage, alerter, policy, clock }
    }

    /// The policy driving this queue's backoff schedule.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Parks a failed job for redrive. Returns whether the session is
    /// queued.
    ///
    /// Immediately eligible (`next_retry_at = now`). A session that already
    /// has an active item is left as-is and reported as queued. A lost
    /// store reports `false` instead of panicking so the failure handler
    /// can continue.
    pub async fn enqueue(&self, request: EnqueueRequest) -> bool {
        if request.session_id.as_str().is_empty() || request.problem_statement.is_empty() {
            tracing::warn!("rejecting enqueue with empty session or problem statement");
            return false;
        }

        let now = self.clock.now_utc();
        let item = RetryQueueItem {
            id: Uuid::new_v4(),
            session_id: request.session_id.clone(),
            tier: request.tier,
            problem_statement: request.problem_statement,
            email: request.email,
            retry_count: 0,
            max_retries: request.max_retries.unwrap_or(crate::DEFAULT_MAX_RETRIES),
            priority: request.priority.unwrap_or(RetryPriority::Medium),
            last_error: None,
            last_attempt_at: None,
            next_retry_at: Some(now),
            status: QueueStatus::Pending,
            created_at: now,
            updated_at: now,
        };

        match self.storage.insert_retry_item(&item).await {
            Ok(true) => {
                tracing::info!(
                    session_id = %item.session_id,
                    tier = %item.tier,
                    "added session to retry queue"
                );
                true
            },
            Ok(false) => {
                tracing::debug!(
                    session_id = %item.session_id,
                    "session already has an active retry item"
                );
                true
            },
            Err(error) => {
                tracing::warn!(
                    session_id = %item.session_id,
                    error = %error,
                    "failed to add session to retry queue"
                );
                false
            },
        }
    }

    /// Claims the next due item, or `None` when nothing is eligible.
    ///
    /// Items come back highest priority first, then oldest first; the
    /// claim marks them `processing` atomically against the store.
    pub async fn dequeue_next(&self) -> Option<RetryQueueItem> {
        match self.storage.claim_next_due(self.clock.now_utc()).await {
            Ok(item) => item,
            Err(error) => {
                tracing::warn!(error = %error, "failed to claim next retry item");
                None
            },
        }
    }

    /// Completes the session's in-flight item.
    ///
    /// Idempotent: completing an already-resolved or missing item is not
    /// an error.
    pub async fn mark_completed(&self, session_id: &SessionId) {
        match self.storage.complete_retry_item(session_id, self.clock.now_utc()).await {
            Ok(true) => {
                tracing::info!(session_id = %session_id, "retry queue item completed");
            },
            Ok(false) => {
                tracing::debug!(
                    session_id = %session_id,
                    "no processing item to complete for session"
                );
            },
            Err(error) => {
                tracing::warn!(
                    session_id = %session_id,
                    error = %error,
                    "failed to mark retry item completed"
                );
            },
        }
    }

    /// Reschedules or permanently fails the session's in-flight item after
    /// a failed attempt.
    ///
    /// Exhaustion fires a critical alert documenting the permanent
    /// failure; the operation row keeps full error detail while the alert
    /// payload carries a shorter excerpt.
    pub async fn mark_for_retry(&self, session_id: &SessionId, error: &str) -> RetryOutcome {
        let item = match self.storage.find_retry_item(session_id).await {
            Ok(Some(item)) => item,
            Ok(None) => {
                tracing::warn!(session_id = %session_id, "no retry item found for session");
                return RetryOutcome::WillNotRetry;
            },
            Err(storage_error) => {
                tracing::warn!(
                    session_id = %session_id,
                    error = %storage_error,
                    "failed to load retry item"
                );
                return RetryOutcome::WillNotRetry;
            },
        };

        let now = self.clock.now_utc();
        let new_retry_count = item.retry_count + 1;
        let stored_error = truncate_chars(error, STORED_ERROR_MAX_CHARS);
        let policy = RetryPolicy {
            max_retries: u32::try_from(item.max_retries).unwrap_or(self.policy.max_retries),
            ..self.policy.clone()
        };

        match policy.decide(u32::try_from(new_retry_count).unwrap_or(u32::MAX), now) {
            RetryDecision::GiveUp { attempts } => {
                if let Err(storage_error) = self
                    .storage
                    .fail_retry_item(session_id, new_retry_count, &stored_error, now)
                    .await
                {
                    tracing::warn!(
                        session_id = %session_id,
                        error = %storage_error,
                        "failed to mark retry item as permanently failed"
                    );
                }

                tracing::error!(
                    session_id = %session_id,
                    attempts,
                    "session permanently failed, retries exhausted"
                );

                let mut context = Metadata::new();
                context.insert(
                    "session_id".to_string(),
                    serde_json::Value::from(session_id.as_str()),
                );
                context.insert("tier".to_string(), serde_json::Value::from(item.tier.to_string()));
                context.insert(
                    "last_error".to_string(),
                    serde_json::Value::from(truncate_chars(error, ALERT_ERROR_MAX_CHARS)),
                );
                self.alerter
                    .alert_critical_error(
                        "Retry Queue Exhausted",
                        &format!(
                            "Session {session_id} has failed after {attempts} retry attempts. \
                             Manual intervention required."
                        ),
                        context,
                    )
                    .await;

                RetryOutcome::WillNotRetry
            },
            RetryDecision::Retry { next_attempt_at } => {
                match self
                    .storage
                    .schedule_retry_item(
                        session_id,
                        new_retry_count,
                        &stored_error,
                        next_attempt_at,
                        now,
                    )
                    .await
                {
                    Ok(true) => {
                        tracing::warn!(
                            session_id = %session_id,
                            retry = new_retry_count,
                            max_retries = item.max_retries,
                            next_retry_at = %next_attempt_at,
                            "session scheduled for retry"
                        );
                        RetryOutcome::WillRetry
                    },
                    Ok(false) => {
                        tracing::debug!(
                            session_id = %session_id,
                            "no processing item to reschedule, likely cancelled"
                        );
                        RetryOutcome::WillNotRetry
                    },
                    Err(storage_error) => {
                        tracing::warn!(
                            session_id = %session_id,
                            error = %storage_error,
                            "failed to reschedule retry item"
                        );
                        RetryOutcome::WillNotRetry
                    },
                }
            },
        }
    }

    /// Cancels the session's active item. Best-effort, never fails.
    pub async fn cancel(&self, session_id: &SessionId) {
        if let Err(error) = self.storage.cancel_retry_item(session_id, self.clock.now_utc()).await
        {
            tracing::warn!(
                session_id = %session_id,
                error = %error,
                "failed to cancel retry item"
            );
        } else {
            tracing::info!(session_id = %session_id, "retry item cancelled");
        }
    }

    /// Per-status counts. All zeros when the store is unreachable, which
    /// dashboards must read as "no data" rather than "no items".
    pub async fn stats(&self) -> QueueStats {
        match self.storage.queue_counts().await {
            Ok(stats) => stats,
            Err(error) => {
                tracing::warn!(error = %error, "failed to load queue stats");
                QueueStats::default()
            },
        }
    }
}
