//! Repository for retry queue database operations.
//!
//! The claim here is the one place the engine needs true cross-process
//! mutual exclusion: multiple processor replicas race on the same table,
//! and `FOR UPDATE SKIP LOCKED` inside a conditional `UPDATE ... RETURNING`
//! guarantees each pending row is handed to exactly one of them.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{
    error::Result,
    models::{QueueStats, RetryQueueItem, SessionId},
};

const SELECT_COLUMNS: &str = r#"
    id, session_id, tier, problem_statement, email, retry_count, max_retries,
    priority, last_error, last_attempt_at, next_retry_at, status,
    created_at, updated_at
"#;

/// Repository for retry queue rows.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Inserts a new queue item.
    ///
    /// Returns `false` without error when the session already has an
    /// active (pending or processing) item; the partial unique index makes
    /// the duplicate check and the insert one atomic statement.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails for any other reason.
    pub async fn insert(&self, item: &RetryQueueItem) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO analysis_retry_queue (
                id, session_id, tier, problem_statement, email, retry_count,
                max_retries, priority, last_error, last_attempt_at,
                next_retry_at, status, created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14
            )
            ON CONFLICT (session_id) WHERE status IN ('pending', 'processing')
            DO NOTHING
            "#,
        )
        .bind(item.id)
        .bind(item.session_id.as_str())
        .bind(item.tier.to_string())
        .bind(&item.problem_statement)
        .bind(&item.email)
        .bind(item.retry_count)
        .bind(item.max_retries)
        .bind(item.priority.as_i32())
        .bind(&item.last_error)
        .bind(item.last_attempt_at)
        .bind(item.next_retry_at)
        .bind(item.status.to_string())
        .bind(item.created_at)
        .bind(item.updated_at)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Atomically claims the next due pending item.
    ///
    /// Selection and the `pending -> processing` transition are one
    /// statement: the subselect takes the highest-priority (lowest value),
    /// oldest eligible row under `FOR UPDATE SKIP LOCKED`, and the outer
    /// update stamps `last_attempt_at` as part of the claim. Two
    /// concurrent processors can never receive the same row.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn claim_next_due(&self, now: DateTime<Utc>) -> Result<Option<RetryQueueItem>> {
        let item = sqlx::query_as::<_, RetryQueueItem>(&format!(
            r#"
            UPDATE analysis_retry_queue
            SET status = 'processing', last_attempt_at = $1, updated_at = $1
            WHERE id = (
                SELECT id FROM analysis_retry_queue
                WHERE status = 'pending'
                  AND (next_retry_at IS NULL OR next_retry_at <= $1)
                ORDER BY priority ASC, created_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {SELECT_COLUMNS}
            "#
        ))
        .bind(now)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(item)
    }

    /// Finds the most recent queue item for a session.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_session(&self, session_id: &SessionId) -> Result<Option<RetryQueueItem>> {
        let item = sqlx::query_as::<_, RetryQueueItem>(&format!(
            r#"
            SELECT {SELECT_COLUMNS}
            FROM analysis_retry_queue
            WHERE session_id = $1
            ORDER BY created_at DESC
            LIMIT 1
            "#
        ))
        .bind(session_id.as_str())
        .fetch_optional(&*self.pool)
        .await?;

        Ok(item)
    }

    /// Marks the session's in-flight item completed.
    ///
    /// Only a `processing` row is touched, so a late success report for an
    /// item that was cancelled or already resolved is a no-op. Returns
    /// whether a row changed.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn mark_completed(
        &self,
        session_id: &SessionId,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE analysis_retry_queue
            SET status = 'completed', updated_at = $1
            WHERE session_id = $2 AND status = 'processing'
            "#,
        )
        .bind(now)
        .bind(session_id.as_str())
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Returns the session's in-flight item to `pending` with a new
    /// schedule.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn schedule_retry(
        &self,
        session_id: &SessionId,
        retry_count: i32,
        last_error: &str,
        next_retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE analysis_retry_queue
            SET status = 'pending',
                retry_count = $1,
                last_error = $2,
                next_retry_at = $3,
                updated_at = $4
            WHERE session_id = $5 AND status = 'processing'
            "#,
        )
        .bind(retry_count)
        .bind(last_error)
        .bind(next_retry_at)
        .bind(now)
        .bind(session_id.as_str())
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Permanently fails the session's in-flight item.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn mark_failed(
        &self,
        session_id: &SessionId,
        retry_count: i32,
        last_error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE analysis_retry_queue
            SET status = 'failed',
                retry_count = $1,
                last_error = $2,
                next_retry_at = NULL,
                updated_at = $3
            WHERE session_id = $4 AND status = 'processing'
            "#,
        )
        .bind(retry_count)
        .bind(last_error)
        .bind(now)
        .bind(session_id.as_str())
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Cancels any active item for the session.
    ///
    /// A `processing` item is cancelled too; the in-flight executor call is
    /// not interrupted, and its eventual outcome report becomes a no-op.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn cancel(&self, session_id: &SessionId, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE analysis_retry_queue
            SET status = 'cancelled', updated_at = $1
            WHERE session_id = $2 AND status IN ('pending', 'processing')
            "#,
        )
        .bind(now)
        .bind(session_id.as_str())
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Counts items grouped by status.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn counts(&self) -> Result<QueueStats> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT status, COUNT(*) FROM analysis_retry_queue
            GROUP BY status
            "#,
        )
        .fetch_all(&*self.pool)
        .await?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            let count = u64::try_from(count).unwrap_or(0);
            match status.as_str() {
                "pending" => stats.pending = count,
                "processing" => stats.processing = count,
                "completed" => stats.completed = count,
                "failed" => stats.failed = count,
                "cancelled" => stats.cancelled = count,
                other => {
                    tracing::warn!(status = other, "ignoring unknown queue status in counts");
                },
            }
            stats.total += count;
        }

        Ok(stats)
    }
}
