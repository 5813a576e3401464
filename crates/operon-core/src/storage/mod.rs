//! Database access layer implementing the repository pattern for the
//! lifecycle engine's persistence.
//!
//! The repository layer acts as an anti-corruption layer, translating
//! between domain models and database schemas. All database operations MUST
//! go through these repositories; direct SQL outside this module is
//! forbidden to maintain consistency.

use std::sync::Arc;

use sqlx::PgPool;

pub mod admin_notifications;
pub mod metrics;
pub mod operation_events;
pub mod operations;
pub mod retry_queue;

use crate::error::Result;

/// Container for all repository instances providing unified database
/// access.
///
/// `Storage` is the entry point for every database operation in the
/// engine. It manages a shared connection pool and provides type-safe
/// access to each domain repository.
#[derive(Clone)]
pub struct Storage {
    /// Repository for analysis operation rows.
    pub operations: Arc<operations::Repository>,

    /// Repository for the append-only operation event log.
    pub operation_events: Arc<operation_events::Repository>,

    /// Repository for retry queue items.
    pub retry_queue: Arc<retry_queue::Repository>,

    /// Repository for admin alert audit records.
    pub admin_notifications: Arc<admin_notifications::Repository>,

    /// Repository for raw and aggregated metrics.
    pub metrics: Arc<metrics::Repository>,
}

impl Storage {
    /// Creates a new storage instance with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            operations: Arc::new(operations::Repository::new(pool.clone())),
            operation_events: Arc::new(operation_events::Repository::new(pool.clone())),
            retry_queue: Arc::new(retry_queue::Repository::new(pool.clone())),
            admin_notifications: Arc::new(admin_notifications::Repository::new(pool.clone())),
            metrics: Arc::new(metrics::Repository::new(pool)),
        }
    }

    /// Performs a health check on the database connection.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy or the
    /// query times out.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.operations.pool()).await?;

        Ok(())
    }

    /// Creates the engine's tables and indexes if they do not exist.
    ///
    /// Idempotent; safe to run on every startup.
    ///
    /// # Errors
    ///
    /// Returns error if any DDL statement fails.
    pub async fn run_migrations(pool: &PgPool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS analysis_operations (
                id UUID PRIMARY KEY,
                session_id TEXT NOT NULL UNIQUE,
                tier TEXT NOT NULL,
                state TEXT NOT NULL,
                total_parts INTEGER NOT NULL,
                completed_parts INTEGER NOT NULL DEFAULT 0,
                current_part INTEGER,
                started_at TIMESTAMPTZ,
                last_part_completed_at TIMESTAMPTZ,
                completed_at TIMESTAMPTZ,
                estimated_completion_at TIMESTAMPTZ,
                last_error TEXT,
                last_error_at TIMESTAMPTZ,
                failed_part INTEGER,
                retry_count INTEGER NOT NULL DEFAULT 0,
                triggered_by TEXT,
                admin_notes TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                CHECK (completed_parts >= 0 AND completed_parts <= total_parts)
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS analysis_operation_events (
                id UUID PRIMARY KEY,
                operation_id UUID NOT NULL,
                session_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                part_number INTEGER,
                previous_state TEXT,
                new_state TEXT,
                error_code TEXT,
                error_message TEXT,
                duration_ms BIGINT,
                token_count INTEGER,
                actor_type TEXT NOT NULL,
                actor_id TEXT,
                metadata JSONB NOT NULL DEFAULT '{}',
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_operation_events_operation
            ON analysis_operation_events(operation_id, created_at)
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS analysis_retry_queue (
                id UUID PRIMARY KEY,
                session_id TEXT NOT NULL,
                tier TEXT NOT NULL,
                problem_statement TEXT NOT NULL,
                email TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 5,
                priority INTEGER NOT NULL DEFAULT 2,
                last_error TEXT,
                last_attempt_at TIMESTAMPTZ,
                next_retry_at TIMESTAMPTZ,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(pool)
        .await?;

        // One active item per session; completed/failed/cancelled rows stay
        // behind as history.
        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_retry_queue_active_session
            ON analysis_retry_queue(session_id)
            WHERE status IN ('pending', 'processing')
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_retry_queue_due
            ON analysis_retry_queue(status, next_retry_at, priority, created_at)
            WHERE status = 'pending'
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS admin_notifications (
                id UUID PRIMARY KEY,
                notification_type TEXT NOT NULL,
                title TEXT NOT NULL,
                message TEXT NOT NULL,
                severity TEXT NOT NULL,
                metadata JSONB NOT NULL DEFAULT '{}',
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS analysis_metrics (
                id UUID PRIMARY KEY,
                session_id TEXT NOT NULL,
                tier TEXT NOT NULL,
                event_type TEXT NOT NULL,
                duration_ms BIGINT,
                part_number INTEGER,
                error_code TEXT,
                error_message TEXT,
                metadata JSONB NOT NULL DEFAULT '{}',
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_analysis_metrics_created
            ON analysis_metrics(created_at)
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS hourly_metrics (
                id UUID PRIMARY KEY,
                hour_start TIMESTAMPTZ NOT NULL,
                total_requests INTEGER NOT NULL DEFAULT 0,
                successful_requests INTEGER NOT NULL DEFAULT 0,
                failed_requests INTEGER NOT NULL DEFAULT 0,
                partial_successes INTEGER NOT NULL DEFAULT 0,
                retried_requests INTEGER NOT NULL DEFAULT 0,
                avg_duration_ms BIGINT,
                p50_duration_ms BIGINT,
                p95_duration_ms BIGINT,
                p99_duration_ms BIGINT,
                tier_low INTEGER NOT NULL DEFAULT 0,
                tier_mid INTEGER NOT NULL DEFAULT 0,
                tier_high INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(pool)
        .await?;

        Ok(())
    }
}
