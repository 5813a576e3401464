//! Repository for the append-only operation event log.
//!
//! Events are write-once, read-many. Nothing here mutates or deletes an
//! existing row; the ordered sequence for an operation is its canonical
//! history.

use std::sync::Arc;

use sqlx::{Executor, PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::{
    error::Result,
    models::{OperationEvent, OperationId, SessionId},
};

/// Repository for operation event rows.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Appends an event to the log.
    ///
    /// # Errors
    ///
    /// Returns error if the store is unreachable; the caller decides
    /// whether to degrade or fail the surrounding mutation.
    pub async fn append(&self, event: &OperationEvent) -> Result<Uuid> {
        self.append_impl(&*self.pool, event).await
    }

    /// Appends an event within a transaction.
    ///
    /// Used by mutators that must commit the event together with the
    /// denormalized operation update.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn append_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &OperationEvent,
    ) -> Result<Uuid> {
        self.append_impl(&mut **tx, event).await
    }

    async fn append_impl<'e, E>(&self, executor: E, event: &OperationEvent) -> Result<Uuid>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let id = sqlx::query_scalar(
            r#"
            INSERT INTO analysis_operation_events (
                id, operation_id, session_id, event_type, part_number,
                previous_state, new_state, error_code, error_message,
                duration_ms, token_count, actor_type, actor_id, metadata,
                created_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15
            )
            RETURNING id
            "#,
        )
        .bind(event.id)
        .bind(event.operation_id.0)
        .bind(event.session_id.as_str())
        .bind(event.event_type.to_string())
        .bind(event.part_number)
        .bind(event.previous_state.map(|s| s.to_string()))
        .bind(event.new_state.map(|s| s.to_string()))
        .bind(&event.error_code)
        .bind(&event.error_message)
        .bind(event.duration_ms)
        .bind(event.token_count)
        .bind(event.actor_type.to_string())
        .bind(&event.actor_id)
        .bind(&event.metadata)
        .bind(event.created_at)
        .fetch_one(executor)
        .await?;

        Ok(id)
    }

    /// Returns all events for an operation, oldest first.
    ///
    /// The ascending order is what replay and audit views rely on.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_operation(
        &self,
        operation_id: OperationId,
    ) -> Result<Vec<OperationEvent>> {
        let events = sqlx::query_as::<_, OperationEvent>(
            r#"
            SELECT id, operation_id, session_id, event_type, part_number,
                   previous_state, new_state, error_code, error_message,
                   duration_ms, token_count, actor_type, actor_id, metadata,
                   created_at
            FROM analysis_operation_events
            WHERE operation_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(operation_id.0)
        .fetch_all(&*self.pool)
        .await?;

        Ok(events)
    }

    /// Returns all events for a session, oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_session(&self, session_id: &SessionId) -> Result<Vec<OperationEvent>> {
        let events = sqlx::query_as::<_, OperationEvent>(
            r#"
            SELECT id, operation_id, session_id, event_type, part_number,
                   previous_state, new_state, error_code, error_message,
                   duration_ms, token_count, actor_type, actor_id, metadata,
                   created_at
            FROM analysis_operation_events
            WHERE session_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(session_id.as_str())
        .fetch_all(&*self.pool)
        .await?;

        Ok(events)
    }

    /// Counts events recorded for an operation.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn count_by_operation(&self, operation_id: OperationId) -> Result<i64> {
        let count: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM analysis_operation_events
            WHERE operation_id = $1
            "#,
        )
        .bind(operation_id.0)
        .fetch_one(&*self.pool)
        .await?;

        Ok(count.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn repository_can_be_created() {
        let pool = sqlx::PgPool::connect_lazy("postgresql://test").unwrap();
        let _repo = Repository::new(Arc::new(pool));
    }
}
