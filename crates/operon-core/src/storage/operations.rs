//! Repository for analysis operation database operations.
//!
//! Handles the denormalized operation rows. State changes always travel
//! together with an event append (see
//! [`operation_events`](super::operation_events)); the transactional
//! variants here exist so both writes commit or fail as one unit.

use std::sync::Arc;

use sqlx::{Executor, PgPool, Postgres, Transaction};

use crate::{
    error::Result,
    models::{Operation, OperationId, OperationState, SessionId},
};

/// Repository for analysis operation rows.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns a reference to the database pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Inserts a new operation row.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails or the session already has an
    /// operation (unique constraint).
    pub async fn create(&self, operation: &Operation) -> Result<OperationId> {
        self.create_impl(&*self.pool, operation).await
    }

    /// Inserts a new operation row within a transaction.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn create_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        operation: &Operation,
    ) -> Result<OperationId> {
        self.create_impl(&mut **tx, operation).await
    }

    async fn create_impl<'e, E>(&self, executor: E, operation: &Operation) -> Result<OperationId>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let id = sqlx::query_scalar(
            r#"
            INSERT INTO analysis_operations (
                id, session_id, tier, state, total_parts, completed_parts,
                current_part, started_at, last_part_completed_at, completed_at,
                estimated_completion_at, last_error, last_error_at, failed_part,
                retry_count, triggered_by, admin_notes, created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                $11, $12, $13, $14, $15, $16, $17, $18, $19
            )
            RETURNING id
            "#,
        )
        .bind(operation.id.0)
        .bind(operation.session_id.as_str())
        .bind(operation.tier.to_string())
        .bind(operation.state.to_string())
        .bind(operation.total_parts)
        .bind(operation.completed_parts)
        .bind(operation.current_part)
        .bind(operation.started_at)
        .bind(operation.last_part_completed_at)
        .bind(operation.completed_at)
        .bind(operation.estimated_completion_at)
        .bind(&operation.last_error)
        .bind(operation.last_error_at)
        .bind(operation.failed_part)
        .bind(operation.retry_count)
        .bind(&operation.triggered_by)
        .bind(&operation.admin_notes)
        .bind(operation.created_at)
        .bind(operation.updated_at)
        .fetch_one(executor)
        .await?;

        Ok(OperationId(id))
    }

    /// Writes back every mutable field of an operation row.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn update(&self, operation: &Operation) -> Result<()> {
        self.update_impl(&*self.pool, operation).await
    }

    /// Writes back an operation row within a transaction.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn update_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        operation: &Operation,
    ) -> Result<()> {
        self.update_impl(&mut **tx, operation).await
    }

    async fn update_impl<'e, E>(&self, executor: E, operation: &Operation) -> Result<()>
    where
        E: Executor<'e, Database = Postgres>,
    {
        sqlx::query(
            r#"
            UPDATE analysis_operations
            SET state = $1,
                completed_parts = $2,
                current_part = $3,
                started_at = $4,
                last_part_completed_at = $5,
                completed_at = $6,
                estimated_completion_at = $7,
                last_error = $8,
                last_error_at = $9,
                failed_part = $10,
                retry_count = $11,
                triggered_by = $12,
                admin_notes = $13,
                updated_at = $14
            WHERE id = $15
            "#,
        )
        .bind(operation.state.to_string())
        .bind(operation.completed_parts)
        .bind(operation.current_part)
        .bind(operation.started_at)
        .bind(operation.last_part_completed_at)
        .bind(operation.completed_at)
        .bind(operation.estimated_completion_at)
        .bind(&operation.last_error)
        .bind(operation.last_error_at)
        .bind(operation.failed_part)
        .bind(operation.retry_count)
        .bind(&operation.triggered_by)
        .bind(&operation.admin_notes)
        .bind(operation.updated_at)
        .bind(operation.id.0)
        .execute(executor)
        .await?;

        Ok(())
    }

    /// Finds an operation by its internal ID.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, operation_id: OperationId) -> Result<Option<Operation>> {
        let operation = sqlx::query_as::<_, Operation>(
            r#"
            SELECT id, session_id, tier, state, total_parts, completed_parts,
                   current_part, started_at, last_part_completed_at, completed_at,
                   estimated_completion_at, last_error, last_error_at, failed_part,
                   retry_count, triggered_by, admin_notes, created_at, updated_at
            FROM analysis_operations
            WHERE id = $1
            "#,
        )
        .bind(operation_id.0)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(operation)
    }

    /// Finds an operation by its external session ID.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_session(&self, session_id: &SessionId) -> Result<Option<Operation>> {
        let operation = sqlx::query_as::<_, Operation>(
            r#"
            SELECT id, session_id, tier, state, total_parts, completed_parts,
                   current_part, started_at, last_part_completed_at, completed_at,
                   estimated_completion_at, last_error, last_error_at, failed_part,
                   retry_count, triggered_by, admin_notes, created_at, updated_at
            FROM analysis_operations
            WHERE session_id = $1
            "#,
        )
        .bind(session_id.as_str())
        .fetch_optional(&*self.pool)
        .await?;

        Ok(operation)
    }

    /// Lists operations currently in a given state, oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn list_by_state(
        &self,
        state: OperationState,
        limit: Option<i64>,
    ) -> Result<Vec<Operation>> {
        let operations = sqlx::query_as::<_, Operation>(
            r#"
            SELECT id, session_id, tier, state, total_parts, completed_parts,
                   current_part, started_at, last_part_completed_at, completed_at,
                   estimated_completion_at, last_error, last_error_at, failed_part,
                   retry_count, triggered_by, admin_notes, created_at, updated_at
            FROM analysis_operations
            WHERE state = $1
            ORDER BY created_at ASC
            LIMIT $2
            "#,
        )
        .bind(state.to_string())
        .bind(limit.unwrap_or(100))
        .fetch_all(&*self.pool)
        .await?;

        Ok(operations)
    }

    /// Counts operations in a given state.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn count_by_state(&self, state: OperationState) -> Result<i64> {
        let count: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM analysis_operations
            WHERE state = $1
            "#,
        )
        .bind(state.to_string())
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
