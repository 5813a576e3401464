//! Repository for admin alert audit records.

use std::sync::Arc;

use sqlx::PgPool;
use uuid::Uuid;

use crate::{error::Result, models::AdminNotification};

/// Repository for admin notification rows.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Records an alert for the audit trail.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails; alert dispatch treats this as
    /// best-effort and proceeds regardless.
    pub async fn insert(&self, notification: &AdminNotification) -> Result<Uuid> {
        let id = sqlx::query_scalar(
            r#"
            INSERT INTO admin_notifications (
                id, notification_type, title, message, severity, metadata,
                created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(notification.id)
        .bind(notification.notification_type.to_string())
        .bind(&notification.title)
        .bind(&notification.message)
        .bind(notification.severity.to_string())
        .bind(&notification.metadata)
        .bind(notification.created_at)
        .fetch_one(&*self.pool)
        .await?;

        Ok(id)
    }

    /// Returns the most recent alerts, newest first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn recent(&self, limit: Option<i64>) -> Result<Vec<AdminNotification>> {
        let notifications = sqlx::query_as::<_, AdminNotification>(
            r#"
            SELECT id, notification_type, title, message, severity, metadata,
                   created_at
            FROM admin_notifications
            ORDER BY created_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit.unwrap_or(100))
        .fetch_all(&*self.pool)
        .await?;

        Ok(notifications)
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
