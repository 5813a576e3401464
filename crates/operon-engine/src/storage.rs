//! Storage abstraction layer for the lifecycle engine.
//!
//! Provides trait-based abstractions over storage operations to enable
//! testability without database dependencies. Production uses the concrete
//! `operon_core::storage::Storage` repositories; tests use the in-memory
//! implementation in [`mock`] with failure injection.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use operon_core::{
    error::Result,
    storage::Storage,
    AdminNotification, Operation, OperationEvent, OperationId, QueueStats, RetryQueueItem,
    SessionId,
};

/// Storage operations required by the lifecycle engine.
///
/// The atomic claim in [`claim_next_due`](EngineStorage::claim_next_due)
/// is the one contract here that carries a concurrency guarantee: a row
/// returned to one caller is never returned to another.
#[async_trait]
pub trait EngineStorage: Send + Sync + 'static {
    /// Inserts a new operation row.
    async fn insert_operation(&self, operation: &Operation) -> Result<()>;

    /// Persists a state change and its event as one logical unit.
    ///
    /// Either both the denormalized operation update and the event append
    /// commit, or neither does.
    async fn record_transition(
        &self,
        operation: &Operation,
        event: &OperationEvent,
    ) -> Result<()>;

    /// Finds an operation by session.
    async fn find_operation(&self, session_id: &SessionId) -> Result<Option<Operation>>;

    /// Returns an operation's events, oldest first.
    async fn events_for_operation(
        &self,
        operation_id: OperationId,
    ) -> Result<Vec<OperationEvent>>;

    /// Inserts a retry queue item; `false` when the session already has an
    /// active item.
    async fn insert_retry_item(&self, item: &RetryQueueItem) -> Result<bool>;

    /// Atomically claims the next due pending item, marking it processing.
    async fn claim_next_due(&self, now: DateTime<Utc>) -> Result<Option<RetryQueueItem>>;

    /// Finds the most recent queue item for a session.
    async fn find_retry_item(&self, session_id: &SessionId) -> Result<Option<RetryQueueItem>>;

    /// Completes the session's in-flight item; `false` when none was
    /// processing.
    async fn complete_retry_item(&self, session_id: &SessionId, now: DateTime<Utc>)
        -> Result<bool>;

    /// Returns the session's in-flight item to pending with a new schedule.
    async fn schedule_retry_item(
        &self,
        session_id: &SessionId,
        retry_count: i32,
        last_error: &str,
        next_retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Permanently fails the session's in-flight item.
    async fn fail_retry_item(
        &self,
        session_id: &SessionId,
        retry_count: i32,
        last_error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Cancels any active item for the session.
    async fn cancel_retry_item(&self, session_id: &SessionId, now: DateTime<Utc>) -> Result<()>;

    /// Counts queue items per status.
    async fn queue_counts(&self) -> Result<QueueStats>;

    /// Records an alert for the audit trail.
    async fn insert_alert(&self, notification: &AdminNotification) -> Result<()>;
}

/// Production storage implementation using PostgreSQL.
///
/// Wraps the concrete repository container; the transition write runs the
/// operation update and event append in a single transaction.
pub struct PostgresEngineStorage {
    storage: Storage,
}

impl PostgresEngineStorage {
    /// Creates a new PostgreSQL storage adapter.
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl EngineStorage for PostgresEngineStorage {
    async fn insert_operation(&self, operation: &Operation) -> Result<()> {
        self.storage.operations.create(operation).await.map(|_| ())
    }

    async fn record_transition(
        &self,
        operation: &Operation,
        event: &OperationEvent,
    ) -> Result<()> {
        let pool = self.storage.operations.pool();
        let mut tx = pool.begin().await?;

        self.storage.operations.update_in_tx(&mut tx, operation).await?;
        self.storage.operation_events.append_in_tx(&mut tx, event).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn find_operation(&self, session_id: &SessionId) -> Result<Option<Operation>> {
        self.storage.operations.find_by_session(session_id).await
    }

    async fn events_for_operation(
        &self,
        operation_id: OperationId,
    ) -> Result<Vec<OperationEvent>> {
        self.storage.operation_events.find_by_operation(operation_id).await
    }

    async fn insert_retry_item(&self, item: &RetryQueueItem) -> Result<bool> {
        self.storage.retry_queue.insert(item).await
    }

    async fn claim_next_due(&self, now: DateTime<Utc>) -> Result<Option<RetryQueueItem>> {
        self.storage.retry_queue.claim_next_due(now).await
    }

    async fn find_retry_item(&self, session_id: &SessionId) -> Result<Option<RetryQueueItem>> {
        self.storage.retry_queue.find_by_session(session_id).await
    }

    async fn complete_retry_item(
        &self,
        session_id: &SessionId,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.storage.retry_queue.mark_completed(session_id, now).await
    }

    async fn schedule_retry_item(
        &self,
        session_id: &SessionId,
        retry_count: i32,
        last_error: &str,
        next_retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.storage
            .retry_queue
            .schedule_retry(session_id, retry_count, last_error, next_retry_at, now)
            .await
    }

    async fn fail_retry_item(
        &self,
        session_id: &SessionId,
        retry_count: i32,
        last_error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.storage.retry_queue.mark_failed(session_id, retry_count, last_error, now).await
    }

    async fn cancel_retry_item(&self, session_id: &SessionId, now: DateTime<Utc>) -> Result<()> {
        self.storage.retry_queue.cancel(session_id, now).await
    }

    async fn queue_counts(&self) -> Result<QueueStats> {
        self.storage.retry_queue.counts().await
    }

    async fn insert_alert(&self, notification: &AdminNotification) -> Result<()> {
        self.storage.admin_notifications.insert(notification).await.map(|_| ())
    }
}

/// Convenience constructor for the production storage stack.
pub fn postgres(storage: Storage) -> Arc<dyn EngineStorage> {
    Arc::new(PostgresEngineStorage::new(storage))
}

pub mod mock {
    //! In-memory storage implementation for testing.
    //!
    //! Deterministic, no database required. `set_unavailable` simulates a
    //! lost store so degraded-mode behavior can be exercised.

    use std::{
        collections::HashMap,
        sync::{Mutex, MutexGuard},
    };

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use operon_core::{
        error::{CoreError, Result},
        AdminNotification, Operation, OperationEvent, OperationId, QueueStats, QueueStatus,
        RetryQueueItem, SessionId,
    };

    use super::EngineStorage;

    #[derive(Default)]
    struct Inner {
        operations: HashMap<String, Operation>,
        events: Vec<OperationEvent>,
        queue: Vec<RetryQueueItem>,
        alerts: Vec<AdminNotification>,
        unavailable: bool,
    }

    /// Mock storage for testing engine logic without a database.
    #[derive(Default)]
    pub struct InMemoryEngineStorage {
        inner: Mutex<Inner>,
    }

    impl InMemoryEngineStorage {
        /// Creates empty mock storage.
        pub fn new() -> Self {
            Self::default()
        }

        fn lock(&self) -> MutexGuard<'_, Inner> {
            self.inner.lock().unwrap_or_else(|e| e.into_inner())
        }

        fn guard(&self) -> Result<MutexGuard<'_, Inner>> {
            let inner = self.lock();
            if inner.unavailable {
                return Err(CoreError::Database("storage unavailable (injected)".to_string()));
            }
            Ok(inner)
        }

        /// Simulates the store becoming unreachable (or reachable again).
        pub fn set_unavailable(&self, unavailable: bool) {
            self.lock().unavailable = unavailable;
        }

        /// Current snapshot of an operation, if present.
        pub fn operation(&self, session_id: &SessionId) -> Option<Operation> {
            self.lock().operations.get(session_id.as_str()).cloned()
        }

        /// All recorded events, in append order.
        pub fn events(&self) -> Vec<OperationEvent> {
            self.lock().events.clone()
        }

        /// All queue items, in insertion order.
        pub fn queue_items(&self) -> Vec<RetryQueueItem> {
            self.lock().queue.clone()
        }

        /// All persisted alerts, in insertion order.
        pub fn alerts(&self) -> Vec<AdminNotification> {
            self.lock().alerts.clone()
        }

        /// Seeds a queue item directly, bypassing enqueue defaults.
        pub fn push_queue_item(&self, item: RetryQueueItem) {
            self.lock().queue.push(item);
        }
    }

    #[async_trait]
    impl EngineStorage for InMemoryEngineStorage {
        async fn insert_operation(&self, operation: &Operation) -> Result<()> {
            let mut inner = self.guard()?;
            let key = operation.session_id.as_str().to_string();
            if inner.operations.contains_key(&key) {
                return Err(CoreError::ConstraintViolation(format!(
                    "operation already exists for session {key}"
                )));
            }
            inner.operations.insert(key, operation.clone());
            Ok(())
        }

        async fn record_transition(
            &self,
            operation: &Operation,
            event: &OperationEvent,
        ) -> Result<()> {
            let mut inner = self.guard()?;
            let key = operation.session_id.as_str().to_string();
            if !inner.operations.contains_key(&key) {
                return Err(CoreError::NotFound(format!("no operation for session {key}")));
            }
            inner.operations.insert(key, operation.clone());
            inner.events.push(event.clone());
            Ok(())
        }

        async fn find_operation(&self, session_id: &SessionId) -> Result<Option<Operation>> {
            let inner = self.guard()?;
            Ok(inner.operations.get(session_id.as_str()).cloned())
        }

        async fn events_for_operation(
            &self,
            operation_id: OperationId,
        ) -> Result<Vec<OperationEvent>> {
            let inner = self.guard()?;
            Ok(inner
                .events
                .iter()
                .filter(|e| e.operation_id == operation_id)
                .cloned()
                .collect())
        }

        async fn insert_retry_item(&self, item: &RetryQueueItem) -> Result<bool> {
            let mut inner = self.guard()?;
            let duplicate = inner
                .queue
                .iter()
                .any(|i| i.session_id == item.session_id && i.status.is_active());
            if duplicate {
                return Ok(false);
            }
            inner.queue.push(item.clone());
            Ok(true)
        }

        async fn claim_next_due(&self, now: DateTime<Utc>) -> Result<Option<RetryQueueItem>> {
            let mut inner = self.guard()?;

            let mut candidates: Vec<usize> = inner
                .queue
                .iter()
                .enumerate()
                .filter(|(_, i)| {
                    i.status == QueueStatus::Pending
                        && i.next_retry_at.map_or(true, |at| at <= now)
                })
                .map(|(idx, _)| idx)
                .collect();
            candidates.sort_by_key(|&idx| {
                let item = &inner.queue[idx];
                (item.priority.as_i32(), item.created_at)
            });

            let Some(&idx) = candidates.first() else {
                return Ok(None);
            };

            let item = &mut inner.queue[idx];
            item.status = QueueStatus::Processing;
            item.last_attempt_at = Some(now);
            item.updated_at = now;
            Ok(Some(item.clone()))
        }

        async fn find_retry_item(
            &self,
            session_id: &SessionId,
        ) -> Result<Option<RetryQueueItem>> {
            let inner = self.guard()?;
            Ok(inner
                .queue
                .iter()
                .filter(|i| &i.session_id == session_id)
                .max_by_key(|i| i.created_at)
                .cloned())
        }

        async fn complete_retry_item(
            &self,
            session_id: &SessionId,
            now: DateTime<Utc>,
        ) -> Result<bool> {
            let mut inner = self.guard()?;
            let Some(item) = inner
                .queue
                .iter_mut()
                .find(|i| &i.session_id == session_id && i.status == QueueStatus::Processing)
            else {
                return Ok(false);
            };
            item.status = QueueStatus::Completed;
            item.updated_at = now;
            Ok(true)
        }

        async fn schedule_retry_item(
            &self,
            session_id: &SessionId,
            retry_count: i32,
            last_error: &str,
            next_retry_at: DateTime<Utc>,
            now: DateTime<Utc>,
        ) -> Result<bool> {
            let mut inner = self.guard()?;
            let Some(item) = inner
                .queue
                .iter_mut()
                .find(|i| &i.session_id == session_id && i.status == QueueStatus::Processing)
            else {
                return Ok(false);
            };
            item.status = QueueStatus::Pending;
            item.retry_count = retry_count;
            item.last_error = Some(last_error.to_string());
            item.next_retry_at = Some(next_retry_at);
            item.updated_at = now;
            Ok(true)
        }

        async fn fail_retry_item(
            &self,
            session_id: &SessionId,
            retry_count: i32,
            last_error: &str,
            now: DateTime<Utc>,
        ) -> Result<bool> {
            let mut inner = self.guard()?;
            let Some(item) = inner
                .queue
                .iter_mut()
                .find(|i| &i.session_id == session_id && i.status == QueueStatus::Processing)
            else {
                return Ok(false);
            };
            item.status = QueueStatus::Failed;
            item.retry_count = retry_count;
            item.last_error = Some(last_error.to_string());
            item.next_retry_at = None;
            item.updated_at = now;
            Ok(true)
        }

        async fn cancel_retry_item(
            &self,
            session_id: &SessionId,
            now: DateTime<Utc>,
        ) -> Result<()> {
            let mut inner = self.guard()?;
            for item in inner
                .queue
                .iter_mut()
                .filter(|i| &i.session_id == session_id && i.status.is_active())
            {
                item.status = QueueStatus::Cancelled;
                item.updated_at = now;
            }
            Ok(())
        }

        async fn queue_counts(&self) -> Result<QueueStats> {
            let inner = self.guard()?;
            let mut stats = QueueStats::default();
            for item in &inner.queue {
                match item.status {
                    QueueStatus::Pending => stats.pending += 1,
                    QueueStatus::Processing => stats.processing += 1,
                    QueueStatus::Completed => stats.completed += 1,
                    QueueStatus::Failed => stats.failed += 1,
                    QueueStatus::Cancelled => stats.cancelled += 1,
                }
                stats.total += 1;
            }
            Ok(stats)
        }

        async fn insert_alert(&self, notification: &AdminNotification) -> Result<()> {
            let mut inner = self.guard()?;
            inner.alerts.push(notification.clone());
            Ok(())
        }
    }
}
