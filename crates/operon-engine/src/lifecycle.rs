//! Operation lifecycle service.
//!
//! Every mutation of an operation flows through here: the transition is
//! validated against the state machine before anything is written, then
//! the denormalized operation row and the append-only event are persisted
//! as one logical unit. A rejected transition leaves both untouched.
//!
//! The event log is the canonical history; [`replay`] folds it back into
//! the state and part count the row should hold, which is the audit and
//! crash-recovery primitive.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use operon_core::{
    error::{CoreError, Result},
    ActorType, Clock, MetricEventType, Operation, OperationEvent, OperationEventType,
    OperationState, SessionId, Tier,
};
use serde::Serialize;

use crate::{
    metrics::{MetricRecord, MetricsSink},
    storage::EngineStorage,
    truncate_chars, STORED_ERROR_MAX_CHARS,
};

/// Read-model of an operation's progress, computed fresh on every call.
#[derive(Debug, Clone, Serialize)]
pub struct OperationProgress {
    /// Session the progress belongs to.
    pub session_id: SessionId,
    /// Current lifecycle state.
    pub state: OperationState,
    /// Parts finished so far.
    pub completed_parts: i32,
    /// Parts this tier generates.
    pub total_parts: i32,
    /// `round(completed / total * 100)`.
    pub percent: u8,
    /// Projected completion time.
    pub estimated_completion_at: Option<DateTime<Utc>>,
    /// Redrive attempts so far.
    pub retry_count: i32,
}

/// State derived from replaying an event sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayedState {
    /// Final state after the last transition event.
    pub state: OperationState,
    /// Part completions observed.
    pub completed_parts: i32,
}

/// Validated, event-sourced mutations of analysis operations.
pub struct OperationLifecycle {
    storage: Arc<dyn EngineStorage>,
    metrics: Arc<dyn MetricsSink>,
    clock: Arc<dyn Clock>,
}

impl OperationLifecycle {
    /// Creates a lifecycle service over the given collaborators.
    pub fn new(
        storage: Arc<dyn EngineStorage>,
        metrics: Arc<dyn MetricsSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { storage, metrics, clock }
    }

    /// Accepts a purchased job, creating its operation in `initialized`.
    pub async fn create(
        &self,
        session_id: SessionId,
        tier: Tier,
        triggered_by: Option<&str>,
    ) -> Result<Operation> {
        let now = self.clock.now_utc();
        let mut operation = Operation::new(session_id.clone(), tier, now);
        operation.triggered_by = triggered_by.map(str::to_string);

        self.storage.insert_operation(&operation).await?;
        tracing::info!(session_id = %session_id, tier = %tier, "operation created");

        self.metrics
            .record_metric(MetricRecord::new(session_id, tier, MetricEventType::Request))
            .await;

        Ok(operation)
    }

    /// Begins generation: `initialized -> generating`.
    pub async fn start(
        &self,
        session_id: &SessionId,
        actor: ActorType,
        actor_id: Option<&str>,
    ) -> Result<Operation> {
        let now = self.clock.now_utc();
        let mut operation = self.load(session_id).await?;
        let from = self.check_transition(&operation, OperationState::Generating)?;

        operation.state = OperationState::Generating;
        operation.started_at = Some(now);
        operation.current_part = Some(operation.completed_parts + 1);
        operation.estimated_completion_at = Some(operation.estimate_completion(now));
        self.stamp(&mut operation, actor, actor_id, now);

        let event = OperationEvent::new(
            operation.id,
            session_id.clone(),
            OperationEventType::OperationStarted,
            now,
        )
        .with_transition(from, OperationState::Generating)
        .with_actor(actor, actor_id.map(str::to_string));

        self.storage.record_transition(&operation, &event).await?;
        tracing::info!(session_id = %session_id, "operation started");
        Ok(operation)
    }

    /// Records that a specific part began generating.
    ///
    /// Not a state transition; the operation must already be `generating`.
    pub async fn part_started(&self, session_id: &SessionId, part_number: i32) -> Result<()> {
        let now = self.clock.now_utc();
        let mut operation = self.load(session_id).await?;
        if operation.state != OperationState::Generating {
            return Err(CoreError::InvalidInput(format!(
                "part {part_number} cannot start while operation is {}",
                operation.state
            )));
        }

        operation.current_part = Some(part_number);
        operation.updated_at = now;

        let mut event = OperationEvent::new(
            operation.id,
            session_id.clone(),
            OperationEventType::PartStarted,
            now,
        );
        event.part_number = Some(part_number);

        self.storage.record_transition(&operation, &event).await?;
        Ok(())
    }

    /// Records a finished part: `generating -> part_completed`, and when it
    /// was the final part, onward to `completed`.
    pub async fn complete_part(
        &self,
        session_id: &SessionId,
        duration_ms: Option<i64>,
        token_count: Option<i32>,
    ) -> Result<Operation> {
        let now = self.clock.now_utc();
        let mut operation = self.load(session_id).await?;
        let from = self.check_transition(&operation, OperationState::PartCompleted)?;

        if operation.completed_parts >= operation.total_parts {
            return Err(CoreError::InvalidInput(format!(
                "operation already has all {} parts completed",
                operation.total_parts
            )));
        }

        operation.state = OperationState::PartCompleted;
        operation.completed_parts += 1;
        let part_number = operation.completed_parts;
        operation.current_part = None;
        operation.last_part_completed_at = Some(now);
        operation.estimated_completion_at = Some(operation.estimate_completion(now));
        operation.updated_at = now;

        let mut event = OperationEvent::new(
            operation.id,
            session_id.clone(),
            OperationEventType::PartCompleted,
            now,
        )
        .with_transition(from, OperationState::PartCompleted);
        event.part_number = Some(part_number);
        event.duration_ms = duration_ms;
        event.token_count = token_count;

        self.storage.record_transition(&operation, &event).await?;
        self.metrics
            .record_metric({
                let mut record = MetricRecord::new(
                    session_id.clone(),
                    operation.tier,
                    MetricEventType::PartComplete,
                );
                record.part_number = Some(part_number);
                record.duration_ms = duration_ms;
                record
            })
            .await;

        tracing::info!(
            session_id = %session_id,
            part = part_number,
            total = operation.total_parts,
            "part completed"
        );

        if operation.completed_parts == operation.total_parts {
            return self.finish(operation, now).await;
        }

        Ok(operation)
    }

    /// Starts the next part: `part_completed -> generating`.
    pub async fn start_next_part(&self, session_id: &SessionId) -> Result<Operation> {
        let now = self.clock.now_utc();
        let mut operation = self.load(session_id).await?;
        let from = self.check_transition(&operation, OperationState::Generating)?;

        operation.state = OperationState::Generating;
        let part_number = operation.completed_parts + 1;
        operation.current_part = Some(part_number);
        operation.updated_at = now;

        let mut event = OperationEvent::new(
            operation.id,
            session_id.clone(),
            OperationEventType::PartStarted,
            now,
        )
        .with_transition(from, OperationState::Generating);
        event.part_number = Some(part_number);

        self.storage.record_transition(&operation, &event).await?;
        Ok(operation)
    }

    /// Records a failure: `generating -> failed`.
    ///
    /// Full error detail stays in the operation row and event log; the
    /// end user only ever sees a generic message through the API layer.
    pub async fn fail(
        &self,
        session_id: &SessionId,
        error_code: Option<&str>,
        error_message: &str,
        actor: ActorType,
    ) -> Result<Operation> {
        let now = self.clock.now_utc();
        let mut operation = self.load(session_id).await?;
        let from = self.check_transition(&operation, OperationState::Failed)?;

        let stored_error = truncate_chars(error_message, STORED_ERROR_MAX_CHARS);
        operation.state = OperationState::Failed;
        operation.failed_part = operation.current_part;
        operation.last_error = Some(stored_error.clone());
        operation.last_error_at = Some(now);
        self.stamp(&mut operation, actor, None, now);

        let mut event = OperationEvent::new(
            operation.id,
            session_id.clone(),
            OperationEventType::OperationFailed,
            now,
        )
        .with_transition(from, OperationState::Failed)
        .with_actor(actor, None);
        event.part_number = operation.failed_part;
        event.error_code = error_code.map(str::to_string);
        event.error_message = Some(stored_error);

        self.storage.record_transition(&operation, &event).await?;
        self.metrics
            .record_metric({
                let mut record = MetricRecord::new(
                    session_id.clone(),
                    operation.tier,
                    MetricEventType::Failure,
                );
                record.error_code = error_code.map(str::to_string);
                record.error_message = operation.last_error.clone();
                record.part_number = operation.failed_part;
                record
            })
            .await;

        tracing::warn!(
            session_id = %session_id,
            part = ?operation.failed_part,
            "operation failed"
        );
        Ok(operation)
    }

    /// Suspends the operation: `{generating, part_completed} -> paused`.
    pub async fn pause(
        &self,
        session_id: &SessionId,
        actor: ActorType,
        actor_id: Option<&str>,
    ) -> Result<Operation> {
        let now = self.clock.now_utc();
        let mut operation = self.load(session_id).await?;
        let from = self.check_transition(&operation, OperationState::Paused)?;

        operation.state = OperationState::Paused;
        self.stamp(&mut operation, actor, actor_id, now);

        let event = OperationEvent::new(
            operation.id,
            session_id.clone(),
            OperationEventType::OperationPaused,
            now,
        )
        .with_transition(from, OperationState::Paused)
        .with_actor(actor, actor_id.map(str::to_string));

        self.storage.record_transition(&operation, &event).await?;
        tracing::info!(session_id = %session_id, "operation paused");
        Ok(operation)
    }

    /// Resumes a paused operation: `paused -> generating`.
    pub async fn resume(
        &self,
        session_id: &SessionId,
        actor: ActorType,
        actor_id: Option<&str>,
    ) -> Result<Operation> {
        let now = self.clock.now_utc();
        let mut operation = self.load(session_id).await?;
        let from = self.check_transition(&operation, OperationState::Generating)?;

        operation.state = OperationState::Generating;
        operation.current_part = Some(operation.completed_parts + 1);
        operation.estimated_completion_at = Some(operation.estimate_completion(now));
        self.stamp(&mut operation, actor, actor_id, now);

        let event = OperationEvent::new(
            operation.id,
            session_id.clone(),
            OperationEventType::OperationResumed,
            now,
        )
        .with_transition(from, OperationState::Generating)
        .with_actor(actor, actor_id.map(str::to_string));

        self.storage.record_transition(&operation, &event).await?;
        tracing::info!(session_id = %session_id, "operation resumed");
        Ok(operation)
    }

    /// Cancels the operation from any non-terminal state.
    pub async fn cancel(
        &self,
        session_id: &SessionId,
        actor: ActorType,
        actor_id: Option<&str>,
    ) -> Result<Operation> {
        let now = self.clock.now_utc();
        let mut operation = self.load(session_id).await?;
        let from = self.check_transition(&operation, OperationState::Cancelled)?;

        operation.state = OperationState::Cancelled;
        operation.current_part = None;
        operation.estimated_completion_at = None;
        self.stamp(&mut operation, actor, actor_id, now);

        let event = OperationEvent::new(
            operation.id,
            session_id.clone(),
            OperationEventType::OperationCancelled,
            now,
        )
        .with_transition(from, OperationState::Cancelled)
        .with_actor(actor, actor_id.map(str::to_string));

        self.storage.record_transition(&operation, &event).await?;
        tracing::info!(session_id = %session_id, "operation cancelled");
        Ok(operation)
    }

    /// Re-enters generation after a failure: `failed -> generating`.
    ///
    /// The only transition that increments `retry_count`. Completed parts
    /// are preserved; generation resumes at the part that failed.
    pub async fn begin_retry(&self, session_id: &SessionId, actor: ActorType) -> Result<Operation> {
        let now = self.clock.now_utc();
        let mut operation = self.load(session_id).await?;
        let from = operation.state;
        if from != OperationState::Failed {
            return Err(CoreError::InvalidTransition {
                from,
                to: OperationState::Generating,
            });
        }

        operation.state = OperationState::Generating;
        operation.retry_count += 1;
        operation.current_part =
            operation.failed_part.or(Some(operation.completed_parts + 1));
        operation.estimated_completion_at = Some(operation.estimate_completion(now));
        self.stamp(&mut operation, actor, None, now);

        let mut event = OperationEvent::new(
            operation.id,
            session_id.clone(),
            OperationEventType::OperationRetried,
            now,
        )
        .with_transition(from, OperationState::Generating)
        .with_actor(actor, None);
        event.part_number = operation.current_part;

        self.storage.record_transition(&operation, &event).await?;
        tracing::info!(
            session_id = %session_id,
            retry_count = operation.retry_count,
            "operation retrying"
        );
        Ok(operation)
    }

    /// Appends an operator note and records the intervention.
    pub async fn add_admin_note(
        &self,
        session_id: &SessionId,
        note: &str,
        admin_id: &str,
    ) -> Result<Operation> {
        let now = self.clock.now_utc();
        let mut operation = self.load(session_id).await?;

        operation.admin_notes = Some(match operation.admin_notes.take() {
            Some(existing) => format!("{existing}\n{note}"),
            None => note.to_string(),
        });
        operation.updated_at = now;

        let mut event = OperationEvent::new(
            operation.id,
            session_id.clone(),
            OperationEventType::AdminIntervention,
            now,
        )
        .with_actor(ActorType::Admin, Some(admin_id.to_string()));
        event
            .metadata
            .0
            .insert("note".to_string(), serde_json::Value::from(note));

        self.storage.record_transition(&operation, &event).await?;
        tracing::info!(session_id = %session_id, admin_id, "admin note recorded");
        Ok(operation)
    }

    /// Progress view, computed fresh from the stored counters.
    pub async fn progress(&self, session_id: &SessionId) -> Result<OperationProgress> {
        let operation = self.load(session_id).await?;
        Ok(OperationProgress {
            session_id: operation.session_id.clone(),
            state: operation.state,
            completed_parts: operation.completed_parts,
            total_parts: operation.total_parts,
            percent: operation.progress_percent(),
            estimated_completion_at: operation.estimated_completion_at,
            retry_count: operation.retry_count,
        })
    }

    /// Ordered event history for a session's operation.
    pub async fn events(&self, session_id: &SessionId) -> Result<Vec<OperationEvent>> {
        let operation = self.load(session_id).await?;
        self.storage.events_for_operation(operation.id).await
    }

    async fn load(&self, session_id: &SessionId) -> Result<Operation> {
        self.storage
            .find_operation(session_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("no operation for session {session_id}")))
    }

    /// Validates the transition, returning the source state.
    ///
    /// Runs before any field is mutated or row written; an invalid
    /// transition is rejected with no side effects.
    fn check_transition(&self, operation: &Operation, to: OperationState) -> Result<OperationState> {
        let from = operation.state;
        if !from.can_transition_to(to) {
            return Err(CoreError::InvalidTransition { from, to });
        }
        Ok(from)
    }

    fn stamp(
        &self,
        operation: &mut Operation,
        actor: ActorType,
        actor_id: Option<&str>,
        now: DateTime<Utc>,
    ) {
        operation.triggered_by =
            Some(actor_id.map_or_else(|| actor.to_string(), str::to_string));
        operation.updated_at = now;
    }

    async fn finish(&self, mut operation: Operation, now: DateTime<Utc>) -> Result<Operation> {
        let from = self.check_transition(&operation, OperationState::Completed)?;

        operation.state = OperationState::Completed;
        operation.completed_at = Some(now);
        operation.estimated_completion_at = None;
        operation.updated_at = now;

        let event = OperationEvent::new(
            operation.id,
            operation.session_id.clone(),
            OperationEventType::OperationCompleted,
            now,
        )
        .with_transition(from, OperationState::Completed);

        self.storage.record_transition(&operation, &event).await?;

        let total_duration_ms = operation
            .started_at
            .map(|started| (now - started).num_milliseconds());
        self.metrics
            .record_metric({
                let mut record = MetricRecord::new(
                    operation.session_id.clone(),
                    operation.tier,
                    MetricEventType::Success,
                );
                record.duration_ms = total_duration_ms;
                record
            })
            .await;

        tracing::info!(session_id = %operation.session_id, "operation completed");
        Ok(operation)
    }
}

/// Replays an ordered event sequence into the state it encodes.
///
/// Transition events move the state; `part_completed` events accumulate
/// the part counter. Replaying an operation's full history must agree
/// with the stored denormalized row.
pub fn replay(events: &[OperationEvent]) -> ReplayedState {
    let mut state = OperationState::Initialized;
    let mut completed_parts = 0;

    for event in events {
        if let Some(new_state) = event.new_state {
            state = new_state;
        }
        if event.event_type == OperationEventType::PartCompleted {
            completed_parts += 1;
        }
    }

    ReplayedState { state, completed_parts }
}

#[cfg(test)]
mod tests {
    use operon_core::{time::test_epoch, TestClock};

    use super::*;
    use crate::{metrics::mock::RecordingMetricsSink, storage::mock::InMemoryEngineStorage};

    struct Fixture {
        lifecycle: OperationLifecycle,
        storage: Arc<InMemoryEngineStorage>,
        metrics: Arc<RecordingMetricsSink>,
        clock: TestClock,
    }

    fn fixture() -> Fixture {
        let clock = TestClock::starting_at(test_epoch());
        let storage = Arc::new(InMemoryEngineStorage::new());
        let metrics = Arc::new(RecordingMetricsSink::new());
        let lifecycle = OperationLifecycle::new(
            storage.clone(),
            metrics.clone(),
            Arc::new(clock.clone()),
        );
        Fixture { lifecycle, storage, metrics, clock }
    }

    fn session(name: &str) -> SessionId {
        SessionId::from(name)
    }

    #[tokio::test]
    async fn single_part_operation_completes_after_one_part() {
        let f = fixture();
        let s = session("s-low");

        f.lifecycle.create(s.clone(), Tier::Low, Some("checkout")).await.unwrap();
        f.lifecycle.start(&s, ActorType::System, None).await.unwrap();
        let op = f.lifecycle.complete_part(&s, Some(28_000), Some(1_500)).await.unwrap();

        assert_eq!(op.state, OperationState::Completed);
        assert_eq!(op.completed_parts, 1);
        assert!(op.completed_at.is_some());

        let events: Vec<_> =
            f.storage.events().iter().map(|e| e.event_type).collect();
        assert_eq!(
            events,
            vec![
                OperationEventType::OperationStarted,
                OperationEventType::PartCompleted,
                OperationEventType::OperationCompleted,
            ]
        );
    }

    #[tokio::test]
    async fn multi_part_operation_walks_part_boundaries() {
        let f = fixture();
        let s = session("s-mid");

        f.lifecycle.create(s.clone(), Tier::Mid, None).await.unwrap();
        f.lifecycle.start(&s, ActorType::System, None).await.unwrap();

        let op = f.lifecycle.complete_part(&s, None, None).await.unwrap();
        assert_eq!(op.state, OperationState::PartCompleted);
        assert_eq!(op.completed_parts, 1);

        let op = f.lifecycle.start_next_part(&s).await.unwrap();
        assert_eq!(op.state, OperationState::Generating);
        assert_eq!(op.current_part, Some(2));

        let op = f.lifecycle.complete_part(&s, None, None).await.unwrap();
        assert_eq!(op.state, OperationState::Completed);
        assert_eq!(op.completed_parts, 2);
    }

    #[tokio::test]
    async fn invalid_transition_rejected_before_any_write() {
        let f = fixture();
        let s = session("s-1");

        f.lifecycle.create(s.clone(), Tier::Low, None).await.unwrap();

        // initialized cannot jump straight to a part completion.
        let err = f.lifecycle.complete_part(&s, None, None).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition { .. }));

        let op = f.storage.operation(&s).unwrap();
        assert_eq!(op.state, OperationState::Initialized);
        assert_eq!(op.completed_parts, 0);
        assert!(f.storage.events().is_empty());
    }

    #[tokio::test]
    async fn terminal_operation_rejects_everything() {
        let f = fixture();
        let s = session("s-1");

        f.lifecycle.create(s.clone(), Tier::Low, None).await.unwrap();
        f.lifecycle.start(&s, ActorType::System, None).await.unwrap();
        f.lifecycle.complete_part(&s, None, None).await.unwrap();

        assert!(f.lifecycle.start(&s, ActorType::System, None).await.is_err());
        assert!(f.lifecycle.cancel(&s, ActorType::Admin, None).await.is_err());
        assert!(f.lifecycle.pause(&s, ActorType::Admin, None).await.is_err());
    }

    #[tokio::test]
    async fn failure_records_error_context() {
        let f = fixture();
        let s = session("s-1");

        f.lifecycle.create(s.clone(), Tier::High, None).await.unwrap();
        f.lifecycle.start(&s, ActorType::System, None).await.unwrap();
        let op = f
            .lifecycle
            .fail(&s, Some("UPSTREAM_TIMEOUT"), "generation timed out", ActorType::System)
            .await
            .unwrap();

        assert_eq!(op.state, OperationState::Failed);
        assert_eq!(op.failed_part, Some(1));
        assert_eq!(op.last_error.as_deref(), Some("generation timed out"));
        assert!(op.last_error_at.is_some());

        let event = f.storage.events().last().unwrap().clone();
        assert_eq!(event.event_type, OperationEventType::OperationFailed);
        assert_eq!(event.error_code.as_deref(), Some("UPSTREAM_TIMEOUT"));
    }

    #[tokio::test]
    async fn retry_count_increments_only_on_failed_to_generating() {
        let f = fixture();
        let s = session("s-1");

        f.lifecycle.create(s.clone(), Tier::Mid, None).await.unwrap();
        f.lifecycle.start(&s, ActorType::System, None).await.unwrap();
        f.lifecycle.complete_part(&s, None, None).await.unwrap();
        f.lifecycle.start_next_part(&s).await.unwrap();
        assert_eq!(f.storage.operation(&s).unwrap().retry_count, 0);

        f.lifecycle.fail(&s, None, "boom", ActorType::System).await.unwrap();
        let op = f.lifecycle.begin_retry(&s, ActorType::System).await.unwrap();

        assert_eq!(op.retry_count, 1);
        assert_eq!(op.state, OperationState::Generating);
        // Partial progress preserved: the completed part survives the retry.
        assert_eq!(op.completed_parts, 1);
        assert_eq!(op.current_part, Some(2));
    }

    #[tokio::test]
    async fn pause_and_resume_round_trip() {
        let f = fixture();
        let s = session("s-1");

        f.lifecycle.create(s.clone(), Tier::High, None).await.unwrap();
        f.lifecycle.start(&s, ActorType::System, None).await.unwrap();
        let op = f.lifecycle.pause(&s, ActorType::Admin, Some("op-team")).await.unwrap();
        assert_eq!(op.state, OperationState::Paused);
        assert_eq!(op.triggered_by.as_deref(), Some("op-team"));

        let op = f.lifecycle.resume(&s, ActorType::Admin, Some("op-team")).await.unwrap();
        assert_eq!(op.state, OperationState::Generating);
    }

    #[tokio::test]
    async fn admin_note_appends_and_logs_intervention() {
        let f = fixture();
        let s = session("s-1");

        f.lifecycle.create(s.clone(), Tier::Low, None).await.unwrap();
        f.lifecycle.add_admin_note(&s, "customer emailed support", "alex").await.unwrap();
        let op = f.lifecycle.add_admin_note(&s, "refund issued", "alex").await.unwrap();

        assert_eq!(
            op.admin_notes.as_deref(),
            Some("customer emailed support\nrefund issued")
        );

        let event = f.storage.events().last().unwrap().clone();
        assert_eq!(event.event_type, OperationEventType::AdminIntervention);
        assert_eq!(event.actor_type, ActorType::Admin);
        assert_eq!(event.actor_id.as_deref(), Some("alex"));
    }

    #[tokio::test]
    async fn part_started_requires_generating() {
        let f = fixture();
        let s = session("s-1");

        f.lifecycle.create(s.clone(), Tier::Mid, None).await.unwrap();
        assert!(f.lifecycle.part_started(&s, 1).await.is_err());

        f.lifecycle.start(&s, ActorType::System, None).await.unwrap();
        f.lifecycle.part_started(&s, 1).await.unwrap();

        let event = f.storage.events().last().unwrap().clone();
        assert_eq!(event.event_type, OperationEventType::PartStarted);
        assert_eq!(event.part_number, Some(1));
        assert!(event.previous_state.is_none(), "not a state transition");
    }

    #[tokio::test]
    async fn progress_reflects_part_counters() {
        let f = fixture();
        let s = session("s-1");

        f.lifecycle.create(s.clone(), Tier::High, None).await.unwrap();
        f.lifecycle.start(&s, ActorType::System, None).await.unwrap();
        f.lifecycle.complete_part(&s, None, None).await.unwrap();
        f.lifecycle.start_next_part(&s).await.unwrap();
        f.lifecycle.complete_part(&s, None, None).await.unwrap();
        f.lifecycle.start_next_part(&s).await.unwrap();
        f.lifecycle.complete_part(&s, None, None).await.unwrap();

        let progress = f.lifecycle.progress(&s).await.unwrap();
        assert_eq!(progress.completed_parts, 3);
        assert_eq!(progress.total_parts, 6);
        assert_eq!(progress.percent, 50);
        assert!(progress.estimated_completion_at.is_some());
    }

    #[tokio::test]
    async fn replay_reconstructs_stored_state() {
        let f = fixture();
        let s = session("s-1");

        f.lifecycle.create(s.clone(), Tier::Mid, None).await.unwrap();
        f.lifecycle.start(&s, ActorType::System, None).await.unwrap();
        f.lifecycle.complete_part(&s, None, None).await.unwrap();
        f.lifecycle.start_next_part(&s).await.unwrap();
        f.lifecycle.fail(&s, None, "blip", ActorType::System).await.unwrap();
        f.lifecycle.begin_retry(&s, ActorType::System).await.unwrap();
        f.lifecycle.complete_part(&s, None, None).await.unwrap();

        let stored = f.storage.operation(&s).unwrap();
        let replayed = replay(&f.lifecycle.events(&s).await.unwrap());

        assert_eq!(replayed.state, stored.state);
        assert_eq!(replayed.completed_parts, stored.completed_parts);
        assert_eq!(stored.state, OperationState::Completed);
    }

    #[tokio::test]
    async fn store_loss_fails_the_whole_mutation() {
        let f = fixture();
        let s = session("s-1");

        f.lifecycle.create(s.clone(), Tier::Low, None).await.unwrap();
        f.storage.set_unavailable(true);

        assert!(f.lifecycle.start(&s, ActorType::System, None).await.is_err());

        f.storage.set_unavailable(false);
        let op = f.storage.operation(&s).unwrap();
        assert_eq!(op.state, OperationState::Initialized);
        assert!(f.storage.events().is_empty());
    }

    #[tokio::test]
    async fn duplicate_session_rejected() {
        let f = fixture();
        let s = session("s-1");

        f.lifecycle.create(s.clone(), Tier::Low, None).await.unwrap();
        let err = f.lifecycle.create(s, Tier::Low, None).await.unwrap_err();
        assert!(matches!(err, CoreError::ConstraintViolation(_)));
    }

    #[tokio::test]
    async fn metrics_recorded_along_the_lifecycle() {
        let f = fixture();
        let s = session("s-1");

        f.lifecycle.create(s.clone(), Tier::Low, None).await.unwrap();
        f.lifecycle.start(&s, ActorType::System, None).await.unwrap();
        f.clock.advance(std::time::Duration::from_secs(30));
        f.lifecycle.complete_part(&s, Some(30_000), None).await.unwrap();

        let recorded: Vec<_> = f.metrics.records().iter().map(|r| r.event_type).collect();
        assert_eq!(
            recorded,
            vec![
                MetricEventType::Request,
                MetricEventType::PartComplete,
                MetricEventType::Success,
            ]
        );

        let success = f.metrics.records().into_iter().last().unwrap();
        assert_eq!(success.duration_ms, Some(30_000));
    }
}
