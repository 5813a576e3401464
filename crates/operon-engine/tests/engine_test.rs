//! End-to-end scenarios for the lifecycle engine.
//!
//! Wires the real services (lifecycle, queue, processor, breaker,
//! alerter) over the in-memory storage and a virtual clock, then walks
//! the recovery paths: transient failure to successful redrive, repeated
//! failure to exhaustion and operator alert, and circuit breaker trips
//! feeding the alerting layer.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use operon_core::{
    time::test_epoch, ActorType, OperationState, QueueStatus, SessionId, TestClock, Tier,
};
use operon_engine::{
    alerts::{AdminAlerter, AlertConfig},
    circuit::{CircuitBreakerManager, CircuitConfig, CircuitState},
    executor::mock::{RecordingNotifier, ScriptedExecutor},
    lifecycle::{replay, OperationLifecycle},
    metrics::mock::RecordingMetricsSink,
    processor::{IterationOutcome, ProcessorConfig, RetryProcessor},
    queue::{EnqueueRequest, RetryQueue},
    retry::RetryPolicy,
    storage::mock::InMemoryEngineStorage,
    EngineError,
};

struct Engine {
    storage: Arc<InMemoryEngineStorage>,
    notifier: Arc<RecordingNotifier>,
    metrics: Arc<RecordingMetricsSink>,
    alerter: Arc<AdminAlerter>,
    lifecycle: Arc<OperationLifecycle>,
    queue: Arc<RetryQueue>,
    clock: TestClock,
}

impl Engine {
    fn new() -> Self {
        let clock = TestClock::starting_at(test_epoch());
        let storage = Arc::new(InMemoryEngineStorage::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let metrics = Arc::new(RecordingMetricsSink::new());
        let alerter = Arc::new(AdminAlerter::new(
            AlertConfig::default(),
            notifier.clone(),
            storage.clone(),
            Arc::new(clock.clone()),
        ));
        let lifecycle = Arc::new(OperationLifecycle::new(
            storage.clone(),
            metrics.clone(),
            Arc::new(clock.clone()),
        ));
        let queue = Arc::new(RetryQueue::new(
            storage.clone(),
            alerter.clone(),
            RetryPolicy::default(),
            Arc::new(clock.clone()),
        ));
        Self { storage, notifier, metrics, alerter, lifecycle, queue, clock }
    }

    fn processor(&self, executor: Arc<ScriptedExecutor>) -> RetryProcessor {
        RetryProcessor::new(
            self.queue.clone(),
            self.lifecycle.clone(),
            executor,
            self.metrics.clone(),
            Arc::new(self.clock.clone()),
            ProcessorConfig::default(),
        )
    }

    /// Runs a job up to its first failure, the way the job pipeline's
    /// failure handler would: operation fails, session enters the queue.
    async fn fail_job(&self, session: &str, tier: Tier, error: &str) -> Result<SessionId> {
        let session_id = SessionId::from(session);
        self.lifecycle.create(session_id.clone(), tier, Some("checkout")).await?;
        self.lifecycle.start(&session_id, ActorType::System, None).await?;
        self.lifecycle.fail(&session_id, Some("UPSTREAM_ERROR"), error, ActorType::System).await?;
        assert!(
            self.queue
                .enqueue(EnqueueRequest::new(session_id.clone(), tier, "analyze churn drivers"))
                .await
        );
        Ok(session_id)
    }
}

#[tokio::test]
async fn transient_failure_recovers_through_the_queue() -> Result<()> {
    let engine = Engine::new();
    let executor = Arc::new(ScriptedExecutor::always_succeeding());
    let processor = engine.processor(executor.clone());

    let session = engine.fail_job("sess-single", Tier::Low, "upstream timed out").await?;

    // The failed job sits pending and immediately eligible.
    let item = engine.storage.queue_items()[0].clone();
    assert_eq!(item.status, QueueStatus::Pending);
    assert_eq!(item.retry_count, 0);

    // One processor tick re-drives it to success.
    assert_eq!(processor.run_iteration().await, IterationOutcome::Succeeded);

    assert_eq!(engine.storage.queue_items()[0].status, QueueStatus::Completed);
    let operation = engine.storage.operation(&session).unwrap();
    assert_eq!(operation.state, OperationState::Completed);
    assert_eq!(operation.retry_count, 1);
    assert_eq!(executor.call_count(), 1);

    Ok(())
}

#[tokio::test]
async fn multi_part_job_rests_at_part_completed_after_redrive() -> Result<()> {
    let engine = Engine::new();
    let processor = engine.processor(Arc::new(ScriptedExecutor::always_succeeding()));

    let session = engine.fail_job("sess-deep", Tier::High, "rate limited").await?;

    assert_eq!(processor.run_iteration().await, IterationOutcome::Succeeded);

    let operation = engine.storage.operation(&session).unwrap();
    assert_eq!(operation.state, OperationState::PartCompleted);
    assert_eq!(operation.completed_parts, 1);
    assert_eq!(operation.total_parts, 6);
    assert_eq!(engine.storage.queue_items()[0].status, QueueStatus::Completed);

    Ok(())
}

#[tokio::test]
async fn two_failures_then_success_follows_the_backoff_schedule() -> Result<()> {
    let engine = Engine::new();
    let executor = Arc::new(ScriptedExecutor::with_script(vec![
        Err(EngineError::execution("upstream 503")),
        Err(EngineError::execution("upstream 503")),
    ]));
    let processor = engine.processor(executor.clone());

    let session = engine.fail_job("sess-flaky", Tier::Low, "upstream 503").await?;

    // First redrive fails: one minute backoff.
    assert_eq!(processor.run_iteration().await, IterationOutcome::RetryScheduled);
    assert_eq!(processor.run_iteration().await, IterationOutcome::Idle, "not yet due");

    engine.clock.advance(Duration::from_secs(61));
    // Second redrive fails: two minute backoff.
    assert_eq!(processor.run_iteration().await, IterationOutcome::RetryScheduled);
    engine.clock.advance(Duration::from_secs(61));
    assert_eq!(processor.run_iteration().await, IterationOutcome::Idle, "backoff doubled");

    engine.clock.advance(Duration::from_secs(60));
    // Third redrive succeeds.
    assert_eq!(processor.run_iteration().await, IterationOutcome::Succeeded);

    assert_eq!(executor.call_count(), 3);
    assert_eq!(engine.storage.operation(&session).unwrap().state, OperationState::Completed);

    // The event log tells the whole story and replays to the stored row.
    let events = engine.lifecycle.events(&session).await?;
    let replayed = replay(&events);
    let stored = engine.storage.operation(&session).unwrap();
    assert_eq!(replayed.state, stored.state);
    assert_eq!(replayed.completed_parts, stored.completed_parts);

    Ok(())
}

#[tokio::test]
async fn exhausted_retries_leave_operation_failed_and_page_the_operator() -> Result<()> {
    let engine = Engine::new();
    let processor = engine.processor(Arc::new(ScriptedExecutor::always_failing("hard down")));

    let session_id = SessionId::from("sess-doomed");
    engine.lifecycle.create(session_id.clone(), Tier::Mid, None).await?;
    engine.lifecycle.start(&session_id, ActorType::System, None).await?;
    engine.lifecycle.fail(&session_id, None, "hard down", ActorType::System).await?;
    let mut request = EnqueueRequest::new(session_id.clone(), Tier::Mid, "problem");
    request.max_retries = Some(2);
    assert!(engine.queue.enqueue(request).await);

    assert_eq!(processor.run_iteration().await, IterationOutcome::RetryScheduled);
    engine.clock.advance(Duration::from_secs(30 * 60));
    assert_eq!(processor.run_iteration().await, IterationOutcome::RetriesExhausted);

    let item = engine.storage.queue_items()[0].clone();
    assert_eq!(item.status, QueueStatus::Failed);
    assert_eq!(item.retry_count, 2);
    assert!(item.next_retry_at.is_none());

    // The operation is left failed for operator retry or cancellation.
    let operation = engine.storage.operation(&session_id).unwrap();
    assert_eq!(operation.state, OperationState::Failed);

    // Exactly one critical alert, persisted for audit.
    assert_eq!(engine.notifier.sent_count(), 1);
    let (title, content) = &engine.notifier.sent()[0];
    assert!(title.starts_with("[CRITICAL]"));
    assert!(title.contains("Retry Queue Exhausted"));
    assert!(content.contains("sess-doomed"));
    assert_eq!(engine.storage.alerts().len(), 1);

    // An operator can still re-drive manually.
    engine.lifecycle.begin_retry(&session_id, ActorType::Admin).await?;
    assert_eq!(
        engine.storage.operation(&session_id).unwrap().state,
        OperationState::Generating
    );

    Ok(())
}

#[tokio::test]
async fn circuit_breaker_trip_reaches_the_operator_once() -> Result<()> {
    let engine = Engine::new();
    let breaker = CircuitBreakerManager::with_alerter(
        CircuitConfig::default(),
        Arc::new(engine.clock.clone()),
        engine.alerter.clone(),
    );

    // The upstream dependency degrades; calls fail until the breaker
    // opens at the fifth consecutive failure.
    for _ in 0..5 {
        assert!(breaker.allow_request("llm-api").await);
        breaker.record_failure("llm-api", "connection timeout").await;
    }
    assert_eq!(breaker.state("llm-api").await, CircuitState::Open);
    assert!(!breaker.allow_request("llm-api").await);

    // Continued failures while open stay silent.
    for _ in 0..20 {
        breaker.record_failure("llm-api", "connection timeout").await;
    }
    assert_eq!(engine.notifier.sent_count(), 1);
    assert!(engine.notifier.sent()[0].0.contains("Circuit Breaker Opened: llm-api"));

    // After the cooldown a probe is admitted; success closes the breaker.
    engine.clock.advance(Duration::from_secs(31));
    assert!(breaker.allow_request("llm-api").await);
    breaker.record_success("llm-api").await;
    assert_eq!(breaker.state("llm-api").await, CircuitState::Closed);

    Ok(())
}

#[tokio::test]
async fn operator_force_reset_recovers_a_tripped_breaker() -> Result<()> {
    let engine = Engine::new();
    let breaker = CircuitBreakerManager::with_alerter(
        CircuitConfig::default(),
        Arc::new(engine.clock.clone()),
        engine.alerter.clone(),
    );

    for _ in 0..5 {
        breaker.record_failure("llm-api", "down").await;
    }
    assert_eq!(breaker.state("llm-api").await, CircuitState::Open);

    breaker.force_reset("llm-api").await;

    let stats = breaker.stats("llm-api").await.unwrap();
    assert_eq!(stats.state, CircuitState::Closed);
    assert_eq!(stats.failures, 0);
    assert!(breaker.allow_request("llm-api").await);

    Ok(())
}

#[tokio::test]
async fn sustained_failures_raise_a_single_rate_alert() -> Result<()> {
    let engine = Engine::new();

    // 12 outcomes, 5 failures: 41.7% over the window.
    for _ in 0..7 {
        engine.alerter.record_request_outcome(true);
    }
    for _ in 0..5 {
        engine.alerter.record_request_outcome(false);
    }
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }

    let alerts: Vec<_> = engine
        .notifier
        .sent()
        .into_iter()
        .filter(|(title, _)| title.contains("High Failure Rate"))
        .collect();
    assert_eq!(alerts.len(), 1, "cooldown deduplicates the repeated trigger");
    // 41.7% is above the 30% threshold but below critical's 50% bar.
    assert!(alerts[0].0.starts_with("[WARNING]"));

    Ok(())
}

#[tokio::test]
async fn engine_degrades_without_crashing_when_the_store_is_lost() -> Result<()> {
    let engine = Engine::new();
    let processor = engine.processor(Arc::new(ScriptedExecutor::always_succeeding()));

    let session = engine.fail_job("sess-1", Tier::Low, "blip").await?;
    engine.storage.set_unavailable(true);

    // Reads degrade to empty, writes to false, iterations to idle.
    assert!(
        !engine
            .queue
            .enqueue(EnqueueRequest::new(SessionId::from("sess-2"), Tier::Low, "p"))
            .await
    );
    assert_eq!(engine.queue.stats().await.total, 0);
    assert_eq!(processor.run_iteration().await, IterationOutcome::Idle);
    engine.queue.cancel(&session).await;

    // The store returns and the parked job drains normally.
    engine.storage.set_unavailable(false);
    assert_eq!(processor.run_iteration().await, IterationOutcome::Succeeded);
    assert_eq!(engine.storage.operation(&session).unwrap().state, OperationState::Completed);

    Ok(())
}

#[tokio::test]
async fn retry_metrics_flow_through_the_sink() -> Result<()> {
    let engine = Engine::new();
    let processor = engine.processor(Arc::new(ScriptedExecutor::always_succeeding()));

    engine.fail_job("sess-1", Tier::Low, "blip").await?;
    processor.run_iteration().await;

    let kinds: Vec<String> = engine
        .metrics
        .records()
        .iter()
        .map(|r| r.event_type.to_string())
        .collect();
    // Request at creation, failure at first attempt, retry at redrive,
    // then the completing part and overall success.
    assert_eq!(kinds, vec!["request", "failure", "retry", "part_complete", "success"]);

    Ok(())
}
