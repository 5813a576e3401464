//! Background processor driving the retry queue.
//!
//! A timer loop claims at most one due item per iteration, re-invokes the
//! job executor, and routes the outcome back into the queue and the
//! operation lifecycle. The loop is the outermost boundary for
//! job-execution errors: everything the executor produces, including a
//! panic or a hung call, is converted into a reschedule decision and the
//! timer keeps ticking.
//!
//! One item is in flight per processor instance; replicas coexist safely
//! because claims are atomic at the store.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use operon_core::{ActorType, Clock, MetricEventType, RetryQueueItem};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    error::EngineError,
    executor::JobExecutor,
    lifecycle::OperationLifecycle,
    metrics::{MetricRecord, MetricsSink},
    queue::{RetryOutcome, RetryQueue},
};

/// Tuning for the processor loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorConfig {
    /// Interval between iterations.
    pub poll_interval: Duration,

    /// Budget for one executor invocation. A call that outlives it is
    /// treated as a retryable failure so the claim is not held forever.
    pub executor_timeout: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(crate::DEFAULT_POLL_INTERVAL_SECS),
            executor_timeout: Duration::from_secs(5 * 60),
        }
    }
}

/// What one processor iteration did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationOutcome {
    /// No eligible item was due.
    Idle,
    /// The redrive succeeded; the item completed.
    Succeeded,
    /// The redrive failed; another attempt is scheduled.
    RetryScheduled,
    /// The redrive failed and no attempts remain.
    RetriesExhausted,
}

struct Inner {
    queue: Arc<RetryQueue>,
    lifecycle: Arc<OperationLifecycle>,
    executor: Arc<dyn JobExecutor>,
    metrics: Arc<dyn MetricsSink>,
    clock: Arc<dyn Clock>,
    config: ProcessorConfig,
}

impl Inner {
    async fn run_iteration(&self) -> IterationOutcome {
        let Some(item) = self.queue.dequeue_next().await else {
            return IterationOutcome::Idle;
        };

        tracing::info!(
            session_id = %item.session_id,
            attempt = item.retry_count + 1,
            max_retries = item.max_retries,
            "processing retry queue item"
        );

        self.metrics
            .record_metric(
                MetricRecord::new(item.session_id.clone(), item.tier, MetricEventType::Retry)
                    .with_metadata(
                        "retry_count",
                        serde_json::Value::from(item.retry_count + 1),
                    ),
            )
            .await;

        // Move the operation back into generation for this attempt. The
        // operation may be unknown to the engine or already advanced; the
        // redrive proceeds either way.
        if let Err(error) = self.lifecycle.begin_retry(&item.session_id, ActorType::System).await {
            tracing::debug!(
                session_id = %item.session_id,
                error = %error,
                "operation not moved to generating before redrive"
            );
        }

        let execution = tokio::time::timeout(
            self.config.executor_timeout,
            self.executor.execute(&item.session_id, item.tier, &item.problem_statement),
        )
        .await;

        match execution {
            Ok(Ok(true)) => self.handle_success(&item).await,
            Ok(Ok(false)) => {
                self.handle_failure(
                    &item,
                    EngineError::execution("job executor reported failure"),
                )
                .await
            },
            Ok(Err(error)) => self.handle_failure(&item, error).await,
            Err(_elapsed) => {
                self.handle_failure(
                    &item,
                    EngineError::timeout(self.config.executor_timeout.as_secs()),
                )
                .await
            },
        }
    }

    async fn handle_success(&self, item: &RetryQueueItem) -> IterationOutcome {
        self.queue.mark_completed(&item.session_id).await;

        // Advance the operation; it completes outright on the final part
        // and rests at part_completed when more parts remain.
        if let Err(error) = self.lifecycle.complete_part(&item.session_id, None, None).await {
            tracing::debug!(
                session_id = %item.session_id,
                error = %error,
                "operation not advanced after successful redrive"
            );
        }

        tracing::info!(session_id = %item.session_id, "redrive succeeded");
        IterationOutcome::Succeeded
    }

    async fn handle_failure(
        &self,
        item: &RetryQueueItem,
        error: EngineError,
    ) -> IterationOutcome {
        tracing::warn!(
            session_id = %item.session_id,
            error = %error,
            "redrive failed"
        );

        if let Err(lifecycle_error) = self
            .lifecycle
            .fail(&item.session_id, Some(error.code()), &error.to_string(), ActorType::System)
            .await
        {
            tracing::debug!(
                session_id = %item.session_id,
                error = %lifecycle_error,
                "operation not marked failed after redrive"
            );
        }

        match self.queue.mark_for_retry(&item.session_id, &error.to_string()).await {
            RetryOutcome::WillRetry => IterationOutcome::RetryScheduled,
            RetryOutcome::WillNotRetry => IterationOutcome::RetriesExhausted,
        }
    }
}

/// Recurring single-flight loop that re-drives failed jobs.
pub struct RetryProcessor {
    inner: Arc<Inner>,
    running: AtomicBool,
    control: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl RetryProcessor {
    /// Creates a processor over the given collaborators.
    pub fn new(
        queue: Arc<RetryQueue>,
        lifecycle: Arc<OperationLifecycle>,
        executor: Arc<dyn JobExecutor>,
        metrics: Arc<dyn MetricsSink>,
        clock: Arc<dyn Clock>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner { queue, lifecycle, executor, metrics, clock, config }),
            running: AtomicBool::new(false),
            control: Mutex::new(None),
        }
    }

    /// Starts the recurring loop. A no-op when already running.
    ///
    /// The first iteration runs immediately; later ones follow the poll
    /// interval. Each iteration runs on its own task so a panicking
    /// executor cannot stop the timer.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::debug!("retry processor already running");
            return;
        }

        let token = CancellationToken::new();
        let loop_token = token.clone();
        let inner = self.inner.clone();

        let handle = tokio::spawn(async move {
            tracing::info!("retry processor started");

            loop {
                if loop_token.is_cancelled() {
                    break;
                }

                let iteration = {
                    let inner = inner.clone();
                    tokio::spawn(async move { inner.run_iteration().await })
                };
                if let Err(join_error) = iteration.await {
                    tracing::error!(
                        error = %join_error,
                        "processor iteration panicked; loop continues"
                    );
                }

                tokio::select! {
                    () = inner.clock.sleep(inner.config.poll_interval) => {},
                    () = loop_token.cancelled() => break,
                }
            }

            tracing::info!("retry processor stopped");
        });

        *self.lock_control() = Some((token, handle));
    }

    /// Stops the recurring loop. A no-op when already stopped.
    ///
    /// Advisory: an iteration already in flight finishes its executor call
    /// and outcome handling before the task exits.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        if let Some((token, _handle)) = self.lock_control().take() {
            token.cancel();
        }
    }

    /// Whether the loop is currently running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Runs exactly one iteration synchronously.
    ///
    /// The loop uses the same path; tests and controlled drains call this
    /// directly.
    pub async fn run_iteration(&self) -> IterationOutcome {
        self.inner.run_iteration().await
    }

    fn lock_control(&self) -> std::sync::MutexGuard<'_, Option<(CancellationToken, JoinHandle<()>)>> {
        self.control.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for RetryProcessor {
    fn drop(&mut self) {
        if let Some((token, _handle)) = self.lock_control().take() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use operon_core::{
        time::test_epoch, QueueStatus, OperationState, SessionId, TestClock, Tier,
    };

    use super::*;
    use crate::{
        alerts::{AdminAlerter, AlertConfig},
        executor::mock::{HangingExecutor, RecordingNotifier, ScriptedExecutor},
        metrics::mock::RecordingMetricsSink,
        queue::EnqueueRequest,
        retry::RetryPolicy,
        storage::mock::InMemoryEngineStorage,
    };

    struct Fixture {
        storage: Arc<InMemoryEngineStorage>,
        notifier: Arc<RecordingNotifier>,
        metrics: Arc<RecordingMetricsSink>,
        queue: Arc<RetryQueue>,
        lifecycle: Arc<OperationLifecycle>,
        clock: TestClock,
    }

    fn fixture() -> Fixture {
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
        let queue = Arc::new(RetryQueue::new(
            storage.clone(),
            alerter,
            RetryPolicy::default(),
            Arc::new(clock.clone()),
        ));
        let lifecycle = Arc::new(OperationLifecycle::new(
            storage.clone(),
            metrics.clone(),
            Arc::new(clock.clone()),
        ));
        Fixture { storage, notifier, metrics, queue, lifecycle, clock }
    }

    impl Fixture {
        fn processor(&self, executor: Arc<dyn JobExecutor>) -> RetryProcessor {
            self.processor_with_config(executor, ProcessorConfig::default())
        }

        fn processor_with_config(
            &self,
            executor: Arc<dyn JobExecutor>,
            config: ProcessorConfig,
        ) -> RetryProcessor {
            RetryProcessor::new(
                self.queue.clone(),
                self.lifecycle.clone(),
                executor,
                self.metrics.clone(),
                Arc::new(self.clock.clone()),
                config,
            )
        }

        /// Creates a failed operation and its queue item, the state a job
        /// is left in by the failure handler.
        async fn seed_failed_job(&self, session: &str, tier: Tier) -> SessionId {
            let session_id = SessionId::from(session);
            self.lifecycle.create(session_id.clone(), tier, None).await.unwrap();
            self.lifecycle
                .start(&session_id, operon_core::ActorType::System, None)
                .await
                .unwrap();
            self.lifecycle
                .fail(&session_id, Some("UPSTREAM_ERROR"), "first attempt failed", operon_core::ActorType::System)
                .await
                .unwrap();
            assert!(
                self.queue
                    .enqueue(EnqueueRequest::new(session_id.clone(), tier, "problem statement"))
                    .await
            );
            session_id
        }
    }

    #[tokio::test]
    async fn empty_queue_iteration_is_idle() {
        let f = fixture();
        let processor = f.processor(Arc::new(ScriptedExecutor::always_succeeding()));

        assert_eq!(processor.run_iteration().await, IterationOutcome::Idle);
    }

    #[tokio::test]
    async fn successful_redrive_completes_single_part_operation() {
        let f = fixture();
        let executor = Arc::new(ScriptedExecutor::always_succeeding());
        let processor = f.processor(executor.clone());

        let session = f.seed_failed_job("s-1", Tier::Low).await;

        assert_eq!(processor.run_iteration().await, IterationOutcome::Succeeded);

        assert_eq!(f.storage.queue_items()[0].status, QueueStatus::Completed);
        assert_eq!(f.storage.operation(&session).unwrap().state, OperationState::Completed);
        assert_eq!(executor.call_count(), 1);
        assert_eq!(
            executor.calls()[0],
            (session, Tier::Low, "problem statement".to_string())
        );
    }

    #[tokio::test]
    async fn successful_redrive_leaves_multi_part_operation_pending_more_parts() {
        let f = fixture();
        let processor = f.processor(Arc::new(ScriptedExecutor::always_succeeding()));

        let session = f.seed_failed_job("s-1", Tier::High).await;

        assert_eq!(processor.run_iteration().await, IterationOutcome::Succeeded);

        let operation = f.storage.operation(&session).unwrap();
        assert_eq!(operation.state, OperationState::PartCompleted);
        assert_eq!(operation.completed_parts, 1);
        assert_eq!(f.storage.queue_items()[0].status, QueueStatus::Completed);
    }

    #[tokio::test]
    async fn failed_redrive_schedules_another_attempt() {
        let f = fixture();
        let processor = f.processor(Arc::new(ScriptedExecutor::always_failing("upstream 500")));

        let session = f.seed_failed_job("s-1", Tier::Mid).await;

        assert_eq!(processor.run_iteration().await, IterationOutcome::RetryScheduled);

        let item = f.storage.queue_items()[0].clone();
        assert_eq!(item.status, QueueStatus::Pending);
        assert_eq!(item.retry_count, 1);
        assert_eq!(
            item.next_retry_at,
            Some(f.clock.now_utc() + chrono::Duration::seconds(60))
        );

        let operation = f.storage.operation(&session).unwrap();
        assert_eq!(operation.state, OperationState::Failed);
        assert!(operation.last_error.unwrap().contains("upstream 500"));
    }

    #[tokio::test]
    async fn executor_reporting_false_is_retried() {
        let f = fixture();
        let processor = f.processor(Arc::new(ScriptedExecutor::with_script(vec![Ok(false)])));

        f.seed_failed_job("s-1", Tier::Low).await;

        assert_eq!(processor.run_iteration().await, IterationOutcome::RetryScheduled);
        let item = f.storage.queue_items()[0].clone();
        assert!(item.last_error.unwrap().contains("reported failure"));
    }

    #[tokio::test]
    async fn hung_executor_is_timed_out_and_retried() {
        let f = fixture();
        let config = ProcessorConfig {
            executor_timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let processor = f.processor_with_config(Arc::new(HangingExecutor), config);

        f.seed_failed_job("s-1", Tier::Low).await;

        assert_eq!(processor.run_iteration().await, IterationOutcome::RetryScheduled);
        let item = f.storage.queue_items()[0].clone();
        assert_eq!(item.status, QueueStatus::Pending);
        assert!(item.last_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn exhausted_item_fails_permanently_and_alerts() {
        let f = fixture();
        let processor = f.processor(Arc::new(ScriptedExecutor::always_failing("hard down")));

        let session_id = SessionId::from("s-1");
        f.lifecycle.create(session_id.clone(), Tier::Low, None).await.unwrap();
        f.lifecycle.start(&session_id, operon_core::ActorType::System, None).await.unwrap();
        f.lifecycle
            .fail(&session_id, None, "initial failure", operon_core::ActorType::System)
            .await
            .unwrap();
        let mut request = EnqueueRequest::new(session_id.clone(), Tier::Low, "problem");
        request.max_retries = Some(1);
        assert!(f.queue.enqueue(request).await);

        assert_eq!(processor.run_iteration().await, IterationOutcome::RetriesExhausted);

        let item = f.storage.queue_items()[0].clone();
        assert_eq!(item.status, QueueStatus::Failed);
        // Operation stays failed, awaiting operator retry or cancellation.
        assert_eq!(f.storage.operation(&session_id).unwrap().state, OperationState::Failed);
        assert_eq!(f.notifier.sent_count(), 1);
        assert!(f.notifier.sent()[0].0.contains("Retry Queue Exhausted"));
    }

    #[tokio::test]
    async fn retry_metric_recorded_per_attempt() {
        let f = fixture();
        let processor = f.processor(Arc::new(ScriptedExecutor::always_succeeding()));

        f.seed_failed_job("s-1", Tier::Low).await;
        processor.run_iteration().await;

        let retries: Vec<_> = f
            .metrics
            .records()
            .into_iter()
            .filter(|r| r.event_type == MetricEventType::Retry)
            .collect();
        assert_eq!(retries.len(), 1);
        assert_eq!(
            retries[0].metadata.get("retry_count"),
            Some(&serde_json::Value::from(1))
        );
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let f = fixture();
        let processor = f.processor(Arc::new(ScriptedExecutor::always_succeeding()));

        assert!(!processor.is_running());
        processor.start();
        assert!(processor.is_running());
        processor.start(); // no-op
        assert!(processor.is_running());

        processor.stop();
        assert!(!processor.is_running());
        processor.stop(); // no-op
        assert!(!processor.is_running());
    }

    #[tokio::test]
    async fn panicking_executor_does_not_stop_the_loop() {
        #[derive(Debug)]
        struct PanickingExecutor;

        #[async_trait]
        impl JobExecutor for PanickingExecutor {
            async fn execute(
                &self,
                _session_id: &SessionId,
                _tier: Tier,
                _problem_statement: &str,
            ) -> crate::error::Result<bool> {
                panic!("executor blew up");
            }
        }

        let f = fixture();
        let processor = f.processor(Arc::new(PanickingExecutor));
        f.seed_failed_job("s-1", Tier::Low).await;

        processor.start();
        // Let several loop turns run; the virtual clock makes the poll
        // interval a yield.
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }

        assert!(processor.is_running());
        processor.stop();
    }

    #[tokio::test]
    async fn cancelled_item_outcome_reports_are_noops() {
        let f = fixture();
        let processor = f.processor(Arc::new(ScriptedExecutor::always_succeeding()));

        let session = f.seed_failed_job("s-1", Tier::Low).await;

        // Claim the item, then cancel both the queue item and the
        // operation while the executor call would be in flight.
        let claimed = f.queue.dequeue_next().await.unwrap();
        f.queue.cancel(&claimed.session_id).await;
        f.lifecycle
            .cancel(&session, operon_core::ActorType::Admin, Some("op-team"))
            .await
            .unwrap();

        // The iteration finds nothing to claim and the late reports
        // change nothing.
        assert_eq!(processor.run_iteration().await, IterationOutcome::Idle);
        f.queue.mark_completed(&session).await;
        assert_eq!(f.storage.queue_items()[0].status, QueueStatus::Cancelled);
        assert_eq!(
            f.storage.operation(&session).unwrap().state,
            OperationState::Cancelled
        );
    }
}
