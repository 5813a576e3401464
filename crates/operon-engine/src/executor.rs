//! Collaborator contracts for the subsystems this engine drives.
//!
//! Job execution, operator notification, and metric recording are owned by
//! excluded subsystems; the engine consumes them through these traits and
//! only needs their outcomes. Test doubles live in [`mock`].

use async_trait::async_trait;
use operon_core::{SessionId, Tier};

use crate::error::Result;

/// Executes the actual multi-part generation for a session.
///
/// The executor writes its own result artifacts independently of this
/// engine; the engine only needs success or failure. `Ok(false)` means the
/// executor ran and reported failure; `Err` means it blew up. Both are
/// treated as retryable by the processor.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// Runs (or re-runs) the analysis for a session.
    async fn execute(
        &self,
        session_id: &SessionId,
        tier: Tier,
        problem_statement: &str,
    ) -> Result<bool>;
}

/// Delivers a human-readable message to an operator channel.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Sends a notification; returns whether delivery succeeded.
    async fn notify(&self, title: &str, content: &str) -> bool;
}

/// Notification sink that writes alerts to the log.
///
/// The default wiring when no operator channel is configured; alert
/// content still reaches whoever reads the service logs.
#[derive(Debug, Default)]
pub struct TracingNotificationSink;

#[async_trait]
impl NotificationSink for TracingNotificationSink {
    async fn notify(&self, title: &str, content: &str) -> bool {
        tracing::error!(title, content, "admin alert");
        true
    }
}

pub mod mock {
    //! Deterministic collaborator doubles for tests.

    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    };

    use async_trait::async_trait;
    use operon_core::{SessionId, Tier};

    use super::{JobExecutor, NotificationSink};
    use crate::error::{EngineError, Result};

    /// Executor that replays a scripted sequence of outcomes.
    ///
    /// Each call pops the next scripted result; once the script is
    /// exhausted, the fallback outcome repeats.
    #[derive(Debug)]
    pub struct ScriptedExecutor {
        script: Mutex<Vec<Result<bool>>>,
        fallback: Result<bool>,
        calls: Mutex<Vec<(SessionId, Tier, String)>>,
    }

    impl ScriptedExecutor {
        fn new(script: Vec<Result<bool>>, fallback: Result<bool>) -> Self {
            Self { script: Mutex::new(script), fallback, calls: Mutex::new(Vec::new()) }
        }

        /// Creates an executor that always succeeds.
        pub fn always_succeeding() -> Self {
            Self::new(Vec::new(), Ok(true))
        }

        /// Creates an executor that always fails with the given message.
        pub fn always_failing(message: &str) -> Self {
            Self::new(Vec::new(), Err(EngineError::execution(message)))
        }

        /// Creates an executor from an outcome script, first call first.
        ///
        /// Succeeds once the script is exhausted.
        pub fn with_script(script: Vec<Result<bool>>) -> Self {
            Self::new(script, Ok(true))
        }

        /// Sessions this executor was invoked for, in call order.
        pub fn calls(&self) -> Vec<(SessionId, Tier, String)> {
            self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
        }

        /// Number of executor invocations.
        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap_or_else(|e| e.into_inner()).len()
        }
    }

    #[async_trait]
    impl JobExecutor for ScriptedExecutor {
        async fn execute(
            &self,
            session_id: &SessionId,
            tier: Tier,
            problem_statement: &str,
        ) -> Result<bool> {
            self.calls.lock().unwrap_or_else(|e| e.into_inner()).push((
                session_id.clone(),
                tier,
                problem_statement.to_string(),
            ));

            let mut script = self.script.lock().unwrap_or_else(|e| e.into_inner());
            if script.is_empty() {
                self.fallback.clone()
            } else {
                script.remove(0)
            }
        }
    }

    /// Executor that never completes, for timeout tests.
    #[derive(Debug, Default)]
    pub struct HangingExecutor;

    #[async_trait]
    impl JobExecutor for HangingExecutor {
        async fn execute(
            &self,
            _session_id: &SessionId,
            _tier: Tier,
            _problem_statement: &str,
        ) -> Result<bool> {
            std::future::pending::<()>().await;
            unreachable!("pending future never resolves")
        }
    }

    /// Notification sink that records every dispatch.
    #[derive(Debug)]
    pub struct RecordingNotifier {
        sent: Mutex<Vec<(String, String)>>,
        succeed: AtomicBool,
    }

    impl Default for RecordingNotifier {
        fn default() -> Self {
            Self { sent: Mutex::new(Vec::new()), succeed: AtomicBool::new(true) }
        }
    }

    impl RecordingNotifier {
        /// Creates a notifier whose dispatches succeed.
        pub fn new() -> Self {
            Self::default()
        }

        /// Makes future dispatches report failure (or success again).
        pub fn set_succeed(&self, succeed: bool) {
            self.succeed.store(succeed, Ordering::SeqCst);
        }

        /// Dispatched `(title, content)` pairs, in order.
        pub fn sent(&self) -> Vec<(String, String)> {
            self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
        }

        /// Number of dispatch attempts.
        pub fn sent_count(&self) -> usize {
            self.sent.lock().unwrap_or_else(|e| e.into_inner()).len()
        }
    }

    #[async_trait]
    impl NotificationSink for RecordingNotifier {
        async fn notify(&self, title: &str, content: &str) -> bool {
            self.sent
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push((title.to_string(), content.to_string()));
            self.succeed.load(Ordering::SeqCst)
        }
    }
}
