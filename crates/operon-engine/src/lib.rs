//! Analysis operation lifecycle engine.
//!
//! This crate implements the recovery machinery around long-running,
//! multi-part analysis jobs: the lifecycle service that validates and
//! records every state transition, the durable retry queue that re-drives
//! failed jobs with exponential backoff, the background processor that
//! polls the queue, the circuit breaker protecting a flaky upstream, and
//! the deduplicated admin alerting that keeps a human in the loop without
//! notification storms.
//!
//! # Architecture
//!
//! ```text
//! job execution (collaborator)
//!      |  success / failure
//!      v
//! OperationLifecycle ----> event log + operation row (one transaction)
//!      |  failure
//!      v
//! RetryQueue  <---- claims ----  RetryProcessor (30s loop)
//!      |  exhausted                    |  invokes
//!      v                               v
//! AdminAlerter  <---- opens ----  CircuitBreakerManager
//! ```
//!
//! Claims are atomic at the store (`FOR UPDATE SKIP LOCKED` inside a
//! conditional `UPDATE`), which is the only cross-process exclusion the
//! design needs: replicas may each run a processor without
//! double-processing an item.
//!
//! # Degraded mode
//!
//! Every public entry point survives a lost store: reads return empty or
//! zero results, writes report `false`, and the processor keeps ticking.
//! Jobs are never silently dropped; a failure either reschedules with
//! backoff or fires a critical alert when retries run out.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod alerts;
pub mod circuit;
pub mod config;
pub mod error;
pub mod executor;
pub mod lifecycle;
pub mod metrics;
pub mod processor;
pub mod queue;
pub mod retry;
pub mod storage;
pub mod telemetry;

pub use alerts::{AdminAlerter, AlertConfig, AlertParams};
pub use circuit::{CircuitBreakerManager, CircuitConfig, CircuitState};
pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use executor::{JobExecutor, NotificationSink};
pub use lifecycle::OperationLifecycle;
pub use metrics::{MetricRecord, MetricsSink, NoopMetricsSink};
pub use processor::{IterationOutcome, ProcessorConfig, RetryProcessor};
pub use queue::{EnqueueRequest, RetryOutcome, RetryQueue};
pub use retry::{RetryDecision, RetryPolicy};
pub use storage::EngineStorage;

/// Default retry attempts before a queue item fails permanently.
pub const DEFAULT_MAX_RETRIES: i32 = 5;

/// Default interval between processor iterations.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;

/// Stored error strings are capped at this many characters.
pub const STORED_ERROR_MAX_CHARS: usize = 1000;

/// Alert payloads truncate error strings further, to this many characters.
pub const ALERT_ERROR_MAX_CHARS: usize = 500;

/// Truncates a string to at most `max` characters on a char boundary.
pub(crate) fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_respects_char_boundaries() {
        let long = "é".repeat(1200);
        let truncated = truncate_chars(&long, STORED_ERROR_MAX_CHARS);
        assert_eq!(truncated.chars().count(), 1000);

        assert_eq!(truncate_chars("short", 1000), "short");
    }
}
