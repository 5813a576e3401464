//! Core domain model for the Operon analysis lifecycle engine.
//!
//! Provides strongly-typed identifiers, the operation state machine,
//! error taxonomy, clock abstraction, and the Postgres repository layer.
//! All other crates depend on these foundational types for type safety
//! and consistency.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use models::{
    is_valid_transition, ActorType, AdminNotification, AlertSeverity, AlertType, AnalysisMetric,
    HourlyMetric, MetricEventType, Operation, OperationEvent, OperationEventType, OperationId,
    OperationState, QueueStats, QueueStatus, RetryPriority, RetryQueueItem, SessionId, Tier,
};
pub use time::{Clock, RealClock, TestClock};
