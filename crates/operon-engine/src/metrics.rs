//! Metric recording seam.
//!
//! Metric writes are best-effort everywhere: a lost metric must never fail
//! the job path that produced it, so the sink trait is infallible and the
//! storage-backed implementation swallows (and logs) its own errors.

use std::sync::Arc;

use async_trait::async_trait;
use operon_core::{
    models::Metadata, storage::metrics, AnalysisMetric, Clock, MetricEventType, SessionId, Tier,
};
use uuid::Uuid;

/// One metric observation, before persistence details are attached.
#[derive(Debug, Clone)]
pub struct MetricRecord {
    /// Session the metric belongs to.
    pub session_id: SessionId,
    /// Tier of the job.
    pub tier: Tier,
    /// What happened.
    pub event_type: MetricEventType,
    /// Duration of the measured work in milliseconds.
    pub duration_ms: Option<i64>,
    /// 1-based part index for part-scoped metrics.
    pub part_number: Option<i32>,
    /// Machine-readable error code for failure metrics.
    pub error_code: Option<String>,
    /// Human-readable error detail for failure metrics.
    pub error_message: Option<String>,
    /// Opaque key-value context.
    pub metadata: Metadata,
}

impl MetricRecord {
    /// Creates a metric with empty optional fields.
    pub fn new(session_id: SessionId, tier: Tier, event_type: MetricEventType) -> Self {
        Self {
            session_id,
            tier,
            event_type,
            duration_ms: None,
            part_number: None,
            error_code: None,
            error_message: None,
            metadata: Metadata::new(),
        }
    }

    /// Sets the measured duration.
    pub fn with_duration_ms(mut self, duration_ms: i64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Sets error context.
    pub fn with_error(mut self, code: impl Into<String>, message: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self.error_message = Some(message.into());
        self
    }

    /// Adds one metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Records metric events; must not throw into caller code paths.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    /// Records one metric observation.
    async fn record_metric(&self, record: MetricRecord);
}

/// Sink that discards all metrics.
#[derive(Debug, Default)]
pub struct NoopMetricsSink;

#[async_trait]
impl MetricsSink for NoopMetricsSink {
    async fn record_metric(&self, _record: MetricRecord) {}
}

/// Sink that persists metrics through the core repository.
pub struct StorageMetricsSink {
    repository: Arc<metrics::Repository>,
    clock: Arc<dyn Clock>,
}

impl StorageMetricsSink {
    /// Creates a sink writing to the given repository.
    pub fn new(repository: Arc<metrics::Repository>, clock: Arc<dyn Clock>) -> Self {
        Self { repository, clock }
    }
}

#[async_trait]
impl MetricsSink for StorageMetricsSink {
    async fn record_metric(&self, record: MetricRecord) {
        let metric = AnalysisMetric {
            id: Uuid::new_v4(),
            session_id: record.session_id,
            tier: record.tier,
            event_type: record.event_type,
            duration_ms: record.duration_ms,
            part_number: record.part_number,
            error_code: record.error_code,
            error_message: record.error_message,
            metadata: sqlx::types::Json(record.metadata),
            created_at: self.clock.now_utc(),
        };

        if let Err(error) = self.repository.record(&metric).await {
            tracing::warn!(
                session_id = %metric.session_id,
                event_type = %metric.event_type,
                error = %error,
                "failed to record metric"
            );
        }
    }
}

pub mod mock {
    //! Recording sink for tests.

    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::{MetricRecord, MetricsSink};

    /// Sink that stores every record for later inspection.
    #[derive(Debug, Default)]
    pub struct RecordingMetricsSink {
        records: Mutex<Vec<MetricRecord>>,
    }

    impl RecordingMetricsSink {
        /// Creates an empty recording sink.
        pub fn new() -> Self {
            Self::default()
        }

        /// All recorded metrics, in order.
        pub fn records(&self) -> Vec<MetricRecord> {
            self.records.lock().unwrap_or_else(|e| e.into_inner()).clone()
        }
    }

    #[async_trait]
    impl MetricsSink for RecordingMetricsSink {
        async fn record_metric(&self, record: MetricRecord) {
            self.records.lock().unwrap_or_else(|e| e.into_inner()).push(record);
        }
    }
}
