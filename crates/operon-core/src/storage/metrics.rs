//! Repository for raw metric events and their hourly aggregation.
//!
//! Raw rows are appended by the engine's metrics sink; a scheduled job
//! folds each completed hour into `hourly_metrics` for dashboard queries.
//! Recording is best-effort at the call sites; this layer reports errors
//! and lets callers decide.

use std::sync::Arc;

use chrono::{DateTime, Duration, Timelike, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    error::Result,
    models::{AnalysisMetric, HourlyMetric, MetricEventType, Tier},
};

/// Summary of failures grouped by error code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorSummary {
    /// Machine-readable error code, `UNKNOWN` when the metric had none.
    pub error_code: String,
    /// Occurrences in the queried range.
    pub count: u64,
    /// Most recent occurrence.
    pub last_occurrence: DateTime<Utc>,
}

/// Repository for metric rows.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Appends one raw metric event.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn record(&self, metric: &AnalysisMetric) -> Result<Uuid> {
        let id = sqlx::query_scalar(
            r#"
            INSERT INTO analysis_metrics (
                id, session_id, tier, event_type, duration_ms, part_number,
                error_code, error_message, metadata, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING id
            "#,
        )
        .bind(metric.id)
        .bind(metric.session_id.as_str())
        .bind(metric.tier.to_string())
        .bind(metric.event_type.to_string())
        .bind(metric.duration_ms)
        .bind(metric.part_number)
        .bind(&metric.error_code)
        .bind(&metric.error_message)
        .bind(&metric.metadata)
        .bind(metric.created_at)
        .fetch_one(&*self.pool)
        .await?;

        Ok(id)
    }

    /// Returns raw metrics in a time range, oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<AnalysisMetric>> {
        let metrics = sqlx::query_as::<_, AnalysisMetric>(
            r#"
            SELECT id, session_id, tier, event_type, duration_ms, part_number,
                   error_code, error_message, metadata, created_at
            FROM analysis_metrics
            WHERE created_at >= $1 AND created_at < $2
            ORDER BY created_at ASC
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_all(&*self.pool)
        .await?;

        Ok(metrics)
    }

    /// Aggregates one hour of raw metrics into a `hourly_metrics` row.
    ///
    /// No row is written when the hour has no metrics.
    ///
    /// # Errors
    ///
    /// Returns error if the read or the insert fails.
    pub async fn aggregate_hour(&self, hour_start: DateTime<Utc>) -> Result<()> {
        let hour_end = hour_start + Duration::hours(1);
        let metrics = self.find_range(hour_start, hour_end).await?;

        let Some(hourly) = aggregate_rows(hour_start, &metrics) else {
            return Ok(());
        };

        sqlx::query(
            r#"
            INSERT INTO hourly_metrics (
                id, hour_start, total_requests, successful_requests,
                failed_requests, partial_successes, retried_requests,
                avg_duration_ms, p50_duration_ms, p95_duration_ms,
                p99_duration_ms, tier_low, tier_mid, tier_high
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14
            )
            "#,
        )
        .bind(hourly.id)
        .bind(hourly.hour_start)
        .bind(hourly.total_requests)
        .bind(hourly.successful_requests)
        .bind(hourly.failed_requests)
        .bind(hourly.partial_successes)
        .bind(hourly.retried_requests)
        .bind(hourly.avg_duration_ms)
        .bind(hourly.p50_duration_ms)
        .bind(hourly.p95_duration_ms)
        .bind(hourly.p99_duration_ms)
        .bind(hourly.tier_low)
        .bind(hourly.tier_mid)
        .bind(hourly.tier_high)
        .execute(&*self.pool)
        .await?;

        tracing::info!(hour_start = %hourly.hour_start, "aggregated hourly metrics");
        Ok(())
    }

    /// Aggregates the hour preceding `now`. Intended for a scheduled job.
    ///
    /// # Errors
    ///
    /// Returns error if aggregation fails.
    pub async fn aggregate_previous_hour(&self, now: DateTime<Utc>) -> Result<()> {
        let this_hour = now
            .with_minute(0)
            .and_then(|t| t.with_second(0))
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(now);
        self.aggregate_hour(this_hour - Duration::hours(1)).await
    }

    /// Returns hourly aggregation rows in a range, oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn hourly_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<HourlyMetric>> {
        let rows = sqlx::query_as::<_, HourlyMetric>(
            r#"
            SELECT id, hour_start, total_requests, successful_requests,
                   failed_requests, partial_successes, retried_requests,
                   avg_duration_ms, p50_duration_ms, p95_duration_ms,
                   p99_duration_ms, tier_low, tier_mid, tier_high
            FROM hourly_metrics
            WHERE hour_start >= $1 AND hour_start <= $2
            ORDER BY hour_start ASC
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_all(&*self.pool)
        .await?;

        Ok(rows)
    }

    /// Groups failure metrics by error code, most frequent first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn error_summary(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ErrorSummary>> {
        let rows: Vec<(Option<String>, i64, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT error_code, COUNT(*), MAX(created_at)
            FROM analysis_metrics
            WHERE event_type = 'failure'
              AND created_at >= $1 AND created_at < $2
            GROUP BY error_code
            ORDER BY COUNT(*) DESC
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_all(&*self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(code, count, last_occurrence)| ErrorSummary {
                error_code: code.unwrap_or_else(|| "UNKNOWN".to_string()),
                count: u64::try_from(count).unwrap_or(0),
                last_occurrence,
            })
            .collect())
    }
}

/// Folds one hour of raw metrics into an aggregation row.
///
/// Duration statistics come from `success` events only. Returns `None`
/// when there is nothing to aggregate.
pub fn aggregate_rows(
    hour_start: DateTime<Utc>,
    metrics: &[AnalysisMetric],
) -> Option<HourlyMetric> {
    if metrics.is_empty() {
        return None;
    }

    let count_of = |event_type: MetricEventType| -> i32 {
        i32::try_from(metrics.iter().filter(|m| m.event_type == event_type).count())
            .unwrap_or(i32::MAX)
    };

    let requests: Vec<_> =
        metrics.iter().filter(|m| m.event_type == MetricEventType::Request).collect();
    let tier_count = |tier: Tier| -> i32 {
        i32::try_from(requests.iter().filter(|m| m.tier == tier).count()).unwrap_or(i32::MAX)
    };

    let mut durations: Vec<i64> = metrics
        .iter()
        .filter(|m| m.event_type == MetricEventType::Success)
        .filter_map(|m| m.duration_ms)
        .collect();
    durations.sort_unstable();

    let avg = if durations.is_empty() {
        None
    } else {
        Some(durations.iter().sum::<i64>() / i64::try_from(durations.len()).unwrap_or(1))
    };

    Some(HourlyMetric {
        id: Uuid::new_v4(),
        hour_start,
        total_requests: i32::try_from(requests.len()).unwrap_or(i32::MAX),
        successful_requests: count_of(MetricEventType::Success),
        failed_requests: count_of(MetricEventType::Failure),
        partial_successes: count_of(MetricEventType::PartialSuccess),
        retried_requests: count_of(MetricEventType::Retry),
        avg_duration_ms: avg,
        p50_duration_ms: percentile(&durations, 0.50),
        p95_duration_ms: percentile(&durations, 0.95),
        p99_duration_ms: percentile(&durations, 0.99),
        tier_low: tier_count(Tier::Low),
        tier_mid: tier_count(Tier::Mid),
        tier_high: tier_count(Tier::High),
    })
}

/// Nearest-rank percentile over a sorted slice.
fn percentile(sorted: &[i64], quantile: f64) -> Option<i64> {
    if sorted.is_empty() {
        return None;
    }
    let index = ((sorted.len() as f64) * quantile).floor() as usize;
    Some(sorted[index.min(sorted.len() - 1)])
}
