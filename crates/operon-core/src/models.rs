//! Domain models and strongly-typed identifiers.
//!
//! Defines analysis operations, their immutable event records, retry queue
//! items, and newtype ID wrappers for compile-time type safety. Includes
//! database serialization traits and the operation state machine used by
//! every mutator in the lifecycle pipeline.

use std::{collections::HashMap, fmt, str::FromStr, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

type PgDb = sqlx::Postgres;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type BoxDynError = sqlx::error::BoxDynError;

/// Opaque metadata attached to events, alerts, and metrics.
pub type Metadata = HashMap<String, serde_json::Value>;

/// Strongly-typed operation identifier.
///
/// Wraps a UUID to prevent mixing with other ID types. Assigned internally
/// when a purchased analysis job is accepted into the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationId(pub Uuid);

impl OperationId {
    /// Creates a new random operation ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for OperationId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for OperationId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for OperationId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

/// Externally assigned session identifier.
///
/// Arrives with the purchase (checkout session) and is the key the outside
/// world uses to refer to a job. Unique across operations; the retry queue
/// permits at most one active item per session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    /// Wraps an externally assigned session string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The session identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl sqlx::Type<PgDb> for SessionId {
    fn type_info() -> PgTypeInfo {
        <String as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for SessionId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <String as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(s))
    }
}

/// Purchase tier of an analysis operation.
///
/// Each tier fixes the number of generation parts and the expected duration
/// of a single part. Higher tiers produce more parts, each taking longer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Single-part analysis.
    Low,
    /// Two-part analysis.
    Mid,
    /// Six-part deep analysis.
    High,
}

impl Tier {
    /// Total number of generation parts for this tier.
    pub fn total_parts(self) -> i32 {
        match self {
            Self::Low => 1,
            Self::Mid => 2,
            Self::High => 6,
        }
    }

    /// Expected wall-clock duration of one generation part.
    pub fn estimated_part_duration(self) -> Duration {
        match self {
            Self::Low => Duration::from_secs(30),
            Self::Mid => Duration::from_secs(45),
            Self::High => Duration::from_secs(60),
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Mid => write!(f, "mid"),
            Self::High => write!(f, "high"),
        }
    }
}

impl FromStr for Tier {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "mid" => Ok(Self::Mid),
            "high" => Ok(Self::High),
            _ => Err(CoreError::InvalidInput(format!("unknown tier: {s}"))),
        }
    }
}

impl sqlx::Type<PgDb> for Tier {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for Tier {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        Self::from_str(s).map_err(|e| e.to_string().into())
    }
}

/// Lifecycle state of an analysis operation.
///
/// Transitions are strictly controlled; every mutator validates against
/// [`OperationState::can_transition_to`] before persisting anything.
///
/// ```text
/// initialized -> generating -> part_completed -> generating -> ...
///                    |               |
///                    v               v
///                  failed        completed (terminal)
///                    |
///                    v
///                generating (retry)
/// ```
///
/// `paused` is reachable from `generating` and `part_completed`;
/// `cancelled` from every non-terminal state. `completed` and `cancelled`
/// admit no further transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    /// Accepted, not yet generating.
    Initialized,
    /// A generation part is in flight.
    Generating,
    /// At least one part finished; more may remain.
    PartCompleted,
    /// The most recent part failed; retry or cancellation pending.
    Failed,
    /// Suspended by an operator; resumable.
    Paused,
    /// Terminal: cancelled by user or operator.
    Cancelled,
    /// Terminal: all parts generated.
    Completed,
}

impl OperationState {
    /// Whether this state admits no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Pure transition check with no side effects.
    ///
    /// Self-transitions are never valid. `initialized` must pass through
    /// `generating` before anything else; `generating` must record a
    /// `part_completed` before the operation can complete; `paused` and
    /// `failed` must resume through `generating` first.
    pub fn can_transition_to(self, to: Self) -> bool {
        match self {
            Self::Initialized => matches!(to, Self::Generating | Self::Cancelled),
            Self::Generating => {
                matches!(to, Self::PartCompleted | Self::Failed | Self::Paused | Self::Cancelled)
            },
            Self::PartCompleted => {
                matches!(to, Self::Generating | Self::Completed | Self::Paused | Self::Cancelled)
            },
            Self::Paused => matches!(to, Self::Generating | Self::Cancelled),
            Self::Failed => matches!(to, Self::Generating | Self::Cancelled),
            Self::Completed | Self::Cancelled => false,
        }
    }
}

/// String-level transition check for boundary code holding raw state names.
///
/// Unknown names are always invalid, as source or target.
pub fn is_valid_transition(from: &str, to: &str) -> bool {
    match (OperationState::from_str(from), OperationState::from_str(to)) {
        (Ok(from), Ok(to)) => from.can_transition_to(to),
        _ => false,
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initialized => write!(f, "initialized"),
            Self::Generating => write!(f, "generating"),
            Self::PartCompleted => write!(f, "part_completed"),
            Self::Failed => write!(f, "failed"),
            Self::Paused => write!(f, "paused"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

impl FromStr for OperationState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initialized" => Ok(Self::Initialized),
            "generating" => Ok(Self::Generating),
            "part_completed" => Ok(Self::PartCompleted),
            "failed" => Ok(Self::Failed),
            "paused" => Ok(Self::Paused),
            "cancelled" => Ok(Self::Cancelled),
            "completed" => Ok(Self::Completed),
            _ => Err(CoreError::InvalidInput(format!("unknown operation state: {s}"))),
        }
    }
}

impl sqlx::Type<PgDb> for OperationState {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for OperationState {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        Self::from_str(s).map_err(|e| e.to_string().into())
    }
}

/// One purchased analysis job, tracked end-to-end.
///
/// This is the denormalized view the dashboard reads; the canonical
/// history lives in the append-only [`OperationEvent`] log. Rows are never
/// deleted, only driven to a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Operation {
    /// Internally assigned identifier.
    pub id: OperationId,

    /// Externally assigned session this job belongs to.
    pub session_id: SessionId,

    /// Purchase tier fixing part count and duration expectations.
    pub tier: Tier,

    /// Current lifecycle state.
    pub state: OperationState,

    /// Number of parts this tier generates.
    pub total_parts: i32,

    /// Parts finished so far. Always within `0..=total_parts`.
    pub completed_parts: i32,

    /// 1-based index of the part currently generating, if any.
    pub current_part: Option<i32>,

    /// When generation first started.
    pub started_at: Option<DateTime<Utc>>,

    /// When the most recent part finished.
    pub last_part_completed_at: Option<DateTime<Utc>>,

    /// When the operation reached `completed`.
    pub completed_at: Option<DateTime<Utc>>,

    /// Projected completion time, refreshed on each part boundary.
    pub estimated_completion_at: Option<DateTime<Utc>>,

    /// Most recent error message, truncated for storage.
    pub last_error: Option<String>,

    /// When the most recent error occurred.
    pub last_error_at: Option<DateTime<Utc>>,

    /// 1-based index of the part that failed, if any.
    pub failed_part: Option<i32>,

    /// Times the operation re-entered `generating` from `failed`.
    pub retry_count: i32,

    /// Who or what caused the most recent transition.
    pub triggered_by: Option<String>,

    /// Free-form operator notes.
    pub admin_notes: Option<String>,

    /// Row creation time.
    pub created_at: DateTime<Utc>,

    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

impl Operation {
    /// Creates a fresh operation in `initialized` for an accepted job.
    pub fn new(session_id: SessionId, tier: Tier, now: DateTime<Utc>) -> Self {
        Self {
            id: OperationId::new(),
            session_id,
            tier,
            state: OperationState::Initialized,
            total_parts: tier.total_parts(),
            completed_parts: 0,
            current_part: None,
            started_at: None,
            last_part_completed_at: None,
            completed_at: None,
            estimated_completion_at: None,
            last_error: None,
            last_error_at: None,
            failed_part: None,
            retry_count: 0,
            triggered_by: None,
            admin_notes: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Completion percentage, computed fresh on every read.
    ///
    /// `round(completed / total * 100)`; never stored, so it cannot drift
    /// from the part counters.
    pub fn progress_percent(&self) -> u8 {
        if self.total_parts <= 0 {
            return 0;
        }
        let ratio = f64::from(self.completed_parts) / f64::from(self.total_parts);
        (ratio * 100.0).round() as u8
    }

    /// Parts still to generate.
    pub fn remaining_parts(&self) -> i32 {
        (self.total_parts - self.completed_parts).max(0)
    }

    /// Projects the completion time from the tier's per-part estimate.
    pub fn estimate_completion(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let per_part = self.tier.estimated_part_duration();
        let remaining = u32::try_from(self.remaining_parts()).unwrap_or(0);
        let total = per_part * remaining;
        now + chrono::Duration::from_std(total).unwrap_or_else(|_| chrono::Duration::zero())
    }
}

/// Kind of occurrence an [`OperationEvent`] records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationEventType {
    /// Generation began for the operation.
    OperationStarted,
    /// A part began generating.
    PartStarted,
    /// A part finished.
    PartCompleted,
    /// A part failed.
    PartFailed,
    /// All parts finished.
    OperationCompleted,
    /// The operation entered `failed`.
    OperationFailed,
    /// An operator paused the operation.
    OperationPaused,
    /// The operation resumed from `paused`.
    OperationResumed,
    /// The operation was cancelled.
    OperationCancelled,
    /// A retry re-entered `generating` from `failed`.
    OperationRetried,
    /// An operator acted on the operation outside the normal flow.
    AdminIntervention,
}

impl fmt::Display for OperationEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::OperationStarted => "operation_started",
            Self::PartStarted => "part_started",
            Self::PartCompleted => "part_completed",
            Self::PartFailed => "part_failed",
            Self::OperationCompleted => "operation_completed",
            Self::OperationFailed => "operation_failed",
            Self::OperationPaused => "operation_paused",
            Self::OperationResumed => "operation_resumed",
            Self::OperationCancelled => "operation_cancelled",
            Self::OperationRetried => "operation_retried",
            Self::AdminIntervention => "admin_intervention",
        };
        write!(f, "{s}")
    }
}

impl FromStr for OperationEventType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "operation_started" => Ok(Self::OperationStarted),
            "part_started" => Ok(Self::PartStarted),
            "part_completed" => Ok(Self::PartCompleted),
            "part_failed" => Ok(Self::PartFailed),
            "operation_completed" => Ok(Self::OperationCompleted),
            "operation_failed" => Ok(Self::OperationFailed),
            "operation_paused" => Ok(Self::OperationPaused),
            "operation_resumed" => Ok(Self::OperationResumed),
            "operation_cancelled" => Ok(Self::OperationCancelled),
            "operation_retried" => Ok(Self::OperationRetried),
            "admin_intervention" => Ok(Self::AdminIntervention),
            _ => Err(CoreError::InvalidInput(format!("unknown event type: {s}"))),
        }
    }
}

impl sqlx::Type<PgDb> for OperationEventType {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for OperationEventType {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        Self::from_str(s).map_err(|e| e.to_string().into())
    }
}

/// Who caused a transition or event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    /// The engine itself (executor outcomes, retry queue).
    System,
    /// A human operator.
    Admin,
    /// The purchasing user.
    User,
}

impl fmt::Display for ActorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::Admin => write!(f, "admin"),
            Self::User => write!(f, "user"),
        }
    }
}

impl FromStr for ActorType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(Self::System),
            "admin" => Ok(Self::Admin),
            "user" => Ok(Self::User),
            _ => Err(CoreError::InvalidInput(format!("unknown actor type: {s}"))),
        }
    }
}

impl sqlx::Type<PgDb> for ActorType {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for ActorType {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        Self::from_str(s).map_err(|e| e.to_string().into())
    }
}

/// Immutable record of one state transition or noteworthy action.
///
/// Write-once, read-many. The ordered event sequence for an operation is
/// its canonical history; replaying it reconstructs the denormalized
/// [`Operation`] state.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct OperationEvent {
    /// Unique identifier for this event.
    pub id: Uuid,

    /// Operation this event belongs to.
    pub operation_id: OperationId,

    /// Session of the owning operation.
    pub session_id: SessionId,

    /// What happened.
    pub event_type: OperationEventType,

    /// 1-based part index, for part-scoped events.
    pub part_number: Option<i32>,

    /// State before the transition, if this event records one.
    pub previous_state: Option<OperationState>,

    /// State after the transition, if this event records one.
    pub new_state: Option<OperationState>,

    /// Machine-readable error code.
    pub error_code: Option<String>,

    /// Human-readable error detail, truncated for storage.
    pub error_message: Option<String>,

    /// Duration of the work this event closes out, in milliseconds.
    pub duration_ms: Option<i64>,

    /// Tokens consumed by the generation step, if known.
    pub token_count: Option<i32>,

    /// Who caused the event.
    pub actor_type: ActorType,

    /// Identifier of the actor (operator handle, subsystem name).
    pub actor_id: Option<String>,

    /// Opaque key-value context.
    pub metadata: sqlx::types::Json<Metadata>,

    /// When the event was recorded.
    pub created_at: DateTime<Utc>,
}

impl OperationEvent {
    /// Creates a system-actored event with empty optional fields.
    pub fn new(
        operation_id: OperationId,
        session_id: SessionId,
        event_type: OperationEventType,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            operation_id,
            session_id,
            event_type,
            part_number: None,
            previous_state: None,
            new_state: None,
            error_code: None,
            error_message: None,
            duration_ms: None,
            token_count: None,
            actor_type: ActorType::System,
            actor_id: None,
            metadata: sqlx::types::Json(Metadata::new()),
            created_at,
        }
    }

    /// Attaches the state transition this event records.
    pub fn with_transition(mut self, from: OperationState, to: OperationState) -> Self {
        self.previous_state = Some(from);
        self.new_state = Some(to);
        self
    }

    /// Sets the acting party.
    pub fn with_actor(mut self, actor_type: ActorType, actor_id: Option<String>) -> Self {
        self.actor_type = actor_type;
        self.actor_id = actor_id;
        self
    }
}

/// Status of a retry queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    /// Waiting for its `next_retry_at` to arrive.
    Pending,
    /// Claimed by a processor; executor call in flight.
    Processing,
    /// Redrive succeeded.
    Completed,
    /// Retries exhausted; operator attention required.
    Failed,
    /// Withdrawn by operator action.
    Cancelled,
}

impl QueueStatus {
    /// Whether the item can still be picked up or is awaiting an outcome.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Processing)
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Processing => write!(f, "processing"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl FromStr for QueueStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(CoreError::InvalidInput(format!("unknown queue status: {s}"))),
        }
    }
}

impl sqlx::Type<PgDb> for QueueStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for QueueStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        Self::from_str(s).map_err(|e| e.to_string().into())
    }
}

/// Dequeue priority of a retry item. Lower numeric value is served first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPriority {
    /// Served before everything else.
    High,
    /// Default for failed jobs.
    Medium,
    /// Background backfill work.
    Low,
}

impl RetryPriority {
    /// Numeric ordering value stored in the queue row.
    pub fn as_i32(self) -> i32 {
        match self {
            Self::High => 1,
            Self::Medium => 2,
            Self::Low => 3,
        }
    }

    /// Parses the stored numeric value.
    pub fn from_i32(value: i32) -> Result<Self, CoreError> {
        match value {
            1 => Ok(Self::High),
            2 => Ok(Self::Medium),
            3 => Ok(Self::Low),
            _ => Err(CoreError::InvalidInput(format!("unknown retry priority: {value}"))),
        }
    }
}

impl sqlx::Type<PgDb> for RetryPriority {
    fn type_info() -> PgTypeInfo {
        <i32 as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for RetryPriority {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let v = <i32 as sqlx::Decode<PgDb>>::decode(value)?;
        Self::from_i32(v).map_err(|e| e.to_string().into())
    }
}

/// One pending or historical retry attempt record.
///
/// Created when a job fails with a retryable error; drives the background
/// processor's redrive loop.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RetryQueueItem {
    /// Unique identifier for this queue row.
    pub id: Uuid,

    /// Session being redriven. At most one active row per session.
    pub session_id: SessionId,

    /// Tier of the failed job.
    pub tier: Tier,

    /// Opaque payload the executor needs to redrive the job.
    pub problem_statement: String,

    /// Notification address for the purchasing user, if known.
    pub email: Option<String>,

    /// Redrive attempts made so far.
    pub retry_count: i32,

    /// Attempts after which the item fails permanently.
    pub max_retries: i32,

    /// Dequeue priority; lower value first.
    pub priority: RetryPriority,

    /// Most recent failure, truncated for storage.
    pub last_error: Option<String>,

    /// When a processor last claimed this item.
    pub last_attempt_at: Option<DateTime<Utc>>,

    /// When the item becomes eligible again.
    pub next_retry_at: Option<DateTime<Utc>>,

    /// Current status.
    pub status: QueueStatus,

    /// Row creation time.
    pub created_at: DateTime<Utc>,

    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

/// Per-status counts of retry queue items.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Items awaiting a retry slot.
    pub pending: u64,
    /// Items currently claimed.
    pub processing: u64,
    /// Items whose redrive succeeded.
    pub completed: u64,
    /// Items that exhausted their retries.
    pub failed: u64,
    /// Items withdrawn by operators.
    pub cancelled: u64,
    /// All items.
    pub total: u64,
}

/// Kind of condition an admin alert reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    /// A circuit breaker opened for a protected dependency.
    CircuitBreakerOpen,
    /// The failure-rate window crossed its threshold.
    HighFailureRate,
    /// An unrecoverable error requiring operator attention.
    CriticalError,
    /// A caller-defined system condition.
    SystemAlert,
}

impl fmt::Display for AlertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CircuitBreakerOpen => write!(f, "circuit_breaker_open"),
            Self::HighFailureRate => write!(f, "high_failure_rate"),
            Self::CriticalError => write!(f, "critical_error"),
            Self::SystemAlert => write!(f, "system_alert"),
        }
    }
}

impl FromStr for AlertType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "circuit_breaker_open" => Ok(Self::CircuitBreakerOpen),
            "high_failure_rate" => Ok(Self::HighFailureRate),
            "critical_error" => Ok(Self::CriticalError),
            "system_alert" => Ok(Self::SystemAlert),
            _ => Err(CoreError::InvalidInput(format!("unknown alert type: {s}"))),
        }
    }
}

impl sqlx::Type<PgDb> for AlertType {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for AlertType {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        Self::from_str(s).map_err(|e| e.to_string().into())
    }
}

/// Severity of an admin alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    /// Informational only.
    Info,
    /// Degraded but operating.
    Warning,
    /// Operator intervention required.
    Critical,
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

impl FromStr for AlertSeverity {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Self::Info),
            "warning" => Ok(Self::Warning),
            "critical" => Ok(Self::Critical),
            _ => Err(CoreError::InvalidInput(format!("unknown alert severity: {s}"))),
        }
    }
}

impl sqlx::Type<PgDb> for AlertSeverity {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for AlertSeverity {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        Self::from_str(s).map_err(|e| e.to_string().into())
    }
}

/// Audit record of a dispatched (or attempted) admin alert.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AdminNotification {
    /// Unique identifier for this record.
    pub id: Uuid,

    /// Alert kind.
    pub notification_type: AlertType,

    /// Short human-readable title.
    pub title: String,

    /// Full alert message.
    pub message: String,

    /// Severity at dispatch time.
    pub severity: AlertSeverity,

    /// Opaque context captured with the alert.
    pub metadata: sqlx::types::Json<Metadata>,

    /// When the alert was recorded.
    pub created_at: DateTime<Utc>,
}

/// Kind of metric event recorded for an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricEventType {
    /// A job was requested.
    Request,
    /// One generation part finished.
    PartComplete,
    /// A job finished successfully.
    Success,
    /// A job failed.
    Failure,
    /// A redrive attempt began.
    Retry,
    /// A job finished with some parts missing.
    PartialSuccess,
}

impl fmt::Display for MetricEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Request => "request",
            Self::PartComplete => "part_complete",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Retry => "retry",
            Self::PartialSuccess => "partial_success",
        };
        write!(f, "{s}")
    }
}

impl FromStr for MetricEventType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "request" => Ok(Self::Request),
            "part_complete" => Ok(Self::PartComplete),
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            "retry" => Ok(Self::Retry),
            "partial_success" => Ok(Self::PartialSuccess),
            _ => Err(CoreError::InvalidInput(format!("unknown metric event type: {s}"))),
        }
    }
}

impl sqlx::Type<PgDb> for MetricEventType {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for MetricEventType {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        Self::from_str(s).map_err(|e| e.to_string().into())
    }
}

/// One raw metric event.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AnalysisMetric {
    /// Unique identifier for this metric row.
    pub id: Uuid,
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
    pub metadata: sqlx::types::Json<Metadata>,
    /// When the metric was recorded.
    pub created_at: DateTime<Utc>,
}

/// Aggregated metrics for one hour, derived from [`AnalysisMetric`] rows.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct HourlyMetric {
    /// Unique identifier for this aggregation row.
    pub id: Uuid,
    /// Start of the aggregated hour.
    pub hour_start: DateTime<Utc>,
    /// Requests in the hour.
    pub total_requests: i32,
    /// Successful jobs in the hour.
    pub successful_requests: i32,
    /// Failed jobs in the hour.
    pub failed_requests: i32,
    /// Partially successful jobs in the hour.
    pub partial_successes: i32,
    /// Redrive attempts in the hour.
    pub retried_requests: i32,
    /// Mean success duration in milliseconds.
    pub avg_duration_ms: Option<i64>,
    /// Median success duration in milliseconds.
    pub p50_duration_ms: Option<i64>,
    /// 95th percentile success duration in milliseconds.
    pub p95_duration_ms: Option<i64>,
    /// 99th percentile success duration in milliseconds.
    pub p99_duration_ms: Option<i64>,
    /// Low-tier requests in the hour.
    pub tier_low: i32,
    /// Mid-tier requests in the hour.
    pub tier_mid: i32,
    /// High-tier requests in the hour.
    pub tier_high: i32,
}
