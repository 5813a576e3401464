//! Error types for engine operations.
//!
//! Covers executor failures, timeouts, circuit breaker rejections, and
//! store loss, with context for debugging and categorization for retry
//! decisions: transient failures route through the retry queue, permanent
//! ones are rejected at the call site.

use std::fmt;

use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Error conditions the lifecycle engine can encounter.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// The job executor reported or threw a failure.
    #[error("job execution failed: {message}")]
    ExecutionFailed {
        /// Executor error detail.
        message: String,
    },

    /// The job executor exceeded its time budget.
    #[error("job execution timed out after {timeout_secs}s")]
    Timeout {
        /// Seconds the executor was allowed to run.
        timeout_secs: u64,
    },

    /// The upstream asked for a cooldown before the next attempt.
    #[error("rate limited: retry after {retry_after_secs}s")]
    RateLimited {
        /// Seconds to wait before retrying.
        retry_after_secs: u64,
    },

    /// The circuit breaker is shedding calls to the dependency.
    #[error("circuit breaker open for service {service}")]
    CircuitOpen {
        /// Name of the protected dependency.
        service: String,
    },

    /// All retry attempts were consumed.
    #[error("retries exhausted after {attempts} attempts")]
    RetriesExhausted {
        /// Redrive attempts made before giving up.
        attempts: u32,
    },

    /// The durable store failed during an engine operation.
    #[error("storage error: {message}")]
    Storage {
        /// Store error detail.
        message: String,
    },

    /// The engine was configured inconsistently.
    #[error("configuration error: {message}")]
    Configuration {
        /// Configuration error detail.
        message: String,
    },
}

impl EngineError {
    /// Creates an execution failure from a message.
    pub fn execution(message: impl Into<String>) -> Self {
        Self::ExecutionFailed { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_secs: u64) -> Self {
        Self::Timeout { timeout_secs }
    }

    /// Creates a rate limit error with retry guidance.
    pub fn rate_limited(retry_after_secs: u64) -> Self {
        Self::RateLimited { retry_after_secs }
    }

    /// Creates a circuit open error.
    pub fn circuit_open(service: impl Into<String>) -> Self {
        Self::CircuitOpen { service: service.into() }
    }

    /// Creates a retries exhausted error.
    pub fn retries_exhausted(attempts: u32) -> Self {
        Self::RetriesExhausted { attempts }
    }

    /// Creates a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Whether this failure is temporary and worth a backed-off retry.
    ///
    /// Configuration mistakes and exhausted retries are permanent; a
    /// circuit rejection is temporary by construction (the breaker will
    /// admit a probe after its cooldown).
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ExecutionFailed { .. }
            | Self::Timeout { .. }
            | Self::RateLimited { .. }
            | Self::CircuitOpen { .. }
            | Self::Storage { .. } => true,

            Self::RetriesExhausted { .. } | Self::Configuration { .. } => false,
        }
    }

    /// Machine-readable code stored in events, metrics, and alerts.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::ExecutionFailed { .. } => "EXECUTION_FAILED",
            Self::Timeout { .. } => "EXECUTION_TIMEOUT",
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::CircuitOpen { .. } => "CIRCUIT_OPEN",
            Self::RetriesExhausted { .. } => "RETRIES_EXHAUSTED",
            Self::Storage { .. } => "STORAGE_ERROR",
            Self::Configuration { .. } => "CONFIGURATION_ERROR",
        }
    }
}

/// Category of engine error for metrics and monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Upstream execution problems (failures, timeouts, rate limits).
    Execution,
    /// Circuit breaker protection.
    Circuit,
    /// Durable store operations.
    Storage,
    /// Configuration problems.
    Configuration,
}

impl From<&EngineError> for ErrorCategory {
    fn from(error: &EngineError) -> Self {
        match error {
            EngineError::ExecutionFailed { .. }
            | EngineError::Timeout { .. }
            | EngineError::RateLimited { .. }
            | EngineError::RetriesExhausted { .. } => Self::Execution,
            EngineError::CircuitOpen { .. } => Self::Circuit,
            EngineError::Storage { .. } => Self::Storage,
            EngineError::Configuration { .. } => Self::Configuration,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Execution => write!(f, "execution"),
            Self::Circuit => write!(f, "circuit"),
            Self::Storage => write!(f, "storage"),
            Self::Configuration => write!(f, "configuration"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors_identified_correctly() {
        assert!(EngineError::execution("upstream 500").is_retryable());
        assert!(EngineError::timeout(300).is_retryable());
        assert!(EngineError::rate_limited(60).is_retryable());
        assert!(EngineError::circuit_open("llm-api").is_retryable());
        assert!(EngineError::storage("connection lost").is_retryable());

        assert!(!EngineError::retries_exhausted(5).is_retryable());
        assert!(!EngineError::configuration("bad interval").is_retryable());
    }

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(EngineError::execution("x").code(), "EXECUTION_FAILED");
        assert_eq!(EngineError::timeout(1).code(), "EXECUTION_TIMEOUT");
        assert_eq!(EngineError::circuit_open("svc").code(), "CIRCUIT_OPEN");
        assert_eq!(EngineError::retries_exhausted(5).code(), "RETRIES_EXHAUSTED");
    }

    #[test]
    fn error_categories_mapped_correctly() {
        assert_eq!(ErrorCategory::from(&EngineError::execution("x")), ErrorCategory::Execution);
        assert_eq!(ErrorCategory::from(&EngineError::circuit_open("svc")), ErrorCategory::Circuit);
        assert_eq!(ErrorCategory::from(&EngineError::storage("x")), ErrorCategory::Storage);
        assert_eq!(
            ErrorCategory::from(&EngineError::configuration("x")),
            ErrorCategory::Configuration
        );
    }

    #[test]
    fn error_display_format() {
        assert_eq!(
            EngineError::timeout(300).to_string(),
            "job execution timed out after 300s"
        );
        assert_eq!(
            EngineError::circuit_open("llm-api").to_string(),
            "circuit breaker open for service llm-api"
        );
    }
}
