//! Error types and result handling for core operations.
//!
//! `CoreError` covers the storage and validation failures the repository
//! layer and lifecycle mutators produce. Pipeline-level classification
//! (retryable vs. permanent) lives in the engine crate next to the code
//! that routes failures into the retry queue.

use thiserror::Error;

use crate::models::OperationState;

/// Result type alias using [`CoreError`].
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core error type for internal operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(String),

    /// Entity not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Constraint violation.
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A state transition the machine forbids was attempted.
    ///
    /// Raised before any persistence happens; the operation row and event
    /// log are untouched when this is returned.
    #[error("Invalid transition: {from} -> {to}")]
    InvalidTransition {
        /// State the operation was in.
        from: OperationState,
        /// State the caller tried to reach.
        to: OperationState,
    },
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("requested entity not found".to_string()),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Self::ConstraintViolation(format!("unique constraint violation: {}", db_err))
            },
            sqlx::Error::Database(db_err) if db_err.is_foreign_key_violation() => {
                Self::ConstraintViolation(format!("foreign key constraint violation: {}", db_err))
            },
            sqlx::Error::Database(db_err) if db_err.is_check_violation() => {
                Self::ConstraintViolation(format!("check constraint violation: {}", db_err))
            },
            _ => Self::Database(err.to_string()),
        }
    }
}
