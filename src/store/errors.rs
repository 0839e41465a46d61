use thiserror::Error;

use super::error_codes::PgErrorCode;
use crate::models::EntityId;
use crate::state_machine::StateMachineError;

/// Error types for entity store access
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("{table} record {id} not found")]
    NotFound { table: &'static str, id: EntityId },

    #[error("Duplicate {table} record: {key}")]
    Duplicate { table: &'static str, key: String },

    #[error("Concurrent modification: {0}")]
    Conflict(String),

    #[error("Transient store failure: {0}")]
    Transient(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Corrupt {table} row: {reason}")]
    Corrupt { table: &'static str, reason: String },

    #[error("Invalid transition: {0}")]
    Transition(#[from] StateMachineError),
}

impl StoreError {
    /// Worth retrying at the access layer
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn corrupt(table: &'static str, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            table,
            reason: reason.into(),
        }
    }

    /// Classify a sqlx error, attributing unique violations to `table`
    pub fn from_sqlx(table: &'static str, err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) => match db.code() {
                Some(code) if PgErrorCode::is_retryable_transaction_error(&code) => {
                    Self::Transient(err.to_string())
                }
                Some(code) if PgErrorCode::is_unique_violation(&code) => Self::Duplicate {
                    table,
                    key: db.constraint().unwrap_or("unique").to_string(),
                },
                _ => Self::Database(err.to_string()),
            },
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => {
                Self::Transient(err.to_string())
            }
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                Self::corrupt(table, err.to_string())
            }
            _ => Self::Database(err.to_string()),
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::from_sqlx("unknown", err)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result type alias for store operations
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(StoreError::Transient("deadlock".to_string()).is_transient());
        assert!(!StoreError::Conflict("lost race".to_string()).is_transient());
        assert!(StoreError::from(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!StoreError::from(sqlx::Error::RowNotFound).is_transient());
    }
}
