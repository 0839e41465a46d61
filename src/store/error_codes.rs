//! PostgreSQL Error Codes
//!
//! SQLSTATE codes the store classifies. Full list:
//! <https://www.postgresql.org/docs/current/errcodes-appendix.html>

/// PostgreSQL SQLSTATE error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PgErrorCode;

impl PgErrorCode {
    /// Unique violation (duplicate key) - Code 23505
    ///
    /// Raised when a second out message reuses an ebMS message id, or a second
    /// retry-reliability record is created for the same target and kind.
    pub const UNIQUE_VIOLATION: &'static str = "23505";

    /// Check constraint violation - Code 23514
    pub const CHECK_VIOLATION: &'static str = "23514";

    /// Serialization failure - Code 40001
    pub const SERIALIZATION_FAILURE: &'static str = "40001";

    /// Deadlock detected - Code 40P01
    pub const DEADLOCK_DETECTED: &'static str = "40P01";

    /// Query canceled - Code 57014
    pub const QUERY_CANCELED: &'static str = "57014";

    #[inline]
    pub fn is_unique_violation(code: &str) -> bool {
        code == Self::UNIQUE_VIOLATION
    }

    #[inline]
    pub fn is_check_violation(code: &str) -> bool {
        code == Self::CHECK_VIOLATION
    }

    /// Check if the error is retryable (serialization failure or deadlock)
    #[inline]
    pub fn is_retryable_transaction_error(code: &str) -> bool {
        code == Self::SERIALIZATION_FAILURE || code == Self::DEADLOCK_DETECTED
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_violation_detection() {
        assert!(PgErrorCode::is_unique_violation("23505"));
        assert!(!PgErrorCode::is_unique_violation("23514"));
    }

    #[test]
    fn test_retryable_errors() {
        assert!(PgErrorCode::is_retryable_transaction_error("40001"));
        assert!(PgErrorCode::is_retryable_transaction_error("40P01"));
        assert!(!PgErrorCode::is_retryable_transaction_error("23505"));
    }
}
