//! Engine error taxonomy
//!
//! Errors are classified by kind, not by origin. Every public operation
//! returns one of the seven tags below; the CLI maps tags to exit codes and
//! the audit log records them verbatim.

use std::time::Duration;

/// Engine error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Id does not exist in scope
    #[error("not found: {0}")]
    NotFound(String),

    /// Caller violated a documented precondition. Never retried; indicates a
    /// bug in the caller or the engine itself.
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// An optimistic update lost a race; retry with a fresh read
    #[error("conflict: {0}")]
    Conflict(String),

    /// Operation exceeded its deadline
    #[error("timeout in {operation} after {elapsed:?}")]
    Timeout {
        /// Which operation timed out
        operation: &'static str,
        /// Elapsed wall-clock time when the deadline fired
        elapsed: Duration,
    },

    /// Substrate, embedder, or validator temporarily unreachable
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Caller exceeded the per-operation quota
    #[error("rate limited on {operation}, retry after {retry_after:?}")]
    RateLimited {
        /// Operation kind that was throttled
        operation: &'static str,
        /// Hint for when the current window resets
        retry_after: Duration,
    },

    /// Inputs failed structural validation
    #[error("validation failed: {0}")]
    Validation(String),
}

impl EngineError {
    /// Stable taxonomy tag, used by the CLI and the audit log.
    pub fn tag(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::Invariant(_) => "invariant",
            EngineError::Conflict(_) => "conflict",
            EngineError::Timeout { .. } => "timeout",
            EngineError::Unavailable(_) => "unavailable",
            EngineError::RateLimited { .. } => "rate_limited",
            EngineError::Validation(_) => "validation",
        }
    }

    /// Whether the operation is safe to retry as-is.
    ///
    /// `Conflict` requires a fresh read first, so it is not blind-retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Timeout { .. }
                | EngineError::Unavailable(_)
                | EngineError::RateLimited { .. }
        )
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match &err {
            rusqlite::Error::QueryReturnedNoRows => {
                EngineError::NotFound("row not found".to_string())
            }
            rusqlite::Error::SqliteFailure(code, msg) => match code.code {
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => EngineError::Unavailable(
                    msg.clone().unwrap_or_else(|| "database busy".to_string()),
                ),
                // Statement-shape problems are programmer bugs, not runtime
                // conditions.
                ErrorCode::ApiMisuse => EngineError::Invariant(err.to_string()),
                _ => EngineError::Unavailable(err.to_string()),
            },
            rusqlite::Error::InvalidParameterName(_)
            | rusqlite::Error::InvalidColumnIndex(_)
            | rusqlite::Error::InvalidColumnName(_)
            | rusqlite::Error::InvalidColumnType(..)
            | rusqlite::Error::InvalidQuery
            | rusqlite::Error::MultipleStatement => EngineError::Invariant(err.to_string()),
            _ => EngineError::Unavailable(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Validation(err.to_string())
    }
}

/// Engine result type
pub type Result<T> = std::result::Result<T, EngineError>;

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_are_stable() {
        assert_eq!(EngineError::NotFound("x".into()).tag(), "not_found");
        assert_eq!(EngineError::Invariant("x".into()).tag(), "invariant");
        assert_eq!(EngineError::Conflict("x".into()).tag(), "conflict");
        assert_eq!(
            EngineError::Timeout {
                operation: "retrieve",
                elapsed: Duration::from_millis(10)
            }
            .tag(),
            "timeout"
        );
        assert_eq!(EngineError::Unavailable("x".into()).tag(), "unavailable");
        assert_eq!(EngineError::Validation("x".into()).tag(), "validation");
    }

    #[test]
    fn test_retryability() {
        assert!(EngineError::Unavailable("x".into()).is_retryable());
        assert!(!EngineError::Invariant("x".into()).is_retryable());
        assert!(!EngineError::Conflict("x".into()).is_retryable());
    }

    #[test]
    fn test_no_rows_maps_to_not_found() {
        let err: EngineError = rusqlite::Error::QueryReturnedNoRows.into();
        assert_eq!(err.tag(), "not_found");
    }
}
