//! Unified error hierarchy for RepCoach
//!
//! Every engine operation reports one of three outcomes to callers:
//! bad input, an unknown set/exercise, or an internal (persistence) failure.
//! Expected outcomes such as a rep that triggers violations are never errors.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{ExerciseId, SetId};
use crate::store::StoreError;

/// Top-level error type for all RepCoach operations
#[derive(Debug, Error)]
pub enum RepCoachError {
    /// Malformed or missing request fields. Nothing was mutated.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Unknown set or exercise
    #[error(transparent)]
    NotFound(#[from] NotFoundError),

    /// The session store failed to read or write
    #[error("Persistence error: {0}")]
    Persistence(#[from] StoreError),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Lookups that did not resolve to a usable record
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NotFoundError {
    #[error("set not found: {set_id}")]
    Set { set_id: SetId },

    /// The set exists but no longer accepts reps
    #[error("set {set_id} is finalized")]
    SetFinalized { set_id: SetId },

    #[error("exercise not found: {exercise_id}")]
    Exercise { exercise_id: ExerciseId },
}

/// Result type alias for RepCoach operations
pub type Result<T> = std::result::Result<T, RepCoachError>;

/// Status category reported alongside the `{error}` envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    BadInput,
    NotFound,
    Internal,
}

impl ErrorCategory {
    /// HTTP-style status code for transports that want one
    pub fn status_code(&self) -> u16 {
        match self {
            ErrorCategory::BadInput => 400,
            ErrorCategory::NotFound => 404,
            ErrorCategory::Internal => 500,
        }
    }
}

impl RepCoachError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            RepCoachError::Validation(_) => ErrorCategory::BadInput,
            RepCoachError::NotFound(_) => ErrorCategory::NotFound,
            RepCoachError::Persistence(_) | RepCoachError::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// Check if error is retryable without changing the request.
    ///
    /// Mutations are atomic, so a failed persistence call can be replayed as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RepCoachError::Persistence(_))
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            RepCoachError::Validation(_) => ErrorSeverity::Warning,
            RepCoachError::NotFound(_) => ErrorSeverity::Warning,
            RepCoachError::Persistence(StoreError::Conflict { .. }) => ErrorSeverity::Warning,
            RepCoachError::Persistence(_) => ErrorSeverity::Error,
            RepCoachError::Internal(_) => ErrorSeverity::Critical,
        }
    }

    /// Get user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            RepCoachError::NotFound(NotFoundError::SetFinalized { set_id }) => {
                format!("Set {} has already ended; start a new set to keep recording.", set_id)
            }
            RepCoachError::Persistence(StoreError::Conflict { set_id, .. }) => {
                format!("Set {} was updated concurrently. Please retry.", set_id)
            }
            RepCoachError::Persistence(_) => {
                "Unable to reach the session store. Please retry.".to_string()
            }
            _ => self.to_string(),
        }
    }
}

impl From<serde_json::Error> for RepCoachError {
    fn from(err: serde_json::Error) -> Self {
        RepCoachError::Validation(err.to_string())
    }
}

/// Error severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Critical system error requiring immediate attention
    Critical,
    /// Error that prevents operation but system can continue
    Error,
    /// Rejected request; the system is healthy
    Warning,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        let err = RepCoachError::Validation("missing set_id".to_string());
        assert_eq!(err.category(), ErrorCategory::BadInput);
        assert_eq!(err.category().status_code(), 400);

        let err: RepCoachError = NotFoundError::Set { set_id: 7 }.into();
        assert_eq!(err.category(), ErrorCategory::NotFound);
        assert_eq!(err.to_string(), "set not found: 7");

        let err: RepCoachError = StoreError::Unavailable("down".to_string()).into();
        assert_eq!(err.category(), ErrorCategory::Internal);
        assert_eq!(err.category().status_code(), 500);
    }

    #[test]
    fn test_error_retryable() {
        let err: RepCoachError = StoreError::Conflict {
            set_id: 1,
            expected: 2,
        }
        .into();
        assert!(err.is_retryable());

        let err = RepCoachError::Validation("test".to_string());
        assert!(!err.is_retryable());

        let err: RepCoachError = NotFoundError::Exercise { exercise_id: 3 }.into();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_error_severity() {
        let err = RepCoachError::Internal("test".to_string());
        assert_eq!(err.severity(), ErrorSeverity::Critical);

        let err: RepCoachError = NotFoundError::SetFinalized { set_id: 4 }.into();
        assert_eq!(err.severity(), ErrorSeverity::Warning);
        assert!(err.user_message().contains("already ended"));

        let err = RepCoachError::Validation("bad".to_string());
        assert_eq!(err.severity(), ErrorSeverity::Warning);

        let err: RepCoachError = StoreError::Unavailable("disk I/O error".to_string()).into();
        assert_eq!(err.severity(), ErrorSeverity::Error);
    }
}
