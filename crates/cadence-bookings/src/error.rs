use thiserror::Error;

use cadence_scheduler::SchedulerError;

/// Errors surfaced by the booking engine.
#[derive(Debug, Error)]
pub enum BookingError {
    /// The row does not exist for this owner. Never distinguishes "absent"
    /// from "owned by someone else".
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Rejected before any write: bad scope/frequency/time, non-positive
    /// duration, negative rate.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Store or task-store I/O failure. Safe to retry.
    #[error("store unavailable: {0}")]
    TransientStore(String),

    /// A scoped operation matched siblings but none of them could be written.
    #[error("scoped operation failed for all {failed} occurrence(s): {first}")]
    ScopeFailed { failed: usize, first: String },
}

impl BookingError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidArgument(reason.into())
    }

    /// Short error code string for the transport layer.
    pub fn code(&self) -> &'static str {
        match self {
            BookingError::NotFound { .. } => "NOT_FOUND",
            BookingError::InvalidArgument(_) => "INVALID_ARGUMENT",
            BookingError::TransientStore(_) => "STORE_UNAVAILABLE",
            BookingError::ScopeFailed { .. } => "SCOPE_FAILED",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, BookingError::TransientStore(_))
    }
}

impl From<rusqlite::Error> for BookingError {
    fn from(e: rusqlite::Error) -> Self {
        BookingError::TransientStore(e.to_string())
    }
}

impl From<SchedulerError> for BookingError {
    fn from(e: SchedulerError) -> Self {
        match e {
            SchedulerError::TaskNotFound { id } => BookingError::not_found("task", id),
            other => BookingError::TransientStore(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for BookingError {
    fn from(e: serde_json::Error) -> Self {
        BookingError::InvalidArgument(format!("malformed payload: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, BookingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_store_errors_are_retryable() {
        let store: BookingError = rusqlite::Error::InvalidQuery.into();
        assert!(store.is_retryable());
        assert_eq!(store.code(), "STORE_UNAVAILABLE");
        assert!(!BookingError::invalid("bad scope").is_retryable());
        assert!(!BookingError::not_found("occurrence", "x").is_retryable());
    }
}
