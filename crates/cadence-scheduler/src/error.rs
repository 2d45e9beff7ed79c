use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// No task with the given ID exists in the store.
    #[error("Task not found: {id}")]
    TaskNotFound { id: String },

    /// The store cannot be used right now (e.g. its lock was poisoned).
    #[error("Task store unavailable: {0}")]
    Unavailable(String),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
